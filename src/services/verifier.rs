use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use futures::future::join_all;

use super::agent::{ExistenceResult, LibraryAgentClient};
use super::PipelineError;
use crate::repository::TrackListRepository;
use crate::utils::config::{IncrementalConfig, VerificationConfig};
use crate::utils::timeutil;

const LAST_VERIFY_SUFFIX: &str = "_last_verify.txt";

/// Periodically re-checks every CSV row against the live library and drops
/// rows the agent confirms gone. Also owns the incremental-run timestamp.
pub struct DatabaseVerifier<'a> {
    agent: &'a LibraryAgentClient,
    csv_repo: &'a TrackListRepository,
    verification: &'a VerificationConfig,
    incremental: &'a IncrementalConfig,
    last_run_file: PathBuf,
    dry_run: bool,
}

impl<'a> DatabaseVerifier<'a> {
    pub fn new(
        agent: &'a LibraryAgentClient,
        csv_repo: &'a TrackListRepository,
        verification: &'a VerificationConfig,
        incremental: &'a IncrementalConfig,
        last_run_file: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self { agent, csv_repo, verification, incremental, last_run_file, dry_run }
    }

    fn last_verify_path(&self) -> PathBuf {
        let csv = self.csv_repo.path();
        let stem = csv.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        csv.with_file_name(format!("{stem}{LAST_VERIFY_SUFFIX}"))
    }

    /// Whether the weekly (configurable) verification is due.
    pub fn should_auto_verify(&self) -> bool {
        if self.verification.auto_verify_days <= 0 {
            return false;
        }

        match read_timestamp_file(&self.last_verify_path()) {
            None => {
                log::debug!("No previous verification found, auto-verify needed");
                true
            }
            Some(last_verify) => {
                let days_since = (timeutil::utc_now_naive() - last_verify).num_days();
                if days_since >= self.verification.auto_verify_days {
                    log::info!(
                        "Auto-verify needed: {days_since} days since last check (threshold: {})",
                        self.verification.auto_verify_days
                    );
                    true
                } else {
                    log::debug!(
                        "Auto-verify not needed: {days_since} days since last check (threshold: {})",
                        self.verification.auto_verify_days
                    );
                    false
                }
            }
        }
    }

    /// Verifies the projection in batches, removing rows the agent reports
    /// as definitively gone. An id only counts as absent on an explicit
    /// "not found"; transient errors default to present so a flaky agent
    /// cannot empty the database. Returns the number of removed rows.
    pub async fn verify_and_clean(&self, force: bool) -> Result<usize, PipelineError> {
        let track_map = self.csv_repo.load()?;
        if track_map.is_empty() {
            log::info!("No existing track database to verify");
            return Ok(0);
        }

        if !force && !self.should_auto_verify() {
            return Ok(0);
        }

        let started = std::time::Instant::now();
        let mut ids: Vec<&String> = track_map.keys().collect();
        ids.sort();

        log::info!("VERIFY START | tracks={}", ids.len());

        let batch_size = self.verification.batch_size.max(1);
        let pause = Duration::from_millis(self.verification.pause_ms);
        let total_batches = ids.len().div_ceil(batch_size);

        let mut invalid_ids: Vec<String> = Vec::new();
        for (batch_num, batch) in ids.chunks(batch_size).enumerate() {
            // Per-id probes within a batch run concurrently; the agent
            // client's own limiter bounds the real parallelism.
            let results = join_all(batch.iter().map(|id| self.probe(id))).await;

            let mut batch_invalid = 0;
            for (id, exists) in batch.iter().zip(results) {
                if !exists {
                    invalid_ids.push(id.to_string());
                    batch_invalid += 1;
                }
            }

            log::info!(
                "BATCH {}/{total_batches} | checked={} valid={} invalid={batch_invalid}",
                batch_num + 1,
                batch.len(),
                batch.len() - batch_invalid
            );

            if (batch_num + 1) * batch_size < ids.len() {
                tokio::time::sleep(pause).await;
            }
        }

        let total_ids = ids.len();

        if !invalid_ids.is_empty() && !self.dry_run {
            let mut cleaned = track_map;
            for id in &invalid_ids {
                cleaned.remove(id);
            }
            self.csv_repo.save(&cleaned)?;
        }

        if !self.dry_run {
            write_timestamp_file(&self.last_verify_path());
        }

        let removed = if self.dry_run { 0 } else { invalid_ids.len() };
        log::info!(
            "VERIFY DONE | total={} invalid={} removed={removed} duration={:.1}s",
            total_ids,
            invalid_ids.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(removed)
    }

    async fn probe(&self, track_id: &str) -> bool {
        match self.agent.track_exists(track_id).await {
            Ok(ExistenceResult::NotFound) => false,
            Ok(_) => true,
            Err(probe_err) => {
                // A track-level validation failure is fatal for that track
                // only; never treat it as absence.
                log::warn!("Existence probe failed for track {track_id}: {probe_err}");
                true
            }
        }
    }

    /// Whether enough time has passed since the last incremental run.
    pub fn can_run_incremental(&self, force: bool) -> bool {
        if force {
            log::info!("Force run requested, skipping interval check");
            return true;
        }

        let Some(last_run) = self.get_last_run_timestamp() else {
            log::info!("No previous incremental run found, proceeding with run");
            return true;
        };

        let now = timeutil::utc_now_naive();
        let elapsed = now - last_run;
        let required = chrono::Duration::minutes(self.incremental.interval_minutes);

        if elapsed >= required {
            log::info!("Last run: {}. Sufficient time has passed, proceeding.", last_run.format("%Y-%m-%d %H:%M"));
            true
        } else {
            let remaining_minutes = (required - elapsed).num_minutes();
            log::info!(
                "Last run: {}. Next run in {remaining_minutes} minutes. Skipping.",
                last_run.format("%Y-%m-%d %H:%M")
            );
            false
        }
    }

    /// The recorded last-run time; a future-dated or unparseable file is
    /// treated as "no previous run".
    pub fn get_last_run_timestamp(&self) -> Option<NaiveDateTime> {
        let last_run = read_timestamp_file(&self.last_run_file)?;

        let now = timeutil::utc_now_naive();
        if last_run > now {
            log::warn!(
                "Last run timestamp is in the future ({}). Treating as if no previous run exists.",
                last_run.format("%Y-%m-%d %H:%M")
            );
            return None;
        }

        Some(last_run)
    }

    pub fn update_last_incremental_run(&self) {
        write_timestamp_file(&self.last_run_file);
        log::info!("Updated last incremental run timestamp in {}", self.last_run_file.display());
    }
}

fn read_timestamp_file(path: &Path) -> Option<NaiveDateTime> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let parsed = timeutil::parse_stored_timestamp(&raw);
            if parsed.is_none() {
                log::warn!("Unparseable timestamp in {}: {raw:?}", path.display());
            }
            parsed
        }
        Err(read_err) => {
            log::warn!("Failed to read timestamp file {}: {read_err}", path.display());
            None
        }
    }
}

fn write_timestamp_file(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(write_err) = std::fs::write(path, timeutil::format_timestamp(timeutil::utc_now_naive())) {
        log::warn!("Failed to update timestamp file {}: {write_err}", path.display());
    }
}
