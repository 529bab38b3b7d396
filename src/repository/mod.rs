pub mod album_cache;
pub mod api_cache;
pub mod generic_cache;
pub mod pending_repo;
pub mod snapshot_repo;
pub mod track_list_repo;

pub use album_cache::AlbumYearCache;
pub use api_cache::ApiResponseCache;
pub use generic_cache::GenericCache;
pub use pending_repo::PendingVerificationStore;
pub use snapshot_repo::SnapshotRepository;
pub use track_list_repo::TrackListRepository;

use std::path::{Path, PathBuf};

/* Errors of the file-backed stores */
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    // A store file exists but cannot be parsed. Callers log this and start
    // the store fresh rather than aborting the run.
    #[error("Store file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("JSON (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV (de)serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] crate::domain::ValidationError),
}

/// Write-to-temp-in-same-dir then rename. Every persistent file in the cache
/// directory goes through here; a crash mid-write leaves the previous file
/// intact instead of a truncated one.
pub fn write_bytes_atomic(target: &Path, data: &[u8]) -> Result<(), RepositoryError> {
    let parent = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = parent.join(format!(".{file_name}.tmp"));

    let result = std::fs::write(&temp_path, data).and_then(|_| std::fs::rename(&temp_path, target));
    if result.is_err() && temp_path.exists() {
        let _ = std::fs::remove_file(&temp_path);
    }

    result.map_err(RepositoryError::from)
}

pub fn ensure_directory(path: &Path) -> Result<(), RepositoryError> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::OnceLock;

    use log::SetLoggerError;

    #[derive(Debug, thiserror::Error)]
    pub enum TestSetupError {
        #[error("Failed to init env logger for the store tests: {0}")]
        LoggerError(String),

        #[error("I/O error: {0}")]
        IOError(#[from] std::io::Error),

        #[error("Repository operation failed: {0}")]
        RepositoryError(#[from] super::RepositoryError),
    }

    pub fn init_logger() -> Result<(), TestSetupError> {
        static LOGGER_RESULT: OnceLock<Result<(), SetLoggerError>> = OnceLock::new();

        let init_result_ref = LOGGER_RESULT.get_or_init(|| {
            env_logger::builder()
                .is_test(true)
                .filter_level(log::LevelFilter::Warn)
                .try_init()
        });

        match init_result_ref {
            Ok(_) => Ok(()),
            Err(e) => Err(TestSetupError::LoggerError(e.to_string())),
        }
    }
}
