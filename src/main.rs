use anyhow::Context;
use clap::Parser;

use tunekeeper::cli::{Cli, Command};
use tunekeeper::services::pipeline::Pipeline;
use tunekeeper::utils::config::Config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let exit_code = match run(&cli).await {
        Ok(code) => code,
        Err(run_err) => {
            log::error!("{run_err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let pipeline = Pipeline::new(config, cli.dry_run).context("initializing services")?;
    pipeline.initialize().await.context("loading persisted state")?;

    let exit_code = tokio::select! {
        result = run_command(&pipeline, cli) => {
            match result {
                Ok(()) => 0,
                Err(run_err) => {
                    log::error!("{run_err}");
                    1
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted; flushing caches before exit");
            1
        }
    };

    // Best-effort persistence on both the success and the interrupt path.
    pipeline.shutdown().await;
    Ok(exit_code)
}

async fn run_command(pipeline: &Pipeline, cli: &Cli) -> Result<(), tunekeeper::services::PipelineError> {
    match &cli.command {
        None | Some(Command::Run) => pipeline.run_main_pipeline(cli.force, cli.fresh).await,
        Some(Command::CleanArtist { artist }) => pipeline.run_clean_artist(artist).await,
        Some(Command::UpdateYears { artist }) => pipeline.run_update_years(artist.as_deref(), cli.force).await,
        Some(Command::RevertYears { artist, album, backup_csv }) => {
            pipeline
                .run_revert_years(artist, album.as_deref(), backup_csv.as_deref())
                .await
        }
        Some(Command::VerifyDatabase) => pipeline.run_verify_database(cli.force).await.map(|_| ()),
        Some(Command::VerifyPending) => pipeline.run_verify_pending().await,
        Some(Command::FullSync) => pipeline.run_full_sync().await,
    }
}
