use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tunekeeper", about = "Incremental music library synchronizer")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Process everything, ignoring incremental state.
    #[arg(long)]
    pub force: bool,

    /// Log what would change without writing anywhere.
    #[arg(long)]
    pub dry_run: bool,

    /// Discard the snapshot before running.
    #[arg(long)]
    pub fresh: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// The main pipeline: clean names, rename artists, update genres and
    /// years, sync the CSV projection (default when no command is given).
    Run,

    /// Clean track and album names for one artist.
    CleanArtist {
        #[arg(long)]
        artist: String,
    },

    /// Resolve and write release years.
    UpdateYears {
        #[arg(long)]
        artist: Option<String>,
    },

    /// Write original years back from the rollback field.
    RevertYears {
        #[arg(long)]
        artist: String,

        #[arg(long)]
        album: Option<String>,

        /// Use a backup of the track list instead of the live projection.
        #[arg(long)]
        backup_csv: Option<PathBuf>,
    },

    /// Check every CSV row still exists in the library.
    VerifyDatabase,

    /// Re-check albums whose verification deadline has passed.
    VerifyPending,

    /// Complete bidirectional resync of the CSV projection.
    FullSync,
}
