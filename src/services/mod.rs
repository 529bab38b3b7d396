pub mod agent;
pub mod api;
pub mod cleaner;
pub mod genre;
pub mod pipeline;
pub mod rate_limiter;
pub mod report;
pub mod sync;
pub mod verifier;
pub mod year_batch;
pub mod year_resolver;

use crate::domain::ValidationError;
use crate::repository::RepositoryError;
use crate::utils::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Library application is not running or not reachable")]
    Unavailable,

    #[error("Script '{script}' failed with status {status}: {stderr}")]
    ScriptFailed { script: String, status: i32, stderr: String },

    #[error("Script '{script}' timed out after {seconds}s")]
    Timeout { script: String, seconds: u64 },

    #[error("Script '{script}' produced undecodable output: {reason}")]
    InvalidOutput { script: String, reason: String },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimiter(#[from] rate_limiter::RateLimiterError),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Worth retrying with backoff.
    #[error("Transient API failure from {source_name}: {reason}")]
    Transient { source_name: String, reason: String },

    // The source is out of budget; it reports a null outcome, not a failure.
    #[error("API quota exhausted for {source_name}")]
    QuotaExhausted { source_name: String },

    #[error("Malformed response from {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },

    #[error("Authentication rejected by {source_name}")]
    Auth { source_name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}
