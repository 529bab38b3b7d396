pub mod album;
pub mod changelog;
pub mod delta;
pub mod track;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Track id cannot be an empty string.")]
    TrackIdIsEmpty,

    #[error("Track id must be numeric, got '{0}'.")]
    TrackIdNotNumeric(String),

    #[error("Confidence must be within 0..=100, got {0}.")]
    ConfidenceOutOfRange(i64),
}
