use thiserror::Error;

/// Everything a user action or background task can fail with. Collaborator
/// errors (Discord, disk, subprocesses) are converted at the boundary so
/// none of them bubble up as panics.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("no results found")]
    NotFound,

    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("persistence failed: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("discord error: {0}")]
    Discord(#[from] serenity::Error),
}

pub type BotResult<T> = Result<T, BotError>;
