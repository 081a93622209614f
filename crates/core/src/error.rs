/// Result alias that carries the custom [`DropError`] type.
pub type Result<T> = std::result::Result<T, DropError>;

/// Common error type for the core crate.
///
/// Every variant is fatal to the call that produced it. Session operations
/// validate before mutating, so an error never leaves a half-updated session.
#[derive(Debug, thiserror::Error)]
pub enum DropError {
    /// Malformed parameters or input data supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// An operation was attempted before the state it depends on exists,
    /// e.g. analysing before a track has been loaded.
    #[error("not loaded: {0}")]
    NotLoaded(&'static str),
    /// The decoder does not understand the container or codec.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Reading the source failed.
    #[error("failed to read audio: {0}")]
    IoRead(#[from] std::io::Error),
    /// Playback was requested past the end of the track.
    #[error("start time {start:.3}s is beyond the track duration of {duration:.3}s")]
    InvalidRange { start: f32, duration: f32 },
    /// The audio output device could not be opened or driven.
    #[error("audio device error: {0}")]
    Device(String),
    /// Configuration or report (de)serialisation failed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl DropError {
    /// Creates an [`DropError::InvalidInput`] from any message.
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn device<T: std::fmt::Display>(err: T) -> Self {
        Self::Device(err.to_string())
    }
}
