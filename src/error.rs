//! Error types for the voice relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// No capture device exists, or the requested one is gone
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// PCM framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// PCM16 payloads carry two bytes per sample
    #[error("Malformed PCM16 payload: odd byte length {0}")]
    OddLength(usize),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Handshake, DNS or TLS failure
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Write failed or raced with a close
    #[error("Send failed: {0}")]
    Send(String),

    /// Malformed inbound frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Lifecycle errors raised by the stream coordinator
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Stream is already running")]
    AlreadyRunning,

    #[error("Transport closed before the first connection attempt finished")]
    Aborted,
}

/// Coarse error classification carried by [`crate::events::RelayEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    Format,
    Connect,
    Send,
    Protocol,
    AlreadyRunning,
    Other,
}

impl Error {
    /// Classify this error for the notification side-channel
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Audio(AudioError::DeviceUnavailable(_)) => ErrorKind::DeviceUnavailable,
            Error::Audio(_) => ErrorKind::Other,
            Error::Codec(_) => ErrorKind::Format,
            Error::Network(e) => e.kind(),
            Error::Session(SessionError::AlreadyRunning) => ErrorKind::AlreadyRunning,
            Error::Session(_) | Error::Config(_) | Error::Io(_) => ErrorKind::Other,
        }
    }
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Connect(_) | NetworkError::InvalidUrl(_) => ErrorKind::Connect,
            NetworkError::Send(_) => ErrorKind::Send,
            NetworkError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::UnsupportedFormat(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
