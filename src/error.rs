//! # Error Handling
//!
//! Central error types for the daemon, grouped by subsystem. Each enum maps
//! onto one failure domain so callers can match on the kind rather than parse
//! message strings:
//!
//! - `SourceError`: DOA hardware reads (transient vs. protocol vs. closed)
//! - `ProtocolError`: the cloud/local JSON message codec
//! - `SendError`: outbound cloud sends
//! - `MotionError`: the vendor robot daemon HTTP client
//! - `AudioError`: the ALSA command wrappers
//!
//! Transient and protocol failures are counted and logged where they occur;
//! they never tear the daemon down. Fatal errors exist only at startup
//! (invalid configuration), handled with `anyhow` in `main`.

use thiserror::Error;

/// Failures reported by a DOA source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A single read failed; the next one may succeed.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// The device answered, but not with what the protocol requires
    /// (short frame, non-zero status byte).
    #[error("device protocol violation: {0}")]
    Protocol(String),

    /// The source has been closed; no further reads will succeed.
    #[error("source is closed")]
    Closed,

    /// The surrounding cancellation scope fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
}

/// Failures in the wire message codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid binary payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Failures of an outbound cloud send.
#[derive(Debug, Error)]
pub enum SendError {
    /// No live connection; the caller may retry after the client reconnects.
    #[error("not connected to remote endpoint")]
    NotConnected,

    #[error("message encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// The write failed or exceeded its deadline. The connection is torn
    /// down and the reconnect machinery takes over.
    #[error("websocket write failed: {0}")]
    Write(String),
}

/// Failures of the motion daemon HTTP client.
#[derive(Debug, Error)]
pub enum MotionError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Failures of the audio capture/playback bridge.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
