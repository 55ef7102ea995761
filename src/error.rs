//! Error types for the plugin core.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the plugin core.
///
/// Per-session failures are reported to the peer through [`ApiError`]
/// events and never tear the plugin down; `Error` is what the internal
/// plumbing propagates.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or was malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The UDP port pool has no free port left.
    #[error("no free ports available in the port pool")]
    PortsExhausted,

    /// A UDP endpoint could not be created, bound or connected.
    #[error("socket error: {0}")]
    Socket(String),

    /// SDP could not be interpreted.
    #[error("sdp error: {0}")]
    Sdp(String),

    /// The registry rejected or failed a request.
    #[error("registry error: {0}")]
    Registry(String),

    /// The registry reported the stream id as already taken.
    #[error("stream id already registered: {0}")]
    DuplicateStreamId(String),

    /// The RTSP server runtime failed or is gone.
    #[error("rtsp server error: {0}")]
    Rtsp(String),

    /// No session is associated with the given handle.
    #[error("no session associated with this handle")]
    SessionNotFound,

    /// The plugin is shutting down and refuses new work.
    #[error("plugin is stopping")]
    Stopping,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn socket(msg: impl Into<String>) -> Self {
        Error::Socket(msg.into())
    }

    pub fn sdp(msg: impl Into<String>) -> Self {
        Error::Sdp(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    pub fn rtsp(msg: impl Into<String>) -> Self {
        Error::Rtsp(msg.into())
    }
}

/// Peer-visible request errors, pushed back as `error_code`/`error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// The request carried no message object at all.
    NoMessage = 411,
    /// The message was not a JSON object.
    InvalidJson = 412,
    /// A known attribute had the wrong type, or no known attribute was present.
    InvalidElement = 413,
    /// The requested stream id already exists in the registry.
    InvalidUrlId = 414,
}

impl ApiError {
    /// Numeric code reported to the peer.
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_codes() {
        assert_eq!(ApiError::NoMessage.code(), 411);
        assert_eq!(ApiError::InvalidJson.code(), 412);
        assert_eq!(ApiError::InvalidElement.code(), 413);
        assert_eq!(ApiError::InvalidUrlId.code(), 414);
    }

    #[test]
    fn error_display_is_descriptive() {
        let e = Error::config("missing category");
        assert!(e.to_string().contains("missing category"));
        assert_eq!(
            Error::PortsExhausted.to_string(),
            "no free ports available in the port pool"
        );
    }
}
