// src/error.rs

//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the bastille library
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ban database failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Configuration could not be read or is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The control socket is missing, stale or not accessible
    #[error("{0}")]
    SocketUnavailable(String),

    /// The server did not reach the desired state within the timeout
    #[error("{0}")]
    StartTimeout(String),

    /// Malformed frame on the control channel
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Ban-time formula failed to parse or evaluate
    #[error("formula error: {0}")]
    Formula(String),

    /// Command rejected by the server dispatch table
    #[error("{0}")]
    Command(String),
}

impl Error {
    /// Short machine-readable tag used as the first payload item of an
    /// error response on the control channel.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::SocketUnavailable(_) => "socket",
            Error::StartTimeout(_) => "timeout",
            Error::Protocol(_) => "protocol",
            Error::Formula(_) => "formula",
            Error::Command(_) => "command",
        }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(Error::Config("x".into()).kind(), "config");
        assert_eq!(Error::Command("x".into()).kind(), "command");
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(io.kind(), "io");
    }

    #[test]
    fn test_error_display() {
        let e = Error::SocketUnavailable("no such socket".into());
        assert_eq!(e.to_string(), "no such socket");
        let e = Error::Formula("unbalanced parens".into());
        assert_eq!(e.to_string(), "formula error: unbalanced parens");
    }
}
