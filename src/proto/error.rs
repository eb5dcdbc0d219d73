use std::io;

use thiserror::Error;

/// Result type alias for redlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when interacting with a Redis connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed or closing.
    ///
    /// Returned when a command is issued after `close()`, and used to fail
    /// every pending reply when the transport goes away.
    #[error("connection closed")]
    ConnectionClosed,

    /// Subscribing is disabled on this connection.
    #[error("subscriptions are not allowed on this connection")]
    PubSubNotAllowed,

    /// A command outside the PubSub allow-list was issued while subscribed.
    #[error("command {command} is not allowed in subscriber mode")]
    InPubSubMode {
        /// The rejected command name.
        command: String,
    },

    /// A caller contract was violated.
    #[error("assertion failure: {message}")]
    Assertion {
        /// Description of the violated contract.
        message: String,
    },

    /// Malformed RESP arrived from the server. Fatal to the connection.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// An IO error occurred on the transport. Fatal to the connection.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The startup handshake (AUTH, SELECT, CLIENT SETNAME) was rejected.
    #[error("startup failed: {message}")]
    Startup {
        /// The server's rejection, or the handshake step that broke.
        message: String,
    },

    /// The server returned an error reply for a specific command.
    ///
    /// This is non-fatal: the raw `RespValue::Error` is handed to the
    /// caller's promise, and typed decode helpers convert it to this
    /// variant.
    #[error("server error: {message}")]
    Server {
        /// Error message from the server.
        message: String,
    },

    /// Invalid configuration or argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },
}

impl Error {
    /// Builds a protocol error from anything displayable.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let error = Error::Io { source: io_err };
        assert!(error.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_protocol() {
        let error = Error::Protocol {
            message: "invalid frame".to_string(),
        };
        assert_eq!(error.to_string(), "protocol error: invalid frame");
    }

    #[test]
    fn test_error_display_server() {
        let error = Error::Server {
            message: "ERR wrong type".to_string(),
        };
        assert_eq!(error.to_string(), "server error: ERR wrong type");
    }

    #[test]
    fn test_error_display_connection_closed() {
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
    }

    #[test]
    fn test_error_display_in_pubsub_mode() {
        let error = Error::InPubSubMode {
            command: "GET".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "command GET is not allowed in subscriber mode"
        );
    }

    #[test]
    fn test_error_display_startup() {
        let error = Error::Startup {
            message: "WRONGPASS invalid password".to_string(),
        };
        assert!(error.to_string().contains("startup failed"));
    }

    #[test]
    fn test_error_display_invalid_argument() {
        let error = Error::InvalidArgument {
            message: "missing required field".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "invalid argument: missing required field"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "test");
        let error: Error = io_err.into();
        assert!(matches!(error, Error::Io { .. }));
    }
}
