//! Error types shared by every layer of the session engine.

use std::sync::Arc;

use thiserror::Error;

use crate::stanza::{StanzaError, StreamError};

/// The error type returned by session, transport and stream operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure (connect, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server name resolution failure.
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// The inbound byte stream is not well-formed XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// WebSocket handshake or framing failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No matching response arrived before the timeout elapsed.
    #[error("no response received within {timeout_ms}ms ({context})")]
    NoResponse { context: String, timeout_ms: u64 },

    /// The peer answered a request with an error-typed response.
    #[error("stanza error: {0}")]
    Stanza(StanzaError),

    /// Authentication or resource binding failed.
    #[error("login failed: {0}")]
    Login(#[from] LoginError),

    /// The server sent a stream-level error; the stream is dead.
    #[error("stream error: {0}")]
    Stream(StreamError),

    /// In-band feature negotiation failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The operation is not valid in the current session state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// There is no active connection to send on.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the stream or the socket.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A pending wait was aborted because the connection went down.
    #[error("connection lost: {0}")]
    Disconnected(Arc<Error>),

    /// The transport cannot perform the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The session configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A pipeline task died from a panic.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NoResponse`].
    pub fn no_response(context: impl Into<String>, timeout: std::time::Duration) -> Self {
        Error::NoResponse {
            context: context.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether automatic reconnection may be attempted after this error.
    ///
    /// Stream errors that signal a policy decision by the server (another client
    /// took over the resource, credentials were revoked, ...) are final.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Stream(e) => e.condition.is_retriable(),
            Error::Disconnected(inner) => inner.is_retriable(),
            _ => true,
        }
    }
}

/// Failures raised by `Session::login`.
#[derive(Debug, Clone, Error)]
pub enum LoginError {
    /// The server offered no SASL mechanism this client implements.
    #[error("no supported SASL mechanism (offered: {0:?})")]
    NoSupportedMechanism(Vec<String>),

    /// The server rejected the credentials.
    #[error("SASL authentication failed: {condition}")]
    Sasl { condition: String, text: Option<String> },

    /// The bind response did not carry a usable JID.
    #[error("resource binding failed: {0}")]
    Bind(String),

    /// `login` was called before the stream was ready.
    #[error("stream not ready for authentication: {0}")]
    NotReady(String),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{StreamError, StreamErrorCondition};

    #[test]
    fn test_conflict_is_not_retriable() {
        let err = Error::Stream(StreamError {
            condition: StreamErrorCondition::Conflict,
            text: None,
        });
        assert!(!err.is_retriable());
        assert!(!Error::Disconnected(Arc::new(err)).is_retriable());
    }

    #[test]
    fn test_transport_errors_are_retriable() {
        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(err.is_retriable());
        assert!(Error::ConnectionClosed.is_retriable());
        assert!(Error::Stream(StreamError {
            condition: StreamErrorCondition::SystemShutdown,
            text: None,
        })
        .is_retriable());
    }

    #[test]
    fn test_no_response_message_includes_timeout() {
        let err = Error::no_response("iq q1", std::time::Duration::from_millis(50));
        assert_eq!(err.to_string(), "no response received within 50ms (iq q1)");
    }
}
