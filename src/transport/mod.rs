//! Byte-level connections to an XMPP server.
//!
//! A [`Transport`] knows how to open a byte stream to the server and how to
//! upgrade it in place (TLS, compression). It does not know about XML: the
//! stream pipeline in [`crate::stream`] runs on top of whatever stream the
//! transport hands back, so TCP and WebSocket sessions share the same reader
//! and writer.

pub mod dns;
pub mod tcp;
pub mod tls;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ProxyConfig, SessionConfig, TransportConfig};
use crate::error::{Error, Result};

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

/// Object-safe alias for a bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// Identity of a transport candidate: (host, port, kind, proxy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxyConfig>,
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
        };
        write!(f, "{}://{}:{}", kind, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}:{}", proxy.host, proxy.port)?;
        }
        Ok(())
    }
}

/// Wraps a byte stream in another encoding, e.g. stream compression.
///
/// Implementations come from the compression negotiator; the transport only
/// applies them.
#[async_trait]
pub trait StreamLayer: Send + Sync {
    async fn wrap(&self, stream: BoxedStream) -> Result<BoxedStream>;
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &TransportDescriptor;

    /// Open a byte stream to the server. Fails with a transport error
    /// (DNS, socket, TLS) that the session treats as a candidate failure.
    async fn connect(&self) -> Result<BoxedStream>;

    /// Upgrade `stream` to TLS after a successful STARTTLS negotiation.
    async fn secure_connection(&self, stream: BoxedStream) -> Result<BoxedStream> {
        drop(stream);
        Err(Error::Unsupported(format!(
            "{} cannot upgrade to TLS in-band",
            self.descriptor()
        )))
    }

    /// Apply a negotiated compression layer.
    async fn compress_stream(
        &self,
        stream: BoxedStream,
        layer: &dyn StreamLayer,
    ) -> Result<BoxedStream> {
        layer.wrap(stream).await
    }

    /// Whether the stream returned by the last `connect` (or upgrade) is encrypted.
    fn is_secure(&self) -> bool;
}

/// Build the transport candidates listed in `config`, in order.
pub fn from_config(config: &SessionConfig) -> Result<Vec<Arc<dyn Transport>>> {
    config
        .transports
        .iter()
        .map(|t| -> Result<Arc<dyn Transport>> {
            match t {
                TransportConfig::Tcp { server, proxy } => Ok(Arc::new(TcpTransport::new(
                    server,
                    proxy.clone(),
                    config.connect_timeout,
                    config.dangerous_insecure_tls,
                ))),
                TransportConfig::WebSocket { url } => Ok(Arc::new(WebSocketTransport::new(
                    url,
                    config.connect_timeout,
                    config.dangerous_insecure_tls,
                )?)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_preserves_candidate_order() {
        let mut config = SessionConfig::for_domain("example.com");
        config.transports.push(TransportConfig::WebSocket {
            url: "wss://example.com/xmpp-websocket".to_string(),
        });
        config.transports.push(TransportConfig::Tcp {
            server: "tls://xmpp.example.com:5223".to_string(),
            proxy: Some(ProxyConfig {
                host: "proxy.local".to_string(),
                port: 3128,
            }),
        });

        let transports = from_config(&config).unwrap();
        let descriptors: Vec<String> = transports
            .iter()
            .map(|t| t.descriptor().to_string())
            .collect();
        assert_eq!(
            descriptors,
            vec![
                "tcp://example.com:5222",
                "websocket://example.com:443",
                "tcp://xmpp.example.com:5223 via proxy.local:3128",
            ]
        );
    }

    #[test]
    fn test_invalid_websocket_url_is_rejected() {
        let mut config = SessionConfig::for_domain("example.com");
        config.transports = vec![TransportConfig::WebSocket {
            url: "not a url".to_string(),
        }];
        assert!(from_config(&config).is_err());
    }
}
