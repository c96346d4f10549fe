//! WebSocket transport (RFC 7395).
//!
//! The engine's reader and writer speak traditional `<stream:stream>` framing
//! over a byte stream. This transport hands them one end of an in-memory pipe
//! and runs a bridge task that translates between that pipe and WebSocket text
//! frames, one complete element per frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace};

use super::{tls, BoxedStream, Transport, TransportDescriptor, TransportKind};
use crate::error::{Error, Result};
use crate::xml::framing::{extract_stanza, frame_to_stream, stream_to_frame};
use crate::xml::parser::MAX_STANZA_BUFFER_SIZE;

/// Capacity of the in-memory pipe between the engine and the bridge task.
const PIPE_CAPACITY: usize = 64 * 1024;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    secure: bool,
    descriptor: TransportDescriptor,
    connect_timeout: Duration,
    insecure_tls: bool,
}

impl WebSocketTransport {
    pub fn new(url: &str, connect_timeout: Duration, insecure_tls: bool) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Config(format!("invalid WebSocket URL '{}': {}", url, e)))?;
        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => {
                return Err(Error::Config(format!(
                    "WebSocket URL must use ws:// or wss://, got '{}'",
                    url
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::Config(format!("WebSocket URL has no host: '{}'", url)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            url: url.to_string(),
            secure,
            descriptor: TransportDescriptor {
                kind: TransportKind::WebSocket,
                host,
                port,
                proxy: None,
            },
            connect_timeout,
            insecure_tls,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    async fn connect(&self) -> Result<BoxedStream> {
        let started = Instant::now();
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

        let connector = if self.secure {
            Some(Connector::Rustls(tls::client_config(self.insecure_tls)?))
        } else {
            None
        };

        let (ws, _response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| {
            Error::WebSocket(format!(
                "WebSocket connect timed out after {}s to {}",
                self.connect_timeout.as_secs(),
                self.url
            ))
        })?
        .map_err(|e| {
            error!(url = %self.url, error = %e, "WebSocket connect failed");
            Error::WebSocket(e.to_string())
        })?;

        let conn_id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, url = %self.url, connect_ms = started.elapsed().as_millis() as u64,
            "Connected (WebSocket)");

        let (engine_end, bridge_end) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(bridge(ws, bridge_end, conn_id));
        Ok(Box::new(engine_end))
    }

    /// `wss://` already provides transport security; in-band STARTTLS is refused.
    async fn secure_connection(&self, stream: BoxedStream) -> Result<BoxedStream> {
        drop(stream);
        Err(Error::Unsupported(
            "STARTTLS is not available over WebSocket".to_string(),
        ))
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeEndReason {
    ServerClosed,
    WebSocketError,
    EngineClosed,
    FramingError,
}

/// Move traffic between `ws` and `pipe` until either side ends.
async fn bridge(ws: WsStream, pipe: DuplexStream, conn_id: u64) {
    let started = Instant::now();
    let (mut ws_write, mut ws_read) = ws.split();
    let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe);

    // Server -> engine: RFC 7395 frames become stream framing
    let inbound = async {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let translated = frame_to_stream(&text);
                    trace!(conn_id, data = %translated, "WS->engine");
                    if pipe_write.write_all(translated.as_bytes()).await.is_err() {
                        return BridgeEndReason::EngineClosed;
                    }
                }
                Ok(Message::Close(_)) => return BridgeEndReason::ServerClosed,
                Ok(_) => {}
                Err(e) => {
                    error!(conn_id, error = %e, "WebSocket read error");
                    return BridgeEndReason::WebSocketError;
                }
            }
        }
        BridgeEndReason::ServerClosed
    };

    // Engine -> server: split the byte stream into elements, one frame each
    let outbound = async {
        let mut buffer: Vec<u8> = Vec::new();
        let mut read_buf = [0u8; 8192];
        loop {
            let n = match pipe_read.read(&mut read_buf).await {
                Ok(0) | Err(_) => return BridgeEndReason::EngineClosed,
                Ok(n) => n,
            };
            buffer.extend_from_slice(&read_buf[..n]);

            let mut consumed = 0;
            loop {
                match extract_stanza(&buffer[consumed..]) {
                    Ok(Some((xml, used))) => {
                        consumed += used;
                        let frame = stream_to_frame(&xml).into_owned();
                        trace!(conn_id, data = %frame, "engine->WS");
                        if let Err(e) = ws_write.send(Message::Text(frame)).await {
                            debug!(conn_id, error = %e, "WebSocket write error");
                            return BridgeEndReason::WebSocketError;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(conn_id, error = %e, "Outbound framing error");
                        return BridgeEndReason::FramingError;
                    }
                }
            }
            if consumed > 0 {
                buffer.drain(..consumed);
            }
            // Whitespace keepalives have no frame of their own
            if buffer.iter().all(u8::is_ascii_whitespace) {
                buffer.clear();
            }
            if buffer.len() > MAX_STANZA_BUFFER_SIZE {
                error!(conn_id, buffer_bytes = buffer.len(), "Outbound buffer exceeded size limit");
                return BridgeEndReason::FramingError;
            }
        }
    };

    let end_reason = tokio::select! {
        reason = inbound => reason,
        reason = outbound => reason,
    };

    let close_result = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = ws_write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Session closed".into(),
            })))
            .await;
    })
    .await;
    if close_result.is_err() {
        debug!(conn_id, "WebSocket close frame send timed out");
    }

    info!(conn_id, reason = ?end_reason, bridge_ms = started.elapsed().as_millis() as u64,
        "WebSocket bridge ended");
}
