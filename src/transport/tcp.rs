//! TCP transport: SRV resolution, optional HTTP CONNECT proxy, direct TLS or
//! STARTTLS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::dns::{self, Endpoint, ServerAddress, TlsMode};
use super::{tls, BoxedStream, Transport, TransportDescriptor, TransportKind};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// Largest proxy response header accepted before giving up.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

#[derive(Debug)]
pub struct TcpTransport {
    server: String,
    descriptor: TransportDescriptor,
    connect_timeout: Duration,
    insecure_tls: bool,
    /// Endpoint of the current connection, for STARTTLS verification.
    current: Mutex<Option<Endpoint>>,
    secure: AtomicBool,
}

impl TcpTransport {
    pub fn new(
        server: &str,
        proxy: Option<ProxyConfig>,
        connect_timeout: Duration,
        insecure_tls: bool,
    ) -> Self {
        let (host, port) = match dns::parse_server(server) {
            ServerAddress::Direct(endpoint) => (endpoint.host, endpoint.port),
            ServerAddress::Domain(domain) => (domain, 5222),
        };
        Self {
            server: server.to_string(),
            descriptor: TransportDescriptor {
                kind: TransportKind::Tcp,
                host,
                port,
                proxy,
            },
            connect_timeout,
            insecure_tls,
            current: Mutex::new(None),
            secure: AtomicBool::new(false),
        }
    }

    /// Endpoint the last successful `connect` reached.
    pub fn connected_endpoint(&self) -> Option<Endpoint> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    async fn candidates(&self) -> Result<Vec<Endpoint>> {
        // Resolve per connection so DNS changes (e.g. after sleep) are picked up
        match dns::parse_server(&self.server) {
            ServerAddress::Direct(endpoint) => {
                info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                    "Using explicit endpoint");
                Ok(vec![endpoint])
            }
            ServerAddress::Domain(domain) => dns::resolve(&domain).await,
        }
    }

    async fn open_socket(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let (target_host, target_port) = match &self.descriptor.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (endpoint.host.as_str(), endpoint.port),
        };

        let mut socket = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target_host, target_port)),
        )
        .await
        .map_err(|_| {
            error!(host = target_host, port = target_port,
                timeout_secs = self.connect_timeout.as_secs(), "TCP connect timed out");
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "TCP connect timed out after {}s to {}:{}",
                    self.connect_timeout.as_secs(),
                    target_host,
                    target_port
                ),
            ))
        })?
        .map_err(|e| {
            error!(host = target_host, port = target_port, error = %e, error_kind = ?e.kind(),
                "TCP connect failed");
            Error::Io(e)
        })?;
        let _ = socket.set_nodelay(true);

        if self.descriptor.proxy.is_some() {
            proxy_connect(&mut socket, &endpoint.host, endpoint.port, self.connect_timeout).await?;
        }
        Ok(socket)
    }

    async fn connect_endpoint(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        let socket = self.open_socket(endpoint).await?;
        match endpoint.mode {
            TlsMode::StartTls => {
                info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
                Ok(Box::new(socket))
            }
            TlsMode::Direct => {
                // SNI uses the XMPP domain, not the SRV target host
                let stream = tls::upgrade(Box::new(socket), endpoint.tls_name(), self.insecure_tls).await?;
                info!(host = %endpoint.host, port = endpoint.port,
                    tls_name = endpoint.tls_name(), "Connected (direct TLS)");
                Ok(stream)
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    async fn connect(&self) -> Result<BoxedStream> {
        let started = Instant::now();
        self.secure.store(false, Ordering::SeqCst);
        let endpoints = self.candidates().await?;

        let mut last_error = None;
        for (index, endpoint) in endpoints.iter().enumerate() {
            match self.connect_endpoint(endpoint).await {
                Ok(stream) => {
                    self.secure
                        .store(endpoint.mode == TlsMode::Direct, Ordering::SeqCst);
                    if let Ok(mut current) = self.current.lock() {
                        *current = Some(endpoint.clone());
                    }
                    info!(host = %endpoint.host, port = endpoint.port,
                        connect_ms = started.elapsed().as_millis() as u64, "Transport connected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(host = %endpoint.host, port = endpoint.port, attempt = index + 1,
                        total = endpoints.len(), error = %e, "Endpoint unreachable, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::Dns(format!("no endpoints resolved for {}", self.server))
        }))
    }

    async fn secure_connection(&self, stream: BoxedStream) -> Result<BoxedStream> {
        let tls_name = self
            .connected_endpoint()
            .map(|e| e.tls_name().to_string())
            .unwrap_or_else(|| self.descriptor.host.clone());
        debug!(tls_name = %tls_name, "STARTTLS: upgrading stream");
        let stream = tls::upgrade(stream, &tls_name, self.insecure_tls).await?;
        self.secure.store(true, Ordering::SeqCst);
        info!(tls_name = %tls_name, "STARTTLS: TLS handshake complete");
        Ok(stream)
    }

    fn is_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }
}

/// Ask an HTTP proxy to tunnel to `host:port`.
async fn proxy_connect(
    socket: &mut TcpStream,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<()> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    socket.write_all(request.as_bytes()).await?;
    socket.flush().await?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    // Byte-at-a-time so nothing past the header is consumed from the tunnel
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > MAX_PROXY_RESPONSE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "proxy response header too large",
            )));
        }
        let n = tokio::time::timeout_at(deadline, socket.read(&mut byte))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "proxy did not answer CONNECT")
            })??;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("proxy refused CONNECT to {}:{}: {}", host, port, status_line),
        )));
    }
    debug!(host, port, "Proxy tunnel established");
    Ok(())
}
