//! The per-connection XML pipeline: one reader task, one writer task and a
//! keepalive timer running over a transport's byte stream.

pub mod reader;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::ConnectionStatus;
use crate::transport::{BoxedStream, StreamLayer, Transport};
use crate::xml::{Element, StreamHeader, StreamOpen};

pub use reader::{ReaderState, StreamReader};
pub use writer::StreamWriter;

/// What the reader must do after an element was handled.
#[derive(Clone)]
pub enum StreamControl {
    Continue,
    /// Re-open the XML stream, optionally after upgrading the byte stream.
    Restart(StreamUpgrade),
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamControl::Continue => f.write_str("Continue"),
            StreamControl::Restart(StreamUpgrade::None) => f.write_str("Restart"),
            StreamControl::Restart(StreamUpgrade::Secure) => f.write_str("Restart(Secure)"),
            StreamControl::Restart(StreamUpgrade::Compress(_)) => f.write_str("Restart(Compress)"),
        }
    }
}

#[derive(Clone)]
pub enum StreamUpgrade {
    /// Same bytes, fresh stream header (e.g. after SASL success).
    None,
    /// TLS handshake first (after `<proceed/>`).
    Secure,
    /// Wrap the byte stream first (after `<compressed/>`).
    Compress(Arc<dyn StreamLayer>),
}

/// Receives everything the reader and writer produce.
///
/// Called from the reader task, so implementations must not wait on anything
/// the reader itself delivers.
pub trait StreamHandler: Send + Sync + 'static {
    /// The server's stream header arrived.
    fn stream_opened(&self, header: &StreamHeader);

    /// A complete top-level element arrived. An `Err` terminates the read loop.
    fn handle_element(&self, element: Element) -> Result<StreamControl>;

    /// Single funnel for read/write/negotiation failures.
    fn notify_exception(&self, error: Error);

    /// Header to send when (re)opening the stream.
    fn stream_open(&self) -> StreamOpen;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub keepalive_interval: Duration,
    pub shutdown_grace: Duration,
}

/// The active connection: a transport plus the reader and writer running on it.
pub struct Connection {
    transport: Arc<dyn Transport>,
    writer: StreamWriter,
    reader: StreamReader,
}

impl Connection {
    /// Start the pipeline on `stream` and send the initial stream header.
    pub fn start(
        transport: Arc<dyn Transport>,
        stream: BoxedStream,
        handler: Arc<dyn StreamHandler>,
        status: watch::Receiver<ConnectionStatus>,
        options: PipelineOptions,
    ) -> Connection {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = StreamWriter::spawn(write_half, handler.clone(), status, options);
        writer.open_stream(handler.stream_open());
        let reader = StreamReader::spawn(
            read_half,
            writer.clone(),
            transport.clone(),
            handler,
            options.shutdown_grace,
        );
        info!(transport = %transport.descriptor(), "Stream pipeline started");
        Connection {
            transport,
            writer,
            reader,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn reader_state(&self) -> ReaderState {
        self.reader.state()
    }

    pub fn send(&self, element: Element) -> Result<()> {
        self.writer.send(element)
    }

    /// Re-open the XML stream on the current byte stream.
    pub fn restart_stream(&self, open: StreamOpen) {
        self.writer.open_stream(open);
    }

    /// Write the closing tag, then stop writer, keepalive and reader. Every
    /// wait is bounded by the shutdown grace period.
    pub async fn close(&self) {
        self.writer.shutdown().await;
        self.reader.shutdown().await;
        info!(transport = %self.transport.descriptor(), "Stream pipeline closed");
    }
}
