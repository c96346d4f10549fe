//! Inbound pipeline: pulls top-level elements off the transport and hands them
//! to the [`StreamHandler`], restarting the stream in place when asked to.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{StreamControl, StreamHandler, StreamUpgrade, StreamWriter};
use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Transport};
use crate::xml::{StreamEvent, StreamParser};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Starting,
    Reading,
    Restarting,
    Stopping,
    Stopped,
}

pub struct StreamReader {
    shutdown: broadcast::Sender<()>,
    state: watch::Receiver<ReaderState>,
    task: StdMutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl StreamReader {
    pub fn spawn(
        input: ReadHalf<BoxedStream>,
        writer: StreamWriter,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn StreamHandler>,
        grace: Duration,
    ) -> StreamReader {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let (state_tx, state) = watch::channel(ReaderState::Starting);
        let task = tokio::spawn(async move {
            let mut reader = ReadLoop {
                input,
                writer,
                transport,
                handler: handler.clone(),
                parser: StreamParser::new(),
                state: state_tx,
            };
            let outcome = match AssertUnwindSafe(reader.run(shutdown_rx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %message, "Read loop panicked");
                    Err(Error::Internal(format!("reader panicked: {}", message)))
                }
            };
            reader.state.send_replace(ReaderState::Stopped);
            if let Err(e) = outcome {
                debug!(error = %e, "Read loop ended");
                handler.notify_exception(e);
            }
        });
        StreamReader {
            shutdown,
            state,
            task: StdMutex::new(Some(task)),
            grace,
        }
    }

    pub fn state(&self) -> ReaderState {
        *self.state.borrow()
    }

    /// Stop the read loop. Idempotent; waits at most the grace period, then
    /// aborts the task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                warn!(grace_ms = self.grace.as_millis() as u64, "Reader did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

struct ReadLoop {
    input: ReadHalf<BoxedStream>,
    writer: StreamWriter,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn StreamHandler>,
    parser: StreamParser,
    state: watch::Sender<ReaderState>,
}

impl ReadLoop {
    /// Runs until shutdown (`Ok`) or until the stream fails or ends (`Err`).
    async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        self.state.send_replace(ReaderState::Reading);

        loop {
            let n = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.state.send_replace(ReaderState::Stopping);
                    return Ok(());
                }
                read = self.input.read(&mut buf) => read?,
            };
            if n == 0 {
                info!("Server closed the connection");
                return Err(Error::ConnectionClosed);
            }
            self.parser.push(&buf[..n]);

            while let Some(event) = self.parser.next_event()? {
                match event {
                    StreamEvent::Header(header) => {
                        debug!(id = ?header.id, from = ?header.from, "Stream opened by server");
                        self.handler.stream_opened(&header);
                    }
                    StreamEvent::Closed => {
                        info!("Server closed the stream");
                        return Err(Error::ConnectionClosed);
                    }
                    StreamEvent::Element(element) => {
                        trace!(data = %element.to_wire(), "RECV");
                        match self.handler.handle_element(element)? {
                            StreamControl::Continue => {}
                            StreamControl::Restart(upgrade) => {
                                self.restart(upgrade).await?;
                                // Bytes buffered from the old stream are meaningless now
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn restart(&mut self, upgrade: StreamUpgrade) -> Result<()> {
        self.state.send_replace(ReaderState::Restarting);
        self.parser.reset();

        match upgrade {
            StreamUpgrade::None => {
                debug!("Restarting stream");
                self.writer.open_stream(self.handler.stream_open());
            }
            StreamUpgrade::Secure | StreamUpgrade::Compress(_) => {
                let output = self.writer.detach().await?;
                // Swap in a placeholder while the halves are reunited
                let (placeholder, _) = tokio::io::split(Box::new(tokio::io::duplex(1).0) as BoxedStream);
                let input = std::mem::replace(&mut self.input, placeholder);
                let stream = input.unsplit(output);

                let upgraded = match &upgrade {
                    StreamUpgrade::Compress(layer) => {
                        debug!("Restarting stream with compression");
                        self.transport.compress_stream(stream, layer.as_ref()).await?
                    }
                    _ => {
                        debug!("Restarting stream over TLS");
                        self.transport.secure_connection(stream).await?
                    }
                };
                let (input, output) = tokio::io::split(upgraded);
                self.input = input;
                self.writer.reset(output, self.handler.stream_open())?;
            }
        }

        self.state.send_replace(ReaderState::Reading);
        Ok(())
    }
}
