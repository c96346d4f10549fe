//! Serialized output: one writer task drains a FIFO of commands so elements hit
//! the wire in `send` order. The keepalive timer shares the output mutex, so a
//! whitespace ping never lands in the middle of an element.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{PipelineOptions, StreamHandler};
use crate::error::{Error, Result};
use crate::session::ConnectionStatus;
use crate::transport::BoxedStream;
use crate::xml::{Element, StreamOpen, STREAM_CLOSE};

pub type Output = WriteHalf<BoxedStream>;

enum WriterCommand {
    Element(Element),
    OpenStream(StreamOpen),
    /// Hand the output back so the transport can be upgraded.
    Detach(oneshot::Sender<Option<Output>>),
    /// Install a new output and re-open the stream on it.
    Reset { output: Output, open: StreamOpen },
    Close(oneshot::Sender<()>),
}

type SharedOutput = Arc<Mutex<Option<Output>>>;

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    shutdown: broadcast::Sender<()>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    grace: Duration,
}

impl StreamWriter {
    /// Start the writer task and the keepalive timer on `output`.
    pub fn spawn(
        output: Output,
        handler: Arc<dyn StreamHandler>,
        status: watch::Receiver<ConnectionStatus>,
        options: PipelineOptions,
    ) -> StreamWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let output: SharedOutput = Arc::new(Mutex::new(Some(output)));

        let writer_task = tokio::spawn(run_writer(rx, output.clone(), handler));
        let keepalive_task = tokio::spawn(run_keepalive(
            output,
            status,
            options.keepalive_interval,
            shutdown.subscribe(),
        ));

        StreamWriter {
            tx,
            shutdown,
            tasks: Arc::new(StdMutex::new(vec![writer_task, keepalive_task])),
            grace: options.shutdown_grace,
        }
    }

    fn submit(&self, command: WriterCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::NotConnected)
    }

    /// Queue `element`. Write failures are reported to the handler, not here.
    pub fn send(&self, element: Element) -> Result<()> {
        self.submit(WriterCommand::Element(element))
    }

    /// Queue a stream header.
    pub fn open_stream(&self, open: StreamOpen) {
        if self.submit(WriterCommand::OpenStream(open)).is_err() {
            debug!("Stream header dropped: writer already closed");
        }
    }

    /// Take the output once everything queued so far has been written.
    /// Elements sent while detached are held until [`reset`](Self::reset).
    pub async fn detach(&self) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        self.submit(WriterCommand::Detach(tx))?;
        rx.await
            .map_err(|_| Error::NotConnected)?
            .ok_or(Error::NotConnected)
    }

    /// Install `output` (e.g. the TLS half after an upgrade) and re-open the stream.
    pub fn reset(&self, output: Output, open: StreamOpen) -> Result<()> {
        self.submit(WriterCommand::Reset { output, open })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Write the closing tag, stop accepting sends and stop the keepalive.
    /// Idempotent; waits at most the grace period per task.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.submit(WriterCommand::Close(ack_tx)).is_ok()
            && tokio::time::timeout(self.grace, ack_rx).await.is_err()
        {
            warn!(grace_ms = self.grace.as_millis() as u64, "Writer did not flush in time");
        }
        let _ = self.shutdown.send(());

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut task in tasks {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

async fn write_bytes(output: &SharedOutput, bytes: &[u8]) -> std::io::Result<bool> {
    let mut guard = output.lock().await;
    match guard.as_mut() {
        Some(out) => {
            out.write_all(bytes).await?;
            out.flush().await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    output: SharedOutput,
    handler: Arc<dyn StreamHandler>,
) {
    // Elements queued while the output is detached for an upgrade
    let mut pending: Vec<String> = Vec::new();
    let mut detached = false;
    let mut failed = false;

    while let Some(command) = rx.recv().await {
        let result = match command {
            WriterCommand::Element(element) => {
                let xml = element.to_wire();
                if detached {
                    pending.push(xml);
                    Ok(())
                } else if failed {
                    Ok(())
                } else {
                    trace!(data = %xml, "SEND");
                    write_bytes(&output, xml.as_bytes()).await.map(|_| ())
                }
            }
            WriterCommand::OpenStream(open) => {
                let header = open.header();
                trace!(data = %header, "SEND");
                write_bytes(&output, header.as_bytes()).await.map(|_| ())
            }
            WriterCommand::Detach(reply) => {
                detached = true;
                let taken = output.lock().await.take();
                let _ = reply.send(taken);
                Ok(())
            }
            WriterCommand::Reset { output: new_output, open } => {
                detached = false;
                failed = false;
                {
                    let mut guard = output.lock().await;
                    if let Some(mut old) = guard.replace(new_output) {
                        let _ = old.shutdown().await;
                    }
                }
                let mut bytes = open.header();
                trace!(data = %bytes, "SEND");
                for xml in pending.drain(..) {
                    trace!(data = %xml, "SEND");
                    bytes.push_str(&xml);
                }
                write_bytes(&output, bytes.as_bytes()).await.map(|_| ())
            }
            WriterCommand::Close(ack) => {
                // Take the output first so no keepalive can follow the closing tag
                let taken = output.lock().await.take();
                if let Some(mut out) = taken {
                    if !failed {
                        trace!(data = STREAM_CLOSE, "SEND");
                        let _ = out.write_all(STREAM_CLOSE.as_bytes()).await;
                        let _ = out.flush().await;
                    }
                    let _ = out.shutdown().await;
                }
                let _ = ack.send(());
                break;
            }
        };

        if let Err(e) = result {
            if !failed {
                failed = true;
                warn!(error = %e, "Write failed");
                handler.notify_exception(Error::Io(e));
            }
        }
    }
    debug!("Writer stopped");
}

async fn run_keepalive(
    output: SharedOutput,
    status: watch::Receiver<ConnectionStatus>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if *status.borrow() != ConnectionStatus::Connected {
                    continue;
                }
                match write_bytes(&output, b" ").await {
                    Ok(true) => trace!("Keepalive sent"),
                    Ok(false) => {}
                    // The reader notices a dead socket; nothing to report from here
                    Err(e) => debug!(error = %e, "Keepalive write failed"),
                }
            }
        }
    }
    debug!("Keepalive stopped");
}
