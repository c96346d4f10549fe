//! Connection status state machine.
//!
//! Transitions are applied under one lock and queued, in order, to a single
//! notifier task. Listeners therefore see every change exactly once and in
//! the order it happened, and never run on the reader or writer tasks.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::listeners::{invoke_isolated, ListenerId, ListenerRegistry, StatusListener};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
        })
    }
}

/// One applied transition.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
    /// Why the connection went down, for transitions into `Disconnected`.
    pub cause: Option<Arc<Error>>,
}

pub struct StatusMachine {
    current: Mutex<ConnectionStatus>,
    watch: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<StatusEvent>,
    listeners: Arc<ListenerRegistry<StatusListener>>,
}

impl StatusMachine {
    /// Starts in `Closed`. The notifier task runs on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(ListenerRegistry::new());
        runtime.spawn(run_notifier(rx, listeners.clone()));
        let (watch, _) = watch::channel(ConnectionStatus::Closed);
        Self {
            current: Mutex::new(ConnectionStatus::Closed),
            watch,
            events,
            listeners,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.watch.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.watch.subscribe()
    }

    /// Move to `next`. Returns false (and notifies nobody) when the status
    /// already is `next`.
    pub fn update(&self, next: ConnectionStatus, cause: Option<Arc<Error>>) -> bool {
        self.apply(None, next, cause)
    }

    /// Move to `next` only while the status is `expected`.
    pub fn transition_from(
        &self,
        expected: ConnectionStatus,
        next: ConnectionStatus,
        cause: Option<Arc<Error>>,
    ) -> bool {
        self.apply(Some(expected), next, cause)
    }

    fn apply(
        &self,
        expected: Option<ConnectionStatus>,
        next: ConnectionStatus,
        cause: Option<Arc<Error>>,
    ) -> bool {
        let mut current = match self.current.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = *current;
        if previous == next || expected.is_some_and(|e| e != previous) {
            return false;
        }
        *current = next;
        self.watch.send_replace(next);
        info!(from = %previous, to = %next, "Connection status changed");
        // Queued while still holding the lock, so the notifier sees transitions in order
        let _ = self.events.send(StatusEvent {
            previous,
            current: next,
            cause,
        });
        true
    }

    pub fn add_listener(&self, listener: Arc<StatusListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

async fn run_notifier(
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    listeners: Arc<ListenerRegistry<StatusListener>>,
) {
    while let Some(event) = rx.recv().await {
        for listener in listeners.snapshot() {
            invoke_isolated("status", || listener(&event));
        }
        if event.current == ConnectionStatus::Closed && event.previous == ConnectionStatus::Closing {
            // A closed session is not reused
            listeners.clear();
        }
    }
    debug!("Status notifier stopped");
}
