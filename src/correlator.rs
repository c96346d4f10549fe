//! Request/response matching over the asynchronous inbound stream.
//!
//! A caller registers a predicate, sends its request and waits. The reader
//! task offers every inbound element; the first element matching a waiter's
//! predicate fills that waiter's one-shot slot. Registration always happens
//! before the send, so a fast response can never slip past its waiter.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::stanza::StanzaError;
use crate::xml::{ns, Element};

type Predicate = Box<dyn Fn(&Element) -> bool + Send + Sync>;

struct Waiter {
    predicate: Predicate,
    slot: Option<oneshot::Sender<Element>>,
}

#[derive(Default)]
pub struct StanzaCorrelator {
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
}

/// Unregisters a waiter on every exit path.
struct Registration<'a> {
    correlator: &'a StanzaCorrelator,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.correlator.waiters().remove(&self.id);
    }
}

/// Matches the `result` or `error` answer to the IQ with `id`.
pub fn iq_response(id: impl Into<String>) -> impl Fn(&Element) -> bool + Send + Sync + 'static {
    let id = id.into();
    move |el: &Element| {
        el.is("iq", ns::CLIENT)
            && el.attr("id") == Some(id.as_str())
            && matches!(el.attr("type"), Some("result") | Some("error"))
    }
}

impl StanzaCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        match self.waiters.lock() {
            Ok(waiters) => waiters,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, predicate: Predicate) -> (Registration<'_>, oneshot::Receiver<Element>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters().insert(
            id,
            Waiter {
                predicate,
                slot: Some(tx),
            },
        );
        (
            Registration {
                correlator: self,
                id,
            },
            rx,
        )
    }

    /// Offer an inbound element to all waiters. Returns how many were woken.
    ///
    /// A predicate that panics counts as no match.
    pub fn offer(&self, element: &Element) -> usize {
        let mut waiters = self.waiters();
        let mut delivered = 0;
        for (id, waiter) in waiters.iter_mut() {
            if waiter.slot.is_none() {
                continue;
            }
            let predicate = &waiter.predicate;
            match catch_unwind(AssertUnwindSafe(|| predicate(element))) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    warn!(waiter = *id, name = element.name(), "Response predicate panicked");
                    continue;
                }
            }
            // First match wins; the slot is gone for any later duplicate
            if let Some(slot) = waiter.slot.take() {
                if slot.send(element.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Register `predicate`, run `send`, then wait up to `timeout` for the
    /// first matching element.
    ///
    /// Fails with [`Error::NoResponse`] on timeout and with [`Error::Stanza`]
    /// when the match is an error-typed response.
    pub async fn await_response<S, P>(
        &self,
        send: S,
        predicate: P,
        timeout: Duration,
        context: &str,
    ) -> Result<Element>
    where
        S: FnOnce() -> Result<()>,
        P: Fn(&Element) -> bool + Send + Sync + 'static,
    {
        let (_registration, rx) = self.register(Box::new(predicate));
        send()?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(element)) => element,
            Ok(Err(_)) => {
                debug!(context, "Waiter dropped before a response arrived");
                return Err(Error::ConnectionClosed);
            }
            Err(_) => {
                warn!(context, timeout_ms = timeout.as_millis() as u64, "No response");
                return Err(Error::no_response(context, timeout));
            }
        };

        if response.attr("type") == Some("error") {
            return Err(Error::Stanza(StanzaError::from_element(&response)));
        }
        Ok(response)
    }

    pub fn pending_count(&self) -> usize {
        self.waiters().len()
    }

    /// Drop every waiter's slot; blocked callers fail with `ConnectionClosed`.
    pub fn clear(&self) {
        for waiter in self.waiters().values_mut() {
            waiter.slot = None;
        }
    }
}
