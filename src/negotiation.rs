//! In-band stream feature negotiation.
//!
//! Negotiators claim top-level elements the session does not handle itself
//! (`<proceed/>`, `<compressed/>`, ...). The session maps their outcome onto a
//! stream restart: a successful security negotiation upgrades to TLS, a
//! successful compression negotiation wraps the stream in the negotiator's
//! [`StreamLayer`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::config::SecurityMode;
use crate::error::{Error, Result};
use crate::transport::StreamLayer;
use crate::xml::{ns, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorKind {
    Security,
    Compression,
    Authentication,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationResult {
    Success,
    /// More round trips needed.
    Incomplete,
    Failure(String),
}

/// What a negotiator may see and do while processing one element.
pub struct NegotiationContext<'a> {
    secure: bool,
    security: SecurityMode,
    send: &'a (dyn Fn(Element) -> Result<()> + Send + Sync),
}

impl<'a> NegotiationContext<'a> {
    pub fn new(
        secure: bool,
        security: SecurityMode,
        send: &'a (dyn Fn(Element) -> Result<()> + Send + Sync),
    ) -> Self {
        Self {
            secure,
            security,
            send,
        }
    }

    /// Whether the byte stream is already encrypted.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn security(&self) -> SecurityMode {
        self.security
    }

    pub fn send(&self, element: Element) -> Result<()> {
        (self.send)(element)
    }
}

pub trait FeatureNegotiator: Send + Sync {
    fn kind(&self) -> NegotiatorKind;

    fn can_process(&self, element: &Element) -> bool;

    /// Called from the reader task for every claimed element. Must not block.
    fn process_negotiation(&self, element: &Element, ctx: &NegotiationContext<'_>) -> NegotiationResult;

    /// Layer to apply after a successful compression negotiation.
    fn stream_layer(&self) -> Option<Arc<dyn StreamLayer>> {
        None
    }
}

/// STARTTLS (RFC 6120 section 5).
#[derive(Debug, Default)]
pub struct StartTlsNegotiator;

impl FeatureNegotiator for StartTlsNegotiator {
    fn kind(&self) -> NegotiatorKind {
        NegotiatorKind::Security
    }

    fn can_process(&self, element: &Element) -> bool {
        (element.is("features", ns::STREAM) && element.has_child("starttls", ns::TLS))
            || element.ns() == Some(ns::TLS)
    }

    fn process_negotiation(&self, element: &Element, ctx: &NegotiationContext<'_>) -> NegotiationResult {
        if element.is("features", ns::STREAM) {
            debug!("Server offers STARTTLS, requesting upgrade");
            return match ctx.send(Element::builder("starttls", ns::TLS).build()) {
                Ok(()) => NegotiationResult::Incomplete,
                Err(e) => NegotiationResult::Failure(format!("cannot send starttls: {e}")),
            };
        }
        match element.name() {
            "proceed" => NegotiationResult::Success,
            "failure" => NegotiationResult::Failure("server refused STARTTLS".to_string()),
            other => NegotiationResult::Failure(format!("unexpected TLS element <{other}/>")),
        }
    }
}

/// Summary of the server's last `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// Legacy session establishment (RFC 3921).
    pub session: bool,
    pub session_optional: bool,
    pub compression_methods: Vec<String>,
}

impl StreamFeatures {
    pub fn parse(element: &Element) -> Self {
        let starttls = element.get_child("starttls", ns::TLS);
        let mechanisms = element
            .get_child("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.name() == "mechanism")
                    .map(|c| c.text().trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let session = element.get_child("session", ns::SESSION);
        let compression_methods = element
            .get_child("compression", ns::COMPRESS_FEATURE)
            .map(|c| c.children().map(|m| m.text().trim().to_string()).collect())
            .unwrap_or_default();

        Self {
            starttls: starttls.is_some(),
            starttls_required: starttls.is_some_and(|s| s.children().any(|c| c.name() == "required")),
            mechanisms,
            bind: element.has_child("bind", ns::BIND),
            session: session.is_some(),
            session_optional: session.is_some_and(|s| s.children().any(|c| c.name() == "optional")),
            compression_methods,
        }
    }

    /// Legacy session establishment must be performed.
    pub fn session_required(&self) -> bool {
        self.session && !self.session_optional
    }
}

type SignalValue = Option<std::result::Result<(), Arc<Error>>>;

/// One-shot synchronization point, set at most once to success or failure.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<SignalValue>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    fn set(&self, value: std::result::Result<(), Arc<Error>>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// Returns false when the signal was already set.
    pub fn signal(&self) -> bool {
        self.set(Ok(()))
    }

    pub fn fail(&self, error: Arc<Error>) -> bool {
        self.set(Err(error))
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait up to `timeout` for the signal.
    pub async fn wait(&self, timeout: Duration, context: &str) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let outcome = tokio::time::timeout(timeout, async move {
            rx.wait_for(|v| v.is_some()).await.map(|v| v.clone())
        })
        .await;
        match outcome {
            Err(_) => Err(Error::no_response(context, timeout)),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(Some(Ok(())))) => Ok(()),
            Ok(Ok(Some(Err(cause)))) => Err(Error::Disconnected(cause)),
            Ok(Ok(None)) => Err(Error::ConnectionClosed),
        }
    }
}

/// The two points `login` waits on. Created fresh for every connection
/// attempt and never reused.
#[derive(Clone, Default)]
pub struct PendingNegotiation {
    /// Pre-authentication negotiation is done and SASL is offered.
    pub sasl: Signal,
    /// Resource binding is offered.
    pub bind: Signal,
}

impl PendingNegotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake anyone still waiting with `error`.
    pub fn fail(&self, error: Arc<Error>) {
        self.sasl.fail(error.clone());
        self.bind.fail(error);
    }
}
