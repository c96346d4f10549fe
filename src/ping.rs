//! XMPP Ping (XEP-0199).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::extension::{ExtensionFactory, ExtensionInstance};
use crate::session::{Session, WeakSession};
use crate::stanza::Iq;
use crate::xml::{ns, Element};

/// Extension key the ping manager is registered under.
pub const PING_EXTENSION: &str = ns::PING;

/// Answers inbound pings and sends outbound ones.
pub struct PingManager {
    session: WeakSession,
}

impl PingManager {
    pub fn new(session: &Session) -> Self {
        session.set_iq_handler(
            "ping",
            ns::PING,
            Arc::new(|request: &Element| {
                debug!(from = ?request.attr("from"), "Answering ping");
                Iq::result_for(request)
            }),
        );
        Self {
            session: session.downgrade(),
        }
    }

    pub fn factory() -> ExtensionFactory {
        Arc::new(|session: &Session| -> ExtensionInstance { Arc::new(PingManager::new(session)) })
    }

    /// Ping `to` (the server when `None`) and return the round-trip time.
    pub async fn ping(&self, to: Option<&str>) -> Result<Duration> {
        let session = self.session.upgrade().ok_or(Error::NotConnected)?;
        let started = Instant::now();
        session
            .query(Iq::get(to, Element::builder("ping", ns::PING).build()), None)
            .await?;
        let rtt = started.elapsed();
        debug!(to = ?to, rtt_ms = rtt.as_millis() as u64, "Ping answered");
        Ok(rtt)
    }
}
