//! Client-side XMPP session engine.
//!
//! A [`Session`] connects over one of several candidate transports (TCP with
//! SRV resolution, STARTTLS or direct TLS, optionally through an HTTP CONNECT
//! proxy, or RFC 7395 WebSocket), runs the reader, writer and keepalive tasks
//! on the resulting byte stream, negotiates stream features in-band, and
//! reconnects with truncated binary exponential backoff after unexpected
//! disconnects.
//!
//! ```no_run
//! # async fn run() -> fluux_session::Result<()> {
//! use fluux_session::{Session, SessionConfig};
//!
//! let session = Session::builder(SessionConfig::for_domain("example.com")).build()?;
//! session.connect().await?;
//! let jid = session.login("juliet", "secret").await?;
//! println!("bound as {jid}");
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod config;
pub mod correlator;
pub mod error;
pub mod extension;
pub mod jid;
pub mod logging;
pub mod negotiation;
pub mod ping;
pub mod reconnect;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod transport;
pub mod xml;

pub use auth::{Authenticator, Credentials, SaslAuthenticator};
pub use backoff::{BackoffStrategy, FixedBackoff, TruncatedBinaryExponentialBackoff};
pub use config::{ProxyConfig, ReconnectionConfig, SecurityMode, SessionConfig, TransportConfig};
pub use error::{Error, LoginError, Result};
pub use jid::Jid;
pub use negotiation::{FeatureNegotiator, NegotiationResult, NegotiatorKind, StreamFeatures};
pub use ping::PingManager;
pub use reconnect::ReconnectionManager;
pub use session::{ConnectionStatus, ListenerId, Session, SessionBuilder, StatusEvent, WeakSession};
pub use stanza::{Iq, Stanza, StanzaError, StreamError};
pub use xml::{ns, Element};

/// Version and source revision of this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
    }
}
