//! Authentication collaborators.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::{Error, LoginError, Result};
use crate::negotiation::StreamFeatures;
use crate::session::Session;
use crate::xml::{ns, Element};

/// Login input, kept by the session so reconnects can replay it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Resource to request at bind time; the server picks one when `None`.
    pub resource: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

/// Runs the authentication exchange on a connected session. Returns once the
/// server accepted the credentials; the stream restart that follows is
/// handled by the session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        session: &Session,
        features: &StreamFeatures,
        credentials: &Credentials,
    ) -> Result<()>;
}

/// SASL PLAIN (RFC 4616). Only meant for TLS-protected streams, which the
/// session enforces unless security is disabled.
#[derive(Debug, Clone)]
pub struct SaslAuthenticator {
    pub timeout: Duration,
}

impl Default for SaslAuthenticator {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

const PLAIN: &str = "PLAIN";

fn plain_payload(credentials: &Credentials) -> String {
    STANDARD.encode(format!("\0{}\0{}", credentials.username, credentials.password))
}

fn is_sasl_outcome(element: &Element) -> bool {
    element.ns() == Some(ns::SASL) && matches!(element.name(), "success" | "failure")
}

#[async_trait]
impl Authenticator for SaslAuthenticator {
    async fn authenticate(
        &self,
        session: &Session,
        features: &StreamFeatures,
        credentials: &Credentials,
    ) -> Result<()> {
        if !features.mechanisms.iter().any(|m| m == PLAIN) {
            return Err(LoginError::NoSupportedMechanism(features.mechanisms.clone()).into());
        }
        debug!(mechanism = PLAIN, user = %credentials.username, "Authenticating");

        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", PLAIN)
            .text(plain_payload(credentials))
            .build();
        let outcome = session
            .send_and_await(auth, is_sasl_outcome, self.timeout, "SASL outcome")
            .await?;

        if outcome.name() == "success" {
            return Ok(());
        }
        let condition = outcome
            .children()
            .find(|c| c.name() != "text")
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "not-authorized".to_string());
        let text = outcome
            .children()
            .find(|c| c.name() == "text")
            .map(|t| t.text());
        warn!(condition = %condition, "SASL authentication rejected");
        Err(Error::Login(LoginError::Sasl { condition, text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_element;

    #[test]
    fn test_plain_payload() {
        let payload = plain_payload(&Credentials::new("juliet", "r0m30"));
        assert_eq!(payload, "AGp1bGlldAByMG0zMA==");
        let decoded = STANDARD.decode(payload).unwrap();
        assert_eq!(decoded, b"\0juliet\0r0m30");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("juliet", "secret").with_resource("balcony");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("juliet"));
        assert!(debug.contains("balcony"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_sasl_outcome_predicate() {
        let success = parse_element("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap();
        let failure = parse_element(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        )
        .unwrap();
        let challenge =
            parse_element("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>abc</challenge>").unwrap();
        assert!(is_sasl_outcome(&success));
        assert!(is_sasl_outcome(&failure));
        assert!(!is_sasl_outcome(&challenge));
    }
}
