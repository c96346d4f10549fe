//! Stanza classification and the error conditions carried by stanzas and streams.
//!
//! Payload schemas stay out of this module: a [`Stanza`] is only a typed view
//! over an [`Element`] in the `jabber:client` namespace.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::xml::{ns, Element};

static NEXT_STANZA_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique stanza id.
pub fn next_id() -> String {
    format!("fl{}", NEXT_STANZA_ID.fetch_add(1, Ordering::Relaxed))
}

/// The three top-level stanza kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Element),
    Presence(Element),
    Iq(Element),
}

impl Stanza {
    /// Classify `element`, handing it back unchanged when it is not a stanza.
    pub fn from_element(element: Element) -> Result<Stanza, Element> {
        if element.ns() != Some(ns::CLIENT) {
            return Err(element);
        }
        match element.name() {
            "message" => Ok(Stanza::Message(element)),
            "presence" => Ok(Stanza::Presence(element)),
            "iq" => Ok(Stanza::Iq(element)),
            _ => Err(element),
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Message(e) | Stanza::Presence(e) | Stanza::Iq(e) => e,
        }
    }

    pub fn into_element(self) -> Element {
        match self {
            Stanza::Message(e) | Stanza::Presence(e) | Stanza::Iq(e) => e,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.element().attr("id")
    }

    pub fn is_error(&self) -> bool {
        self.element().attr("type") == Some("error")
    }
}

/// Value of an IQ's `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    pub fn of(element: &Element) -> Option<Self> {
        element.attr("type").and_then(Self::parse)
    }
}

/// IQ constructors.
pub struct Iq;

impl Iq {
    fn build(kind: IqType, to: Option<&str>, payload: Option<Element>) -> Element {
        let mut iq = Element::builder("iq", ns::CLIENT)
            .attr("type", kind.as_str())
            .attr("id", next_id())
            .attr_opt("to", to)
            .build();
        if let Some(payload) = payload {
            iq.append_child(payload);
        }
        iq
    }

    pub fn get(to: Option<&str>, payload: Element) -> Element {
        Self::build(IqType::Get, to, Some(payload))
    }

    pub fn set(to: Option<&str>, payload: Element) -> Element {
        Self::build(IqType::Set, to, Some(payload))
    }

    /// Empty result answering `request`, addressed back to its sender.
    pub fn result_for(request: &Element) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("type", IqType::Result.as_str())
            .attr_opt("id", request.attr("id"))
            .attr_opt("to", request.attr("from"))
            .build()
    }

    /// `service-unavailable` error answering `request`.
    pub fn service_unavailable(request: &Element) -> Element {
        let error = Element::builder("error", ns::CLIENT)
            .attr("type", "cancel")
            .append(Element::builder("service-unavailable", ns::STANZA_ERRORS).build())
            .build();
        Element::builder("iq", ns::CLIENT)
            .attr("type", IqType::Error.as_str())
            .attr_opt("id", request.attr("id"))
            .attr_opt("to", request.attr("from"))
            .append(error)
            .build()
    }
}

/// A protocol-level error attached to an error-typed response.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// Defined condition, e.g. `item-not-found`.
    pub condition: String,
    /// The `type` of the `<error/>` child (`cancel`, `auth`, `wait`, ...).
    pub kind: Option<String>,
    pub text: Option<String>,
    /// The complete error response.
    pub element: Element,
}

impl StanzaError {
    pub fn from_element(element: &Element) -> Self {
        let error = element.get_child("error", ns::CLIENT);
        let condition = error
            .and_then(|e| {
                e.children()
                    .find(|c| c.ns() == Some(ns::STANZA_ERRORS) && c.name() != "text")
            })
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let kind = error.and_then(|e| e.attr("type")).map(str::to_string);
        let text = error
            .and_then(|e| e.get_child("text", ns::STANZA_ERRORS))
            .map(Element::text);
        StanzaError {
            condition,
            kind,
            text,
            element: element.clone(),
        }
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.condition)?;
        if let Some(text) = &self.text {
            write!(f, " ({})", text)?;
        }
        Ok(())
    }
}

/// Defined conditions of a `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    InternalServerError,
    NotAuthorized,
    PolicyViolation,
    ResourceConstraint,
    SeeOtherHost,
    SystemShutdown,
    Other(String),
}

impl StreamErrorCondition {
    pub fn parse(name: &str) -> Self {
        match name {
            "bad-format" => Self::BadFormat,
            "conflict" => Self::Conflict,
            "connection-timeout" => Self::ConnectionTimeout,
            "host-gone" => Self::HostGone,
            "host-unknown" => Self::HostUnknown,
            "internal-server-error" => Self::InternalServerError,
            "not-authorized" => Self::NotAuthorized,
            "policy-violation" => Self::PolicyViolation,
            "resource-constraint" => Self::ResourceConstraint,
            "see-other-host" => Self::SeeOtherHost,
            "system-shutdown" => Self::SystemShutdown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::BadFormat => "bad-format",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::InternalServerError => "internal-server-error",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::SeeOtherHost => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::Other(name) => name,
        }
    }

    /// `false` for conditions where reconnecting would repeat a server policy
    /// decision (another client took the resource, credentials revoked, ...).
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Conflict | Self::NotAuthorized | Self::PolicyViolation | Self::HostUnknown
        )
    }
}

/// A stream-level error sent by the server. The stream is closed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
}

impl StreamError {
    /// Parse a `<stream:error/>` element. Returns `None` for anything else.
    pub fn from_element(element: &Element) -> Option<Self> {
        if !element.is("error", ns::STREAM) {
            return None;
        }
        let condition = element
            .children()
            .find(|c| c.ns() == Some(ns::STREAM_ERRORS) && c.name() != "text")
            .map(|c| StreamErrorCondition::parse(c.name()))
            .unwrap_or_else(|| StreamErrorCondition::Other("undefined-condition".to_string()));
        let text = element
            .get_child("text", ns::STREAM_ERRORS)
            .map(Element::text);
        Some(StreamError { condition, text })
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.condition.as_str())?;
        if let Some(text) = &self.text {
            write!(f, " ({})", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_element;

    #[test]
    fn test_classify_stanzas() {
        let message = parse_element("<message id='m1'><body>hi</body></message>").unwrap();
        assert!(matches!(Stanza::from_element(message), Ok(Stanza::Message(_))));

        let features =
            parse_element("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>")
                .unwrap();
        assert!(Stanza::from_element(features).is_err());

        let iq = Stanza::from_element(parse_element("<iq type='error' id='q7'/>").unwrap()).unwrap();
        assert_eq!(iq.id(), Some("q7"));
        assert!(iq.is_error());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Iq::get(None, Element::builder("query", ns::ROSTER).build());
        let b = Iq::get(None, Element::builder("query", ns::ROSTER).build());
        assert_ne!(a.attr("id"), b.attr("id"));
        assert_eq!(IqType::of(&a), Some(IqType::Get));
    }

    #[test]
    fn test_result_for_swaps_addressing() {
        let ping = parse_element(
            "<iq type='get' id='p1' from='example.com' to='me@example.com/r'><ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .unwrap();
        let result = Iq::result_for(&ping);
        assert_eq!(result.to_wire(), "<iq type='result' id='p1' to='example.com'/>");
    }

    #[test]
    fn test_parse_stanza_error() {
        let response = parse_element(
            "<iq type='error' id='q1'><error type='cancel'>\
             <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>No such node</text></error></iq>",
        )
        .unwrap();
        let error = StanzaError::from_element(&response);
        assert_eq!(error.condition, "item-not-found");
        assert_eq!(error.kind.as_deref(), Some("cancel"));
        assert_eq!(error.to_string(), "item-not-found (No such node)");
    }

    #[test]
    fn test_parse_stream_error() {
        let element = parse_element(
            "<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        )
        .unwrap();
        let error = StreamError::from_element(&element).unwrap();
        assert_eq!(error.condition, StreamErrorCondition::Conflict);
        assert!(!error.condition.is_retriable());

        let shutdown = StreamErrorCondition::parse("system-shutdown");
        assert!(shutdown.is_retriable());
        assert_eq!(StreamErrorCondition::parse("x-custom").as_str(), "x-custom");
    }
}
