//! XML element model used on both directions of the stream.
//!
//! Payload schemas are not modelled here: an [`Element`] is a plain tree of
//! names, namespaces, attributes and text. Parsing lives in [`parser`],
//! serialization in [`writer`], and WebSocket (RFC 7395) framing in [`framing`].

pub mod framing;
pub mod parser;
pub mod writer;

use std::fmt;

pub use parser::{parse_element, StreamEvent, StreamHeader, StreamParser};
pub use writer::{StreamOpen, STREAM_CLOSE};

/// Well-known namespaces.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const PING: &str = "urn:xmpp:ping";
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// A child node: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// One XML element with its subtree.
///
/// `ns` is the resolved namespace. `None` means "inherit from the parent",
/// which is what locally built children usually want.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, ns: Option<&str>) -> Self {
        Self {
            name: name.into(),
            ns: ns.map(str::to_string),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn builder(name: impl Into<String>, ns: &str) -> ElementBuilder {
        ElementBuilder {
            element: Element::new(name, Some(ns)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// True when both the local name and the namespace match.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping text nodes.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given name and namespace. A child without an
    /// explicit namespace inherits this element's.
    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| {
            c.name == name && c.ns.as_deref().or(self.ns.as_deref()) == Some(ns)
        })
    }

    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn append_child(&mut self, child: Element) -> &mut Element {
        self.children.push(Node::Element(child));
        match self.children.last_mut() {
            Some(Node::Element(e)) => e,
            _ => unreachable!("just pushed an element"),
        }
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(&text);
        } else {
            self.children.push(Node::Text(text));
        }
    }

    /// Serialize for the wire, assuming the enclosing stream's default
    /// namespace is `jabber:client`.
    pub fn to_wire(&self) -> String {
        writer::serialize(self, Some(ns::CLIENT))
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&writer::serialize(self, None))
    }
}

/// Fluent construction of outgoing elements.
#[derive(Debug, Clone)]
pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.element.set_attr(key, value);
        self
    }

    /// Add the attribute only when a value is present.
    pub fn attr_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    pub fn append(mut self, child: Element) -> Self {
        self.element.append_child(child);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.append_text(text);
        self
    }

    pub fn build(self) -> Element {
        self.element
    }
}

impl From<ElementBuilder> for Element {
    fn from(builder: ElementBuilder) -> Self {
        builder.build()
    }
}
