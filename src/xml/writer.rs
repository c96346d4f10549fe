//! Element serialization in fragment mode: one element per call, no
//! document wrapper.

use quick_xml::escape::escape;

use super::{ns, Element, Node};

/// Closing tag of a client stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Serialize `element`. A namespace declaration is written only when the
/// element's namespace differs from `parent_ns`.
pub fn serialize(element: &Element, parent_ns: Option<&str>) -> String {
    let mut out = String::with_capacity(128);
    write_element(&mut out, element, parent_ns);
    out
}

fn write_element(out: &mut String, element: &Element, parent_ns: Option<&str>) {
    out.push('<');
    out.push_str(element.name());

    let own_ns = element.ns().or(parent_ns);
    if let Some(ns) = element.ns() {
        if Some(ns) != parent_ns {
            push_attr(out, "xmlns", ns);
        }
    }
    for (key, value) in element.attrs() {
        push_attr(out, key, value);
    }

    if element.nodes().is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in element.nodes() {
        match node {
            Node::Element(child) => write_element(out, child, own_ns),
            Node::Text(text) => out.push_str(&escape(text.as_str())),
        }
    }
    out.push_str("</");
    out.push_str(element.name());
    out.push('>');
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

/// Parameters of the client's opening `<stream:stream>` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    /// Server domain the stream is addressed to.
    pub to: String,
    /// Bare JID of the user, once known.
    pub from: Option<String>,
    pub lang: Option<String>,
}

impl StreamOpen {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: None,
            lang: None,
        }
    }

    /// Render the stream header, including the XML declaration.
    pub fn header(&self) -> String {
        let mut tag = String::from("<?xml version='1.0'?><stream:stream");
        push_attr(&mut tag, "to", &self.to);
        if let Some(from) = &self.from {
            push_attr(&mut tag, "from", from);
        }
        push_attr(&mut tag, "version", "1.0");
        if let Some(lang) = &self.lang {
            push_attr(&mut tag, "xml:lang", lang);
        }
        push_attr(&mut tag, "xmlns", ns::CLIENT);
        push_attr(&mut tag, "xmlns:stream", ns::STREAM);
        tag.push('>');
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_in_client_namespace_omits_xmlns() {
        let presence = Element::builder("presence", ns::CLIENT)
            .attr("type", "unavailable")
            .build();
        assert_eq!(presence.to_wire(), "<presence type='unavailable'/>");
    }

    #[test]
    fn test_child_namespace_declared_once() {
        let mut bind = Element::new("bind", Some(ns::BIND));
        bind.append_child(Element::new("resource", None)).append_text("laptop");
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", "b1")
            .append(bind)
            .build();

        assert_eq!(
            iq.to_wire(),
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>laptop</resource></bind></iq>"
        );
    }

    #[test]
    fn test_text_and_attributes_are_escaped() {
        let message = Element::builder("message", ns::CLIENT)
            .attr("to", "o'brien@example.com")
            .append(Element::builder("body", ns::CLIENT).text("1 < 2 & 3").build())
            .build();
        let xml = message.to_wire();
        assert!(xml.contains("to='o&apos;brien@example.com'"));
        assert!(xml.contains("<body>1 &lt; 2 &amp; 3</body>"));
    }

    #[test]
    fn test_display_always_declares_namespace() {
        let ping = Element::builder("ping", ns::PING).build();
        assert_eq!(ping.to_string(), "<ping xmlns='urn:xmpp:ping'/>");
    }

    #[test]
    fn test_stream_header() {
        let mut open = StreamOpen::new("example.com");
        open.from = Some("user@example.com".to_string());
        open.lang = Some("en".to_string());
        let header = open.header();

        assert!(header.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(header.contains("to='example.com'"));
        assert!(header.contains("from='user@example.com'"));
        assert!(header.contains("xml:lang='en'"));
        assert!(header.contains("xmlns='jabber:client'"));
        assert!(header.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        assert!(header.ends_with('>'));
        assert!(!header.ends_with("/>"));
    }
}
