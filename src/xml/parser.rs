//! Incremental parsing of an inbound XMPP stream into top-level elements.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::framing::extract_stanza;
use super::{ns, Element};
use crate::error::{Error, Result};

/// Maximum number of buffered bytes without a complete element.
///
/// 1 MB is generous for XMPP: typical stanzas are a few KB. The largest
/// legitimate stanzas (vCard avatars, MAM result pages) rarely exceed 100 KB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Attributes of the server's `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

/// One unit pulled off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Header(StreamHeader),
    Element(Element),
    /// The peer sent `</stream:stream>`.
    Closed,
}

/// Buffers raw bytes and yields [`StreamEvent`]s as they become complete.
///
/// A parser is bound to one stream instance; after a stream restart it must be
/// [`reset`](Self::reset) so bytes from the old stream are not reinterpreted.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    consumed: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be parsed.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
    }

    /// Next complete event, or `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        let extracted = extract_stanza(&self.buffer[self.consumed..])?;
        let Some((xml, used)) = extracted else {
            self.compact();
            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                return Err(Error::Xml(format!(
                    "stanza buffer exceeded {} bytes without a complete element",
                    MAX_STANZA_BUFFER_SIZE
                )));
            }
            return Ok(None);
        };
        self.consumed += used;

        let trimmed = xml.trim();
        if trimmed == "</stream:stream>" {
            return Ok(Some(StreamEvent::Closed));
        }
        if is_stream_header(trimmed) {
            return parse_header(trimmed).map(|h| Some(StreamEvent::Header(h)));
        }
        parse_element(trimmed).map(|e| Some(StreamEvent::Element(e)))
    }

    // Track the consumed offset and compact once per read, avoiding O(n²) memmoves.
    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        // Whitespace keepalives between stanzas would otherwise accumulate
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
        }
    }
}

fn is_stream_header(xml: &str) -> bool {
    let body = match xml.strip_prefix("<?xml") {
        Some(_) => xml.find("?>").map(|p| xml[p + 2..].trim_start()).unwrap_or(xml),
        None => xml,
    };
    body.starts_with("<stream:stream") || body.starts_with("<stream ")
}

fn parse_header(xml: &str) -> Result<StreamHeader> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let mut header = StreamHeader::default();
                for attr in e.attributes().flatten() {
                    let value = attr
                        .unescape_value()
                        .map_err(|err| Error::Xml(err.to_string()))?
                        .into_owned();
                    match attr.key.as_ref() {
                        b"id" => header.id = Some(value),
                        b"from" => header.from = Some(value),
                        b"to" => header.to = Some(value),
                        b"version" => header.version = Some(value),
                        b"xml:lang" => header.lang = Some(value),
                        _ => {}
                    }
                }
                return Ok(header);
            }
            Ok(Event::Eof) => return Err(Error::Xml("empty stream header".to_string())),
            Ok(_) => continue,
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
    }
}

/// Namespace declarations in effect for one element.
#[derive(Debug, Default, Clone)]
struct Scope {
    default_ns: Option<String>,
    prefixes: Vec<(String, String)>,
}

fn lookup_prefix<'a>(scopes: &'a [Scope], prefix: &str) -> Option<&'a str> {
    scopes.iter().rev().find_map(|s| {
        s.prefixes
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, ns)| ns.as_str())
    })
}

fn default_ns(scopes: &[Scope]) -> Option<&str> {
    scopes.iter().rev().find_map(|s| s.default_ns.as_deref())
}

fn open_element(start: &BytesStart<'_>, scopes: &mut Vec<Scope>) -> Result<Element> {
    let mut scope = Scope::default();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Xml(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            scope.default_ns = Some(value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }
    scopes.push(scope);

    let qname = start.name();
    let local = String::from_utf8_lossy(qname.local_name().as_ref()).into_owned();
    let ns = match qname.prefix() {
        Some(prefix) => {
            let prefix = String::from_utf8_lossy(prefix.as_ref()).into_owned();
            lookup_prefix(scopes, &prefix)
                .map(str::to_string)
                .ok_or_else(|| Error::Xml(format!("unbound namespace prefix '{}'", prefix)))?
        }
        None => default_ns(scopes).unwrap_or(ns::CLIENT).to_string(),
    };

    let mut element = Element::new(local, Some(&ns));
    for (k, v) in attrs {
        element.set_attr(k, v);
    }
    Ok(element)
}

/// Parse one complete top-level element.
///
/// Elements inherit `jabber:client` as their default namespace and the
/// `stream` prefix is pre-bound, mirroring the enclosing stream header.
pub fn parse_element(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut scopes = vec![Scope {
        default_ns: Some(ns::CLIENT.to_string()),
        prefixes: vec![
            ("stream".to_string(), ns::STREAM.to_string()),
            ("xml".to_string(), ns::XML.to_string()),
        ],
    }];
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let element = open_element(&e, &mut scopes)?;
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = open_element(&e, &mut scopes)?;
                scopes.pop();
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Ok(Event::End(_)) => {
                scopes.pop();
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::Xml("unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(current) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| Error::Xml(e.to_string()))?;
                    if !text.is_empty() {
                        current.append_text(text.into_owned());
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(current) = stack.last_mut() {
                    current.append_text(String::from_utf8_lossy(&c.into_inner()).into_owned());
                }
            }
            Ok(Event::Eof) => return Err(Error::Xml("incomplete element".to_string())),
            Ok(_) => {}
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0' xml:lang='en'>";

    #[test]
    fn test_header_then_features_in_one_read() {
        let mut parser = StreamParser::new();
        parser.push(HEADER.as_bytes());
        parser.push(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");

        let header = match parser.next_event().unwrap() {
            Some(StreamEvent::Header(h)) => h,
            other => panic!("expected header, got {:?}", other),
        };
        assert_eq!(header.id.as_deref(), Some("abc"));
        assert_eq!(header.from.as_deref(), Some("example.com"));
        assert_eq!(header.lang.as_deref(), Some("en"));

        let features = match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => e,
            other => panic!("expected features, got {:?}", other),
        };
        assert!(features.is("features", ns::STREAM));
        assert!(features.has_child("bind", ns::BIND));
        assert!(parser.next_event().unwrap().is_none());
    }

    #[test]
    fn test_element_split_across_reads() {
        let mut parser = StreamParser::new();
        parser.push(b"<message type='chat'><bo");
        assert!(parser.next_event().unwrap().is_none());
        parser.push(b"dy>Hi &amp; bye</body></message>");

        let message = match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => e,
            other => panic!("expected message, got {:?}", other),
        };
        assert!(message.is("message", ns::CLIENT));
        assert_eq!(message.get_child("body", ns::CLIENT).unwrap().text(), "Hi & bye");
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_stream_close() {
        let mut parser = StreamParser::new();
        parser.push(b"<presence/></stream:stream>");
        assert!(matches!(parser.next_event().unwrap(), Some(StreamEvent::Element(_))));
        assert_eq!(parser.next_event().unwrap(), Some(StreamEvent::Closed));
    }

    #[test]
    fn test_whitespace_keepalives_are_discarded() {
        let mut parser = StreamParser::new();
        parser.push(b"   ");
        assert!(parser.next_event().unwrap().is_none());
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_oversized_partial_element_is_an_error() {
        let mut parser = StreamParser::new();
        parser.push(b"<message><body>");
        parser.push(&vec![b'a'; MAX_STANZA_BUFFER_SIZE + 1]);
        assert!(matches!(parser.next_event(), Err(Error::Xml(_))));
    }

    #[test]
    fn test_parse_stream_error_resolves_prefixes() {
        let error = parse_element(
            "<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text></stream:error>",
        )
        .unwrap();
        assert!(error.is("error", ns::STREAM));
        assert!(error.has_child("conflict", ns::STREAM_ERRORS));
        assert_eq!(
            error.get_child("text", ns::STREAM_ERRORS).unwrap().text(),
            "Replaced by new connection"
        );
    }

    #[test]
    fn test_parse_websocket_features_without_prefix() {
        let features = parse_element(
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
        )
        .unwrap();
        assert!(features.is("features", ns::STREAM));
        let mechanisms = features.get_child("mechanisms", ns::SASL).unwrap();
        assert_eq!(mechanisms.children().next().unwrap().text(), "PLAIN");
    }

    #[test]
    fn test_parse_then_serialize_keeps_namespaces() {
        let xml = "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/res</jid></bind></iq>";
        let iq = parse_element(xml).unwrap();
        assert_eq!(iq.to_wire(), xml);
    }

    #[test]
    fn test_unbound_prefix_is_rejected() {
        assert!(parse_element("<foo:bar/>").is_err());
    }
}
