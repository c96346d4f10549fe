//! XMPP XML framing: stanza boundary detection and RFC 7395 translation.
//!
//! Boundary detection splits a TCP byte stream into the stream header, complete
//! top-level elements and the closing tag. The translation helpers let the
//! WebSocket transport present RFC 7395 framing (`<open/>`, `<close/>`) to the
//! rest of the engine as a traditional `<stream:stream>` byte stream.

use std::borrow::Cow;

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::ns;
use crate::error::{Error, Result};

/// Translate an inbound RFC 7395 frame into traditional stream framing.
/// - `<open/>` → `<stream:stream>` carrying `from`, `id`, `version`, `xml:lang`
/// - `<close/>` → `</stream:stream>`
/// - Everything else passes through unchanged (zero-copy via Cow)
pub fn frame_to_stream(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();

    if trimmed.starts_with("<open ") || trimmed.starts_with("<open>") || trimmed.starts_with("<open/") {
        let mut reader = Reader::from_str(trimmed);
        reader.config_mut().check_end_names = false;

        let event = reader.read_event();
        let attrs = match &event {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => Some(e.attributes()),
            _ => None,
        };

        let mut stream_tag = String::from("<?xml version='1.0'?><stream:stream");
        let mut version = String::from("1.0");
        if let Some(attrs) = attrs {
            for attr in attrs.flatten() {
                let key = String::from_utf8_lossy(attr.key.as_ref());
                let value = String::from_utf8_lossy(&attr.value);
                match key.as_ref() {
                    "to" | "from" | "id" | "xml:lang" => {
                        stream_tag.push_str(&format!(" {}='{}'", key, value));
                    }
                    "version" => version = value.to_string(),
                    _ => {} // Skip the framing xmlns
                }
            }
        }
        stream_tag.push_str(&format!(" version='{}'", version));
        stream_tag.push_str(&format!(
            " xmlns='{}' xmlns:stream='{}'>",
            ns::CLIENT,
            ns::STREAM
        ));
        return Cow::Owned(stream_tag);
    }

    if trimmed.starts_with("<close") {
        return Cow::Borrowed("</stream:stream>");
    }

    Cow::Borrowed(text)
}

/// Translate outbound traditional stream framing into RFC 7395 frames.
/// - `<stream:stream ...>` (with or without XML declaration) → `<open .../>`
/// - `</stream:stream>` → `<close/>`
/// - Regular stanzas pass through unchanged (zero-copy via Cow)
pub fn stream_to_frame(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();

    if trimmed == "</stream:stream>" {
        return Cow::Owned(format!(r#"<close xmlns="{}"/>"#, ns::FRAMING));
    }

    // Strip optional XML declaration first
    let stream_text = if trimmed.starts_with("<?xml") {
        match trimmed.find("?>") {
            Some(pos) => trimmed[pos + 2..].trim(),
            None => trimmed,
        }
    } else {
        trimmed
    };

    if stream_text.starts_with("<stream:stream ") {
        let mut reader = Reader::from_str(stream_text);
        reader.config_mut().check_end_names = false;

        if let Ok(Event::Start(e)) = reader.read_event() {
            let mut open_tag = format!(r#"<open xmlns="{}""#, ns::FRAMING);
            for attr in e.attributes().flatten() {
                let key = String::from_utf8_lossy(attr.key.as_ref());
                let value = String::from_utf8_lossy(&attr.value);
                match key.as_ref() {
                    "to" | "from" | "id" | "version" | "xml:lang" => {
                        open_tag.push_str(&format!(r#" {}="{}""#, key, value));
                    }
                    _ => {} // jabber:client and xmlns:stream are TCP-specific
                }
            }
            open_tag.push_str("/>");
            return Cow::Owned(open_tag);
        }
    }

    Cow::Borrowed(text)
}

/// State machine for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Waiting for a stanza to start (between stanzas, or before stream open).
    Idle,
    /// Inside a top-level stanza, collecting events.
    InStanza,
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(local_name: &[u8], qname: &[u8]) -> bool {
    local_name == b"stream" || qname == b"stream:stream"
}

/// Extract a single complete top-level unit from the given buffer slice.
///
/// Returns `Ok(Some((xml, bytes_consumed)))` for a stream header, a complete
/// element or the closing tag, `Ok(None)` if more bytes are needed, and an
/// error if the buffer can never become well-formed.
pub fn extract_stanza(buffer: &[u8]) -> Result<Option<(String, usize)>> {
    // The closing tag appears alone, without a matching opening tag in the buffer
    let trimmed = buffer.iter().position(|b| !b.is_ascii_whitespace());
    match trimmed {
        Some(start) if buffer[start..].starts_with(b"</stream:stream>") => {
            let tag_end = start + b"</stream:stream>".len();
            return Ok(Some(("</stream:stream>".to_string(), tag_end)));
        }
        Some(_) => {}
        None => return Ok(None),
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_tag(e.name().local_name().as_ref(), e.name().as_ref())
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((bytes_to_string(&buffer[0..tag_end]), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle
                    && is_stream_tag(e.name().local_name().as_ref(), e.name().as_ref())
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((bytes_to_string(&buffer[0..tag_end]), tag_end)));
                }

                // Self-closing top-level element (e.g. <presence/>, <proceed/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((bytes_to_string(&buffer[pos..tag_end]), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().local_name().as_ref(), e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some(("</stream:stream>".to_string(), tag_end)));
                }

                if depth == 0 {
                    return Err(Error::Xml(format!(
                        "unexpected closing tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                depth -= 1;
                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((bytes_to_string(&buffer[stanza_start..tag_end]), tag_end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedPIOrXmlDecl))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedComment))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedCData)) => {
                // Partial element; the next read completes it
                return Ok(None);
            }
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- extract_stanza ---

    #[test]
    fn test_extract_stream_opening_with_declaration() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0'>";
        let (stanza, consumed) = extract_stanza(buf).unwrap().unwrap();
        assert!(stanza.contains("<?xml"));
        assert!(stanza.contains("<stream:stream"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (stanza, consumed) = extract_stanza(buf).unwrap().unwrap();
        assert!(stanza.starts_with("<stream:features"));
        assert!(stanza.ends_with("</stream:features>"));
        assert!(stanza.contains("<starttls"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_multiple_stanzas() {
        let buf = b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>";
        let (first, used) = extract_stanza(buf).unwrap().unwrap();
        assert_eq!(first, "<presence from='user@example.com'/>");

        let (second, used2) = extract_stanza(&buf[used..]).unwrap().unwrap();
        assert!(second.starts_with("<message"));
        assert!(second.contains("Hello"));
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn test_extract_incomplete_stanza_needs_more_bytes() {
        assert!(extract_stanza(b"<iq type='get'><query xmlns='jabber:iq:roster'>")
            .unwrap()
            .is_none());
        assert!(extract_stanza(b"<iq type='get' id=").unwrap().is_none());
    }

    #[test]
    fn test_extract_whitespace_only_buffer() {
        assert!(extract_stanza(b"").unwrap().is_none());
        assert!(extract_stanza(b"  \n ").unwrap().is_none());
    }

    #[test]
    fn test_extract_stream_close_with_leading_whitespace() {
        let buf = b"  </stream:stream>";
        let (stanza, consumed) = extract_stanza(buf).unwrap().unwrap();
        assert_eq!(stanza, "</stream:stream>");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_skips_whitespace_keepalive_between_stanzas() {
        let buf = b" <r xmlns='urn:xmpp:sm:3'/> ";
        let (stanza, consumed) = extract_stanza(buf).unwrap().unwrap();
        assert_eq!(stanza, "<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(consumed, buf.len() - 1);
    }

    #[test]
    fn test_extract_reports_malformed_xml() {
        assert!(extract_stanza(b"<!foo>").is_err());
        assert!(extract_stanza(b"</message>").is_err());
    }

    // --- frame_to_stream ---

    #[test]
    fn test_open_frame_becomes_stream_header() {
        let open = r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" id="ws-1" version="1.0" xml:lang="en"/>"#;
        let translated = frame_to_stream(open);

        assert!(translated.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(translated.contains("from='example.com'"));
        assert!(translated.contains("id='ws-1'"));
        assert!(translated.contains("version='1.0'"));
        assert!(translated.contains("xml:lang='en'"));
        assert!(translated.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        assert!(!translated.contains("xmpp-framing"));
    }

    #[test]
    fn test_close_frame_becomes_stream_end() {
        let close = r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#;
        assert_eq!(&*frame_to_stream(close), "</stream:stream>");
    }

    #[test]
    fn test_inbound_stanza_passthrough() {
        let stanza = r#"<features xmlns="http://etherx.jabber.org/streams"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></features>"#;
        assert!(matches!(frame_to_stream(stanza), Cow::Borrowed(_)));
    }

    // --- stream_to_frame ---

    #[test]
    fn test_stream_header_becomes_open_frame() {
        let header = "<?xml version='1.0'?><stream:stream to='example.com' version='1.0' xml:lang='en' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";
        let translated = stream_to_frame(header);

        assert!(translated.starts_with(r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing""#));
        assert!(translated.contains(r#"to="example.com""#));
        assert!(translated.contains(r#"version="1.0""#));
        assert!(translated.ends_with("/>"));
        assert!(!translated.contains("jabber:client"));
    }

    #[test]
    fn test_stream_end_becomes_close_frame() {
        assert_eq!(
            &*stream_to_frame("</stream:stream>"),
            r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#
        );
    }

    #[test]
    fn test_outbound_stanza_passthrough() {
        let stanza = "<message to='a@b'><body>Hi</body></message>";
        assert_eq!(&*stream_to_frame(stanza), stanza);
    }
}
