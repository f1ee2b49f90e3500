//! Incremental XML stream framing.
//!
//! A client stream is one long XML document: a `<stream:stream>` header that is never closed
//! until the session ends, and complete top-level stanzas inside it. [`parse_next_event`]
//! extracts the next header, stanza or stream close from the unread bytes and reports how many
//! bytes it consumed, so the caller can keep the remainder for the next network read.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::errors::{Error as XmlError, SyntaxError};
use quick_xml::events::{BytesStart, Event};
use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_core::tree::Element;

/// Namespace of the stream wrapper element.
pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// One framed unit of the client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// `<stream:stream ...>` header. Its declarations become the scope of later stanzas.
    StreamOpen(Element),
    /// Complete top-level element.
    Stanza(Element),
    /// `</stream:stream>`.
    StreamClose,
}

/// Result of one framing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed.
    Incomplete,
    /// One event was framed from the first `consumed` bytes.
    Complete {
        /// Framed event.
        event: StreamEvent,
        /// Number of buffer bytes the event used, including leading whitespace.
        consumed: usize,
    },
}

/// Namespace declarations in effect at some point of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceScope {
    default: Option<String>,
    prefixes: Vec<(String, String)>,
}

impl NamespaceScope {
    /// Default namespace, if declared.
    #[must_use]
    pub fn default_namespace(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Namespace bound to `prefix`.
    #[must_use]
    pub fn prefix(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.prefixes
            .iter()
            .rev()
            .find(|(bound, _)| bound == prefix)
            .map(|(_, namespace)| namespace.as_str())
    }

    fn declare(&mut self, prefix: Option<&str>, namespace: String) {
        match prefix {
            None => self.default = Some(namespace),
            Some(prefix) => {
                self.prefixes.retain(|(bound, _)| bound != prefix);
                self.prefixes.push((prefix.to_owned(), namespace));
            }
        }
    }
}

/// Frames the next event from `buffer`.
///
/// `scope` holds the declarations of the stream header; it is replaced when a new header is
/// framed and only read otherwise.
///
/// # Errors
///
/// Returns `XmpdError::Protocol` for malformed XML, undeclared prefixes and stray closing tags.
pub fn parse_next_event(buffer: &[u8], scope: &mut NamespaceScope) -> XmpdResult<ParseStatus> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut open: Vec<(Element, NamespaceScope)> = Vec::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(XmlError::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(XmpdError::Protocol("invalid markup declaration".to_owned()));
            }
            Err(XmlError::Syntax(_)) => return Ok(ParseStatus::Incomplete),
            Err(error) => return Err(XmpdError::Protocol(format!("malformed xml: {error}"))),
        };
        let position = position(&reader)?;

        match event {
            Event::Start(start) => {
                if open.is_empty() && is_stream_tag(start.name().as_ref()) {
                    let (header, header_scope) = build_element(&start, &NamespaceScope::default())?;
                    *scope = header_scope;
                    return Ok(complete(StreamEvent::StreamOpen(header), position));
                }
                let parent_scope = open.last().map_or(&*scope, |(_, scope)| scope);
                let (element, element_scope) = build_element(&start, parent_scope)?;
                open.push((element, element_scope));
            }
            Event::Empty(start) => {
                if open.is_empty() && is_stream_tag(start.name().as_ref()) {
                    let (header, header_scope) = build_element(&start, &NamespaceScope::default())?;
                    *scope = header_scope;
                    return Ok(complete(StreamEvent::StreamOpen(header), position));
                }
                let parent_scope = open.last().map_or(&*scope, |(_, scope)| scope);
                let (element, _) = build_element(&start, parent_scope)?;
                match open.last_mut() {
                    Some((parent, _)) => parent.push_child(element),
                    None => return Ok(complete(StreamEvent::Stanza(element), position)),
                }
            }
            Event::End(end) => {
                let Some((element, _)) = open.pop() else {
                    if is_stream_tag(end.name().as_ref()) {
                        return Ok(complete(StreamEvent::StreamClose, position));
                    }
                    return Err(XmpdError::Protocol(format!(
                        "unexpected closing tag '{}'",
                        String::from_utf8_lossy(end.name().as_ref())
                    )));
                };
                match open.last_mut() {
                    Some((parent, _)) => parent.push_child(element),
                    None => return Ok(complete(StreamEvent::Stanza(element), position)),
                }
            }
            Event::Text(text) => {
                // Text running to the end of the buffer may be cut inside an entity.
                if position >= buffer.len() {
                    return Ok(ParseStatus::Incomplete);
                }
                if let Some((element, _)) = open.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|error| XmpdError::Protocol(format!("bad text: {error}")))?;
                    element.push_text(&text);
                }
            }
            Event::CData(data) => {
                if let Some((element, _)) = open.last_mut() {
                    element.push_text(&utf8(data.into_inner())?);
                }
            }
            Event::Eof => return Ok(ParseStatus::Incomplete),
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }
}

fn complete(event: StreamEvent, consumed: usize) -> ParseStatus {
    ParseStatus::Complete { event, consumed }
}

fn position(reader: &Reader<&[u8]>) -> XmpdResult<usize> {
    usize::try_from(reader.buffer_position())
        .map_err(|_| XmpdError::Protocol("stream position overflow".to_owned()))
}

fn is_stream_tag(qualified: &[u8]) -> bool {
    qualified == b"stream:stream" || qualified == b"stream"
}

fn utf8(bytes: Cow<'_, [u8]>) -> XmpdResult<String> {
    String::from_utf8(bytes.into_owned())
        .map_err(|_| XmpdError::Protocol("stream is not valid utf-8".to_owned()))
}

/// Builds an element from a start tag, resolving its namespace against `parent`.
///
/// Namespace declarations are folded into the returned scope and not kept as attributes.
fn build_element(
    start: &BytesStart<'_>,
    parent: &NamespaceScope,
) -> XmpdResult<(Element, NamespaceScope)> {
    let qualified = utf8(Cow::Borrowed(start.name().as_ref()))?;
    let mut scope = parent.clone();
    let mut attributes = Vec::new();

    for attribute in start.attributes() {
        let attribute = attribute
            .map_err(|error| XmpdError::Protocol(format!("bad attribute in <{qualified}>: {error}")))?;
        let key = utf8(Cow::Borrowed(attribute.key.as_ref()))?;
        let value = attribute
            .unescape_value()
            .map_err(|error| XmpdError::Protocol(format!("bad attribute value in <{qualified}>: {error}")))?
            .into_owned();
        if key == "xmlns" {
            scope.declare(None, value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.declare(Some(prefix), value);
        } else {
            attributes.push((key, value));
        }
    }

    let (namespace, local) = match qualified.split_once(':') {
        Some((prefix, local)) => {
            let namespace = scope.prefix(prefix).ok_or_else(|| {
                XmpdError::Protocol(format!("undeclared namespace prefix '{prefix}'"))
            })?;
            (Some(namespace.to_owned()), local.to_owned())
        }
        None => (scope.default_namespace().map(str::to_owned), qualified.clone()),
    };

    let mut element = match namespace {
        Some(namespace) => Element::with_namespace(local, namespace),
        None => Element::new(local),
    };
    for (key, value) in attributes {
        element.set_attr(key, value);
    }
    Ok((element, scope))
}

#[cfg(test)]
mod tests {
    use super::{NamespaceScope, ParseStatus, STREAM_NS, StreamEvent, parse_next_event};
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::XmpdError;
    use xmpd_core::tree::Element;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='1.0'>";

    fn client_scope() -> NamespaceScope {
        let mut scope = NamespaceScope::default();
        let status = parse_next_event(HEADER.as_bytes(), &mut scope).expect("header parses");
        assert_that!(matches!(status, ParseStatus::Complete { .. }), eq(true));
        scope
    }

    #[rstest]
    fn header_is_framed_and_sets_scope() {
        let mut scope = NamespaceScope::default();
        let status = parse_next_event(HEADER.as_bytes(), &mut scope).expect("header parses");

        let ParseStatus::Complete {
            event: StreamEvent::StreamOpen(header),
            consumed,
        } = status
        else {
            panic!("expected stream header");
        };
        assert_that!(consumed, eq(HEADER.len()));
        assert_that!(header.is("stream", STREAM_NS), eq(true));
        assert_that!(header.get("to"), eq(Some("localhost")));
        assert_that!(header.get("xmlns"), eq(None::<&str>));
        assert_that!(scope.default_namespace(), eq(Some("jabber:client")));
        assert_that!(scope.prefix("stream"), eq(Some(STREAM_NS)));
    }

    #[rstest]
    fn stanza_inherits_stream_default_namespace() {
        let mut scope = client_scope();
        let input = "  <iq type='get' id='r1'><query xmlns='jabber:iq:roster'/></iq><presence/>";

        let status = parse_next_event(input.as_bytes(), &mut scope).expect("stanza parses");

        let expected = Element::with_namespace("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "r1")
            .with_child(Element::with_namespace("query", "jabber:iq:roster"));
        assert_that!(
            &status,
            eq(&ParseStatus::Complete {
                event: StreamEvent::Stanza(expected),
                consumed: input.find("<presence").expect("second stanza present"),
            })
        );
    }

    #[rstest]
    fn text_and_entities_are_unescaped() {
        let mut scope = client_scope();
        let input = "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGE&amp;b</auth>";

        let status = parse_next_event(input.as_bytes(), &mut scope).expect("stanza parses");

        let ParseStatus::Complete {
            event: StreamEvent::Stanza(auth),
            ..
        } = status
        else {
            panic!("expected stanza");
        };
        assert_that!(auth.namespace(), eq(Some("urn:ietf:params:xml:ns:xmpp-sasl")));
        assert_that!(auth.get("mechanism"), eq(Some("PLAIN")));
        assert_that!(auth.text(), eq("AGE&b"));
    }

    #[rstest]
    #[case("<iq type='get'><query xmlns='jabber:iq:roster'/>")]
    #[case("<iq type='ge")]
    #[case("<message><body>half &am")]
    #[case("   ")]
    #[case("")]
    fn partial_input_is_incomplete(#[case] input: &str) {
        let mut scope = client_scope();
        assert_that!(
            &parse_next_event(input.as_bytes(), &mut scope),
            eq(&Ok(ParseStatus::Incomplete))
        );
    }

    #[rstest]
    fn stream_close_is_framed() {
        let mut scope = client_scope();
        let input = "\n</stream:stream>";
        assert_that!(
            &parse_next_event(input.as_bytes(), &mut scope),
            eq(&Ok(ParseStatus::Complete {
                event: StreamEvent::StreamClose,
                consumed: input.len(),
            }))
        );
    }

    #[rstest]
    #[case("</iq>")]
    #[case("<foo:bar/>")]
    #[case("<!WRONG>")]
    fn malformed_input_is_a_protocol_error(#[case] input: &str) {
        let mut scope = client_scope();
        let result = parse_next_event(input.as_bytes(), &mut scope);
        assert_that!(matches!(result, Err(XmpdError::Protocol(_))), eq(true));
    }
}
