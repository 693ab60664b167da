//! Incremental XML stream framing for server-to-server sessions.
//!
//! XMPP uses a single long-lived XML document per stream, so element
//! delivery has to be incremental: bytes accumulate until a complete
//! top-level child is available, and the unclosed `<stream:stream>` header
//! is handled as a special case. This module frames the byte stream into
//! [`StreamEvent`]s for the outgoing session state machine; full stanza
//! payloads are materialized as [`minidom::Element`]s.

use minidom::Element;

use crate::error::XmppError;

/// Namespace URIs used on federation streams.
pub mod ns {
    /// Client stanza namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Server-to-server stanza namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// Stream framing namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error condition namespace
    pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Stanza error condition namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Server Dialback namespace (XEP-0220)
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Dialback stream-feature namespace
    pub const DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";
    /// Main PubSub namespace (XEP-0060)
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    /// PubSub event notification namespace
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    /// PubSub owner operation namespace
    pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
    /// PubSub extended error namespace
    pub const PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";
    /// PubSub node configuration FORM_TYPE
    pub const PUBSUB_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";
    /// PubSub subscription options FORM_TYPE
    pub const PUBSUB_SUB_OPTIONS: &str = "http://jabber.org/protocol/pubsub#subscribe_options";
    /// PubSub subscription authorization FORM_TYPE
    pub const PUBSUB_SUB_AUTH: &str = "http://jabber.org/protocol/pubsub#subscribe_authorization";
    /// Data forms namespace (XEP-0004)
    pub const DATA_FORMS: &str = "jabber:x:data";
    /// Stanza headers and internet metadata (XEP-0131)
    pub const SHIM: &str = "http://jabber.org/protocol/shim";
    /// Extended stanza addressing (XEP-0033)
    pub const ADDRESS: &str = "http://jabber.org/protocol/address";
    /// Service discovery: info
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery: items
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
}

/// Parsed `<stream:stream>` opening attributes.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream id assigned by the receiving side)
    pub id: Option<String>,
    /// The 'version' attribute ("1.0" on RFC 6120 streams, absent on legacy)
    pub version: Option<String>,
    /// The default `xmlns` declared on the stream
    pub default_ns: Option<String>,
    /// Whether the dialback namespace prefix was declared
    pub dialback: bool,
}

impl StreamHeader {
    /// Parse the opening tag out of raw stream data.
    ///
    /// The stream header is intentionally unclosed XML (its end tag arrives
    /// at stream teardown), so attributes are scanned from the raw tag text.
    pub fn parse(data: &str) -> Result<Self, XmppError> {
        let start = data
            .find("<stream:stream")
            .or_else(|| data.find("<stream "))
            .ok_or_else(|| XmppError::xml_parse("no stream opening tag"))?;
        let end = data[start..]
            .find('>')
            .map(|i| start + i)
            .ok_or_else(|| XmppError::xml_parse("incomplete stream opening tag"))?;
        let tag = &data[start..=end];

        Ok(Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            default_ns: extract_attribute(tag, "xmlns"),
            dialback: extract_attribute(tag, "xmlns:db").as_deref() == Some(ns::DIALBACK),
        })
    }

    /// Whether the peer speaks XMPP 1.0 or newer.
    pub fn supports_v10(&self) -> bool {
        let major = self
            .version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|m| m.parse::<u32>().ok());
        matches!(major, Some(m) if m >= 1)
    }
}

/// Serialize the opening a federating initiator sends: `jabber:server`
/// default namespace, the dialback prefix declaration, and `version='1.0'`
/// only when post-1.0 features (STARTTLS, SASL) are wanted.
pub fn build_stream_open(from: &str, to: &str, use_v10: bool) -> String {
    let version = if use_v10 { " version='1.0'" } else { "" };
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' xmlns:db='{}' from='{}' to='{}'{}>",
        ns::JABBER_SERVER,
        ns::STREAM,
        ns::DIALBACK,
        from,
        to,
        version
    )
}

/// Extract an attribute value from a raw XML tag.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        let mut search = 0;
        while let Some(found) = tag[search..].find(&pattern) {
            let start = search + found;
            // Skip matches that are a suffix of a longer attribute name
            // (e.g. `to=` inside `xmlns:proto=`).
            let valid = start == 0 || tag.as_bytes()[start - 1].is_ascii_whitespace();
            if valid {
                let value_start = start + pattern.len();
                if let Some(value_end) = tag[value_start..].find(quote) {
                    return Some(tag[value_start..value_start + value_end].to_string());
                }
                return None;
            }
            search = start + pattern.len();
        }
    }
    None
}

/// Stream features advertised by the receiving server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// STARTTLS advertised
    pub starttls: bool,
    /// STARTTLS marked `<required/>`
    pub starttls_required: bool,
    /// Dialback feature advertised
    pub dialback: bool,
    /// SASL mechanisms offered
    pub mechanisms: Vec<String>,
}

impl StreamFeatures {
    /// Whether SASL EXTERNAL is on offer.
    pub fn offers_external(&self) -> bool {
        self.mechanisms.iter().any(|m| m == "EXTERNAL")
    }
}

/// A framed event read from the peer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The peer's stream opening.
    StreamStart(StreamHeader),
    /// `<stream:features/>`
    Features(StreamFeatures),
    /// `<proceed/>` in the TLS namespace
    TlsProceed,
    /// `<failure/>` in the TLS namespace
    TlsFailure,
    /// `<success/>` in the SASL namespace
    SaslSuccess,
    /// `<failure/>` in the SASL namespace
    SaslFailure,
    /// `db:result`: dialback key assertion or its answer
    DialbackResult {
        from: String,
        to: String,
        key: Option<String>,
        result_type: Option<String>,
    },
    /// `db:verify`: dialback verification request or its answer
    DialbackVerify {
        from: String,
        to: String,
        id: String,
        key: Option<String>,
        result_type: Option<String>,
    },
    /// A routable stanza (message, presence, iq).
    Stanza(Element),
    /// `<stream:error/>`
    StreamError { condition: String },
    /// The peer closed the stream with `</stream:stream>`.
    StreamEnd,
}

/// Incremental framer over the stream's byte sequence.
///
/// Feed raw bytes with [`StreamFramer::feed`]; pull the header first, then
/// events. The framer is reset after STARTTLS and after SASL success, when
/// the XML document restarts from scratch.
pub struct StreamFramer {
    buffer: Vec<u8>,
    header_taken: bool,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            header_taken: false,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discard all framing state, ready for a fresh XML document.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header_taken = false;
    }

    /// Pull the next framed event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        if !self.header_taken {
            return self.take_stream_header();
        }

        let data = String::from_utf8_lossy(&self.buffer).to_string();

        // The close tag ends the document regardless of anything queued
        // after it.
        if let Some(pos) = data.find("</stream:stream>") {
            let consumed = consume_to(&data, pos + "</stream:stream>".len());
            self.buffer.drain(..consumed);
            return Ok(Some(StreamEvent::StreamEnd));
        }

        // Scan for the earliest complete top-level child so events come out
        // in wire order.
        let patterns: &[(&str, &str)] = &[
            ("<stream:features", "stream:features"),
            ("<stream:error", "stream:error"),
            ("<proceed", "proceed"),
            ("<success", "success"),
            ("<failure", "failure"),
            ("<db:result", "db:result"),
            ("<db:verify", "db:verify"),
            ("<message", "message"),
            ("<presence", "presence"),
            ("<iq", "iq"),
        ];

        let mut earliest: Option<(usize, &str, &str)> = None;
        for (pattern, tag) in patterns {
            if let Some(pos) = data.find(pattern) {
                if earliest.map(|(p, _, _)| pos < p).unwrap_or(true) {
                    earliest = Some((pos, pattern, tag));
                }
            }
        }

        let (start, _, tag) = match earliest {
            Some(found) => found,
            None => return Ok(None),
        };
        let end = match find_element_end(&data, start, tag) {
            Some(end) => end,
            None => return Ok(None),
        };

        let fragment = data[start..end].to_string();
        let consumed = consume_to(&data, end);
        self.buffer.drain(..consumed);

        let event = frame_event(tag, &fragment)?;
        Ok(Some(event))
    }

    fn take_stream_header(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        let data = String::from_utf8_lossy(&self.buffer).to_string();
        let start = match data.find("<stream:stream").or_else(|| data.find("<stream ")) {
            Some(start) => start,
            None => return Ok(None),
        };
        let end = match data[start..].find('>') {
            Some(i) => start + i + 1,
            None => return Ok(None),
        };

        let header = StreamHeader::parse(&data[..end])?;
        let consumed = consume_to(&data, end);
        self.buffer.drain(..consumed);
        self.header_taken = true;
        Ok(Some(StreamEvent::StreamStart(header)))
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offset corresponding to a char offset in the lossily decoded view.
///
/// The buffer is ASCII at every framing boundary, so the offsets coincide;
/// this clamps defensively for the pathological case.
fn consume_to(data: &str, char_end: usize) -> usize {
    char_end.min(data.len())
}

/// Find the end offset (exclusive) of a complete element starting at
/// `start`, or `None` if its close tag has not arrived yet.
fn find_element_end(data: &str, start: usize, tag: &str) -> Option<usize> {
    let after = &data[start..];

    // Self-closing form.
    if let Some(gt) = after.find('>') {
        if gt > 0 && after.as_bytes()[gt - 1] == b'/' {
            return Some(start + gt + 1);
        }
    }

    // Matching close tag. Nested same-name children do not occur at the
    // framing level for the tags handled here.
    let close = format!("</{}", tag);
    let close_start = after.find(&close)?;
    let close_end = after[close_start..].find('>')?;
    Some(start + close_start + close_end + 1)
}

/// Turn a complete framed fragment into a [`StreamEvent`].
fn frame_event(tag: &str, fragment: &str) -> Result<StreamEvent, XmppError> {
    match tag {
        "stream:features" => Ok(StreamEvent::Features(parse_features(fragment))),
        "stream:error" => Ok(StreamEvent::StreamError {
            condition: parse_stream_error_condition(fragment),
        }),
        "proceed" => Ok(StreamEvent::TlsProceed),
        "success" => Ok(StreamEvent::SaslSuccess),
        "failure" => {
            if fragment.contains(ns::TLS) {
                Ok(StreamEvent::TlsFailure)
            } else {
                Ok(StreamEvent::SaslFailure)
            }
        }
        "db:result" => Ok(StreamEvent::DialbackResult {
            from: extract_attribute(fragment, "from").unwrap_or_default(),
            to: extract_attribute(fragment, "to").unwrap_or_default(),
            key: element_text(fragment),
            result_type: extract_attribute(fragment, "type"),
        }),
        "db:verify" => Ok(StreamEvent::DialbackVerify {
            from: extract_attribute(fragment, "from").unwrap_or_default(),
            to: extract_attribute(fragment, "to").unwrap_or_default(),
            id: extract_attribute(fragment, "id").unwrap_or_default(),
            key: element_text(fragment),
            result_type: extract_attribute(fragment, "type"),
        }),
        "message" | "presence" | "iq" => {
            Ok(StreamEvent::Stanza(parse_stanza(fragment, ns::JABBER_SERVER)?))
        }
        other => Err(XmppError::xml_parse(format!("unexpected element: {}", other))),
    }
}

fn parse_features(data: &str) -> StreamFeatures {
    let starttls = data.contains("<starttls");
    let starttls_required = starttls && data.contains("<required");
    let dialback = data.contains(ns::DIALBACK_FEATURE) || data.contains("<dialback");

    let mut mechanisms = Vec::new();
    let mut search = 0;
    while let Some(found) = data[search..].find("<mechanism>") {
        let value_start = search + found + "<mechanism>".len();
        match data[value_start..].find("</mechanism>") {
            Some(end) => {
                mechanisms.push(data[value_start..value_start + end].trim().to_string());
                search = value_start + end;
            }
            None => break,
        }
    }

    StreamFeatures {
        starttls,
        starttls_required,
        dialback,
        mechanisms,
    }
}

fn parse_stream_error_condition(data: &str) -> String {
    const CONDITIONS: &[&str] = &[
        "bad-format",
        "bad-namespace-prefix",
        "conflict",
        "connection-timeout",
        "host-gone",
        "host-unknown",
        "improper-addressing",
        "internal-server-error",
        "invalid-from",
        "invalid-namespace",
        "invalid-xml",
        "not-authorized",
        "not-well-formed",
        "policy-violation",
        "remote-connection-failed",
        "reset",
        "resource-constraint",
        "restricted-xml",
        "see-other-host",
        "system-shutdown",
        "undefined-condition",
        "unsupported-encoding",
        "unsupported-stanza-type",
        "unsupported-version",
        "xml-not-well-formed",
    ];
    CONDITIONS
        .iter()
        .find(|c| data.contains(**c))
        .map(|c| c.to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

/// Text content of a simple `<tag ...>text</tag>` fragment.
fn element_text(fragment: &str) -> Option<String> {
    let open_end = fragment.find('>')? + 1;
    if open_end >= 2 && fragment.as_bytes()[open_end - 2] == b'/' {
        return None;
    }
    let close = fragment.rfind("</")?;
    if close < open_end {
        return None;
    }
    let text = fragment[open_end..close].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Parse a stanza fragment, injecting the stream's default namespace when
/// the wire form relies on inheritance from the stream element.
pub fn parse_stanza(fragment: &str, default_ns: &str) -> Result<Element, XmppError> {
    let tag_end = fragment
        .find('>')
        .ok_or_else(|| XmppError::xml_parse("truncated stanza"))?;
    let head = &fragment[..tag_end];

    let owned;
    let source = if head.contains("xmlns=") {
        fragment
    } else {
        let name_end = head
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(head.len());
        owned = format!(
            "{} xmlns='{}'{}",
            &fragment[..name_end],
            default_ns,
            &fragment[name_end..]
        );
        owned.as_str()
    };

    source
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("failed to parse stanza: {}", e)))
}

/// Serialize a stanza for the wire, stripping the redundant default
/// namespace declaration that minidom emits.
pub fn element_to_wire(element: &Element, stream_ns: &str) -> String {
    let serialized = String::from(element);
    let declaration = format!(" xmlns=\"{}\"", stream_ns);
    let declaration_sq = format!(" xmlns='{}'", stream_ns);
    serialized
        .replacen(&declaration, "", 1)
        .replacen(&declaration_sq, "", 1)
}
