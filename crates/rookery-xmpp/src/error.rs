//! Error types for the federation layer.
//!
//! Two layers of errors live here:
//!
//! - [`XmppError`] is the library-level error returned by fallible APIs
//!   (connect failures, parse failures, store aborts).
//! - [`StanzaError`] models an XMPP stanza-level error: a defined condition
//!   plus an error type, optionally extended with a XEP-0060 error element
//!   such as `<unsupported feature='...'/>`. Stanza errors render to wire
//!   elements and are what the PubSub controller returns to requesters and
//!   what the S2S bounce path attaches to undeliverable stanzas.

use minidom::Element;
use thiserror::Error;

use crate::parser::ns;

/// Library-level errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// DNS resolution error
    #[error("DNS error: {0}")]
    Dns(String),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream-level protocol error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Send or negotiation deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store transaction aborted
    #[error("Store transaction aborted: {0}")]
    TxAbort(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new DNS error.
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// The `type` attribute of a stanza error (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (the error cannot be remedied)
    Cancel,
    /// Proceed (the condition was only a warning)
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (the error is temporary)
    Wait,
}

impl ErrorType {
    /// Wire value of the `type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

/// Defined stanza error conditions used by this crate (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PaymentRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ServiceUnavailable,
    UndefinedCondition,
    UnexpectedRequest,
}

impl Condition {
    /// Wire name of the condition element.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The default error type associated with the condition.
    pub fn default_type(&self) -> ErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable => ErrorType::Modify,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => ErrorType::Cancel,
            Self::Forbidden | Self::NotAuthorized | Self::PaymentRequired => ErrorType::Auth,
            Self::InternalServerError | Self::RemoteServerTimeout | Self::UnexpectedRequest => {
                ErrorType::Wait
            }
        }
    }
}

/// XEP-0060 extended error elements (namespace `pubsub#errors`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubErrorExt {
    /// `<unsupported feature='...'/>`: the named feature is not implemented
    /// by the node's plugin.
    Unsupported(String),
    ClosedNode,
    ConfigurationRequired,
    InvalidJid,
    InvalidPayload,
    InvalidSubid,
    ItemRequired,
    JidRequired,
    NodeIdRequired,
    NotInRosterGroup,
    NotSubscribed,
    PayloadRequired,
    PayloadTooBig,
    PendingSubscription,
    PresenceSubscriptionRequired,
    SubidRequired,
    TooManySubscriptions,
}

impl PubSubErrorExt {
    /// Wire name of the extension element.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported",
            Self::ClosedNode => "closed-node",
            Self::ConfigurationRequired => "configuration-required",
            Self::InvalidJid => "invalid-jid",
            Self::InvalidPayload => "invalid-payload",
            Self::InvalidSubid => "invalid-subid",
            Self::ItemRequired => "item-required",
            Self::JidRequired => "jid-required",
            Self::NodeIdRequired => "nodeid-required",
            Self::NotInRosterGroup => "not-in-roster-group",
            Self::NotSubscribed => "not-subscribed",
            Self::PayloadRequired => "payload-required",
            Self::PayloadTooBig => "payload-too-big",
            Self::PendingSubscription => "pending-subscription",
            Self::PresenceSubscriptionRequired => "presence-subscription-required",
            Self::SubidRequired => "subid-required",
            Self::TooManySubscriptions => "too-many-subscriptions",
        }
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.as_str(), ns::PUBSUB_ERRORS);
        if let Self::Unsupported(feature) = self {
            builder = builder.attr("feature", feature.as_str());
        }
        builder.build()
    }
}

/// A stanza-level error: defined condition, error type, optional PubSub
/// extension and optional human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: Condition,
    pub pubsub_ext: Option<PubSubErrorExt>,
    pub text: Option<String>,
}

impl StanzaError {
    /// Create a stanza error with the condition's default error type.
    pub fn new(condition: Condition) -> Self {
        Self {
            error_type: condition.default_type(),
            condition,
            pubsub_ext: None,
            text: None,
        }
    }

    pub fn bad_request() -> Self {
        Self::new(Condition::BadRequest)
    }

    pub fn conflict() -> Self {
        Self::new(Condition::Conflict)
    }

    pub fn forbidden() -> Self {
        Self::new(Condition::Forbidden)
    }

    pub fn internal_server_error() -> Self {
        Self::new(Condition::InternalServerError)
    }

    pub fn item_not_found() -> Self {
        Self::new(Condition::ItemNotFound)
    }

    pub fn not_acceptable() -> Self {
        Self::new(Condition::NotAcceptable)
    }

    pub fn not_allowed() -> Self {
        Self::new(Condition::NotAllowed)
    }

    pub fn not_authorized() -> Self {
        Self::new(Condition::NotAuthorized)
    }

    pub fn remote_server_not_found() -> Self {
        Self::new(Condition::RemoteServerNotFound)
    }

    pub fn remote_server_timeout() -> Self {
        Self::new(Condition::RemoteServerTimeout)
    }

    /// `feature-not-implemented` with the XEP-0060 `<unsupported/>` child
    /// naming the missing feature.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::new(Condition::FeatureNotImplemented)
            .with_ext(PubSubErrorExt::Unsupported(feature.into()))
    }

    /// Attach a PubSub extended-error element.
    pub fn with_ext(mut self, ext: PubSubErrorExt) -> Self {
        self.pubsub_ext = Some(ext);
        self
    }

    /// Attach a human-readable text child.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Render as an `<error/>` element in the `jabber:client` namespace.
    pub fn to_element(&self) -> Element {
        self.to_element_in(ns::JABBER_CLIENT)
    }

    /// Render as an `<error/>` element in the given stanza namespace.
    ///
    /// The namespace must match the enclosing stanza's (`jabber:client` or
    /// `jabber:server`) so the child inherits correctly on the wire.
    pub fn to_element_in(&self, stanza_ns: impl Into<String>) -> Element {
        let mut builder = Element::builder("error", stanza_ns)
            .attr("type", self.error_type.as_str())
            .append(Element::builder(self.condition.as_str(), ns::STANZAS).build());
        if let Some(ref ext) = self.pubsub_ext {
            builder = builder.append(ext.to_element());
        }
        if let Some(ref text) = self.text {
            builder = builder.append(
                Element::builder("text", ns::STANZAS)
                    .append(text.as_str())
                    .build(),
            );
        }
        builder.build()
    }
}

/// Synthesize an error reply for an undeliverable or rejected stanza.
///
/// Returns `None` when the stanza's `type` is `error` or `result`: replying
/// to those would loop, so callers drop them silently. Otherwise the reply
/// carries the original children, swapped addressing, `type='error'` and the
/// rendered error element.
pub fn make_error_reply(stanza: &Element, error: &StanzaError) -> Option<Element> {
    match stanza.attr("type") {
        Some("error") | Some("result") => return None,
        _ => {}
    }

    let mut reply = Element::builder(stanza.name(), stanza.ns()).build();
    if let Some(from) = stanza.attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(to) = stanza.attr("to") {
        reply.set_attr("from", to);
    }
    if let Some(id) = stanza.attr("id") {
        reply.set_attr("id", id);
    }
    reply.set_attr("type", "error");
    for child in stanza.children() {
        reply.append_child(child.clone());
    }
    reply.append_child(error.to_element_in(stanza.ns()));
    Some(reply)
}

/// Render a stream-level error element followed by the stream close tag.
///
/// Stream errors are unrecoverable: the sender closes the stream right after.
pub fn stream_error_xml(condition: &str) -> String {
    format!(
        "<stream:error><{} xmlns='{}'/></stream:error></stream:stream>",
        condition,
        ns::STREAMS_ERRORS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_default_types() {
        assert_eq!(
            Condition::RemoteServerNotFound.default_type(),
            ErrorType::Cancel
        );
        assert_eq!(Condition::BadRequest.default_type(), ErrorType::Modify);
        assert_eq!(Condition::Forbidden.default_type(), ErrorType::Auth);
        assert_eq!(
            Condition::RemoteServerTimeout.default_type(),
            ErrorType::Wait
        );
    }

    #[test]
    fn test_stanza_error_to_element() {
        let error = StanzaError::unsupported("retract-items");
        let elem = error.to_element();

        assert_eq!(elem.name(), "error");
        assert_eq!(elem.attr("type"), Some("cancel"));
        assert!(elem
            .get_child("feature-not-implemented", ns::STANZAS)
            .is_some());

        let unsupported = elem
            .get_child("unsupported", ns::PUBSUB_ERRORS)
            .expect("extension element");
        assert_eq!(unsupported.attr("feature"), Some("retract-items"));
    }

    #[test]
    fn test_make_error_reply_swaps_addressing() {
        let stanza: Element =
            "<message xmlns='jabber:server' from='a@x.example' to='b@y.example' id='m1'><body xmlns='jabber:server'>hi</body></message>"
                .parse()
                .expect("valid xml");

        let reply = make_error_reply(&stanza, &StanzaError::remote_server_not_found())
            .expect("bounceable");

        assert_eq!(reply.attr("to"), Some("a@x.example"));
        assert_eq!(reply.attr("from"), Some("b@y.example"));
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("m1"));

        let error = reply
            .get_child("error", "jabber:server")
            .expect("error child");
        assert!(error
            .get_child("remote-server-not-found", ns::STANZAS)
            .is_some());
    }

    #[test]
    fn test_make_error_reply_drops_error_and_result() {
        let stanza: Element = "<message xmlns='jabber:server' type='error'/>"
            .parse()
            .expect("valid xml");
        assert!(make_error_reply(&stanza, &StanzaError::remote_server_not_found()).is_none());

        let stanza: Element = "<iq xmlns='jabber:server' type='result'/>"
            .parse()
            .expect("valid xml");
        assert!(make_error_reply(&stanza, &StanzaError::remote_server_not_found()).is_none());
    }

    #[test]
    fn test_stream_error_xml() {
        let xml = stream_error_xml("invalid-namespace");
        assert!(xml.contains("<stream:error>"));
        assert!(xml.contains("invalid-namespace"));
        assert!(xml.ends_with("</stream:stream>"));
    }
}
