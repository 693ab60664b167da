//! # rookery-xmpp
//!
//! The federation layer of the Rookery XMPP server: outgoing
//! server-to-server sessions and the publish/subscribe service.
//!
//! ## Architecture
//!
//! - **S2S**: one task per `(local domain, remote domain)` pair driving an
//!   XML stream state machine (SRV discovery, TCP connect with family
//!   fallback, STARTTLS + SASL EXTERNAL, Server Dialback) with FIFO
//!   queueing while negotiating, bounce-on-failure, and exponential retry
//!   backoff. The [`s2s::OutgoingRegistry`] guarantees at most one
//!   authoritative session per pair.
//! - **PubSub**: a node tree with per-node affiliation/subscription/item
//!   tables, the XEP-0060 verb set, the access-model gate, PEP semantics
//!   on bare-JID hosts, and a broadcaster evaluating per-subscription
//!   delivery filters (depth, items-vs-nodes, presence show states).
//! - **Router**: the [`router::StanzaSink`] seam both subsystems emit
//!   through; the [`router::StanzaRouter`] splits local delivery from
//!   federation.
//!
//! The XML parser glue, C2S layer, incoming S2S listener, roster and
//! presence directory are collaborators provided by the embedding server.

pub mod config;
pub mod parser;
pub mod pubsub;
pub mod router;
pub mod s2s;

mod error;

pub use config::{
    AddressFamilies, DnsConfig, NodeCreatePolicy, PubSubConfig, S2sConfig, StartTlsPolicy,
};
pub use error::{
    make_error_reply, stream_error_xml, Condition, ErrorType, PubSubErrorExt, StanzaError,
    XmppError,
};
pub use parser::{ns, StreamHeader};
pub use router::{CapturingSink, StanzaRouter, StanzaSink};
pub use s2s::{OutgoingRegistry, SessionKey, VerifyOutcome};
