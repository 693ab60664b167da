//! Outgoing server-to-server federation.
//!
//! This module implements the initiating side of XMPP federation:
//! - DNS SRV discovery with weighted target ordering
//! - TCP connect with address-family fallback and STARTTLS upgrade
//! - The per-pair outgoing session state machine (stream negotiation,
//!   SASL EXTERNAL, Server Dialback, stanza relay, retry backoff)
//! - The pair registry guaranteeing one authoritative session per
//!   `(local domain, remote domain)` and queueing/bouncing semantics
//!
//! The incoming listener is a collaborator: it validates keys via
//! [`registry::OutgoingRegistry::has_key`] and requests dialback verifier
//! sub-sessions through [`registry::OutgoingRegistry::spawn_verifier`].

pub mod dialback;
pub mod dns;
pub mod registry;
pub mod session;
pub mod transport;

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub use dialback::DialbackKeyGen;
pub use dns::{SrvResolver, SrvTarget};
pub use registry::{OutgoingRegistry, SessionKey, VerifyOutcome};
pub use session::SessionCommand;

/// States of the outgoing session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resolving and connecting.
    OpenSocket,
    /// Waiting for the peer's stream opening.
    WaitForStream,
    /// Dialback key sent, waiting for the validity verdict.
    WaitForValidation,
    /// Waiting for `<stream:features/>`.
    WaitForFeatures,
    /// SASL EXTERNAL sent, waiting for success/failure.
    WaitForAuthResult,
    /// `<starttls/>` sent, waiting for `<proceed/>`.
    WaitForStarttlsProceed,
    /// Closing the socket to restart negotiation with changed flags.
    ReopenSocket,
    /// Connect failed; holding until the retry timer fires.
    WaitBeforeRetry,
    /// Negotiation complete; relaying stanzas.
    StreamEstablished,
}

impl SessionState {
    /// Multiplier applied to the base state timeout.
    pub fn timeout_factor(&self) -> Option<u32> {
        match self {
            // Dialback takes a full round trip through the peer's own
            // outgoing connection.
            Self::WaitForValidation => Some(6),
            // Bounded by the idle watchdog instead.
            Self::StreamEstablished => None,
            // The retry timer is the deadline.
            Self::WaitBeforeRetry => None,
            _ => Some(1),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenSocket => "open_socket",
            Self::WaitForStream => "wait_for_stream",
            Self::WaitForValidation => "wait_for_validation",
            Self::WaitForFeatures => "wait_for_features",
            Self::WaitForAuthResult => "wait_for_auth_result",
            Self::WaitForStarttlsProceed => "wait_for_starttls_proceed",
            Self::ReopenSocket => "reopen_socket",
            Self::WaitBeforeRetry => "wait_before_retry",
            Self::StreamEstablished => "stream_established",
        };
        write!(f, "{}", name)
    }
}

/// Role of an outgoing session.
#[derive(Debug, Clone)]
pub enum SessionRole {
    /// Authoritative session for its pair; asserts the given dialback key.
    New {
        /// Key this session sends in its `db:result`.
        key: String,
    },
    /// Dialback verifier sub-session spawned on behalf of an incoming
    /// connection. Does not register in the pair index and holds no queue.
    Verify {
        /// Identifier of the requesting incoming session.
        request_id: String,
        /// Key to verify.
        key: String,
        /// Stream id the key was generated for.
        stream_id: String,
    },
}

impl SessionRole {
    /// Whether this is a verifier sub-session.
    pub fn is_verify(&self) -> bool {
        matches!(self, Self::Verify { .. })
    }
}

/// Negotiation flags tracked across reconnects within one session.
#[derive(Debug, Clone)]
pub struct SessionFlags {
    /// Advertise XMPP 1.0 on our opening; cleared to force pre-1.0 dialback.
    pub use_v10: bool,
    /// Peer advertised STARTTLS at least once during this session.
    pub tls_offered: bool,
    /// Peer requires STARTTLS.
    pub tls_required: bool,
    /// TLS is active on the current socket.
    pub tls_enabled: bool,
    /// SASL EXTERNAL completed.
    pub authenticated: bool,
    /// Peer declared the dialback namespace.
    pub dialback_enabled: bool,
    /// SASL EXTERNAL may still be attempted; cleared after a failure.
    pub may_try_auth: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            use_v10: true,
            tls_offered: false,
            tls_required: false,
            tls_enabled: false,
            authenticated: false,
            dialback_enabled: false,
            may_try_auth: true,
        }
    }
}

/// Counters for the outgoing federation subsystem.
#[derive(Debug, Default)]
pub struct S2sMetrics {
    sessions_started: AtomicI64,
    sessions_established: AtomicI64,
    active_sessions: AtomicI64,
    stanzas_relayed: AtomicU64,
    stanzas_bounced: AtomicU64,
    verify_sessions: AtomicI64,
}

impl S2sMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_stanza_relayed(&self) {
        self.stanzas_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stanza_bounced(&self) {
        self.stanzas_bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verify_session(&self) {
        self.verify_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn stanzas_bounced(&self) -> u64 {
        self.stanzas_bounced.load(Ordering::Relaxed)
    }

    pub fn stanzas_relayed(&self) -> u64 {
        self.stanzas_relayed.load(Ordering::Relaxed)
    }
}
