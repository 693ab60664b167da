//! The outgoing session registry.
//!
//! Maps `(local domain, remote domain)` pairs to their single authoritative
//! session and provides the `send` entry point used by the router. The
//! registry issues each new session its dialback key, arbitrates the
//! registration race (`try_register` is a compare-and-set on the stored
//! session id), and clears entries with compare-and-clear so a stale
//! session exiting late cannot evict a fresh one.
//!
//! Dialback verifier sub-sessions are spawned here on behalf of the
//! incoming listener; they bypass the pair index entirely.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use minidom::Element;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

use crate::config::S2sConfig;
use crate::error::{make_error_reply, StanzaError, XmppError};
use crate::router::StanzaSink;
use crate::s2s::dialback::DialbackKeyGen;
use crate::s2s::dns::SrvResolver;
use crate::s2s::session::{OutgoingSession, SessionCommand};
use crate::s2s::transport::build_tls_connector;
use crate::s2s::{S2sMetrics, SessionRole};

/// Ordered federation pair: the local domain asserting to the remote one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local: String,
    pub remote: String,
}

impl SessionKey {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

/// Verdict a verifier sub-session reports back to its requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Identifier the incoming listener attached to its request.
    pub request_id: String,
    pub local: String,
    pub remote: String,
    pub valid: bool,
}

/// Registry entry for the authoritative session of a pair.
struct SessionSlot {
    session_id: u64,
    key: String,
    tx: mpsc::Sender<SessionCommand>,
}

/// Registry of outgoing sessions, one authoritative session per pair.
pub struct OutgoingRegistry {
    config: Arc<S2sConfig>,
    router: Arc<dyn StanzaSink>,
    resolver: SrvResolver,
    keygen: DialbackKeyGen,
    sessions: DashMap<SessionKey, SessionSlot>,
    static_routes: DashMap<String, Vec<SocketAddr>>,
    tls_connectors: DashMap<String, TlsConnector>,
    next_id: AtomicU64,
    metrics: Arc<S2sMetrics>,
}

impl OutgoingRegistry {
    /// Create the registry. Must run inside a Tokio runtime (the DNS
    /// resolver binds to it).
    pub fn new(config: S2sConfig, router: Arc<dyn StanzaSink>) -> Arc<Self> {
        let resolver = SrvResolver::new(&config.dns, config.address_families, config.default_port);
        info!(
            default_port = config.default_port,
            max_retry_delay_secs = config.max_retry_delay.as_secs(),
            "outgoing S2S registry created"
        );
        Arc::new(Self {
            config: Arc::new(config),
            router,
            resolver,
            keygen: DialbackKeyGen::random(),
            sessions: DashMap::new(),
            static_routes: DashMap::new(),
            tls_connectors: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics: Arc::new(S2sMetrics::new()),
        })
    }

    /// Send a stanza toward a remote domain, spawning the pair's session if
    /// none exists. Pre-established sessions queue in FIFO order.
    #[instrument(skip(self, stanza), name = "s2s.send", fields(local = %local, remote = %remote))]
    pub async fn send(
        self: &Arc<Self>,
        local: &str,
        remote: &str,
        stanza: Element,
    ) -> Result<(), XmppError> {
        let pair = SessionKey::new(local, remote);
        let mut stanza = stanza;

        loop {
            let existing = self
                .sessions
                .get(&pair)
                .map(|slot| (slot.session_id, slot.tx.clone()));

            if let Some((session_id, tx)) = existing {
                match tx.try_send(SessionCommand::Send(stanza)) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(command)) => {
                        warn!(pair = %pair, "session mailbox full, bouncing");
                        if let SessionCommand::Send(original) = command {
                            self.bounce_with(original, StanzaError::remote_server_timeout())
                                .await;
                        }
                        return Ok(());
                    }
                    Err(TrySendError::Closed(command)) => {
                        // The session died without clearing its slot yet;
                        // clear it for it and start over.
                        self.sessions
                            .remove_if(&pair, |_, slot| slot.session_id == session_id);
                        stanza = match command {
                            SessionCommand::Send(original) => original,
                            _ => return Ok(()),
                        };
                        continue;
                    }
                }
            }

            let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let key = self.keygen.generate(
                &uuid::Uuid::new_v4().to_string(),
                &pair.remote,
                &pair.local,
            );
            let (tx, rx) = mpsc::channel(self.config.max_fsm_queue.max(1));

            match self.sessions.entry(pair.clone()) {
                Entry::Occupied(_) => {
                    // Another task spawned concurrently; retry the fast
                    // path against the winner.
                    continue;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(SessionSlot {
                        session_id,
                        key: key.clone(),
                        tx: tx.clone(),
                    });
                }
            }

            debug!(pair = %pair, id = session_id, "spawning outgoing session");
            let session = OutgoingSession::new(
                session_id,
                pair.clone(),
                SessionRole::New { key },
                Arc::clone(self),
                None,
            );
            tokio::spawn(session.run(rx));

            // Fresh channel; the first send cannot fail.
            let _ = tx.try_send(SessionCommand::Send(stanza));
            return Ok(());
        }
    }

    /// Confirm slot ownership at negotiation start. Returns the dialback
    /// key stored for the session, or `None` when another session holds the
    /// pair (the caller lost the race and must terminate).
    pub fn try_register(&self, pair: &SessionKey, session_id: u64) -> Option<String> {
        self.sessions.get(pair).and_then(|slot| {
            if slot.session_id == session_id {
                Some(slot.key.clone())
            } else {
                None
            }
        })
    }

    /// Compare-and-clear removal: only the session that owns the slot can
    /// free it.
    pub fn remove_connection(&self, pair: &SessionKey, session_id: u64) {
        let removed = self
            .sessions
            .remove_if(pair, |_, slot| slot.session_id == session_id);
        if removed.is_some() {
            debug!(pair = %pair, id = session_id, "session unregistered");
        }
    }

    /// Whether `key` is the dialback key issued for the pair. Used by the
    /// incoming listener (and established sessions) to answer `db:verify`.
    pub fn has_key(&self, pair: &SessionKey, key: &str) -> bool {
        self.sessions
            .get(pair)
            .map(|slot| slot.key == key)
            .unwrap_or(false)
    }

    /// Session ids registered for the pair (at most one).
    pub fn get_connections(&self, pair: &SessionKey) -> Vec<u64> {
        self.sessions
            .get(pair)
            .map(|slot| vec![slot.session_id])
            .unwrap_or_default()
    }

    /// Terminate the pair's session if it is holding a retry delay, so the
    /// next outbound stanza attempts a fresh connection immediately.
    pub fn terminate_if_waiting_delay(&self, local: &str, remote: &str) {
        let pair = SessionKey::new(local, remote);
        if let Some(slot) = self.sessions.get(&pair) {
            let _ = slot.tx.try_send(SessionCommand::TerminateIfWaiting);
        }
    }

    /// Spawn a dialback verifier sub-session on behalf of the incoming
    /// listener. The verdict is reported on `reply`; the sub-session never
    /// registers in the pair index and holds no stanza queue.
    pub fn spawn_verifier(
        self: &Arc<Self>,
        local: &str,
        remote: &str,
        request_id: impl Into<String>,
        key: impl Into<String>,
        stream_id: impl Into<String>,
        reply: mpsc::Sender<VerifyOutcome>,
    ) {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_tx, rx) = mpsc::channel(1);
        let session = OutgoingSession::new(
            session_id,
            SessionKey::new(local, remote),
            SessionRole::Verify {
                request_id: request_id.into(),
                key: key.into(),
                stream_id: stream_id.into(),
            },
            Arc::clone(self),
            Some(reply),
        );
        tokio::spawn(session.run(rx));
    }

    /// Route a static candidate list for a domain, bypassing DNS. Useful
    /// for fixed peers and test harnesses.
    pub fn add_static_route(&self, domain: impl Into<String>, candidates: Vec<SocketAddr>) {
        self.static_routes.insert(domain.into(), candidates);
    }

    /// Bounce an undeliverable stanza with `remote-server-not-found`.
    pub(crate) async fn bounce(&self, stanza: Element) {
        self.bounce_with(stanza, StanzaError::remote_server_not_found())
            .await;
    }

    pub(crate) async fn bounce_with(&self, stanza: Element, error: StanzaError) {
        self.metrics.record_stanza_bounced();
        if let Some(reply) = make_error_reply(&stanza, &error) {
            if let Err(error) = self.router.deliver(reply).await {
                warn!(error = %error, "failed to route bounced stanza");
            }
        }
    }

    /// Connect candidates for a remote domain: static route if configured,
    /// DNS discovery otherwise.
    pub(crate) async fn connect_candidates(&self, remote: &str) -> Vec<SocketAddr> {
        if let Some(route) = self.static_routes.get(remote) {
            return route.clone();
        }
        self.resolver.resolve(remote).await
    }

    /// TLS connector presenting the local domain's certificate, built once
    /// per local domain.
    pub(crate) fn tls_connector(&self, local: &str) -> Result<TlsConnector, XmppError> {
        if let Some(connector) = self.tls_connectors.get(local) {
            return Ok(connector.clone());
        }
        let connector = build_tls_connector(&self.config, local)?;
        self.tls_connectors
            .insert(local.to_string(), connector.clone());
        Ok(connector)
    }

    pub fn config(&self) -> Arc<S2sConfig> {
        Arc::clone(&self.config)
    }

    pub fn metrics(&self) -> Arc<S2sMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn router(&self) -> Arc<dyn StanzaSink> {
        Arc::clone(&self.router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::CapturingSink;
    use std::time::Duration;

    fn message(from: &str, to: &str) -> Element {
        format!(
            "<message xmlns='jabber:server' from='{}' to='{}'><body>hello</body></message>",
            from, to
        )
        .parse()
        .expect("valid xml")
    }

    fn unreachable_addr() -> SocketAddr {
        // Bind then drop: nothing listens afterwards.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F, what: &str) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_send_spawns_single_session_per_pair() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        for _ in 0..5 {
            registry
                .send("a.example", "b.example", message("u@a.example", "v@b.example"))
                .await
                .expect("accepted");
        }

        let pair = SessionKey::new("a.example", "b.example");
        assert_eq!(registry.get_connections(&pair).len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_bounces_queue() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink.clone());
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        registry
            .send("a.example", "b.example", message("u@a.example", "v@b.example"))
            .await
            .expect("accepted");

        wait_for(|| !sink.is_empty(), "bounce").await;
        let bounced = sink.stanzas();
        assert_eq!(bounced[0].attr("to"), Some("u@a.example"));
        assert_eq!(bounced[0].attr("type"), Some("error"));
        let error = bounced[0]
            .get_child("error", "jabber:server")
            .expect("error child");
        assert!(error
            .get_child(
                "remote-server-not-found",
                "urn:ietf:params:xml:ns:xmpp-stanzas"
            )
            .is_some());
    }

    #[tokio::test]
    async fn test_terminate_if_waiting_clears_session() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink.clone());
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        registry
            .send("a.example", "b.example", message("u@a.example", "v@b.example"))
            .await
            .expect("accepted");

        // The session enters backoff once the bounce lands.
        wait_for(|| !sink.is_empty(), "bounce").await;
        registry.terminate_if_waiting_delay("a.example", "b.example");

        let pair = SessionKey::new("a.example", "b.example");
        wait_for(
            || registry.get_connections(&pair).is_empty(),
            "session removal",
        )
        .await;
    }

    #[tokio::test]
    async fn test_try_register_is_owner_only() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        registry
            .send("a.example", "b.example", message("u@a.example", "v@b.example"))
            .await
            .expect("accepted");

        let pair = SessionKey::new("a.example", "b.example");
        let owner = registry.get_connections(&pair)[0];

        assert!(registry.try_register(&pair, owner).is_some());
        assert!(registry.try_register(&pair, owner + 1000).is_none());
    }

    #[tokio::test]
    async fn test_remove_connection_compare_and_clear() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        registry
            .send("a.example", "b.example", message("u@a.example", "v@b.example"))
            .await
            .expect("accepted");

        let pair = SessionKey::new("a.example", "b.example");
        let owner = registry.get_connections(&pair)[0];

        // A stale id must not evict the live session.
        registry.remove_connection(&pair, owner + 1000);
        assert_eq!(registry.get_connections(&pair), vec![owner]);

        registry.remove_connection(&pair, owner);
        assert!(registry.get_connections(&pair).is_empty());
    }

    #[tokio::test]
    async fn test_has_key_matches_issued_key() {
        let sink = Arc::new(CapturingSink::new());
        let registry = OutgoingRegistry::new(S2sConfig::default(), sink);
        registry.add_static_route("b.example", vec![unreachable_addr()]);

        registry
            .send("a.example", "b.example", message("u@a.example", "v@b.example"))
            .await
            .expect("accepted");

        let pair = SessionKey::new("a.example", "b.example");
        let owner = registry.get_connections(&pair)[0];
        let key = registry.try_register(&pair, owner).expect("owner key");

        assert!(registry.has_key(&pair, &key));
        assert!(!registry.has_key(&pair, "not-the-key"));
        assert!(!registry.has_key(&SessionKey::new("a.example", "c.example"), &key));
    }
}
