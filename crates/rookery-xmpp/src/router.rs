//! Stanza routing between the local server and federated domains.
//!
//! The [`StanzaRouter`] examines each stanza's destination, delivers locally
//! through the embedder-provided sink when the domain is served here, and
//! otherwise hands the stanza to the outgoing S2S registry, which owns the
//! per-pair sessions. Both the PubSub broadcaster and the S2S bounce path
//! emit through the same [`StanzaSink`] seam, so tests can swap in a
//! capturing sink and assert on the exact wire traffic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, warn};

use crate::error::{make_error_reply, StanzaError, XmppError};
use crate::s2s::registry::OutgoingRegistry;

/// Anything that can accept a stanza for delivery.
#[async_trait]
pub trait StanzaSink: Send + Sync + 'static {
    /// Deliver one stanza. Implementations must not block on the recipient.
    async fn deliver(&self, stanza: Element) -> Result<(), XmppError>;
}

/// Router splitting traffic between local delivery and S2S federation.
pub struct StanzaRouter {
    /// Domains served by this process (bare domains, ASCII).
    local_domains: HashSet<String>,
    /// Delivery sink for local recipients (the C2S layer or session
    /// manager).
    local: Arc<dyn StanzaSink>,
    /// Outgoing S2S registry; wired after construction because the registry
    /// itself routes bounces back through this router.
    s2s: OnceLock<Arc<OutgoingRegistry>>,
}

impl StanzaRouter {
    /// Create a router for the given local domains.
    pub fn new(local_domains: impl IntoIterator<Item = String>, local: Arc<dyn StanzaSink>) -> Self {
        Self {
            local_domains: local_domains.into_iter().collect(),
            local,
            s2s: OnceLock::new(),
        }
    }

    /// Attach the outgoing S2S registry. May be called once.
    pub fn set_s2s(&self, registry: Arc<OutgoingRegistry>) {
        if self.s2s.set(registry).is_err() {
            warn!("S2S registry already attached to router");
        }
    }

    /// Whether the domain is served locally.
    pub fn is_local(&self, domain: &str) -> bool {
        self.local_domains.contains(domain)
    }

    fn domain_of(attr: Option<&str>) -> Option<String> {
        let jid = attr?;
        // Resource first: an '@' inside a resourcepart is legal.
        let bare = jid.split('/').next()?;
        let domain = bare.rsplit('@').next()?;
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_string())
        }
    }
}

#[async_trait]
impl StanzaSink for StanzaRouter {
    async fn deliver(&self, stanza: Element) -> Result<(), XmppError> {
        let to_domain = match Self::domain_of(stanza.attr("to")) {
            Some(domain) => domain,
            None => {
                debug!(stanza = %stanza.name(), "dropping stanza without destination");
                return Ok(());
            }
        };

        if self.is_local(&to_domain) {
            return self.local.deliver(stanza).await;
        }

        let from_domain = match Self::domain_of(stanza.attr("from")) {
            Some(domain) => domain,
            None => {
                debug!("dropping remote-bound stanza without origin");
                return Ok(());
            }
        };

        match self.s2s.get() {
            Some(registry) => registry.send(&from_domain, &to_domain, stanza).await,
            None => {
                // Federation disabled: answer as an unreachable peer would.
                warn!(domain = %to_domain, "federation disabled, bouncing stanza");
                if let Some(reply) =
                    make_error_reply(&stanza, &StanzaError::remote_server_not_found())
                {
                    self.local.deliver(reply).await?;
                }
                Ok(())
            }
        }
    }
}

/// Sink that records everything it is handed. Used by the test suites and
/// useful for embedders writing their own.
#[derive(Default)]
pub struct CapturingSink {
    delivered: Mutex<Vec<Element>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stanzas delivered so far, in order.
    pub fn stanzas(&self) -> Vec<Element> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of stanzas delivered.
    pub fn len(&self) -> usize {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been delivered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all recorded stanzas.
    pub fn clear(&self) {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl StanzaSink for CapturingSink {
    async fn deliver(&self, stanza: Element) -> Result<(), XmppError> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).push(stanza);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(raw: &str) -> Element {
        raw.parse().expect("valid xml")
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let local = Arc::new(CapturingSink::new());
        let router = StanzaRouter::new(vec!["a.example".to_string()], local.clone());

        router
            .deliver(stanza(
                "<message xmlns='jabber:client' from='x@a.example' to='y@a.example'/>",
            ))
            .await
            .expect("delivered");

        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_without_s2s_bounces() {
        let local = Arc::new(CapturingSink::new());
        let router = StanzaRouter::new(vec!["a.example".to_string()], local.clone());

        router
            .deliver(stanza(
                "<message xmlns='jabber:client' from='x@a.example' to='y@b.example'><body>hi</body></message>",
            ))
            .await
            .expect("handled");

        let bounced = local.stanzas();
        assert_eq!(bounced.len(), 1);
        assert_eq!(bounced[0].attr("type"), Some("error"));
        assert_eq!(bounced[0].attr("to"), Some("x@a.example"));
    }

    #[tokio::test]
    async fn test_drop_without_destination() {
        let local = Arc::new(CapturingSink::new());
        let router = StanzaRouter::new(vec!["a.example".to_string()], local.clone());

        router
            .deliver(stanza("<presence xmlns='jabber:client' from='x@a.example'/>"))
            .await
            .expect("handled");

        assert!(local.is_empty());
    }

    #[test]
    fn test_domain_extraction() {
        assert_eq!(
            StanzaRouter::domain_of(Some("user@host.example/res")),
            Some("host.example".to_string())
        );
        assert_eq!(
            StanzaRouter::domain_of(Some("service.example")),
            Some("service.example".to_string())
        );
        assert_eq!(StanzaRouter::domain_of(None), None);
    }
}
