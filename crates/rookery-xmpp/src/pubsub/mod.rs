//! Publish/subscribe service (XEP-0060) with PEP semantics (XEP-0163).
//!
//! The pieces, leaves first:
//! - [`node`]: node records, the `pubsub#node_config` option schema and the
//!   data-form codecs
//! - [`plugin`]: capability tables per node type (`flat`, `hometree`,
//!   `pep`)
//! - [`store`]: the in-memory node tree and per-node tables
//! - [`stanzas`]: request parsing and notification building
//! - [`service`]: the controller implementing the protocol verbs
//! - [`broadcast`]: recipient computation and fan-out
//! - [`pep`]: presence-driven behavior for bare-JID hosts
//!
//! The roster and presence directory are collaborators owned by the rest
//! of the server; the service reaches them through the [`RosterQuery`] and
//! [`PresenceDirectory`] seams. Static implementations are provided for
//! tests and simple embedders.

pub mod broadcast;
pub mod node;
pub mod pep;
pub mod plugin;
pub mod service;
pub mod stanzas;
pub mod store;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;

pub use broadcast::{Broadcaster, Recipient};
pub use node::{
    AccessModel, Affiliation, Depth, Host, NodeIdx, NodeOptions, NotificationType, PublishModel,
    SendLastPublishedItem, ShowValue, SubOptions, SubscriptionState, SubscriptionType,
};
pub use plugin::{FlatPlugin, HometreePlugin, NodePlugin, PepPlugin, PluginRegistry};
pub use service::PubSubService;
pub use stanzas::{is_pubsub_iq, parse_pubsub_iq, PubSubRequest};
pub use store::{ItemRecord, NodeRecord, NodeStore, StateRecord, SubId};

/// Roster facts the access gate needs.
#[async_trait]
pub trait RosterQuery: Send + Sync + 'static {
    /// Whether `owner` has approved a presence subscription from `contact`.
    async fn has_presence_subscription(&self, owner: &BareJid, contact: &BareJid) -> bool;

    /// Roster groups `owner` files `contact` under.
    async fn groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String>;
}

/// Presence facts the broadcaster and PEP need.
#[async_trait]
pub trait PresenceDirectory: Send + Sync + 'static {
    /// Online resources of a bare JID with their show state.
    async fn resources(&self, user: &BareJid) -> Vec<(String, ShowValue)>;
}

/// Fixed roster for tests and single-tenant embedders.
#[derive(Default)]
pub struct StaticRoster {
    subscriptions: DashMap<(BareJid, BareJid), Vec<String>>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `owner` accepts presence from `contact`, under groups.
    pub fn allow(&self, owner: &BareJid, contact: &BareJid, groups: &[&str]) {
        self.subscriptions.insert(
            (owner.clone(), contact.clone()),
            groups.iter().map(|group| group.to_string()).collect(),
        );
    }
}

#[async_trait]
impl RosterQuery for StaticRoster {
    async fn has_presence_subscription(&self, owner: &BareJid, contact: &BareJid) -> bool {
        self.subscriptions
            .contains_key(&(owner.clone(), contact.clone()))
    }

    async fn groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String> {
        self.subscriptions
            .get(&(owner.clone(), contact.clone()))
            .map(|groups| groups.clone())
            .unwrap_or_default()
    }
}

/// Scriptable presence directory for tests and simple embedders.
#[derive(Default)]
pub struct StaticPresence {
    online: DashMap<BareJid, Vec<(String, ShowValue)>>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a resource online with the given show state.
    pub fn set_online(&self, user: &BareJid, resource_jid: &str, show: ShowValue) {
        let mut entry = self.online.entry(user.clone()).or_default();
        entry.retain(|(jid, _)| jid != resource_jid);
        entry.push((resource_jid.to_string(), show));
    }

    /// Mark a resource offline.
    pub fn set_offline(&self, user: &BareJid, resource_jid: &str) {
        if let Some(mut entry) = self.online.get_mut(user) {
            entry.retain(|(jid, _)| jid != resource_jid);
        }
    }
}

#[async_trait]
impl PresenceDirectory for StaticPresence {
    async fn resources(&self, user: &BareJid) -> Vec<(String, ShowValue)> {
        self.online
            .get(user)
            .map(|resources| resources.clone())
            .unwrap_or_default()
    }
}
