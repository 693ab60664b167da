//! Node type plugins.
//!
//! A plugin is the capability table for one node type: the XEP-0060
//! features it implements, its default node options, and its path rules.
//! The stock set mirrors the service configuration's `plugins` list:
//! `flat` (arbitrary paths), `hometree` (paths rooted under the owner's
//! home collection) and `pep` (personal eventing on bare-JID hosts).

use std::collections::HashMap;
use std::sync::Arc;

use jid::BareJid;

use crate::config::PubSubConfig;
use crate::error::StanzaError;
use crate::pubsub::node::{
    AccessModel, Host, NodeOptions, SendLastPublishedItem,
};

/// Features shared by every stock plugin.
const BASE_FEATURES: &[&str] = &[
    "create-nodes",
    "config-node",
    "delete-nodes",
    "delete-items",
    "item-ids",
    "manage-subscriptions",
    "modify-affiliations",
    "outcast-affiliation",
    "persistent-items",
    "publish",
    "purge-nodes",
    "retract-items",
    "retrieve-affiliations",
    "retrieve-items",
    "retrieve-subscriptions",
    "subscribe",
    "subscription-options",
    "subscription-notifications",
];

const FLAT_FEATURES: &[&str] = &[
    "create-nodes",
    "config-node",
    "collections",
    "delete-nodes",
    "delete-items",
    "instant-nodes",
    "item-ids",
    "manage-subscriptions",
    "modify-affiliations",
    "outcast-affiliation",
    "persistent-items",
    "publish",
    "purge-nodes",
    "retract-items",
    "retrieve-affiliations",
    "retrieve-items",
    "retrieve-subscriptions",
    "subscribe",
    "subscription-options",
    "subscription-notifications",
];

const PEP_FEATURES: &[&str] = &[
    "auto-create",
    "auto-subscribe",
    "config-node",
    "create-nodes",
    "delete-nodes",
    "delete-items",
    "filtered-notifications",
    "item-ids",
    "last-published",
    "modify-affiliations",
    "outcast-affiliation",
    "persistent-items",
    "publish",
    "purge-nodes",
    "retract-items",
    "retrieve-affiliations",
    "retrieve-items",
    "retrieve-subscriptions",
    "subscribe",
    "subscription-options",
];

/// Capability table for one node type.
pub trait NodePlugin: Send + Sync {
    /// Plugin name, also the node type stored in the node record.
    fn name(&self) -> &'static str;

    /// XEP-0060 feature names this type implements.
    fn features(&self) -> &'static [&'static str];

    /// Whether a feature is implemented.
    fn has_feature(&self, feature: &str) -> bool {
        self.features().contains(&feature)
    }

    /// Default options for newly created nodes of this type.
    fn default_options(&self, config: &PubSubConfig) -> NodeOptions {
        NodeOptions {
            max_items: config.max_items_node,
            max_payload_size: config.max_payload_size,
            ..NodeOptions::default()
        }
    }

    /// Whether one entity may hold several subscriptions to one node.
    fn multi_subscribe(&self) -> bool {
        false
    }

    /// Whether read paths may use dirty (non-transactional) store access.
    fn prefers_dirty_reads(&self) -> bool {
        true
    }

    /// Validate the node path for creation on this host by this owner.
    fn check_create_path(
        &self,
        _host: &Host,
        _path: &str,
        _owner: &BareJid,
    ) -> Result<(), StanzaError> {
        Ok(())
    }
}

/// Arbitrary paths, open by default.
pub struct FlatPlugin;

impl NodePlugin for FlatPlugin {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn features(&self) -> &'static [&'static str] {
        FLAT_FEATURES
    }
}

/// Paths rooted under `/home/<domain>/<user>`, owned by that user.
pub struct HometreePlugin;

impl HometreePlugin {
    /// The collection a user's nodes live under.
    pub fn home_path(owner: &BareJid) -> String {
        match owner.node() {
            Some(node) => format!("/home/{}/{}", owner.domain(), node),
            None => format!("/home/{}", owner.domain()),
        }
    }
}

impl NodePlugin for HometreePlugin {
    fn name(&self) -> &'static str {
        "hometree"
    }

    fn features(&self) -> &'static [&'static str] {
        BASE_FEATURES
    }

    fn check_create_path(
        &self,
        _host: &Host,
        path: &str,
        owner: &BareJid,
    ) -> Result<(), StanzaError> {
        let home = Self::home_path(owner);
        if path == home || path.starts_with(&format!("{}/", home)) {
            Ok(())
        } else {
            Err(StanzaError::forbidden())
        }
    }
}

/// Personal eventing: nodes on a user's bare JID, auto-created on first
/// publish, presence access, single-item history by default.
pub struct PepPlugin;

impl NodePlugin for PepPlugin {
    fn name(&self) -> &'static str {
        "pep"
    }

    fn features(&self) -> &'static [&'static str] {
        PEP_FEATURES
    }

    fn default_options(&self, config: &PubSubConfig) -> NodeOptions {
        NodeOptions {
            access_model: AccessModel::Presence,
            send_last_published_item: SendLastPublishedItem::OnSubAndPresence,
            max_items: 1,
            max_payload_size: config.max_payload_size,
            ..NodeOptions::default()
        }
    }

    fn check_create_path(
        &self,
        host: &Host,
        _path: &str,
        owner: &BareJid,
    ) -> Result<(), StanzaError> {
        // PEP nodes live on the owner's own bare JID.
        match host {
            Host::User(user) if user == owner => Ok(()),
            _ => Err(StanzaError::forbidden()),
        }
    }
}

/// The enabled plugin set, in configuration order.
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn NodePlugin>>,
    default_plugin: &'static str,
}

impl PluginRegistry {
    /// Build the registry from the configured plugin list; unknown names
    /// are skipped. The first configured plugin is the default node type.
    pub fn from_config(config: &PubSubConfig) -> Self {
        let stock: Vec<Arc<dyn NodePlugin>> =
            vec![Arc::new(FlatPlugin), Arc::new(HometreePlugin), Arc::new(PepPlugin)];

        let mut plugins: HashMap<&'static str, Arc<dyn NodePlugin>> = HashMap::new();
        let mut default_plugin = "flat";
        let mut first = true;
        for name in &config.plugins {
            if let Some(plugin) = stock.iter().find(|p| p.name() == name.as_str()) {
                if first {
                    default_plugin = plugin.name();
                    first = false;
                }
                plugins.insert(plugin.name(), Arc::clone(plugin));
            }
        }
        if plugins.is_empty() {
            plugins.insert("flat", Arc::new(FlatPlugin));
        }

        Self {
            plugins,
            default_plugin,
        }
    }

    /// Look up a plugin by node type name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn NodePlugin>> {
        self.plugins.get(name).cloned()
    }

    /// The default node type for this service.
    pub fn default_plugin(&self) -> Arc<dyn NodePlugin> {
        self.plugins[self.default_plugin].clone()
    }

    /// The plugin used for PEP hosts, when enabled.
    pub fn pep_plugin(&self) -> Option<Arc<dyn NodePlugin>> {
        self.get("pep")
    }
}
