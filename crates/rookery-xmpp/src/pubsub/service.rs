//! The PubSub controller.
//!
//! One method per protocol verb. Each verb checks permissions, mutates the
//! node store (mutating paths run inside a store transaction), and on
//! success hands the event to the broadcaster. Errors are [`StanzaError`]s
//! carrying the XEP-0060 extended conditions; the IQ dispatcher
//! [`PubSubService::handle_request`] maps parsed requests onto the verbs
//! and builds result payloads.

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{NodeCreatePolicy, PubSubConfig};
use crate::error::{PubSubErrorExt, StanzaError};
use crate::pubsub::broadcast::Broadcaster;
use crate::pubsub::node::{
    Affiliation, Host, SendLastPublishedItem, SubOptions, SubscriptionState,
};
use crate::pubsub::plugin::{NodePlugin, PluginRegistry};
use crate::pubsub::stanzas::{self, PubSubRequest};
use crate::pubsub::store::{ItemRecord, NodeRecord, NodeStore, SubId};
use crate::pubsub::{PresenceDirectory, RosterQuery};
use crate::router::StanzaSink;

/// Verdict of the access-model gate for a subscribe attempt.
enum Gate {
    Allow,
    Pending,
}

/// The publish/subscribe service for a set of hosts.
pub struct PubSubService {
    pub(crate) config: Arc<PubSubConfig>,
    pub(crate) store: Arc<NodeStore>,
    pub(crate) plugins: PluginRegistry,
    pub(crate) router: Arc<dyn StanzaSink>,
    pub(crate) roster: Arc<dyn RosterQuery>,
    pub(crate) presence: Arc<dyn PresenceDirectory>,
    pub(crate) broadcaster: Broadcaster,
    /// Domains served by this process, for the `local` create policy.
    pub(crate) local_domains: Vec<String>,
}

impl PubSubService {
    pub fn new(
        config: PubSubConfig,
        router: Arc<dyn StanzaSink>,
        roster: Arc<dyn RosterQuery>,
        presence: Arc<dyn PresenceDirectory>,
        local_domains: Vec<String>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(NodeStore::new(config.last_item_cache));
        let plugins = PluginRegistry::from_config(&config);
        let broadcaster = Broadcaster::new(
            Arc::clone(&store),
            Arc::clone(&router),
            Arc::clone(&presence),
            Arc::clone(&config),
        );
        info!(
            plugins = config.plugins.len(),
            max_items_node = config.max_items_node,
            "PubSub service created"
        );
        Self {
            config,
            store,
            plugins,
            router,
            roster,
            presence,
            broadcaster,
            local_domains,
        }
    }

    /// The backing store (read access for embedders and tests).
    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub(crate) fn plugin_for_host(&self, host: &Host) -> Arc<dyn NodePlugin> {
        match host {
            Host::User(_) => self
                .plugins
                .pep_plugin()
                .unwrap_or_else(|| self.plugins.default_plugin()),
            Host::Domain(_) => self.plugins.default_plugin(),
        }
    }

    pub(crate) fn plugin_for_node(&self, node: &NodeRecord) -> Arc<dyn NodePlugin> {
        self.plugins
            .get(&node.plugin)
            .unwrap_or_else(|| self.plugins.default_plugin())
    }

    fn require_feature(
        plugin: &Arc<dyn NodePlugin>,
        feature: &str,
    ) -> Result<(), StanzaError> {
        if plugin.has_feature(feature) {
            Ok(())
        } else {
            Err(StanzaError::unsupported(feature))
        }
    }

    fn node_or_not_found(&self, host: &Host, path: &str) -> Result<NodeRecord, StanzaError> {
        self.store
            .node(host, path)
            .ok_or_else(StanzaError::item_not_found)
    }

    // ---- create / delete / purge ----

    /// Create a node. An absent path requests an instant node with a
    /// generated path.
    #[instrument(skip(self, config_form), fields(host = %host))]
    pub async fn create_node(
        &self,
        host: &Host,
        path: Option<String>,
        requester: &Jid,
        node_type: Option<&str>,
        config_form: Option<&Element>,
    ) -> Result<String, StanzaError> {
        let plugin = match node_type {
            Some(name) => self
                .plugins
                .get(name)
                .ok_or_else(StanzaError::not_acceptable)?,
            // On PEP hosts, `pep_mapping` may pin a payload namespace to a
            // specific node type.
            None => path
                .as_deref()
                .filter(|_| host.is_pep())
                .and_then(|path| self.config.pep_mapping.get(path))
                .and_then(|name| self.plugins.get(name))
                .unwrap_or_else(|| self.plugin_for_host(host)),
        };
        Self::require_feature(&plugin, "create-nodes")?;

        let path = match path {
            Some(path) => path,
            None => {
                Self::require_feature(&plugin, "instant-nodes")?;
                Uuid::new_v4().to_string()
            }
        };

        let owner = requester.to_bare();
        self.check_create_policy(&owner)?;
        plugin.check_create_path(host, &path, &owner)?;

        let mut options = plugin.default_options(&self.config);
        if let Some(form) = config_form {
            options.apply_form(form)?;
        }

        // Parents must exist and be writable by the creator.
        for parent_path in &options.collection {
            let parent = self
                .store
                .node(host, parent_path)
                .ok_or_else(StanzaError::item_not_found)?;
            if !parent.is_owner(&owner)
                && parent.options.access_model != crate::pubsub::node::AccessModel::Open
            {
                return Err(StanzaError::forbidden());
            }
        }

        let store = Arc::clone(&self.store);
        let created_path = path.clone();
        let host_clone = host.clone();
        let plugin_name = plugin.name().to_string();
        self.store.transaction(move |_| {
            store
                .create_node(
                    host_clone.clone(),
                    created_path.clone(),
                    plugin_name.clone(),
                    owner.clone(),
                    options.clone(),
                )
                .map(|_| ())
        })?;

        let node = self.node_or_not_found(host, &path)?;
        self.broadcaster.broadcast_create(&node).await;
        debug!(node = %path, "node created");
        Ok(path)
    }

    fn check_create_policy(&self, owner: &BareJid) -> Result<(), StanzaError> {
        match self.config.access_createnode {
            NodeCreatePolicy::All => Ok(()),
            NodeCreatePolicy::Local => {
                let domain = owner.domain().to_string();
                if self.local_domains.iter().any(|local| local == &domain) {
                    Ok(())
                } else {
                    Err(StanzaError::forbidden())
                }
            }
            NodeCreatePolicy::Closed => Err(StanzaError::forbidden()),
        }
    }

    /// Delete a node and its descendants, notifying first.
    #[instrument(skip(self), fields(host = %host, node = %path))]
    pub async fn delete_node(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "delete-nodes")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        // Notify while subscriptions still exist; the cascade removes them.
        let mut doomed = vec![node.clone()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor].clone();
            for child in self.store.children_of(&current.host, &current.path) {
                if !doomed.iter().any(|seen| seen.idx == child.idx) {
                    doomed.push(child);
                }
            }
            cursor += 1;
        }
        for record in &doomed {
            self.broadcaster.broadcast_delete(record).await;
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        self.store
            .transaction(move |_| store.delete_node(idx).map(|_| ()))?;
        info!(node = %path, cascade = doomed.len(), "node deleted");
        Ok(())
    }

    /// Remove all items from a node.
    #[instrument(skip(self), fields(host = %host, node = %path))]
    pub async fn purge_node(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "purge-nodes")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }
        if !node.options.persist_items {
            return Err(StanzaError::unsupported("persistent-items"));
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        self.store.transaction(move |_| {
            store.purge_items(idx);
            Ok(())
        })?;
        self.broadcaster.broadcast_purge(&node).await;
        Ok(())
    }

    // ---- subscriptions ----

    /// Subscribe `jid` to a node. Returns the resulting state and subid.
    #[instrument(skip(self, options_form), fields(host = %host, node = %path))]
    pub async fn subscribe_node(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        jid: &Jid,
        options_form: Option<&Element>,
    ) -> Result<(SubscriptionState, SubId), StanzaError> {
        if requester.to_bare() != jid.to_bare() {
            return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::InvalidJid));
        }

        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "subscribe")?;
        if !node.options.subscribe {
            return Err(StanzaError::not_allowed());
        }

        let mut sub_options = SubOptions::default();
        if let Some(form) = options_form {
            Self::require_feature(&plugin, "subscription-options")?;
            sub_options.apply_form(form)?;
        }

        let subscriber = jid.to_bare();
        let state = self.store.state(node.idx, &subscriber);
        if state.affiliation == Affiliation::Outcast {
            return Err(StanzaError::forbidden());
        }

        // Without multi-subscribe, a second subscribe returns the existing
        // subscription.
        if !plugin.multi_subscribe() {
            if let Some((existing_state, existing_subid)) = state
                .subscriptions
                .iter()
                .find(|(s, _)| *s == SubscriptionState::Subscribed)
            {
                return Ok((*existing_state, existing_subid.clone()));
            }
        }

        let gate = self.check_access(&node, &subscriber).await?;
        let new_state = match gate {
            Gate::Allow => SubscriptionState::Subscribed,
            Gate::Pending => SubscriptionState::Pending,
        };
        let subid: SubId = Uuid::new_v4().to_string();

        {
            let store = Arc::clone(&self.store);
            let idx = node.idx;
            let subscriber = subscriber.clone();
            let subid = subid.clone();
            let sub_options = sub_options.clone();
            self.store.transaction(move |_| {
                store.add_subscription(idx, &subscriber, new_state, subid.clone(), sub_options.clone());
                Ok(())
            })?;
        }

        self.broadcaster
            .notify_owners_of_subscription(&node, jid, new_state, Some(&subid))
            .await;

        match new_state {
            SubscriptionState::Subscribed => {
                if matches!(
                    node.options.send_last_published_item,
                    SendLastPublishedItem::OnSub | SendLastPublishedItem::OnSubAndPresence
                ) {
                    if let Some(item) = self.store.last_item(node.idx) {
                        self.broadcaster
                            .send_items_to(&node, &jid.to_string(), &[item], None)
                            .await;
                    }
                }
            }
            SubscriptionState::Pending => {
                self.send_authorization_requests(&node, jid).await;
            }
            SubscriptionState::Unconfigured => {}
        }

        Ok((new_state, subid))
    }

    async fn send_authorization_requests(&self, node: &NodeRecord, subscriber: &Jid) {
        let from = node.host.service_jid();
        for owner in &node.owners {
            let message = stanzas::build_authorization_request(
                &from,
                &owner.to_string(),
                &node.path,
                subscriber,
            );
            if let Err(error) = self.router.deliver(message).await {
                warn!(
                    node = %node.path,
                    owner = %owner,
                    error = %error,
                    "authorization request delivery failed"
                );
            }
        }
    }

    /// Remove a subscription. Owners may unsubscribe other entities.
    #[instrument(skip(self), fields(host = %host, node = %path))]
    pub async fn unsubscribe_node(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let subject = jid.to_bare();
        if requester.to_bare() != subject && !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        let state = self.store.state(node.idx, &subject);
        let target_subid = match subid {
            Some(subid) => {
                if !state.subscriptions.iter().any(|(_, s)| s == subid) {
                    return Err(StanzaError::not_acceptable().with_ext(PubSubErrorExt::InvalidSubid));
                }
                subid.to_string()
            }
            None => match state.subscriptions.len() {
                0 => {
                    return Err(StanzaError::new(crate::error::Condition::UnexpectedRequest)
                        .with_ext(PubSubErrorExt::NotSubscribed))
                }
                1 => state.subscriptions[0].1.clone(),
                _ => {
                    return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::SubidRequired))
                }
            },
        };

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        let entity = subject.clone();
        self.store.transaction(move |_| {
            store.remove_subscription(idx, &entity, &target_subid);
            Ok(())
        })?;
        Ok(())
    }

    /// Access-model gate for subscribe attempts.
    async fn check_access(
        &self,
        node: &NodeRecord,
        requester: &BareJid,
    ) -> Result<Gate, StanzaError> {
        use crate::pubsub::node::AccessModel;

        match node.options.access_model {
            AccessModel::Open => Ok(Gate::Allow),
            AccessModel::Presence => {
                if self.any_owner_shares_presence(node, requester).await {
                    Ok(Gate::Allow)
                } else {
                    Err(StanzaError::not_authorized()
                        .with_ext(PubSubErrorExt::PresenceSubscriptionRequired))
                }
            }
            AccessModel::Roster => {
                if !self.any_owner_shares_presence(node, requester).await {
                    return Err(StanzaError::not_authorized()
                        .with_ext(PubSubErrorExt::PresenceSubscriptionRequired));
                }
                for owner in &node.owners {
                    let groups = self.roster.groups(owner, requester).await;
                    if groups
                        .iter()
                        .any(|group| node.options.roster_groups_allowed.contains(group))
                    {
                        return Ok(Gate::Allow);
                    }
                }
                Err(StanzaError::not_authorized().with_ext(PubSubErrorExt::NotInRosterGroup))
            }
            AccessModel::Authorize => Ok(Gate::Pending),
            AccessModel::Whitelist => {
                let state = self.store.state(node.idx, requester);
                match state.affiliation {
                    Affiliation::Owner | Affiliation::Publisher | Affiliation::Member => {
                        Ok(Gate::Allow)
                    }
                    _ => Err(StanzaError::not_allowed().with_ext(PubSubErrorExt::ClosedNode)),
                }
            }
        }
    }

    async fn any_owner_shares_presence(&self, node: &NodeRecord, requester: &BareJid) -> bool {
        for owner in &node.owners {
            if owner == requester
                || self.roster.has_presence_subscription(owner, requester).await
            {
                return true;
            }
        }
        false
    }

    /// Whether `requester` may retrieve items from the node.
    pub(crate) async fn retrieval_allowed(
        &self,
        node: &NodeRecord,
        requester: &BareJid,
    ) -> Result<(), StanzaError> {
        use crate::pubsub::node::AccessModel;

        if node.is_owner(requester) {
            return Ok(());
        }
        let state = self.store.state(node.idx, requester);
        if state.affiliation == Affiliation::Outcast {
            return Err(StanzaError::forbidden());
        }

        match node.options.access_model {
            AccessModel::Open => Ok(()),
            AccessModel::Presence | AccessModel::Roster => {
                match self.check_access(node, requester).await? {
                    Gate::Allow => Ok(()),
                    Gate::Pending => Err(StanzaError::not_authorized()),
                }
            }
            AccessModel::Authorize => {
                if state.has_subscription_state(SubscriptionState::Subscribed) {
                    Ok(())
                } else {
                    Err(StanzaError::not_authorized()
                        .with_ext(PubSubErrorExt::PendingSubscription))
                }
            }
            AccessModel::Whitelist => match state.affiliation {
                Affiliation::Publisher | Affiliation::Member => Ok(()),
                _ => Err(StanzaError::not_allowed().with_ext(PubSubErrorExt::ClosedNode)),
            },
        }
    }

    // ---- publishing ----

    /// Publish an item. Returns the item id and any evicted item ids.
    #[instrument(skip(self, payload), fields(host = %host, node = %path))]
    pub async fn publish_item(
        &self,
        host: &Host,
        path: &str,
        publisher: &Jid,
        item_id: Option<String>,
        payload: Vec<Element>,
    ) -> Result<(String, Vec<String>), StanzaError> {
        let node = match self.store.node(host, path) {
            Some(node) => node,
            None => {
                let plugin = self.plugin_for_host(host);
                if !plugin.has_feature("auto-create") {
                    return Err(StanzaError::item_not_found());
                }
                let created = self
                    .create_node(host, Some(path.to_string()), publisher, None, None)
                    .await?;
                self.node_or_not_found(host, &created)?
            }
        };
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "publish")?;

        let publisher_bare = publisher.to_bare();
        self.publish_allowed(&node, &publisher_bare)?;
        self.validate_payload(&node, &payload)?;

        let id = item_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Non-persistent nodes keep at most the last item, and only when a
        // last-item push can still need it.
        let retention = if node.options.persist_items {
            Some(node.options.max_items)
        } else if node.options.send_last_published_item != SendLastPublishedItem::Never {
            Some(1)
        } else {
            None
        };

        let evicted = match retention {
            Some(max_items) => {
                let store = Arc::clone(&self.store);
                let idx = node.idx;
                let id = id.clone();
                let payload = payload.clone();
                let publisher_bare = publisher_bare.clone();
                self.store.transaction(move |_| {
                    Ok(store.store_item(idx, id.clone(), payload.clone(), publisher_bare.clone(), max_items))
                })?
            }
            None => Vec::new(),
        };

        let item = self.store.item(node.idx, &id).unwrap_or_else(|| {
            // Never-stored path: materialize the event item directly.
            let now = chrono::Utc::now();
            ItemRecord {
                id: id.clone(),
                payload,
                creation: (now, publisher_bare.clone()),
                modification: (now, publisher_bare.clone()),
            }
        });

        self.broadcaster
            .broadcast_items(&node, &[item], Some(publisher))
            .await;
        if !evicted.is_empty() {
            self.broadcaster
                .broadcast_retract(&node, &evicted, false)
                .await;
        }

        Ok((id, evicted))
    }

    fn publish_allowed(&self, node: &NodeRecord, publisher: &BareJid) -> Result<(), StanzaError> {
        use crate::pubsub::node::PublishModel;

        let state = self.store.state(node.idx, publisher);
        if state.affiliation == Affiliation::Outcast {
            return Err(StanzaError::forbidden());
        }
        let allowed = match node.options.publish_model {
            PublishModel::Open => true,
            PublishModel::Publishers => state.affiliation.can_publish(),
            PublishModel::Subscribers => {
                state.affiliation.can_publish()
                    || state.has_subscription_state(SubscriptionState::Subscribed)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(StanzaError::forbidden())
        }
    }

    fn validate_payload(
        &self,
        node: &NodeRecord,
        payload: &[Element],
    ) -> Result<(), StanzaError> {
        let wants_payload = node.options.deliver_payloads || node.options.persist_items;
        if wants_payload && payload.is_empty() {
            return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::PayloadRequired));
        }
        if !wants_payload && !payload.is_empty() {
            return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::InvalidPayload));
        }
        if payload.len() > 1 {
            return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::InvalidPayload));
        }

        let size: usize = payload
            .iter()
            .map(|fragment| String::from(fragment).len())
            .sum();
        if size > node.options.max_payload_size {
            return Err(StanzaError::not_acceptable().with_ext(PubSubErrorExt::PayloadTooBig));
        }

        if let (Some(required_ns), Some(fragment)) =
            (node.options.payload_type.as_deref(), payload.first())
        {
            if fragment.ns() != required_ns {
                return Err(StanzaError::bad_request().with_ext(PubSubErrorExt::InvalidPayload));
            }
        }
        Ok(())
    }

    /// Retract one item.
    #[instrument(skip(self), fields(host = %host, node = %path))]
    pub async fn retract_item(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        item_id: &str,
        force_notify: bool,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "persistent-items")?;
        Self::require_feature(&plugin, "delete-items")?;
        if !node.options.persist_items {
            return Err(StanzaError::unsupported("persistent-items"));
        }

        let requester_bare = requester.to_bare();
        let item = self
            .store
            .item(node.idx, item_id)
            .ok_or_else(StanzaError::item_not_found)?;
        let state = self.store.state(node.idx, &requester_bare);
        let may_retract = node.is_owner(&requester_bare)
            || state.affiliation.can_publish()
            || item.modification.1 == requester_bare;
        if !may_retract {
            return Err(StanzaError::forbidden());
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        let id = item_id.to_string();
        self.store.transaction(move |_| {
            store.remove_item(idx, &id);
            Ok(())
        })?;

        self.broadcaster
            .broadcast_retract(&node, &[item_id.to_string()], force_notify)
            .await;
        Ok(())
    }

    // ---- retrieval ----

    /// Items newest-first, honoring the access model and retention caps.
    pub async fn get_items(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        max_items: Option<usize>,
        item_ids: &[String],
    ) -> Result<Vec<ItemRecord>, StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "retrieve-items")?;
        self.retrieval_allowed(&node, &requester.to_bare()).await?;

        if !item_ids.is_empty() {
            let mut out = Vec::new();
            for id in item_ids {
                if let Some(item) = self.store.item(node.idx, id) {
                    out.push(item);
                }
            }
            return Ok(out);
        }

        // A zero retention bound means unlimited.
        let cap = match (max_items, node.options.max_items) {
            (Some(cap), 0) => Some(cap),
            (Some(cap), limit) => Some(cap.min(limit)),
            (None, 0) => None,
            (None, limit) => Some(limit),
        };
        Ok(self.store.items(node.idx, cap))
    }

    /// One item by id.
    pub async fn get_item(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        item_id: &str,
    ) -> Result<ItemRecord, StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "retrieve-items")?;
        self.retrieval_allowed(&node, &requester.to_bare()).await?;
        self.store
            .item(node.idx, item_id)
            .ok_or_else(StanzaError::item_not_found)
    }

    // ---- affiliations ----

    /// The requester's own affiliations across the host.
    pub async fn get_affiliations(
        &self,
        host: &Host,
        requester: &Jid,
    ) -> Result<Vec<(String, Affiliation)>, StanzaError> {
        let entity = requester.to_bare();
        Ok(self
            .store
            .states_by_entity(host, &entity)
            .into_iter()
            .map(|(node, state)| (node.path, state.affiliation))
            .collect())
    }

    /// Owner view of a node's affiliation table.
    pub async fn get_node_affiliations(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
    ) -> Result<Vec<(BareJid, Affiliation)>, StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "modify-affiliations")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }
        Ok(self.store.affiliations_by_node(node.idx))
    }

    /// Owner-only affiliation writes. `owner` entries extend the owner set;
    /// `none` removes (the last owner cannot be removed).
    #[instrument(skip(self, entries), fields(host = %host, node = %path))]
    pub async fn set_node_affiliations(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        entries: Vec<(BareJid, Affiliation)>,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "modify-affiliations")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        let mut owners = node.owners.clone();
        self.store.transaction(move |_| {
            for (entity, affiliation) in &entries {
                match affiliation {
                    Affiliation::Owner => {
                        if !owners.contains(entity) {
                            owners.push(entity.clone());
                        }
                    }
                    Affiliation::None => {
                        if owners.contains(entity) {
                            if owners.len() == 1 {
                                return Err(StanzaError::conflict()
                                    .with_text("cannot remove the last owner"));
                            }
                            owners.retain(|owner| owner != entity);
                        }
                    }
                    _ => {
                        if owners.contains(entity) && owners.len() == 1 {
                            return Err(StanzaError::conflict()
                                .with_text("cannot demote the last owner"));
                        }
                        owners.retain(|owner| owner != entity);
                    }
                }
                store.set_affiliation(idx, entity, *affiliation);
            }
            store.set_owners(idx, owners.clone())
        })?;
        Ok(())
    }

    // ---- subscription tables ----

    /// The requester's own subscriptions across the host.
    pub async fn get_subscriptions(
        &self,
        host: &Host,
        requester: &Jid,
    ) -> Result<Vec<(String, String, SubscriptionState, SubId)>, StanzaError> {
        let entity = requester.to_bare();
        let mut out = Vec::new();
        for (node, state) in self.store.states_by_entity(host, &entity) {
            for (sub_state, subid) in state.subscriptions {
                out.push((node.path.clone(), entity.to_string(), sub_state, subid));
            }
        }
        Ok(out)
    }

    /// Owner view of a node's subscription table.
    pub async fn get_node_subscriptions(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
    ) -> Result<Vec<(String, SubscriptionState, SubId)>, StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "manage-subscriptions")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }
        let mut out = Vec::new();
        for (entity, state) in self.store.states_by_node(node.idx) {
            for (sub_state, subid) in state.subscriptions {
                out.push((entity.to_string(), sub_state, subid));
            }
        }
        Ok(out)
    }

    /// Owner-only subscription writes.
    ///
    /// Entries commit one at a time: the first failing entry aborts the
    /// remainder with `not-acceptable` while earlier entries stay applied.
    /// State changes are notified to each affected subject.
    #[instrument(skip(self, entries), fields(host = %host, node = %path))]
    pub async fn set_node_subscriptions(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        entries: Vec<(Jid, Option<SubscriptionState>, Option<SubId>)>,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "manage-subscriptions")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        for (jid, new_state, subid) in entries {
            let entity = jid.to_bare();
            let current = self.store.state(node.idx, &entity);
            let target_subid = match &subid {
                Some(subid) => Some(subid.clone()),
                None => match current.subscriptions.len() {
                    0 => None,
                    1 => Some(current.subscriptions[0].1.clone()),
                    _ => {
                        return Err(
                            StanzaError::not_acceptable().with_ext(PubSubErrorExt::SubidRequired)
                        )
                    }
                },
            };

            let applied_state = match new_state {
                None => {
                    let target = target_subid.ok_or_else(|| {
                        StanzaError::not_acceptable().with_ext(PubSubErrorExt::NotSubscribed)
                    })?;
                    let store = Arc::clone(&self.store);
                    let idx = node.idx;
                    let entity = entity.clone();
                    let removed = self.store.transaction(move |_| {
                        Ok(store.remove_subscription(idx, &entity, &target))
                    })?;
                    if !removed {
                        return Err(
                            StanzaError::not_acceptable().with_ext(PubSubErrorExt::NotSubscribed)
                        );
                    }
                    None
                }
                Some(state) => {
                    match target_subid {
                        Some(target) => {
                            let store = Arc::clone(&self.store);
                            let idx = node.idx;
                            let entity = entity.clone();
                            let result = self.store.transaction(move |_| {
                                store.update_subscription_state(idx, &entity, &target, state)
                            });
                            result.map_err(|_| {
                                StanzaError::not_acceptable()
                                    .with_ext(PubSubErrorExt::NotSubscribed)
                            })?;
                        }
                        None => {
                            let store = Arc::clone(&self.store);
                            let idx = node.idx;
                            let entity = entity.clone();
                            let fresh: SubId = Uuid::new_v4().to_string();
                            let fresh_clone = fresh.clone();
                            self.store.transaction(move |_| {
                                store.add_subscription(
                                    idx,
                                    &entity,
                                    state,
                                    fresh_clone.clone(),
                                    SubOptions::default(),
                                );
                                Ok(())
                            })?;
                        }
                    }
                    Some(state)
                }
            };

            if let Some(state) = applied_state {
                self.broadcaster
                    .notify_subscription_state(&node, &jid, state, None)
                    .await;
            }
        }
        Ok(())
    }

    // ---- configuration ----

    /// Current configuration form (owner only).
    pub async fn get_node_config(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
    ) -> Result<Element, StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "config-node")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }
        Ok(node.options.to_form())
    }

    /// Apply a submitted configuration form (owner only).
    #[instrument(skip(self, form), fields(host = %host, node = %path))]
    pub async fn configure_node(
        &self,
        host: &Host,
        path: &str,
        requester: &Jid,
        form: &Element,
    ) -> Result<(), StanzaError> {
        let node = self.node_or_not_found(host, path)?;
        let plugin = self.plugin_for_node(&node);
        Self::require_feature(&plugin, "config-node")?;
        if !node.is_owner(&requester.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        let mut options = node.options.clone();
        options.apply_form(form)?;

        for parent_path in &options.collection {
            if self.store.node(host, parent_path).is_none() {
                return Err(StanzaError::item_not_found());
            }
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        let options_clone = options.clone();
        self.store
            .transaction(move |_| store.update_options(idx, options_clone.clone()))?;

        let updated = self.node_or_not_found(host, path)?;
        self.broadcaster.broadcast_config(&updated).await;
        Ok(())
    }

    // ---- authorization workflow ----

    /// Apply an owner's submitted `pubsub#subscribe_authorization` form:
    /// approval promotes the pending subscription, rejection removes it.
    /// The subject is notified either way.
    #[instrument(skip(self, form), fields(host = %host))]
    pub async fn handle_authorization_response(
        &self,
        host: &Host,
        owner: &Jid,
        form: &Element,
    ) -> Result<(), StanzaError> {
        let (path, subscriber, allow) = stanzas::parse_authorization_response(form)?;
        let node = self.node_or_not_found(host, &path)?;
        if !node.is_owner(&owner.to_bare()) {
            return Err(StanzaError::forbidden());
        }

        let state = self.store.state(node.idx, &subscriber);
        let pending: Vec<SubId> = state
            .subscriptions
            .iter()
            .filter(|(s, _)| *s == SubscriptionState::Pending)
            .map(|(_, subid)| subid.clone())
            .collect();
        if pending.is_empty() {
            return Err(StanzaError::item_not_found());
        }

        let store = Arc::clone(&self.store);
        let idx = node.idx;
        let entity = subscriber.clone();
        let pending_tx = pending.clone();
        self.store.transaction(move |_| {
            for subid in &pending_tx {
                if allow {
                    store.update_subscription_state(
                        idx,
                        &entity,
                        subid,
                        SubscriptionState::Subscribed,
                    )?;
                } else {
                    store.remove_subscription(idx, &entity, subid);
                }
            }
            Ok(())
        })?;

        if allow {
            let subject = Jid::from(subscriber.clone());
            self.broadcaster
                .notify_subscription_state(
                    &node,
                    &subject,
                    SubscriptionState::Subscribed,
                    pending.first().map(String::as_str),
                )
                .await;
        }
        Ok(())
    }

    // ---- service discovery ----

    /// `disco#info` for the host, or for one of its nodes.
    pub async fn disco_info(
        &self,
        host: &Host,
        node: Option<&str>,
    ) -> Result<Element, StanzaError> {
        match node {
            None => {
                let plugin = self.plugin_for_host(host);
                Ok(stanzas::build_disco_info(
                    None,
                    host.is_pep(),
                    false,
                    plugin.features(),
                ))
            }
            Some(path) => {
                let record = self.node_or_not_found(host, path)?;
                let plugin = self.plugin_for_node(&record);
                let is_collection = !self.store.children_of(host, path).is_empty();
                Ok(stanzas::build_disco_info(
                    Some(path),
                    host.is_pep(),
                    is_collection,
                    plugin.features(),
                ))
            }
        }
    }

    /// `disco#items`: top-level nodes of the host, or children of a node.
    pub async fn disco_items(
        &self,
        host: &Host,
        node: Option<&str>,
    ) -> Result<Element, StanzaError> {
        let nodes = match node {
            None => self
                .store
                .nodes_on_host(host)
                .into_iter()
                .filter(|record| record.options.collection.is_empty())
                .collect::<Vec<_>>(),
            Some(path) => {
                self.node_or_not_found(host, path)?;
                self.store.children_of(host, path)
            }
        };
        let listing: Vec<(String, String)> = nodes
            .into_iter()
            .map(|record| (record.path, record.options.title.clone()))
            .collect();
        Ok(stanzas::build_disco_items(&host.service_jid(), &listing))
    }

    // ---- IQ dispatch ----

    /// Dispatch a parsed request, returning the result payload (if any).
    pub async fn handle_request(
        &self,
        host: &Host,
        from: &Jid,
        request: PubSubRequest,
    ) -> Result<Option<Element>, StanzaError> {
        match request {
            PubSubRequest::CreateNode { node, config } => {
                let instant = node.is_none();
                let path = self
                    .create_node(host, node, from, None, config.as_ref())
                    .await?;
                Ok(instant.then(|| stanzas::build_create_result(&path)))
            }
            PubSubRequest::DeleteNode { node } => {
                self.delete_node(host, &node, from).await?;
                Ok(None)
            }
            PubSubRequest::Purge { node } => {
                self.purge_node(host, &node, from).await?;
                Ok(None)
            }
            PubSubRequest::Publish {
                node,
                item_id,
                payload,
            } => {
                let (id, _evicted) = self
                    .publish_item(host, &node, from, item_id, payload)
                    .await?;
                Ok(Some(stanzas::build_publish_result(&node, &id)))
            }
            PubSubRequest::Retract {
                node,
                item_id,
                notify,
            } => {
                self.retract_item(host, &node, from, &item_id, notify)
                    .await?;
                Ok(None)
            }
            PubSubRequest::Items {
                node,
                max_items,
                item_ids,
            } => {
                let items = self
                    .get_items(host, &node, from, max_items, &item_ids)
                    .await?;
                let record = self.node_or_not_found(host, &node)?;
                Ok(Some(stanzas::build_items_result(
                    &node,
                    &items,
                    record.options.deliver_payloads || record.options.persist_items,
                )))
            }
            PubSubRequest::Subscribe { node, jid, options } => {
                let (state, subid) = self
                    .subscribe_node(host, &node, from, &jid, options.as_ref())
                    .await?;
                Ok(Some(stanzas::build_subscription_result(
                    &node,
                    &jid,
                    state,
                    Some(&subid),
                )))
            }
            PubSubRequest::Unsubscribe { node, jid, subid } => {
                self.unsubscribe_node(host, &node, from, &jid, subid.as_deref())
                    .await?;
                Ok(None)
            }
            PubSubRequest::Affiliations => {
                let entries = self.get_affiliations(host, from).await?;
                Ok(Some(stanzas::build_affiliations_result(&entries)))
            }
            PubSubRequest::Subscriptions => {
                let entries = self.get_subscriptions(host, from).await?;
                Ok(Some(stanzas::build_subscriptions_result(&entries)))
            }
            PubSubRequest::NodeAffiliations { node } => {
                let entries = self.get_node_affiliations(host, &node, from).await?;
                Ok(Some(stanzas::build_node_affiliations_result(
                    &node, &entries,
                )))
            }
            PubSubRequest::SetNodeAffiliations { node, entries } => {
                self.set_node_affiliations(host, &node, from, entries)
                    .await?;
                Ok(None)
            }
            PubSubRequest::NodeSubscriptions { node } => {
                let entries = self.get_node_subscriptions(host, &node, from).await?;
                Ok(Some(stanzas::build_node_subscriptions_result(
                    &node, &entries,
                )))
            }
            PubSubRequest::SetNodeSubscriptions { node, entries } => {
                self.set_node_subscriptions(host, &node, from, entries)
                    .await?;
                Ok(None)
            }
            PubSubRequest::ConfigureGet { node } => {
                let form = self.get_node_config(host, &node, from).await?;
                Ok(Some(stanzas::build_configure_result(&node, form)))
            }
            PubSubRequest::ConfigureSet { node, form } => {
                match form {
                    Some(form) => self.configure_node(host, &node, from, &form).await?,
                    // An empty submit resets nothing.
                    None => {
                        let _ = self.get_node_config(host, &node, from).await?;
                    }
                }
                Ok(None)
            }
        }
    }
}
