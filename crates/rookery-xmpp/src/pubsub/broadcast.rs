//! Notification fan-out.
//!
//! For every node event the broadcaster computes the recipient set by
//! walking the node's ancestor collection chain and evaluating each
//! subscription's delivery options: the deliver flag, the items-vs-nodes
//! subscription type, the depth bound against the distance to the
//! publishing node, expiry, and the presence show-state filter. Matching
//! subscriptions of one bare JID collapse into a single message carrying
//! SHIM `Collection` and `SubId` headers.
//!
//! Senders: the service JID for domain hosts; for PEP the owner's bare JID,
//! with the publisher's full JID attached as a `replyto` extended address.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use jid::{BareJid, Jid};
use tracing::{debug, instrument, warn};

use crate::config::PubSubConfig;
use crate::pubsub::node::{NotificationType, ShowValue, SubscriptionState, SubscriptionType};
use crate::pubsub::stanzas::{
    build_config_event, build_create_event, build_delete_event, build_event_message,
    build_items_event, build_purge_event, build_retract_event, build_subscription_event,
};
use crate::pubsub::store::{ItemRecord, NodeRecord, NodeStore, SubId};
use crate::pubsub::PresenceDirectory;
use crate::router::StanzaSink;

/// Classes of events for the subscription-type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// Item publishes and retractions go to `items` subscriptions.
    Items,
    /// Create, delete, configure and purge go to `nodes` subscriptions.
    Structural,
}

impl EventClass {
    /// The items/nodes split only constrains collection-mediated matches;
    /// a node's direct subscribers always hear about its own structural
    /// changes.
    fn matches(&self, subscription_type: SubscriptionType, distance: u32) -> bool {
        match self {
            Self::Items => subscription_type == SubscriptionType::Items,
            Self::Structural => distance == 0 || subscription_type == SubscriptionType::Nodes,
        }
    }
}

/// One computed notification target.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub jid: BareJid,
    pub subids: Vec<SubId>,
    /// Ancestor collection the match came through, if not the node itself.
    pub collection: Option<String>,
}

/// Computes recipient sets and emits notification messages.
pub struct Broadcaster {
    store: Arc<NodeStore>,
    router: Arc<dyn StanzaSink>,
    presence: Arc<dyn PresenceDirectory>,
    config: Arc<PubSubConfig>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<NodeStore>,
        router: Arc<dyn StanzaSink>,
        presence: Arc<dyn PresenceDirectory>,
        config: Arc<PubSubConfig>,
    ) -> Self {
        Self {
            store,
            router,
            presence,
            config,
        }
    }

    /// Recipients for an event on `node`, deduplicated by bare JID.
    async fn recipients(&self, node: &NodeRecord, class: EventClass) -> Vec<Recipient> {
        let mut chain = vec![(node.clone(), 0u32)];
        chain.extend(self.store.ancestors(node));
        let now = Utc::now();

        let mut by_jid: HashMap<BareJid, Recipient> = HashMap::new();
        for (hop, distance) in &chain {
            for (entity, state) in self.store.states_by_node(hop.idx) {
                if state.affiliation == crate::pubsub::node::Affiliation::Outcast {
                    continue;
                }
                for (sub_state, subid) in &state.subscriptions {
                    if *sub_state != SubscriptionState::Subscribed {
                        continue;
                    }
                    let options = self.store.sub_options(subid).unwrap_or_default();
                    if !options.deliver
                        || !class.matches(options.subscription_type, *distance)
                        || !options.subscription_depth.accepts(*distance)
                        || options.expired_at(now)
                    {
                        continue;
                    }

                    let needs_presence = node.options.presence_based_delivery
                        || !options.show_values.is_empty();
                    if needs_presence {
                        let resources = self.presence.resources(&entity).await;
                        if resources.is_empty() {
                            continue;
                        }
                        if !resources
                            .iter()
                            .any(|(_, show)| options.accepts_show(*show))
                        {
                            continue;
                        }
                    }

                    let recipient =
                        by_jid
                            .entry(entity.clone())
                            .or_insert_with(|| Recipient {
                                jid: entity.clone(),
                                subids: Vec::new(),
                                collection: None,
                            });
                    if !recipient.subids.contains(subid) {
                        recipient.subids.push(subid.clone());
                    }
                    if *distance > 0 && recipient.collection.is_none() {
                        recipient.collection = Some(hop.path.clone());
                    }
                }
            }
        }

        by_jid.into_values().collect()
    }

    /// Sender address and `replyto` for an event on this node.
    fn sender(&self, node: &NodeRecord, publisher: Option<&Jid>) -> (String, Option<String>) {
        if node.host.is_pep() {
            let replyto = publisher.map(|jid| jid.to_string());
            (node.host.service_jid(), replyto)
        } else {
            (node.host.service_jid(), None)
        }
    }

    async fn emit(
        &self,
        node: &NodeRecord,
        class: EventClass,
        event: minidom::Element,
        publisher: Option<&Jid>,
    ) {
        let recipients = self.recipients(node, class).await;
        debug!(
            node = %node.path,
            host = %node.host,
            recipients = recipients.len(),
            "broadcasting event"
        );
        let (from, replyto) = self.sender(node, publisher);
        for recipient in recipients {
            let message = build_event_message(
                &from,
                &recipient.jid.to_string(),
                event.clone(),
                node.options.notification_type,
                &recipient.subids,
                recipient.collection.as_deref(),
                replyto.as_deref(),
            );
            if let Err(error) = self.router.deliver(message).await {
                warn!(node = %node.path, error = %error, "notification delivery failed");
            }
        }
    }

    /// Publish notification for freshly stored items.
    #[instrument(skip(self, node, items), fields(node = %node.path))]
    pub async fn broadcast_items(
        &self,
        node: &NodeRecord,
        items: &[ItemRecord],
        publisher: Option<&Jid>,
    ) {
        if !node.options.deliver_notifications {
            return;
        }
        let event = build_items_event(&node.path, items, node.options.deliver_payloads);
        self.emit(node, EventClass::Items, event, publisher).await;
    }

    /// Retract notification; `force` bypasses the node's `notify_retract`.
    pub async fn broadcast_retract(&self, node: &NodeRecord, item_ids: &[String], force: bool) {
        if item_ids.is_empty() || (!node.options.notify_retract && !force) {
            return;
        }
        if !node.options.deliver_notifications {
            return;
        }
        let event = build_retract_event(&node.path, item_ids);
        self.emit(node, EventClass::Items, event, None).await;
    }

    /// Purge notification (structural).
    pub async fn broadcast_purge(&self, node: &NodeRecord) {
        let event = build_purge_event(&node.path);
        self.emit(node, EventClass::Structural, event, None).await;
    }

    /// Delete notification, honoring `notify_delete`.
    pub async fn broadcast_delete(&self, node: &NodeRecord) {
        if !node.options.notify_delete {
            return;
        }
        let event = build_delete_event(&node.path);
        self.emit(node, EventClass::Structural, event, None).await;
    }

    /// Creation notification (reaches collection subscribers).
    pub async fn broadcast_create(&self, node: &NodeRecord) {
        let event = build_create_event(&node.path);
        self.emit(node, EventClass::Structural, event, None).await;
    }

    /// Configuration-change notification, honoring `notify_config`.
    pub async fn broadcast_config(&self, node: &NodeRecord) {
        if !node.options.notify_config {
            return;
        }
        let form = if node.options.deliver_payloads {
            Some(node.options.to_form())
        } else {
            None
        };
        let event = build_config_event(&node.path, form);
        self.emit(node, EventClass::Structural, event, None).await;
    }

    /// Tell node owners about a subscription change (`notify_sub`).
    pub async fn notify_owners_of_subscription(
        &self,
        node: &NodeRecord,
        subject: &Jid,
        state: SubscriptionState,
        subid: Option<&str>,
    ) {
        if !node.options.notify_sub {
            return;
        }
        let event = build_subscription_event(
            &node.path,
            subject,
            state,
            subid,
            self.config.compat_subsription_attr,
        );
        let (from, _) = self.sender(node, None);
        for owner in &node.owners {
            let message = build_event_message(
                &from,
                &owner.to_string(),
                event.clone(),
                NotificationType::Headline,
                &[],
                None,
                None,
            );
            if let Err(error) = self.router.deliver(message).await {
                warn!(node = %node.path, error = %error, "owner notification failed");
            }
        }
    }

    /// Tell the subject its subscription state changed.
    pub async fn notify_subscription_state(
        &self,
        node: &NodeRecord,
        subject: &Jid,
        state: SubscriptionState,
        subid: Option<&str>,
    ) {
        let event = build_subscription_event(&node.path, subject, state, subid, false);
        let (from, _) = self.sender(node, None);
        let message = build_event_message(
            &from,
            &subject.to_string(),
            event,
            NotificationType::Headline,
            &[],
            None,
            None,
        );
        if let Err(error) = self.router.deliver(message).await {
            warn!(node = %node.path, error = %error, "subject notification failed");
        }
    }

    /// Push the node's newest item(s) to one recipient, bypassing the
    /// recipient computation. Used for send-last-published-item.
    pub async fn send_items_to(
        &self,
        node: &NodeRecord,
        to: &str,
        items: &[ItemRecord],
        publisher: Option<&Jid>,
    ) {
        if items.is_empty() {
            return;
        }
        let event = build_items_event(&node.path, items, node.options.deliver_payloads);
        let (from, replyto) = self.sender(node, publisher);
        let message = build_event_message(
            &from,
            to,
            event,
            node.options.notification_type,
            &[],
            None,
            replyto.as_deref(),
        );
        if let Err(error) = self.router.deliver(message).await {
            warn!(node = %node.path, to = %to, error = %error, "last-item push failed");
        }
    }

    /// Resources of a user that pass a show filter, for PEP presence
    /// deliveries.
    pub async fn online_resources(&self, user: &BareJid) -> Vec<(String, ShowValue)> {
        self.presence.resources(user).await
    }
}
