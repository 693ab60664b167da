//! Personal Eventing (XEP-0163) presence hooks.
//!
//! PEP nodes live on a user's bare JID. Two presence-driven behaviors are
//! implemented here on top of the regular controller:
//!
//! - When a contact's resource becomes available, the newest item of each
//!   of the user's PEP nodes configured with
//!   `send_last_published_item=on_sub_and_presence` is pushed to that
//!   resource, once, subject to the node's access model.
//! - When a user's last resource disconnects, items they published on
//!   nodes configured with `purge_offline` are removed and retract
//!   notifications broadcast.

use jid::{BareJid, Jid};
use tracing::{debug, instrument};

use crate::pubsub::node::{Host, SendLastPublishedItem};
use crate::pubsub::service::PubSubService;

/// The PEP host for a user.
pub fn pep_host(user: &BareJid) -> Host {
    Host::User(user.clone())
}

impl PubSubService {
    /// A contact's resource came online: deliver last published items of
    /// `owner`'s PEP nodes to the new resource.
    ///
    /// With `ignore_pep_from_offline` set (the default), nothing is pushed
    /// while the node owner has no online resource of their own.
    #[instrument(skip(self), fields(owner = %owner, contact = %contact))]
    pub async fn on_presence_available(&self, owner: &BareJid, contact: &Jid) {
        if self.config.ignore_pep_from_offline
            && self.presence.resources(owner).await.is_empty()
        {
            debug!("owner offline, suppressing PEP presence delivery");
            return;
        }

        let host = pep_host(owner);
        let contact_bare = contact.to_bare();
        for node in self.store.nodes_on_host(&host) {
            if node.options.send_last_published_item != SendLastPublishedItem::OnSubAndPresence {
                continue;
            }
            if self.retrieval_allowed(&node, &contact_bare).await.is_err() {
                continue;
            }
            if let Some(item) = self.store.last_item(node.idx) {
                let publisher = Jid::from(item.modification.1.clone());
                self.broadcaster
                    .send_items_to(&node, &contact.to_string(), &[item], Some(&publisher))
                    .await;
            }
        }
    }

    /// The user's last resource went offline: purge their authored items
    /// from nodes configured with `purge_offline`, broadcasting retractions
    /// per `notify_retract`.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn on_last_resource_offline(&self, user: &BareJid) {
        let mut candidates = self.store.nodes_on_host(&pep_host(user));
        for node in self.store.nodes_with_state_for(user) {
            if !candidates.iter().any(|seen| seen.idx == node.idx) {
                candidates.push(node);
            }
        }

        for node in candidates {
            if !node.options.purge_offline {
                continue;
            }
            let authored = self.store.items_by_publisher(node.idx, user);
            if authored.is_empty() {
                continue;
            }

            let store = std::sync::Arc::clone(&self.store);
            let idx = node.idx;
            let ids = authored.clone();
            let purged = self.store.transaction(move |_| {
                for id in &ids {
                    store.remove_item(idx, id);
                }
                Ok(())
            });
            if purged.is_err() {
                continue;
            }

            debug!(node = %node.path, removed = authored.len(), "purged offline publisher items");
            self.broadcaster
                .broadcast_retract(&node, &authored, false)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pep_host_wraps_bare_jid() {
        let user: BareJid = "alice@a.example".parse().expect("valid jid");
        let host = pep_host(&user);
        assert!(host.is_pep());
        assert_eq!(host.service_jid(), "alice@a.example");
    }
}
