//! PubSub wire codec: request parsing, result payloads and event messages.
//!
//! Requests arrive as IQ stanzas under `http://jabber.org/protocol/pubsub`
//! (entity verbs) or `...pubsub#owner` (owner verbs) and are parsed into
//! [`PubSubRequest`] values for the controller. Notification messages are
//! built here: the `pubsub#event` payload, SHIM headers, PEP `replyto`
//! addressing and the owner authorization form.

use jid::{BareJid, Jid};
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::StanzaError;
use crate::parser::ns;
use crate::pubsub::node::{
    hidden_field, text_field, Affiliation, NotificationType, SubscriptionState,
};
use crate::pubsub::store::{ItemRecord, SubId};

/// A parsed PubSub request.
#[derive(Debug, Clone)]
pub enum PubSubRequest {
    CreateNode {
        /// Empty requests an instant node.
        node: Option<String>,
        /// Submitted `pubsub#node_config` form.
        config: Option<Element>,
    },
    DeleteNode {
        node: String,
    },
    Purge {
        node: String,
    },
    Publish {
        node: String,
        /// Empty means the service assigns one.
        item_id: Option<String>,
        payload: Vec<Element>,
    },
    Retract {
        node: String,
        item_id: String,
        notify: bool,
    },
    Items {
        node: String,
        max_items: Option<usize>,
        item_ids: Vec<String>,
    },
    Subscribe {
        node: String,
        jid: Jid,
        options: Option<Element>,
    },
    Unsubscribe {
        node: String,
        jid: Jid,
        subid: Option<String>,
    },
    /// Entity-scoped: own affiliations across the host.
    Affiliations,
    /// Entity-scoped: own subscriptions across the host.
    Subscriptions,
    /// Owner-scoped affiliation list for one node.
    NodeAffiliations {
        node: String,
    },
    SetNodeAffiliations {
        node: String,
        entries: Vec<(BareJid, Affiliation)>,
    },
    /// Owner-scoped subscription list for one node.
    NodeSubscriptions {
        node: String,
    },
    SetNodeSubscriptions {
        node: String,
        /// `None` state requests removal of the subscription.
        entries: Vec<(Jid, Option<SubscriptionState>, Option<SubId>)>,
    },
    ConfigureGet {
        node: String,
    },
    ConfigureSet {
        node: String,
        form: Option<Element>,
    },
}

/// Whether an IQ carries a PubSub request.
pub fn is_pubsub_iq(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => {
            elem.name() == "pubsub" && (elem.ns() == ns::PUBSUB || elem.ns() == ns::PUBSUB_OWNER)
        }
        _ => false,
    }
}

/// Parse a PubSub IQ into a request for the controller.
pub fn parse_pubsub_iq(iq: &Iq) -> Result<PubSubRequest, StanzaError> {
    let (pubsub, is_set) = match &iq.payload {
        IqType::Get(elem) => (elem, false),
        IqType::Set(elem) => (elem, true),
        _ => return Err(StanzaError::bad_request()),
    };
    if pubsub.name() != "pubsub" {
        return Err(StanzaError::bad_request());
    }

    match pubsub.ns() {
        x if x == ns::PUBSUB => parse_entity_request(pubsub, is_set),
        x if x == ns::PUBSUB_OWNER => parse_owner_request(pubsub, is_set),
        _ => Err(StanzaError::bad_request()),
    }
}

fn required_node(elem: &Element) -> Result<String, StanzaError> {
    elem.attr("node")
        .map(String::from)
        .filter(|node| !node.is_empty())
        .ok_or_else(|| {
            StanzaError::bad_request().with_ext(crate::error::PubSubErrorExt::NodeIdRequired)
        })
}

fn required_jid(elem: &Element) -> Result<Jid, StanzaError> {
    let raw = elem.attr("jid").ok_or_else(|| {
        StanzaError::bad_request().with_ext(crate::error::PubSubErrorExt::JidRequired)
    })?;
    raw.parse().map_err(|_| {
        StanzaError::bad_request().with_ext(crate::error::PubSubErrorExt::InvalidJid)
    })
}

fn parse_entity_request(pubsub: &Element, _is_set: bool) -> Result<PubSubRequest, StanzaError> {
    if let Some(create) = pubsub.get_child("create", ns::PUBSUB) {
        let node = create
            .attr("node")
            .filter(|node| !node.is_empty())
            .map(String::from);
        let config = pubsub
            .get_child("configure", ns::PUBSUB)
            .and_then(|configure| configure.get_child("x", ns::DATA_FORMS))
            .cloned();
        return Ok(PubSubRequest::CreateNode { node, config });
    }

    if let Some(publish) = pubsub.get_child("publish", ns::PUBSUB) {
        let node = required_node(publish)?;
        let (item_id, payload) = match publish.get_child("item", ns::PUBSUB) {
            Some(item) => (
                item.attr("id").filter(|id| !id.is_empty()).map(String::from),
                item.children().cloned().collect(),
            ),
            None => (None, Vec::new()),
        };
        return Ok(PubSubRequest::Publish {
            node,
            item_id,
            payload,
        });
    }

    if let Some(retract) = pubsub.get_child("retract", ns::PUBSUB) {
        let node = required_node(retract)?;
        let notify = retract
            .attr("notify")
            .map(|value| value == "1" || value == "true")
            .unwrap_or(false);
        let item_id = retract
            .get_child("item", ns::PUBSUB)
            .and_then(|item| item.attr("id"))
            .map(String::from)
            .ok_or_else(|| {
                StanzaError::bad_request().with_ext(crate::error::PubSubErrorExt::ItemRequired)
            })?;
        return Ok(PubSubRequest::Retract {
            node,
            item_id,
            notify,
        });
    }

    if let Some(items) = pubsub.get_child("items", ns::PUBSUB) {
        let node = required_node(items)?;
        let max_items = items.attr("max_items").and_then(|value| value.parse().ok());
        let item_ids = items
            .children()
            .filter(|child| child.name() == "item")
            .filter_map(|item| item.attr("id").map(String::from))
            .collect();
        return Ok(PubSubRequest::Items {
            node,
            max_items,
            item_ids,
        });
    }

    if let Some(subscribe) = pubsub.get_child("subscribe", ns::PUBSUB) {
        let node = required_node(subscribe)?;
        let jid = required_jid(subscribe)?;
        let options = pubsub
            .get_child("options", ns::PUBSUB)
            .and_then(|options| options.get_child("x", ns::DATA_FORMS))
            .cloned();
        return Ok(PubSubRequest::Subscribe { node, jid, options });
    }

    if let Some(unsubscribe) = pubsub.get_child("unsubscribe", ns::PUBSUB) {
        let node = required_node(unsubscribe)?;
        let jid = required_jid(unsubscribe)?;
        let subid = unsubscribe.attr("subid").map(String::from);
        return Ok(PubSubRequest::Unsubscribe { node, jid, subid });
    }

    if pubsub.get_child("affiliations", ns::PUBSUB).is_some() {
        return Ok(PubSubRequest::Affiliations);
    }
    if pubsub.get_child("subscriptions", ns::PUBSUB).is_some() {
        return Ok(PubSubRequest::Subscriptions);
    }

    Err(StanzaError::bad_request())
}

fn parse_owner_request(pubsub: &Element, is_set: bool) -> Result<PubSubRequest, StanzaError> {
    if let Some(delete) = pubsub.get_child("delete", ns::PUBSUB_OWNER) {
        return Ok(PubSubRequest::DeleteNode {
            node: required_node(delete)?,
        });
    }

    if let Some(purge) = pubsub.get_child("purge", ns::PUBSUB_OWNER) {
        return Ok(PubSubRequest::Purge {
            node: required_node(purge)?,
        });
    }

    if let Some(configure) = pubsub.get_child("configure", ns::PUBSUB_OWNER) {
        let node = required_node(configure)?;
        return if is_set {
            Ok(PubSubRequest::ConfigureSet {
                node,
                form: configure.get_child("x", ns::DATA_FORMS).cloned(),
            })
        } else {
            Ok(PubSubRequest::ConfigureGet { node })
        };
    }

    if let Some(affiliations) = pubsub.get_child("affiliations", ns::PUBSUB_OWNER) {
        let node = required_node(affiliations)?;
        if !is_set {
            return Ok(PubSubRequest::NodeAffiliations { node });
        }
        let mut entries = Vec::new();
        for child in affiliations.children() {
            if child.name() != "affiliation" {
                continue;
            }
            let jid: BareJid = child
                .attr("jid")
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| {
                    StanzaError::bad_request()
                        .with_ext(crate::error::PubSubErrorExt::InvalidJid)
                })?;
            let affiliation = child
                .attr("affiliation")
                .and_then(Affiliation::parse)
                .ok_or_else(StanzaError::bad_request)?;
            entries.push((jid, affiliation));
        }
        return Ok(PubSubRequest::SetNodeAffiliations { node, entries });
    }

    if let Some(subscriptions) = pubsub.get_child("subscriptions", ns::PUBSUB_OWNER) {
        let node = required_node(subscriptions)?;
        if !is_set {
            return Ok(PubSubRequest::NodeSubscriptions { node });
        }
        let mut entries = Vec::new();
        for child in subscriptions.children() {
            if child.name() != "subscription" {
                continue;
            }
            let jid: Jid = child
                .attr("jid")
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| {
                    StanzaError::bad_request()
                        .with_ext(crate::error::PubSubErrorExt::InvalidJid)
                })?;
            // "none" requests removal of the subscription.
            let state = match child.attr("subscription") {
                Some("none") => None,
                Some(value) => {
                    Some(SubscriptionState::parse(value).ok_or_else(StanzaError::bad_request)?)
                }
                None => return Err(StanzaError::bad_request()),
            };
            let subid = child.attr("subid").map(String::from);
            entries.push((jid, state, subid));
        }
        return Ok(PubSubRequest::SetNodeSubscriptions { node, entries });
    }

    Err(StanzaError::bad_request())
}

// ---- result payload builders ----

/// `<pubsub><publish node><item id/></publish></pubsub>`
pub fn build_publish_result(node: &str, item_id: &str) -> Element {
    Element::builder("pubsub", ns::PUBSUB)
        .append(
            Element::builder("publish", ns::PUBSUB)
                .attr("node", node)
                .append(
                    Element::builder("item", ns::PUBSUB)
                        .attr("id", item_id)
                        .build(),
                )
                .build(),
        )
        .build()
}

/// `<pubsub><create node/></pubsub>` for instant node results.
pub fn build_create_result(node: &str) -> Element {
    Element::builder("pubsub", ns::PUBSUB)
        .append(
            Element::builder("create", ns::PUBSUB)
                .attr("node", node)
                .build(),
        )
        .build()
}

/// `<pubsub><subscription .../></pubsub>`
pub fn build_subscription_result(
    node: &str,
    jid: &Jid,
    state: SubscriptionState,
    subid: Option<&str>,
) -> Element {
    let mut subscription = Element::builder("subscription", ns::PUBSUB)
        .attr("node", node)
        .attr("jid", jid.to_string().as_str())
        .attr("subscription", state.as_str());
    if let Some(subid) = subid {
        subscription = subscription.attr("subid", subid);
    }
    Element::builder("pubsub", ns::PUBSUB)
        .append(subscription.build())
        .build()
}

/// `<pubsub><items node>...</items></pubsub>`
pub fn build_items_result(node: &str, items: &[ItemRecord], with_payloads: bool) -> Element {
    let mut items_elem = Element::builder("items", ns::PUBSUB).attr("node", node);
    for item in items {
        let mut item_elem = Element::builder("item", ns::PUBSUB).attr("id", item.id.as_str());
        if with_payloads {
            for fragment in &item.payload {
                item_elem = item_elem.append(fragment.clone());
            }
        }
        items_elem = items_elem.append(item_elem.build());
    }
    Element::builder("pubsub", ns::PUBSUB)
        .append(items_elem.build())
        .build()
}

/// Entity-scoped affiliations result.
pub fn build_affiliations_result(entries: &[(String, Affiliation)]) -> Element {
    let mut affiliations = Element::builder("affiliations", ns::PUBSUB);
    for (node, affiliation) in entries {
        affiliations = affiliations.append(
            Element::builder("affiliation", ns::PUBSUB)
                .attr("node", node.as_str())
                .attr("affiliation", affiliation.as_str())
                .build(),
        );
    }
    Element::builder("pubsub", ns::PUBSUB)
        .append(affiliations.build())
        .build()
}

/// Owner-scoped per-node affiliations result.
pub fn build_node_affiliations_result(node: &str, entries: &[(BareJid, Affiliation)]) -> Element {
    let mut affiliations =
        Element::builder("affiliations", ns::PUBSUB_OWNER).attr("node", node);
    for (jid, affiliation) in entries {
        affiliations = affiliations.append(
            Element::builder("affiliation", ns::PUBSUB_OWNER)
                .attr("jid", jid.to_string().as_str())
                .attr("affiliation", affiliation.as_str())
                .build(),
        );
    }
    Element::builder("pubsub", ns::PUBSUB_OWNER)
        .append(affiliations.build())
        .build()
}

/// Entity-scoped subscriptions result.
pub fn build_subscriptions_result(
    entries: &[(String, String, SubscriptionState, SubId)],
) -> Element {
    let mut subscriptions = Element::builder("subscriptions", ns::PUBSUB);
    for (node, jid, state, subid) in entries {
        subscriptions = subscriptions.append(
            Element::builder("subscription", ns::PUBSUB)
                .attr("node", node.as_str())
                .attr("jid", jid.as_str())
                .attr("subscription", state.as_str())
                .attr("subid", subid.as_str())
                .build(),
        );
    }
    Element::builder("pubsub", ns::PUBSUB)
        .append(subscriptions.build())
        .build()
}

/// Owner-scoped per-node subscriptions result.
pub fn build_node_subscriptions_result(
    node: &str,
    entries: &[(String, SubscriptionState, SubId)],
) -> Element {
    let mut subscriptions =
        Element::builder("subscriptions", ns::PUBSUB_OWNER).attr("node", node);
    for (jid, state, subid) in entries {
        subscriptions = subscriptions.append(
            Element::builder("subscription", ns::PUBSUB_OWNER)
                .attr("jid", jid.as_str())
                .attr("subscription", state.as_str())
                .attr("subid", subid.as_str())
                .build(),
        );
    }
    Element::builder("pubsub", ns::PUBSUB_OWNER)
        .append(subscriptions.build())
        .build()
}

/// Owner configure result carrying the current options form.
pub fn build_configure_result(node: &str, form: Element) -> Element {
    Element::builder("pubsub", ns::PUBSUB_OWNER)
        .append(
            Element::builder("configure", ns::PUBSUB_OWNER)
                .attr("node", node)
                .append(form)
                .build(),
        )
        .build()
}

// ---- event payload builders ----

/// Items publish event, with payloads when the node delivers them.
pub fn build_items_event(node: &str, items: &[ItemRecord], with_payloads: bool) -> Element {
    let mut items_elem = Element::builder("items", ns::PUBSUB_EVENT).attr("node", node);
    for item in items {
        let mut item_elem =
            Element::builder("item", ns::PUBSUB_EVENT).attr("id", item.id.as_str());
        item_elem = item_elem.attr("publisher", item.modification.1.to_string().as_str());
        if with_payloads {
            for fragment in &item.payload {
                item_elem = item_elem.append(fragment.clone());
            }
        }
        items_elem = items_elem.append(item_elem.build());
    }
    Element::builder("event", ns::PUBSUB_EVENT)
        .append(items_elem.build())
        .build()
}

/// Retract event for the given item ids.
pub fn build_retract_event(node: &str, item_ids: &[String]) -> Element {
    let mut items_elem = Element::builder("items", ns::PUBSUB_EVENT).attr("node", node);
    for id in item_ids {
        items_elem = items_elem.append(
            Element::builder("retract", ns::PUBSUB_EVENT)
                .attr("id", id.as_str())
                .build(),
        );
    }
    Element::builder("event", ns::PUBSUB_EVENT)
        .append(items_elem.build())
        .build()
}

/// Structural events.
pub fn build_purge_event(node: &str) -> Element {
    simple_node_event("purge", node)
}

pub fn build_delete_event(node: &str) -> Element {
    simple_node_event("delete", node)
}

pub fn build_create_event(node: &str) -> Element {
    simple_node_event("create", node)
}

fn simple_node_event(kind: &str, node: &str) -> Element {
    Element::builder("event", ns::PUBSUB_EVENT)
        .append(
            Element::builder(kind, ns::PUBSUB_EVENT)
                .attr("node", node)
                .build(),
        )
        .build()
}

/// Configuration-change event, carrying the new form when `notify_config`
/// delivers payloads.
pub fn build_config_event(node: &str, form: Option<Element>) -> Element {
    let mut configuration =
        Element::builder("configuration", ns::PUBSUB_EVENT).attr("node", node);
    if let Some(form) = form {
        configuration = configuration.append(form);
    }
    Element::builder("event", ns::PUBSUB_EVENT)
        .append(configuration.build())
        .build()
}

/// Subscription-change event (`notify_sub`). The attribute is spelled
/// correctly; `compat_misspelled` additionally emits the historical
/// `subsription` attribute for peers that still match on it.
pub fn build_subscription_event(
    node: &str,
    jid: &Jid,
    state: SubscriptionState,
    subid: Option<&str>,
    compat_misspelled: bool,
) -> Element {
    let mut subscription = Element::builder("subscription", ns::PUBSUB_EVENT)
        .attr("node", node)
        .attr("jid", jid.to_string().as_str())
        .attr("subscription", state.as_str());
    if compat_misspelled {
        subscription = subscription.attr("subsription", state.as_str());
    }
    if let Some(subid) = subid {
        subscription = subscription.attr("subid", subid);
    }
    Element::builder("event", ns::PUBSUB_EVENT)
        .append(subscription.build())
        .build()
}

/// Wrap an event payload into a notification message.
///
/// SHIM headers carry the matching subids (when more than one) and the
/// collection the event was routed through. PEP notifications add the
/// publisher's full JID as a `replyto` extended address.
#[allow(clippy::too_many_arguments)]
pub fn build_event_message(
    from: &str,
    to: &str,
    event: Element,
    notification_type: NotificationType,
    subids: &[SubId],
    collection: Option<&str>,
    replyto: Option<&str>,
) -> Element {
    let mut message = Element::builder("message", ns::JABBER_CLIENT)
        .attr("from", from)
        .attr("to", to)
        .attr("type", notification_type.as_str())
        .append(event);

    if collection.is_some() || subids.len() > 1 {
        let mut headers = Element::builder("headers", ns::SHIM);
        if let Some(collection) = collection {
            headers = headers.append(
                Element::builder("header", ns::SHIM)
                    .attr("name", "Collection")
                    .append(collection)
                    .build(),
            );
        }
        for subid in subids {
            headers = headers.append(
                Element::builder("header", ns::SHIM)
                    .attr("name", "SubId")
                    .append(subid.as_str())
                    .build(),
            );
        }
        message = message.append(headers.build());
    }

    if let Some(replyto) = replyto {
        message = message.append(
            Element::builder("addresses", ns::ADDRESS)
                .append(
                    Element::builder("address", ns::ADDRESS)
                        .attr("type", "replyto")
                        .attr("jid", replyto)
                        .build(),
                )
                .build(),
        );
    }

    message.build()
}

// ---- service discovery ----

/// `disco#info` result for the service itself or for one node.
///
/// The service identity is `pubsub/service` (`pubsub/pep` on bare-JID
/// hosts); nodes answer as `pubsub/leaf` or `pubsub/collection`.
pub fn build_disco_info(
    node: Option<&str>,
    pep: bool,
    is_collection: bool,
    features: &[&str],
) -> Element {
    let mut query = Element::builder("query", ns::DISCO_INFO);
    if let Some(node) = node {
        query = query.attr("node", node);
    }

    let identity_type = match (node.is_some(), pep, is_collection) {
        (false, true, _) => "pep",
        (false, false, _) => "service",
        (true, _, true) => "collection",
        (true, _, false) => "leaf",
    };
    query = query.append(
        Element::builder("identity", ns::DISCO_INFO)
            .attr("category", "pubsub")
            .attr("type", identity_type)
            .build(),
    );

    query = query.append(
        Element::builder("feature", ns::DISCO_INFO)
            .attr("var", ns::PUBSUB)
            .build(),
    );
    for feature in features {
        query = query.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", format!("{}#{}", ns::PUBSUB, feature).as_str())
                .build(),
        );
    }
    query.build()
}

/// `disco#items` result listing child nodes.
pub fn build_disco_items(host_jid: &str, nodes: &[(String, String)]) -> Element {
    let mut query = Element::builder("query", ns::DISCO_ITEMS);
    for (path, title) in nodes {
        let mut item = Element::builder("item", ns::DISCO_ITEMS)
            .attr("jid", host_jid)
            .attr("node", path.as_str());
        if !title.is_empty() {
            item = item.attr("name", title.as_str());
        }
        query = query.append(item.build());
    }
    query.build()
}

// ---- authorization workflow ----

/// The `pubsub#subscribe_authorization` form sent to each owner when a
/// subscription enters the pending state.
pub fn build_authorization_request(
    from: &str,
    owner: &str,
    node: &str,
    subscriber: &Jid,
) -> Element {
    let form = Element::builder("x", ns::DATA_FORMS)
        .attr("type", "form")
        .append(hidden_field("FORM_TYPE", ns::PUBSUB_SUB_AUTH))
        .append(text_field("pubsub#node", node))
        .append(text_field(
            "pubsub#subscriber_jid",
            subscriber.to_string().as_str(),
        ))
        .append(text_field("pubsub#allow", "false"))
        .build();

    Element::builder("message", ns::JABBER_CLIENT)
        .attr("from", from)
        .attr("to", owner)
        .append(form)
        .build()
}

/// Parse an owner's submitted authorization form.
pub fn parse_authorization_response(
    form: &Element,
) -> Result<(String, BareJid, bool), StanzaError> {
    if form.name() != "x" || form.ns() != ns::DATA_FORMS {
        return Err(StanzaError::bad_request());
    }

    let mut node = None;
    let mut subscriber = None;
    let mut allow = None;
    for (var, values) in crate::pubsub::node::form_fields(form) {
        let first = values.first().map(String::as_str).unwrap_or("");
        match var.as_str() {
            "pubsub#node" => node = Some(first.to_string()),
            "pubsub#subscriber_jid" => {
                subscriber = Some(first.parse::<BareJid>().map_err(|_| {
                    StanzaError::bad_request()
                        .with_ext(crate::error::PubSubErrorExt::InvalidJid)
                })?);
            }
            "pubsub#allow" => allow = Some(first == "1" || first == "true"),
            _ => {}
        }
    }

    match (node, subscriber, allow) {
        (Some(node), Some(subscriber), Some(allow)) => Ok((node, subscriber, allow)),
        _ => Err(StanzaError::bad_request()),
    }
}
