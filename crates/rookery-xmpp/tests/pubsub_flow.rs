//! End-to-end PubSub flows against the in-memory store with a capturing
//! router and scriptable roster/presence stubs.

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;

use rookery_xmpp::ns;
use rookery_xmpp::pubsub::{
    Host, PubSubService, ShowValue, StaticPresence, StaticRoster, SubscriptionState,
};
use rookery_xmpp::{CapturingSink, Condition, PubSubConfig};

struct Harness {
    service: PubSubService,
    sink: Arc<CapturingSink>,
    roster: Arc<StaticRoster>,
    presence: Arc<StaticPresence>,
}

fn harness() -> Harness {
    harness_with(PubSubConfig::default())
}

fn harness_with(config: PubSubConfig) -> Harness {
    let sink = Arc::new(CapturingSink::new());
    let roster = Arc::new(StaticRoster::new());
    let presence = Arc::new(StaticPresence::new());
    let service = PubSubService::new(
        config,
        sink.clone(),
        roster.clone(),
        presence.clone(),
        vec!["a.example".to_string()],
    );
    Harness {
        service,
        sink,
        roster,
        presence,
    }
}

fn host() -> Host {
    Host::Domain("pubsub.a.example".to_string())
}

fn alice() -> Jid {
    "alice@a.example/home".parse().expect("valid jid")
}

fn bob() -> Jid {
    "bob@b.example/desk".parse().expect("valid jid")
}

fn carol() -> Jid {
    "carol@c.example/phone".parse().expect("valid jid")
}

fn payload() -> Element {
    "<entry xmlns='urn:example:blog'>post</entry>"
        .parse()
        .expect("valid xml")
}

fn form(fields: &[(&str, &str)]) -> Element {
    let mut builder = Element::builder("x", ns::DATA_FORMS).attr("type", "submit");
    for (var, value) in fields {
        builder = builder.append(
            Element::builder("field", ns::DATA_FORMS)
                .attr("var", *var)
                .append(
                    Element::builder("value", ns::DATA_FORMS)
                        .append(*value)
                        .build(),
                )
                .build(),
        );
    }
    builder.build()
}

/// Messages delivered to a bare or full JID prefix.
fn messages_to(sink: &CapturingSink, to_prefix: &str) -> Vec<Element> {
    sink.stanzas()
        .into_iter()
        .filter(|stanza| {
            stanza.name() == "message"
                && stanza
                    .attr("to")
                    .map(|to| to.starts_with(to_prefix))
                    .unwrap_or(false)
        })
        .collect()
}

#[tokio::test]
async fn create_subscribe_publish_notify() {
    let h = harness();

    h.service
        .create_node(&host(), Some("/tests".to_string()), &alice(), None, None)
        .await
        .expect("created");

    let (state, subid) = h
        .service
        .subscribe_node(&host(), "/tests", &bob(), &bob(), None)
        .await
        .expect("subscribed");
    assert_eq!(state, SubscriptionState::Subscribed);
    assert!(!subid.is_empty());

    h.sink.clear();
    let (item_id, evicted) = h
        .service
        .publish_item(
            &host(),
            "/tests",
            &alice(),
            Some("x1".to_string()),
            vec![payload()],
        )
        .await
        .expect("published");
    assert_eq!(item_id, "x1");
    assert!(evicted.is_empty());

    let notifications = messages_to(&h.sink, "bob@b.example");
    assert_eq!(notifications.len(), 1);
    let message = &notifications[0];
    assert_eq!(message.attr("type"), Some("headline"));

    let event = message
        .get_child("event", ns::PUBSUB_EVENT)
        .expect("event payload");
    let items = event.get_child("items", ns::PUBSUB_EVENT).expect("items");
    assert_eq!(items.attr("node"), Some("/tests"));
    let item = items.get_child("item", ns::PUBSUB_EVENT).expect("item");
    assert_eq!(item.attr("id"), Some("x1"));
    assert!(item.get_child("entry", "urn:example:blog").is_some());
}

#[tokio::test]
async fn publish_then_retrieve_newest_first() {
    let h = harness();
    h.service
        .create_node(&host(), Some("/history".to_string()), &alice(), None, None)
        .await
        .expect("created");

    for i in 1..=4 {
        h.service
            .publish_item(
                &host(),
                "/history",
                &alice(),
                Some(format!("i{}", i)),
                vec![payload()],
            )
            .await
            .expect("published");
    }

    let items = h
        .service
        .get_items(&host(), "/history", &alice(), None, &[])
        .await
        .expect("retrieved");
    assert_eq!(items[0].id, "i4");
    assert!(items.iter().any(|item| item.id == "i1"));
}

#[tokio::test]
async fn eviction_returns_oldest_and_drops_it() {
    let h = harness();
    h.service
        .create_node(
            &host(),
            Some("/bounded".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#max_items", "2")])),
        )
        .await
        .expect("created");

    for i in 1..=2 {
        let (_, evicted) = h
            .service
            .publish_item(
                &host(),
                "/bounded",
                &alice(),
                Some(format!("i{}", i)),
                vec![payload()],
            )
            .await
            .expect("published");
        assert!(evicted.is_empty());
    }

    let (_, evicted) = h
        .service
        .publish_item(
            &host(),
            "/bounded",
            &alice(),
            Some("i3".to_string()),
            vec![payload()],
        )
        .await
        .expect("published");
    assert_eq!(evicted, vec!["i1".to_string()]);

    let items = h
        .service
        .get_items(&host(), "/bounded", &alice(), None, &[])
        .await
        .expect("retrieved");
    assert!(!items.iter().any(|item| item.id == "i1"));
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn access_gates() {
    let h = harness();
    let owner_bare: BareJid = "alice@a.example".parse().expect("jid");
    let bob_bare: BareJid = "bob@b.example".parse().expect("jid");

    // open
    h.service
        .create_node(&host(), Some("/open".to_string()), &alice(), None, None)
        .await
        .expect("created");
    let (state, _) = h
        .service
        .subscribe_node(&host(), "/open", &bob(), &bob(), None)
        .await
        .expect("subscribed");
    assert_eq!(state, SubscriptionState::Subscribed);

    // presence: denied without a presence subscription, allowed with one
    h.service
        .create_node(
            &host(),
            Some("/presence".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#access_model", "presence")])),
        )
        .await
        .expect("created");
    let denied = h
        .service
        .subscribe_node(&host(), "/presence", &carol(), &carol(), None)
        .await
        .unwrap_err();
    assert_eq!(denied.condition, Condition::NotAuthorized);

    h.roster.allow(&owner_bare, &bob_bare, &["friends"]);
    let (state, _) = h
        .service
        .subscribe_node(&host(), "/presence", &bob(), &bob(), None)
        .await
        .expect("subscribed");
    assert_eq!(state, SubscriptionState::Subscribed);

    // roster: requires a shared allowed group
    h.service
        .create_node(
            &host(),
            Some("/roster".to_string()),
            &alice(),
            None,
            Some(&form(&[
                ("pubsub#access_model", "roster"),
                ("pubsub#roster_groups_allowed", "family"),
            ])),
        )
        .await
        .expect("created");
    let denied = h
        .service
        .subscribe_node(&host(), "/roster", &bob(), &bob(), None)
        .await
        .unwrap_err();
    assert_eq!(denied.condition, Condition::NotAuthorized);

    let carol_bare: BareJid = "carol@c.example".parse().expect("jid");
    h.roster.allow(&owner_bare, &carol_bare, &["family"]);
    let (state, _) = h
        .service
        .subscribe_node(&host(), "/roster", &carol(), &carol(), None)
        .await
        .expect("subscribed");
    assert_eq!(state, SubscriptionState::Subscribed);

    // authorize: always pending
    h.service
        .create_node(
            &host(),
            Some("/authorize".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#access_model", "authorize")])),
        )
        .await
        .expect("created");
    let (state, _) = h
        .service
        .subscribe_node(&host(), "/authorize", &bob(), &bob(), None)
        .await
        .expect("pending");
    assert_eq!(state, SubscriptionState::Pending);

    // whitelist: refused until an owner whitelists the entity
    h.service
        .create_node(
            &host(),
            Some("/whitelist".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#access_model", "whitelist")])),
        )
        .await
        .expect("created");
    let denied = h
        .service
        .subscribe_node(&host(), "/whitelist", &bob(), &bob(), None)
        .await
        .unwrap_err();
    assert_eq!(denied.condition, Condition::NotAllowed);

    h.service
        .set_node_affiliations(
            &host(),
            "/whitelist",
            &alice(),
            vec![(bob_bare, rookery_xmpp::pubsub::Affiliation::Member)],
        )
        .await
        .expect("whitelisted");
    let (state, _) = h
        .service
        .subscribe_node(&host(), "/whitelist", &bob(), &bob(), None)
        .await
        .expect("subscribed");
    assert_eq!(state, SubscriptionState::Subscribed);
}

#[tokio::test]
async fn authorization_workflow_promotes_pending() {
    let h = harness();
    h.service
        .create_node(
            &host(),
            Some("/approval".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#access_model", "authorize")])),
        )
        .await
        .expect("created");

    h.sink.clear();
    let (state, _subid) = h
        .service
        .subscribe_node(&host(), "/approval", &bob(), &bob(), None)
        .await
        .expect("pending");
    assert_eq!(state, SubscriptionState::Pending);

    // The owner received an authorization form.
    let owner_mail = messages_to(&h.sink, "alice@a.example");
    assert_eq!(owner_mail.len(), 1);
    let request_form = owner_mail[0]
        .get_child("x", ns::DATA_FORMS)
        .expect("authorization form");
    assert!(String::from(request_form).contains("pubsub#subscriber_jid"));

    // Owner approves.
    h.sink.clear();
    let approval = form(&[
        ("pubsub#node", "/approval"),
        ("pubsub#subscriber_jid", "bob@b.example"),
        ("pubsub#allow", "true"),
    ]);
    h.service
        .handle_authorization_response(&host(), &alice(), &approval)
        .await
        .expect("approved");

    // Subject was told it is now subscribed.
    let subject_mail = messages_to(&h.sink, "bob@b.example");
    assert_eq!(subject_mail.len(), 1);
    let event = subject_mail[0]
        .get_child("event", ns::PUBSUB_EVENT)
        .expect("event");
    let subscription = event
        .get_child("subscription", ns::PUBSUB_EVENT)
        .expect("subscription");
    assert_eq!(subscription.attr("subscription"), Some("subscribed"));

    // And the table agrees.
    let subs = h
        .service
        .get_node_subscriptions(&host(), "/approval", &alice())
        .await
        .expect("listed");
    assert!(subs
        .iter()
        .any(|(jid, state, _)| jid == "bob@b.example" && *state == SubscriptionState::Subscribed));
}

#[tokio::test]
async fn broadcast_filters() {
    let h = harness();
    h.service
        .create_node(&host(), Some("/filters".to_string()), &alice(), None, None)
        .await
        .expect("created");

    // deliver=false subscriber receives nothing.
    h.service
        .subscribe_node(
            &host(),
            "/filters",
            &bob(),
            &bob(),
            Some(&form(&[("pubsub#deliver", "0")])),
        )
        .await
        .expect("subscribed");

    // show-values subscriber only receives while online.
    h.service
        .subscribe_node(
            &host(),
            "/filters",
            &carol(),
            &carol(),
            Some(&form(&[("pubsub#show-values", "online")])),
        )
        .await
        .expect("subscribed");

    let carol_bare: BareJid = "carol@c.example".parse().expect("jid");

    h.sink.clear();
    h.presence
        .set_online(&carol_bare, "carol@c.example/phone", ShowValue::Away);
    h.service
        .publish_item(&host(), "/filters", &alice(), None, vec![payload()])
        .await
        .expect("published");
    assert!(messages_to(&h.sink, "bob@b.example").is_empty());
    assert!(messages_to(&h.sink, "carol@c.example").is_empty());

    h.sink.clear();
    h.presence
        .set_online(&carol_bare, "carol@c.example/phone", ShowValue::Online);
    h.service
        .publish_item(&host(), "/filters", &alice(), None, vec![payload()])
        .await
        .expect("published");
    assert_eq!(messages_to(&h.sink, "carol@c.example").len(), 1);
    assert!(messages_to(&h.sink, "bob@b.example").is_empty());
}

#[tokio::test]
async fn collection_depth_and_shim_headers() {
    let h = harness();
    h.service
        .create_node(&host(), Some("/col".to_string()), &alice(), None, None)
        .await
        .expect("created");
    h.service
        .create_node(
            &host(),
            Some("/col/leaf".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#collection", "/col")])),
        )
        .await
        .expect("created");

    // bob subscribes to the collection with unlimited depth, carol with
    // depth 0 (direct events only).
    h.service
        .subscribe_node(
            &host(),
            "/col",
            &bob(),
            &bob(),
            Some(&form(&[("pubsub#subscription_depth", "all")])),
        )
        .await
        .expect("subscribed");
    h.service
        .subscribe_node(
            &host(),
            "/col",
            &carol(),
            &carol(),
            Some(&form(&[("pubsub#subscription_depth", "0")])),
        )
        .await
        .expect("subscribed");

    h.sink.clear();
    h.service
        .publish_item(&host(), "/col/leaf", &alice(), None, vec![payload()])
        .await
        .expect("published");

    let to_bob = messages_to(&h.sink, "bob@b.example");
    assert_eq!(to_bob.len(), 1);
    let headers = to_bob[0].get_child("headers", ns::SHIM).expect("headers");
    let collection = headers
        .children()
        .find(|header| header.attr("name") == Some("Collection"))
        .expect("collection header");
    assert_eq!(collection.text(), "/col");

    assert!(messages_to(&h.sink, "carol@c.example").is_empty());

    // Direct publishes on the collection node reach carol.
    h.sink.clear();
    h.service
        .publish_item(&host(), "/col", &alice(), None, vec![payload()])
        .await
        .expect("published");
    assert_eq!(messages_to(&h.sink, "carol@c.example").len(), 1);
}

#[tokio::test]
async fn pep_presence_sends_last_item_once() {
    let h = harness();
    let alice_bare: BareJid = "alice@a.example".parse().expect("jid");
    let pep = Host::User(alice_bare.clone());

    h.presence
        .set_online(&alice_bare, "alice@a.example/home", ShowValue::Online);

    // Auto-created PEP node; presence access passes via owner == owner.
    h.service
        .publish_item(
            &pep,
            "urn:example:mood",
            &alice(),
            Some("m1".to_string()),
            vec!["<mood xmlns='urn:example:mood'><happy/></mood>"
                .parse()
                .expect("valid xml")],
        )
        .await
        .expect("published");

    let bob_bare: BareJid = "bob@b.example".parse().expect("jid");
    h.roster.allow(&alice_bare, &bob_bare, &["friends"]);

    h.sink.clear();
    h.service.on_presence_available(&alice_bare, &bob()).await;

    let pushed = messages_to(&h.sink, "bob@b.example/desk");
    assert_eq!(pushed.len(), 1);
    let message = &pushed[0];
    assert_eq!(message.attr("from"), Some("alice@a.example"));

    let event = message
        .get_child("event", ns::PUBSUB_EVENT)
        .expect("event");
    let items = event.get_child("items", ns::PUBSUB_EVENT).expect("items");
    assert_eq!(items.attr("node"), Some("urn:example:mood"));
    assert_eq!(
        items
            .get_child("item", ns::PUBSUB_EVENT)
            .and_then(|item| item.attr("id")),
        Some("m1")
    );

    // Deferred pushes only know the stored bare publisher for replyto.
    let addresses = message
        .get_child("addresses", ns::ADDRESS)
        .expect("addresses");
    assert_eq!(
        addresses
            .children()
            .next()
            .and_then(|address| address.attr("jid")),
        Some("alice@a.example")
    );
}

#[tokio::test]
async fn pep_ignore_from_offline_suppresses_push() {
    let h = harness();
    let alice_bare: BareJid = "alice@a.example".parse().expect("jid");
    let pep = Host::User(alice_bare.clone());

    h.presence
        .set_online(&alice_bare, "alice@a.example/home", ShowValue::Online);
    h.service
        .publish_item(&pep, "urn:example:mood", &alice(), None, vec![payload()])
        .await
        .expect("published");
    h.presence.set_offline(&alice_bare, "alice@a.example/home");

    let bob_bare: BareJid = "bob@b.example".parse().expect("jid");
    h.roster.allow(&alice_bare, &bob_bare, &["friends"]);

    h.sink.clear();
    h.service.on_presence_available(&alice_bare, &bob()).await;
    assert!(messages_to(&h.sink, "bob@b.example").is_empty());
}

#[tokio::test]
async fn purge_offline_retracts_authored_items() {
    let h = harness();
    h.service
        .create_node(
            &host(),
            Some("/volatile".to_string()),
            &alice(),
            None,
            Some(&form(&[
                ("pubsub#purge_offline", "1"),
                ("pubsub#notify_retract", "1"),
            ])),
        )
        .await
        .expect("created");
    h.service
        .subscribe_node(&host(), "/volatile", &bob(), &bob(), None)
        .await
        .expect("subscribed");

    h.service
        .publish_item(
            &host(),
            "/volatile",
            &alice(),
            Some("a1".to_string()),
            vec![payload()],
        )
        .await
        .expect("published");
    h.service
        .publish_item(
            &host(),
            "/volatile",
            &alice(),
            Some("a2".to_string()),
            vec![payload()],
        )
        .await
        .expect("published");

    h.sink.clear();
    let alice_bare: BareJid = "alice@a.example".parse().expect("jid");
    h.service.on_last_resource_offline(&alice_bare).await;

    let items = h
        .service
        .get_items(&host(), "/volatile", &alice(), None, &[])
        .await
        .expect("retrieved");
    assert!(items.is_empty());

    let retracts = messages_to(&h.sink, "bob@b.example");
    assert_eq!(retracts.len(), 1);
    let event = retracts[0]
        .get_child("event", ns::PUBSUB_EVENT)
        .expect("event");
    let items = event.get_child("items", ns::PUBSUB_EVENT).expect("items");
    let retracted: Vec<_> = items
        .children()
        .filter(|child| child.name() == "retract")
        .filter_map(|child| child.attr("id"))
        .collect();
    assert_eq!(retracted.len(), 2);
    assert!(retracted.contains(&"a1"));
    assert!(retracted.contains(&"a2"));
}

#[tokio::test]
async fn delete_node_notifies_and_cascades() {
    let h = harness();
    h.service
        .create_node(
            &host(),
            Some("/doomed".to_string()),
            &alice(),
            None,
            Some(&form(&[("pubsub#notify_delete", "1")])),
        )
        .await
        .expect("created");
    h.service
        .subscribe_node(&host(), "/doomed", &bob(), &bob(), None)
        .await
        .expect("subscribed");

    // Non-owners cannot delete.
    let denied = h
        .service
        .delete_node(&host(), "/doomed", &bob())
        .await
        .unwrap_err();
    assert_eq!(denied.condition, Condition::Forbidden);

    h.sink.clear();
    h.service
        .delete_node(&host(), "/doomed", &alice())
        .await
        .expect("deleted");

    let notifications = messages_to(&h.sink, "bob@b.example");
    assert_eq!(notifications.len(), 1);
    let event = notifications[0]
        .get_child("event", ns::PUBSUB_EVENT)
        .expect("event");
    assert!(event.get_child("delete", ns::PUBSUB_EVENT).is_some());

    let missing = h
        .service
        .get_items(&host(), "/doomed", &alice(), None, &[])
        .await
        .unwrap_err();
    assert_eq!(missing.condition, Condition::ItemNotFound);
}

#[tokio::test]
async fn instant_node_gets_generated_path() {
    let h = harness();
    let path = h
        .service
        .create_node(&host(), None, &alice(), None, None)
        .await
        .expect("created");
    assert!(!path.is_empty());

    let again = h
        .service
        .create_node(&host(), Some(path.clone()), &alice(), None, None)
        .await
        .unwrap_err();
    assert_eq!(again.condition, Condition::Conflict);
}
