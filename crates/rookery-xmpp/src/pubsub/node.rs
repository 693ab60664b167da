//! Node records, option schema and data-form codecs.
//!
//! A node is identified by `(host, path)` plus a stable numeric index used
//! as the foreign key of the per-node tables. Options follow the XEP-0060
//! `pubsub#node_config` schema; subscription options follow
//! `pubsub#subscribe_options`. Unknown form fields are ignored, malformed
//! values reject the form.

use std::fmt;

use chrono::{DateTime, Utc};
use jid::BareJid;
use minidom::Element;

use crate::error::StanzaError;
use crate::parser::ns;

/// A PubSub service host: a dedicated service domain, or a user's bare JID
/// for PEP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// Regular pub/sub service addressed by domain.
    Domain(String),
    /// PEP service hosted on a user's bare JID.
    User(BareJid),
}

impl Host {
    /// The JID string notifications are sent from.
    pub fn service_jid(&self) -> String {
        match self {
            Self::Domain(domain) => domain.clone(),
            Self::User(jid) => jid.to_string(),
        }
    }

    /// Whether this is a PEP host.
    pub fn is_pep(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service_jid())
    }
}

/// Stable numeric node index, unique process-wide and immutable once
/// assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub u64);

impl fmt::Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Affiliation of an entity with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    Owner,
    Publisher,
    Member,
    #[default]
    None,
    Outcast,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Publisher => "publisher",
            Self::Member => "member",
            Self::None => "none",
            Self::Outcast => "outcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "publisher" => Some(Self::Publisher),
            "member" => Some(Self::Member),
            "none" => Some(Self::None),
            "outcast" => Some(Self::Outcast),
            _ => None,
        }
    }

    /// Whether the affiliation may publish under the `publishers` model.
    pub fn can_publish(&self) -> bool {
        matches!(self, Self::Owner | Self::Publisher)
    }
}

/// State of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed,
    Pending,
    Unconfigured,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Pending => "pending",
            Self::Unconfigured => "unconfigured",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribed" => Some(Self::Subscribed),
            "pending" => Some(Self::Pending),
            "unconfigured" => Some(Self::Unconfigured),
            _ => None,
        }
    }
}

/// Access model controlling subscription and retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessModel {
    #[default]
    Open,
    Presence,
    Roster,
    Authorize,
    Whitelist,
}

impl AccessModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Presence => "presence",
            Self::Roster => "roster",
            Self::Authorize => "authorize",
            Self::Whitelist => "whitelist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "presence" => Some(Self::Presence),
            "roster" => Some(Self::Roster),
            "authorize" => Some(Self::Authorize),
            "whitelist" => Some(Self::Whitelist),
            _ => None,
        }
    }
}

/// Publish model controlling who may publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishModel {
    #[default]
    Publishers,
    Subscribers,
    Open,
}

impl PublishModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publishers => "publishers",
            Self::Subscribers => "subscribers",
            Self::Open => "open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(Self::Publishers),
            "subscribers" => Some(Self::Subscribers),
            "open" => Some(Self::Open),
            _ => None,
        }
    }
}

/// When the last published item is pushed to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendLastPublishedItem {
    #[default]
    Never,
    OnSub,
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnSub => "on_sub",
            Self::OnSubAndPresence => "on_sub_and_presence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(Self::Never),
            "on_sub" => Some(Self::OnSub),
            "on_sub_and_presence" => Some(Self::OnSubAndPresence),
            _ => None,
        }
    }
}

/// Message type used for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationType {
    #[default]
    Headline,
    Normal,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headline => "headline",
            Self::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "headline" => Some(Self::Headline),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }
}

/// Presence show states usable in a subscription's delivery filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowValue {
    /// Available with no `<show/>` child.
    Online,
    Away,
    Chat,
    Dnd,
    Xa,
}

impl ShowValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Chat => "chat",
            Self::Dnd => "dnd",
            Self::Xa => "xa",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "chat" => Some(Self::Chat),
            "dnd" => Some(Self::Dnd),
            "xa" => Some(Self::Xa),
            _ => None,
        }
    }
}

/// Kind of events a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// Item publish/retract events.
    #[default]
    Items,
    /// Structural node events (create, delete, configure, purge).
    Nodes,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Nodes => "nodes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "items" => Some(Self::Items),
            "nodes" => Some(Self::Nodes),
            _ => None,
        }
    }
}

/// Collection traversal depth a subscription accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Any distance.
    All,
    /// At most this many levels above the publishing node; 0 means the
    /// subscribed node itself only.
    Levels(u32),
}

impl Default for Depth {
    fn default() -> Self {
        Self::Levels(1)
    }
}

impl Depth {
    /// Whether an event `distance` levels below the subscribed node passes.
    pub fn accepts(&self, distance: u32) -> bool {
        match self {
            Self::All => true,
            Self::Levels(levels) => distance <= *levels,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s == "all" {
            return Some(Self::All);
        }
        s.parse::<u32>().ok().map(Self::Levels)
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Levels(levels) => write!(f, "{}", levels),
        }
    }
}

/// The full `pubsub#node_config` option set.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOptions {
    pub deliver_payloads: bool,
    pub deliver_notifications: bool,
    pub notify_config: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub notify_sub: bool,
    pub persist_items: bool,
    pub max_items: usize,
    pub subscribe: bool,
    pub access_model: AccessModel,
    pub roster_groups_allowed: Vec<String>,
    pub publish_model: PublishModel,
    pub purge_offline: bool,
    pub notification_type: NotificationType,
    pub max_payload_size: usize,
    pub send_last_published_item: SendLastPublishedItem,
    pub presence_based_delivery: bool,
    /// Parent collection node paths.
    pub collection: Vec<String>,
    /// Required payload namespace; empty means unconstrained.
    pub payload_type: Option<String>,
    pub title: String,
    pub body_xslt: Option<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            deliver_payloads: true,
            deliver_notifications: true,
            notify_config: false,
            notify_delete: false,
            notify_retract: true,
            notify_sub: false,
            persist_items: true,
            max_items: 10,
            subscribe: true,
            access_model: AccessModel::Open,
            roster_groups_allowed: Vec::new(),
            publish_model: PublishModel::Publishers,
            purge_offline: false,
            notification_type: NotificationType::Headline,
            max_payload_size: 60_000,
            send_last_published_item: SendLastPublishedItem::OnSub,
            presence_based_delivery: false,
            collection: Vec::new(),
            payload_type: None,
            title: String::new(),
            body_xslt: None,
        }
    }
}

impl NodeOptions {
    /// Apply a submitted `pubsub#node_config` form. Unknown fields are
    /// ignored; a malformed value rejects the whole form.
    pub fn apply_form(&mut self, form: &Element) -> Result<(), StanzaError> {
        for (var, values) in form_fields(form) {
            let first = values.first().map(String::as_str).unwrap_or("");
            match var.as_str() {
                "pubsub#deliver_payloads" => self.deliver_payloads = parse_bool(first)?,
                "pubsub#deliver_notifications" => {
                    self.deliver_notifications = parse_bool(first)?
                }
                "pubsub#notify_config" => self.notify_config = parse_bool(first)?,
                "pubsub#notify_delete" => self.notify_delete = parse_bool(first)?,
                "pubsub#notify_retract" => self.notify_retract = parse_bool(first)?,
                "pubsub#notify_sub" => self.notify_sub = parse_bool(first)?,
                "pubsub#persist_items" => self.persist_items = parse_bool(first)?,
                "pubsub#max_items" => {
                    self.max_items = first
                        .parse()
                        .map_err(|_| StanzaError::not_acceptable())?
                }
                "pubsub#subscribe" => self.subscribe = parse_bool(first)?,
                "pubsub#access_model" => {
                    self.access_model =
                        AccessModel::parse(first).ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#roster_groups_allowed" => self.roster_groups_allowed = values.clone(),
                "pubsub#publish_model" => {
                    self.publish_model =
                        PublishModel::parse(first).ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#purge_offline" => self.purge_offline = parse_bool(first)?,
                "pubsub#notification_type" => {
                    self.notification_type =
                        NotificationType::parse(first).ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#max_payload_size" => {
                    self.max_payload_size = first
                        .parse()
                        .map_err(|_| StanzaError::not_acceptable())?
                }
                "pubsub#send_last_published_item" => {
                    self.send_last_published_item = SendLastPublishedItem::parse(first)
                        .ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#presence_based_delivery" => {
                    self.presence_based_delivery = parse_bool(first)?
                }
                "pubsub#collection" => self.collection = values.clone(),
                "pubsub#type" => {
                    self.payload_type = if first.is_empty() {
                        None
                    } else {
                        Some(first.to_string())
                    }
                }
                "pubsub#title" => self.title = first.to_string(),
                "pubsub#body_xslt" => {
                    self.body_xslt = if first.is_empty() {
                        None
                    } else {
                        Some(first.to_string())
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Render the current configuration as a `pubsub#node_config` form.
    pub fn to_form(&self) -> Element {
        let mut form = Element::builder("x", ns::DATA_FORMS)
            .attr("type", "form")
            .append(hidden_field("FORM_TYPE", ns::PUBSUB_NODE_CONFIG));

        form = form
            .append(bool_field("pubsub#deliver_payloads", self.deliver_payloads))
            .append(bool_field(
                "pubsub#deliver_notifications",
                self.deliver_notifications,
            ))
            .append(bool_field("pubsub#notify_config", self.notify_config))
            .append(bool_field("pubsub#notify_delete", self.notify_delete))
            .append(bool_field("pubsub#notify_retract", self.notify_retract))
            .append(bool_field("pubsub#notify_sub", self.notify_sub))
            .append(bool_field("pubsub#persist_items", self.persist_items))
            .append(text_field("pubsub#max_items", &self.max_items.to_string()))
            .append(bool_field("pubsub#subscribe", self.subscribe))
            .append(text_field("pubsub#access_model", self.access_model.as_str()))
            .append(list_field(
                "pubsub#roster_groups_allowed",
                &self.roster_groups_allowed,
            ))
            .append(text_field(
                "pubsub#publish_model",
                self.publish_model.as_str(),
            ))
            .append(bool_field("pubsub#purge_offline", self.purge_offline))
            .append(text_field(
                "pubsub#notification_type",
                self.notification_type.as_str(),
            ))
            .append(text_field(
                "pubsub#max_payload_size",
                &self.max_payload_size.to_string(),
            ))
            .append(text_field(
                "pubsub#send_last_published_item",
                self.send_last_published_item.as_str(),
            ))
            .append(bool_field(
                "pubsub#presence_based_delivery",
                self.presence_based_delivery,
            ))
            .append(list_field("pubsub#collection", &self.collection))
            .append(text_field(
                "pubsub#type",
                self.payload_type.as_deref().unwrap_or(""),
            ))
            .append(text_field("pubsub#title", &self.title))
            .append(text_field(
                "pubsub#body_xslt",
                self.body_xslt.as_deref().unwrap_or(""),
            ));

        form.build()
    }
}

/// Per-subscription delivery options (`pubsub#subscribe_options`).
#[derive(Debug, Clone, PartialEq)]
pub struct SubOptions {
    /// Master delivery switch.
    pub deliver: bool,
    /// Accepted for protocol compatibility; digests are not assembled.
    pub digest: bool,
    pub subscription_depth: Depth,
    pub subscription_type: SubscriptionType,
    /// Presence show states to deliver under; empty means any.
    pub show_values: Vec<ShowValue>,
    /// Subscription expiry; `None` means never.
    pub expire: Option<DateTime<Utc>>,
}

impl Default for SubOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            digest: false,
            subscription_depth: Depth::All,
            subscription_type: SubscriptionType::Items,
            show_values: Vec::new(),
            expire: None,
        }
    }
}

impl SubOptions {
    /// Whether the subscription has lapsed at `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expire, Some(expire) if expire <= now)
    }

    /// Whether a resource with the given show state passes the presence
    /// filter.
    pub fn accepts_show(&self, show: ShowValue) -> bool {
        self.show_values.is_empty() || self.show_values.contains(&show)
    }

    /// Apply a submitted `pubsub#subscribe_options` form.
    pub fn apply_form(&mut self, form: &Element) -> Result<(), StanzaError> {
        for (var, values) in form_fields(form) {
            let first = values.first().map(String::as_str).unwrap_or("");
            match var.as_str() {
                "pubsub#deliver" => self.deliver = parse_bool(first)?,
                "pubsub#digest" => self.digest = parse_bool(first)?,
                "pubsub#subscription_depth" => {
                    self.subscription_depth =
                        Depth::parse(first).ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#subscription_type" => {
                    self.subscription_type =
                        SubscriptionType::parse(first).ok_or_else(StanzaError::not_acceptable)?
                }
                "pubsub#show-values" => {
                    let mut shows = Vec::new();
                    for value in &values {
                        shows.push(
                            ShowValue::parse(value).ok_or_else(StanzaError::not_acceptable)?,
                        );
                    }
                    self.show_values = shows;
                }
                "pubsub#expire" => {
                    if first.is_empty() || first == "presence" {
                        self.expire = None;
                    } else {
                        let parsed = DateTime::parse_from_rfc3339(first)
                            .map_err(|_| StanzaError::not_acceptable())?;
                        self.expire = Some(parsed.with_timezone(&Utc));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Render as a `pubsub#subscribe_options` form.
    pub fn to_form(&self) -> Element {
        let shows: Vec<String> = self
            .show_values
            .iter()
            .map(|show| show.as_str().to_string())
            .collect();
        let mut form = Element::builder("x", ns::DATA_FORMS)
            .attr("type", "form")
            .append(hidden_field("FORM_TYPE", ns::PUBSUB_SUB_OPTIONS))
            .append(bool_field("pubsub#deliver", self.deliver))
            .append(bool_field("pubsub#digest", self.digest))
            .append(text_field(
                "pubsub#subscription_depth",
                &self.subscription_depth.to_string(),
            ))
            .append(text_field(
                "pubsub#subscription_type",
                self.subscription_type.as_str(),
            ))
            .append(list_field("pubsub#show-values", &shows));
        if let Some(expire) = self.expire {
            form = form.append(text_field("pubsub#expire", &expire.to_rfc3339()));
        }
        form.build()
    }
}

/// Iterate `<field var=...><value>...</value></field>` children of a data
/// form.
pub(crate) fn form_fields(form: &Element) -> Vec<(String, Vec<String>)> {
    form.children()
        .filter(|child| child.name() == "field" && child.ns() == ns::DATA_FORMS)
        .filter_map(|field| {
            let var = field.attr("var")?.to_string();
            let values = field
                .children()
                .filter(|child| child.name() == "value")
                .map(|value| value.text())
                .collect();
            Some((var, values))
        })
        .collect()
}

/// Form boolean: `1`/`true` and `0`/`false`.
pub(crate) fn parse_bool(s: &str) -> Result<bool, StanzaError> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(StanzaError::not_acceptable()),
    }
}

pub(crate) fn hidden_field(var: &str, value: &str) -> Element {
    Element::builder("field", ns::DATA_FORMS)
        .attr("var", var)
        .attr("type", "hidden")
        .append(
            Element::builder("value", ns::DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

pub(crate) fn text_field(var: &str, value: &str) -> Element {
    Element::builder("field", ns::DATA_FORMS)
        .attr("var", var)
        .append(
            Element::builder("value", ns::DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

pub(crate) fn bool_field(var: &str, value: bool) -> Element {
    text_field(var, if value { "1" } else { "0" })
}

pub(crate) fn list_field(var: &str, values: &[String]) -> Element {
    let mut builder = Element::builder("field", ns::DATA_FORMS).attr("var", var);
    for value in values {
        builder = builder.append(
            Element::builder("value", ns::DATA_FORMS)
                .append(value.as_str())
                .build(),
        );
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted_form(fields: &[(&str, &[&str])]) -> Element {
        let mut builder = Element::builder("x", ns::DATA_FORMS).attr("type", "submit");
        for (var, values) in fields {
            let mut field = Element::builder("field", ns::DATA_FORMS).attr("var", *var);
            for value in *values {
                field = field.append(
                    Element::builder("value", ns::DATA_FORMS)
                        .append(*value)
                        .build(),
                );
            }
            builder = builder.append(field.build());
        }
        builder.build()
    }

    #[test]
    fn test_node_options_defaults() {
        let options = NodeOptions::default();
        assert!(options.persist_items);
        assert_eq!(options.max_items, 10);
        assert_eq!(options.access_model, AccessModel::Open);
        assert_eq!(options.notification_type, NotificationType::Headline);
    }

    #[test]
    fn test_apply_node_config_form() {
        let mut options = NodeOptions::default();
        let form = submitted_form(&[
            ("pubsub#persist_items", &["0"]),
            ("pubsub#max_items", &["3"]),
            ("pubsub#access_model", &["whitelist"]),
            ("pubsub#collection", &["/a", "/b"]),
            ("pubsub#title", &["Test node"]),
            ("some#unknown", &["ignored"]),
        ]);

        options.apply_form(&form).expect("valid form");
        assert!(!options.persist_items);
        assert_eq!(options.max_items, 3);
        assert_eq!(options.access_model, AccessModel::Whitelist);
        assert_eq!(options.collection, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(options.title, "Test node");
    }

    #[test]
    fn test_apply_form_rejects_bad_values() {
        let mut options = NodeOptions::default();
        let form = submitted_form(&[("pubsub#access_model", &["everyone"])]);
        assert!(options.apply_form(&form).is_err());

        let form = submitted_form(&[("pubsub#max_items", &["lots"])]);
        assert!(options.apply_form(&form).is_err());
    }

    #[test]
    fn test_node_config_form_round_trip() {
        let options = NodeOptions {
            max_items: 7,
            access_model: AccessModel::Presence,
            notify_delete: true,
            ..Default::default()
        };
        let form = options.to_form();

        let mut restored = NodeOptions::default();
        restored.apply_form(&form).expect("own form is valid");
        assert_eq!(restored.max_items, 7);
        assert_eq!(restored.access_model, AccessModel::Presence);
        assert!(restored.notify_delete);
    }

    #[test]
    fn test_sub_options_show_filter() {
        let mut options = SubOptions::default();
        assert!(options.accepts_show(ShowValue::Dnd));

        options.show_values = vec![ShowValue::Online, ShowValue::Chat];
        assert!(options.accepts_show(ShowValue::Online));
        assert!(!options.accepts_show(ShowValue::Away));
    }

    #[test]
    fn test_sub_options_expiry() {
        let mut options = SubOptions::default();
        assert!(!options.expired_at(Utc::now()));

        options.expire = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(options.expired_at(Utc::now()));
    }

    #[test]
    fn test_sub_options_form() {
        let mut options = SubOptions::default();
        let form = submitted_form(&[
            ("pubsub#deliver", &["0"]),
            ("pubsub#subscription_depth", &["0"]),
            ("pubsub#subscription_type", &["nodes"]),
            ("pubsub#show-values", &["online", "chat"]),
        ]);

        options.apply_form(&form).expect("valid form");
        assert!(!options.deliver);
        assert_eq!(options.subscription_depth, Depth::Levels(0));
        assert_eq!(options.subscription_type, SubscriptionType::Nodes);
        assert_eq!(options.show_values.len(), 2);
    }

    #[test]
    fn test_depth_accepts() {
        assert!(Depth::All.accepts(10));
        assert!(Depth::Levels(1).accepts(0));
        assert!(Depth::Levels(1).accepts(1));
        assert!(!Depth::Levels(1).accepts(2));
        assert!(!Depth::Levels(0).accepts(1));
    }

    #[test]
    fn test_host_service_jid() {
        let host = Host::Domain("pubsub.a.example".to_string());
        assert_eq!(host.service_jid(), "pubsub.a.example");
        assert!(!host.is_pep());

        let jid: BareJid = "user@a.example".parse().expect("valid jid");
        let host = Host::User(jid);
        assert_eq!(host.service_jid(), "user@a.example");
        assert!(host.is_pep());
    }
}
