//! Process-wide configuration for the federation layer.
//!
//! Configuration loading (files, environment) is the embedder's concern;
//! these structs only define the knobs, their serde shapes and the defaults
//! the rest of the crate relies on.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// STARTTLS policy for outgoing server-to-server streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTlsPolicy {
    /// Never negotiate TLS; force pre-1.0 dialback when the peer insists.
    Disabled,
    /// Negotiate TLS when the peer offers it.
    #[default]
    Optional,
    /// Refuse to authenticate over plaintext streams.
    Required,
}

impl StartTlsPolicy {
    /// Whether TLS negotiation is allowed at all.
    pub fn allows_tls(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Address family preference for outgoing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamilies {
    /// Try IPv4 addresses before IPv6 (the default).
    #[default]
    Ipv4First,
    /// Try IPv6 addresses before IPv4.
    Ipv6First,
    /// IPv4 only.
    Ipv4Only,
    /// IPv6 only.
    Ipv6Only,
}

impl AddressFamilies {
    /// Order the families to attempt; one entry means the other is skipped.
    pub fn order(&self) -> &'static [Family] {
        match self {
            Self::Ipv4First => &[Family::V4, Family::V6],
            Self::Ipv6First => &[Family::V6, Family::V4],
            Self::Ipv4Only => &[Family::V4],
            Self::Ipv6Only => &[Family::V6],
        }
    }
}

/// A single address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Whether the given address belongs to this family.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// DNS lookup tuning for S2S target discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Per-lookup timeout.
    #[serde(with = "secs", default = "defaults::dns_timeout")]
    pub timeout: Duration,
    /// Lookup attempts before giving up.
    #[serde(default = "defaults::dns_retries")]
    pub retries: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout: defaults::dns_timeout(),
            retries: defaults::dns_retries(),
        }
    }
}

/// Configuration for the outgoing S2S subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S2sConfig {
    /// STARTTLS policy (`s2s_use_starttls`).
    pub use_starttls: StartTlsPolicy,

    /// Certificate + key PEM file presented on TLS streams (`s2s_certfile`).
    pub certfile: Option<PathBuf>,

    /// Per-domain certificate overrides (`domain_certfile`).
    pub domain_certfiles: HashMap<String, PathBuf>,

    /// Local address outgoing sockets bind to
    /// (`outgoing_s2s_local_address`).
    pub local_address: Option<IpAddr>,

    /// Port used when SRV discovery yields nothing (`outgoing_s2s_port`).
    pub default_port: u16,

    /// Address family preference (`outgoing_s2s_options`).
    pub address_families: AddressFamilies,

    /// TCP connect timeout per candidate (`outgoing_s2s_timeout`).
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// DNS lookup tuning (`s2s_dns_options`).
    pub dns: DnsConfig,

    /// Ceiling for the exponential retry backoff (`s2s_max_retry_delay`).
    #[serde(with = "secs")]
    pub max_retry_delay: Duration,

    /// Cap on a session's mailbox and pending queue (`max_fsm_queue`).
    pub max_fsm_queue: usize,

    /// Bound on a single socket send.
    #[serde(with = "secs")]
    pub send_timeout: Duration,

    /// Base negotiation-state deadline; `wait_for_validation` uses six times
    /// this value.
    #[serde(with = "secs")]
    pub state_timeout: Duration,

    /// Idle watchdog for established streams, rearmed on every send.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,

    /// Skip TLS certificate verification (interop/testing escape hatch).
    pub insecure_skip_verify: bool,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            use_starttls: StartTlsPolicy::default(),
            certfile: None,
            domain_certfiles: HashMap::new(),
            local_address: None,
            default_port: 5269,
            address_families: AddressFamilies::default(),
            connect_timeout: Duration::from_secs(10),
            dns: DnsConfig::default(),
            max_retry_delay: Duration::from_secs(300),
            max_fsm_queue: 10_000,
            send_timeout: Duration::from_secs(15),
            state_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            insecure_skip_verify: false,
        }
    }
}

impl S2sConfig {
    /// Certificate file for the given local domain, honoring per-domain
    /// overrides.
    pub fn certfile_for(&self, domain: &str) -> Option<&PathBuf> {
        self.domain_certfiles
            .get(domain)
            .or(self.certfile.as_ref())
    }
}

/// Who may create nodes on a PubSub service host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCreatePolicy {
    /// Anyone, including remote entities.
    #[default]
    All,
    /// Only entities on one of the served local domains.
    Local,
    /// Nobody (nodes are provisioned administratively).
    Closed,
}

/// Configuration for the PubSub service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Node creation policy (`access_createnode`).
    pub access_createnode: NodeCreatePolicy,

    /// Suppress presence-triggered PEP deliveries for offline publishers
    /// (`ignore_pep_from_offline`).
    pub ignore_pep_from_offline: bool,

    /// Keep an in-RAM copy of each node's newest item (`last_item_cache`).
    pub last_item_cache: bool,

    /// Default retention bound for nodes that do not configure `max_items`
    /// (`max_items_node`).
    pub max_items_node: usize,

    /// Overrides mapping a PEP payload namespace to a node type
    /// (`pep_mapping`).
    pub pep_mapping: HashMap<String, String>,

    /// Enabled node plugins, in registration order (`plugins`).
    pub plugins: Vec<String>,

    /// Node tree backend name (`nodetree`).
    pub nodetree: String,

    /// Default payload size bound in bytes (`max_payload_size`).
    pub max_payload_size: usize,

    /// Also emit the historical misspelled `subsription` attribute on
    /// subscription-change notifications for peers that still match on it.
    pub compat_subsription_attr: bool,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            access_createnode: NodeCreatePolicy::default(),
            ignore_pep_from_offline: true,
            last_item_cache: false,
            max_items_node: 10,
            pep_mapping: HashMap::new(),
            plugins: vec![
                "flat".to_string(),
                "hometree".to_string(),
                "pep".to_string(),
            ],
            nodetree: "tree".to_string(),
            max_payload_size: 60_000,
            compat_subsription_attr: false,
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn dns_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn dns_retries() -> usize {
        2
    }
}

/// Serde helper: durations expressed as whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
