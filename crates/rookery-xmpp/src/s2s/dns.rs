//! DNS discovery for outgoing federation targets.
//!
//! Resolution follows RFC 6120 §3.2 plus the legacy fallback service:
//! 1. Query `_xmpp-server._tcp.{domain}` SRV records, then
//!    `_jabber._tcp.{domain}` when that lookup fails
//! 2. Order records by priority, weighted-random within a priority
//! 3. Without SRV records, fall back to the domain itself on the
//!    configured default port
//! 4. Expand every host to its A/AAAA addresses in the configured address
//!    family order
//!
//! Resolution never surfaces an error to the session: an unresolvable
//! domain yields an empty candidate list and the session enters retry
//! backoff. Non-ASCII domains are IDNA-encoded by hickory's name parsing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::Resolver;
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::config::{AddressFamilies, DnsConfig};

/// SRV service labels tried in order.
const SRV_SERVICES: &[&str] = &["_xmpp-server._tcp", "_jabber._tcp"];

/// Type alias for the Tokio-based resolver.
pub type TokioResolver = Resolver<TokioConnectionProvider>;

/// One SRV record result prior to address expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Target hostname, trailing dot stripped.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// SRV priority (lower is tried first).
    pub priority: u16,
    /// SRV weight (higher is preferred within a priority).
    pub weight: u16,
}

impl SrvTarget {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }

    /// Target used when no SRV records exist.
    pub fn fallback(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, 0, 0)
    }
}

/// Order SRV targets by priority ascending, weighted-random within equal
/// priorities.
///
/// Each record gets the sort key `priority * 65536 - (weight + 1) * U` with
/// `U` drawn from `[0, 1)`; zero-weight records use `priority * 65536`
/// exactly, which places them after the weighted records of their priority
/// class. Records are then sorted ascending by key.
pub fn order_targets<R: Rng + ?Sized>(mut targets: Vec<SrvTarget>, rng: &mut R) -> Vec<SrvTarget> {
    let mut keyed: Vec<(f64, SrvTarget)> = targets
        .drain(..)
        .map(|target| {
            let base = f64::from(target.priority) * 65536.0;
            let key = if target.weight == 0 {
                base
            } else {
                base - f64::from(target.weight + 1) * rng.random::<f64>()
            };
            (key, target)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    keyed.into_iter().map(|(_, target)| target).collect()
}

/// SRV resolver for outgoing federation connections.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
    families: AddressFamilies,
    default_port: u16,
}

impl SrvResolver {
    /// Create a resolver with the system DNS configuration and the given
    /// lookup tuning.
    pub fn new(dns: &DnsConfig, families: AddressFamilies, default_port: u16) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = dns.timeout;
        opts.attempts = dns.retries;

        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(opts)
        .build();

        Self {
            resolver: Arc::new(resolver),
            families,
            default_port,
        }
    }

    /// Resolve a remote domain to an ordered connect candidate list.
    ///
    /// Returns an empty list when the domain does not resolve at all.
    #[instrument(skip(self), name = "s2s.dns.resolve")]
    pub async fn resolve(&self, domain: &str) -> Vec<SocketAddr> {
        let targets = self.resolve_targets(domain).await;
        let mut candidates = Vec::new();

        for target in &targets {
            match self.lookup_host(&target.host).await {
                Ok(addrs) => {
                    for family in self.families.order() {
                        candidates.extend(
                            addrs
                                .iter()
                                .filter(|addr| family.matches(addr))
                                .map(|addr| SocketAddr::new(*addr, target.port)),
                        );
                    }
                }
                Err(message) => {
                    warn!(host = %target.host, error = %message, "address lookup failed");
                }
            }
        }

        debug!(
            domain = %domain,
            targets = targets.len(),
            candidates = candidates.len(),
            "resolved connect candidates"
        );
        candidates
    }

    /// Resolve SRV targets for a domain, falling back to the bare domain on
    /// the default port.
    pub async fn resolve_targets(&self, domain: &str) -> Vec<SrvTarget> {
        for service in SRV_SERVICES {
            let name = format!("{}.{}", service, domain);
            match self.resolver.srv_lookup(&name).await {
                Ok(response) => {
                    let records: Vec<&SRV> = response.iter().collect();
                    let targets = collect_srv_targets(&records);
                    if !targets.is_empty() {
                        return order_targets(targets, &mut rand::rng());
                    }
                    debug!(service = %name, "SRV lookup returned no usable targets");
                }
                Err(error) => {
                    debug!(service = %name, error = %error, "SRV lookup failed");
                }
            }
        }

        vec![SrvTarget::fallback(domain, self.default_port)]
    }

    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(vec![literal]);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(response) => {
                let addrs: Vec<IpAddr> = response.iter().collect();
                if addrs.is_empty() {
                    Err(format!("no addresses for {}", host))
                } else {
                    Ok(addrs)
                }
            }
            Err(error) => Err(error.to_string()),
        }
    }
}

fn collect_srv_targets(records: &[&SRV]) -> Vec<SrvTarget> {
    records
        .iter()
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            // A root target means "service not available here".
            if target == "." || target.is_empty() {
                return None;
            }
            Some(SrvTarget::new(
                target.trim_end_matches('.'),
                srv.port(),
                srv.priority(),
                srv.weight(),
            ))
        })
        .collect()
}
