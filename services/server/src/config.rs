//! Server configuration.
//!
//! Built with defaults in code (tests) or loaded from `OUTPOST_*` environment
//! variables by the binary.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use outpost_id::NodeId;

use crate::ServerError;

/// Timing and fan-out knobs for the membership protocol.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Time between probe rounds.
    pub probe_interval: Duration,
    /// Wait for a direct ack before asking other peers to probe.
    pub probe_timeout: Duration,
    /// Peers asked to probe indirectly.
    pub indirect_probes: usize,
    /// Suspect nodes not refuted within this window are declared dead.
    pub suspect_timeout: Duration,
    /// Anti-entropy push-pull period.
    pub sync_interval: Duration,
    /// Dead/left nodes and tombstones are forgotten after this long.
    pub reap_after: Duration,
    /// Deadline for each seed push-pull during join.
    pub join_timeout: Duration,
    /// Upper bound for the background join retry backoff.
    pub join_retry_max: Duration,
    /// Deltas piggybacked on a single gossip message.
    pub max_piggyback: usize,
    /// Times each delta is sent to each peer before it leaves the outbox.
    pub retransmits: u32,
    /// Keepalive ping period on peer links.
    pub link_keepalive: Duration,
    /// A peer link silent this long is closed and redialed on next use.
    pub link_keepalive_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(200),
            indirect_probes: 3,
            suspect_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(15),
            reap_after: Duration::from_secs(60),
            join_timeout: Duration::from_secs(2),
            join_retry_max: Duration::from_secs(30),
            max_piggyback: 16,
            retransmits: 2,
            link_keepalive: Duration::from_secs(5),
            link_keepalive_timeout: Duration::from_secs(15),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Fixed node id; generated at startup when absent.
    pub node_id: Option<NodeId>,

    /// Where upstream agents dial in.
    pub upstream_addr: SocketAddr,

    /// Where proxy clients connect.
    pub proxy_addr: SocketAddr,

    /// UDP gossip and TCP peer links.
    pub cluster_addr: SocketAddr,

    /// Cluster address announced to peers. Defaults to the bound cluster address.
    pub advertise_addr: Option<SocketAddr>,

    /// `host:port` entries; a host may resolve to many addresses.
    pub seeds: Vec<String>,

    pub handshake_timeout: Duration,

    /// Deadline for forward setup: dial, open and owner response.
    pub forward_timeout: Duration,

    /// How long `shutdown` waits for in-flight requests before closing
    /// the relays still open.
    pub shutdown_grace: Duration,

    /// A relay with no bytes in either direction for this long is closed.
    /// `None` keeps quiet relays open until shutdown.
    pub relay_idle_timeout: Option<Duration>,

    pub max_upstream_connections: usize,
    pub max_proxy_connections: usize,

    /// Keepalive on upstream sessions. `None` disables it.
    pub upstream_keepalive: Option<Duration>,
    pub upstream_keepalive_timeout: Duration,

    pub cluster: ClusterConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let loopback = |port| SocketAddr::from(([127, 0, 0, 1], port));
        Self {
            node_id: None,
            upstream_addr: loopback(7000),
            proxy_addr: loopback(7001),
            cluster_addr: loopback(7946),
            advertise_addr: None,
            seeds: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            relay_idle_timeout: Some(Duration::from_secs(300)),
            max_upstream_connections: 10_000,
            max_proxy_connections: 10_000,
            upstream_keepalive: Some(Duration::from_secs(15)),
            upstream_keepalive_timeout: Duration::from_secs(45),
            cluster: ClusterConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Every listener on an ephemeral loopback port. Used by tests.
    pub fn ephemeral() -> Self {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            upstream_addr: any,
            proxy_addr: any,
            cluster_addr: any,
            ..Self::default()
        }
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = String>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let node_id = std::env::var("OUTPOST_NODE_ID")
            .ok()
            .map(|v| v.parse::<NodeId>())
            .transpose()
            .context("OUTPOST_NODE_ID must look like node_<ulid>.")?;

        let upstream_addr = env_addr("OUTPOST_UPSTREAM_ADDR")?.unwrap_or(defaults.upstream_addr);
        let proxy_addr = env_addr("OUTPOST_PROXY_ADDR")?.unwrap_or(defaults.proxy_addr);
        let cluster_addr = env_addr("OUTPOST_CLUSTER_ADDR")?.unwrap_or(defaults.cluster_addr);
        let advertise_addr = env_addr("OUTPOST_ADVERTISE_ADDR")?;

        let seeds = std::env::var("OUTPOST_SEEDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let handshake_timeout =
            env_millis("OUTPOST_HANDSHAKE_TIMEOUT_MS")?.unwrap_or(defaults.handshake_timeout);
        let forward_timeout =
            env_millis("OUTPOST_FORWARD_TIMEOUT_MS")?.unwrap_or(defaults.forward_timeout);
        let shutdown_grace =
            env_millis("OUTPOST_SHUTDOWN_GRACE_MS")?.unwrap_or(defaults.shutdown_grace);

        let relay_idle_timeout = match env_millis("OUTPOST_RELAY_IDLE_TIMEOUT_MS")? {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => defaults.relay_idle_timeout,
        };

        let max_upstream_connections = env_parse("OUTPOST_MAX_UPSTREAM_CONNECTIONS")?
            .unwrap_or(defaults.max_upstream_connections);
        let max_proxy_connections = env_parse("OUTPOST_MAX_PROXY_CONNECTIONS")?
            .unwrap_or(defaults.max_proxy_connections);

        let upstream_keepalive = match env_millis("OUTPOST_UPSTREAM_KEEPALIVE_MS")? {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => defaults.upstream_keepalive,
        };
        let upstream_keepalive_timeout = env_millis("OUTPOST_UPSTREAM_KEEPALIVE_TIMEOUT_MS")?
            .unwrap_or(defaults.upstream_keepalive_timeout);

        let d = ClusterConfig::default();
        let cluster = ClusterConfig {
            probe_interval: env_millis("OUTPOST_PROBE_INTERVAL_MS")?.unwrap_or(d.probe_interval),
            probe_timeout: env_millis("OUTPOST_PROBE_TIMEOUT_MS")?.unwrap_or(d.probe_timeout),
            indirect_probes: env_parse("OUTPOST_INDIRECT_PROBES")?.unwrap_or(d.indirect_probes),
            suspect_timeout: env_millis("OUTPOST_SUSPECT_TIMEOUT_MS")?
                .unwrap_or(d.suspect_timeout),
            sync_interval: env_millis("OUTPOST_SYNC_INTERVAL_MS")?.unwrap_or(d.sync_interval),
            reap_after: env_millis("OUTPOST_REAP_AFTER_MS")?.unwrap_or(d.reap_after),
            join_timeout: env_millis("OUTPOST_JOIN_TIMEOUT_MS")?.unwrap_or(d.join_timeout),
            join_retry_max: env_millis("OUTPOST_JOIN_RETRY_MAX_MS")?.unwrap_or(d.join_retry_max),
            max_piggyback: env_parse("OUTPOST_MAX_PIGGYBACK")?.unwrap_or(d.max_piggyback),
            retransmits: env_parse("OUTPOST_RETRANSMITS")?.unwrap_or(d.retransmits),
            link_keepalive: env_millis("OUTPOST_LINK_KEEPALIVE_MS")?.unwrap_or(d.link_keepalive),
            link_keepalive_timeout: env_millis("OUTPOST_LINK_KEEPALIVE_TIMEOUT_MS")?
                .unwrap_or(d.link_keepalive_timeout),
        };

        let log_level =
            std::env::var("OUTPOST_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        Ok(Self {
            node_id,
            upstream_addr,
            proxy_addr,
            cluster_addr,
            advertise_addr,
            seeds,
            handshake_timeout,
            forward_timeout,
            shutdown_grace,
            relay_idle_timeout,
            max_upstream_connections,
            max_proxy_connections,
            upstream_keepalive,
            upstream_keepalive_timeout,
            cluster,
            log_level,
        })
    }

    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ServerError> {
        let c = &self.cluster;
        let nonzero = [
            ("handshake_timeout", self.handshake_timeout),
            ("forward_timeout", self.forward_timeout),
            ("probe_interval", c.probe_interval),
            ("probe_timeout", c.probe_timeout),
            ("suspect_timeout", c.suspect_timeout),
            ("sync_interval", c.sync_interval),
            ("join_timeout", c.join_timeout),
            ("link_keepalive", c.link_keepalive),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(ServerError::Config(format!("{name} must be greater than zero")));
            }
        }

        if c.probe_timeout >= c.probe_interval {
            return Err(ServerError::Config(format!(
                "probe_timeout ({:?}) must be shorter than probe_interval ({:?})",
                c.probe_timeout, c.probe_interval
            )));
        }
        if c.reap_after < c.suspect_timeout {
            return Err(ServerError::Config(
                "reap_after must not be shorter than suspect_timeout".to_string(),
            ));
        }
        if c.max_piggyback == 0 || c.retransmits == 0 {
            return Err(ServerError::Config(
                "max_piggyback and retransmits must be at least 1".to_string(),
            ));
        }
        if self.max_upstream_connections == 0 || self.max_proxy_connections == 0 {
            return Err(ServerError::Config(
                "connection limits must be at least 1".to_string(),
            ));
        }
        if let Some(keepalive) = self.upstream_keepalive {
            if keepalive >= self.upstream_keepalive_timeout {
                return Err(ServerError::Config(
                    "upstream keepalive interval must be shorter than its timeout".to_string(),
                ));
            }
        }
        if c.link_keepalive >= c.link_keepalive_timeout {
            return Err(ServerError::Config(
                "link_keepalive must be shorter than link_keepalive_timeout".to_string(),
            ));
        }
        if self.relay_idle_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ServerError::Config(
                "relay_idle_timeout must be greater than zero; use None to disable".to_string(),
            ));
        }
        if let Some(addr) = self.advertise_addr {
            if addr.ip().is_unspecified() || addr.port() == 0 {
                return Err(ServerError::Config(format!(
                    "advertise address {addr} is not dialable"
                )));
            }
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} has an invalid value."))
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)
        .with_context(|| format!("{key} must be an integer (milliseconds)."))?
        .map(Duration::from_millis))
}

fn env_addr(key: &str) -> Result<Option<SocketAddr>> {
    env_parse::<SocketAddr>(key).with_context(|| format!("{key} must be an ip:port address."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ServerConfig::default().validate().unwrap();
        ServerConfig::ephemeral().validate().unwrap();
    }

    #[test]
    fn test_probe_timeout_must_fit_interval() {
        let mut config = ServerConfig::default();
        config.cluster.probe_timeout = config.cluster.probe_interval;
        let err = config.validate().unwrap_err();
        assert_eq!(err.reason_code(), "invalid_config");
    }

    #[test]
    fn test_zero_forward_timeout_rejected() {
        let config = ServerConfig {
            forward_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relays_bounded_by_default() {
        assert_eq!(
            ServerConfig::default().relay_idle_timeout,
            Some(Duration::from_secs(300))
        );
        let config = ServerConfig {
            relay_idle_timeout: Some(Duration::ZERO),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_link_keepalive_must_fit_timeout() {
        let mut config = ServerConfig::default();
        config.cluster.link_keepalive = config.cluster.link_keepalive_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unspecified_advertise_rejected() {
        let config = ServerConfig {
            advertise_addr: Some("0.0.0.0:7946".parse().unwrap()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
