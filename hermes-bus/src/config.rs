//! Runtime settings for the three node roles.
//!
//! These are plain structs; the binary fills them from command-line flags.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 5246;
pub const DEFAULT_DISCOVERY_PORT: u16 = 5245;
pub const DEFAULT_WORKERS: usize = 100;
pub const DEFAULT_LIVELINESS_MS: u64 = 1000;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_BROADCAST: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// Settings shared by every node that owns a reactor.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    /// Address to bind acceptors on; also the default remote for
    /// connect-out sockets registered without an explicit address.
    pub ip: IpAddr,
    /// First candidate port for bind-in sockets.
    pub port: u16,
    /// Capacity of the handler worker pool.
    pub workers: usize,
    /// Upper bound on one poll wait. `None` waits until a message or timer.
    pub poll_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            poll_timeout: Some(Duration::from_secs(1)),
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub enabled: bool,
    pub broadcast: IpAddr,
    pub port: u16,
    pub interval: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broadcast: DEFAULT_BROADCAST,
            port: DEFAULT_DISCOVERY_PORT,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node: NodeConfig,
    pub beacon: BeaconConfig,
    /// How often the liveliness roll-call walks the catalog.
    pub rollcall_interval: Duration,
}

impl BrokerConfig {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            beacon: BeaconConfig::default(),
            rollcall_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub node: NodeConfig,
    /// Broker interface address; discovered through the beacon when unset.
    pub broker: Option<SocketAddr>,
    pub discovery_port: u16,
    pub discovery_timeout: Duration,
    /// Heartbeat interval promised to the broker.
    pub liveliness: Duration,
    pub retries: u32,
    pub topics: Option<Vec<String>>,
    /// How long to wait for the broker to answer a request.
    pub request_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            broker: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_timeout: Duration::from_secs(5),
            liveliness: Duration::from_millis(DEFAULT_LIVELINESS_MS),
            retries: DEFAULT_RETRIES,
            topics: None,
            request_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_broker(mut self, broker: SocketAddr) -> Self {
        self.broker = Some(broker);
        self
    }
}
