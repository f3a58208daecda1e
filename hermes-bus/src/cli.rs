use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BeaconConfig, BrokerConfig, DEFAULT_BROADCAST, DEFAULT_DISCOVERY_PORT, DEFAULT_LIVELINESS_MS,
    DEFAULT_PORT, DEFAULT_RETRIES, DEFAULT_WORKERS, NodeConfig, ServiceConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker: keep the service catalog and broadcast the discovery beacon.
    Broker(BrokerArgs),
    /// Register a service with a broker and answer requests until told to exit.
    Service(ServiceArgs),
    /// Query the broker or send a one-off command to a node.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, default_value = "Amon Din")]
    pub name: String,

    /// Address the interface socket binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// First port tried for the interface socket.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Do not broadcast the discovery beacon.
    #[arg(long)]
    pub no_beacon: bool,

    #[arg(long, default_value_t = DEFAULT_BROADCAST)]
    pub broadcast: IpAddr,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    #[arg(long, default_value_t = 1000)]
    pub beacon_interval_ms: u64,

    /// How often the liveliness roll-call walks the catalog.
    #[arg(long, default_value_t = 500)]
    pub rollcall_ms: u64,

    /// Size of the handler worker pool.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,
}

impl BrokerArgs {
    pub fn into_config(self) -> BrokerConfig {
        let mut node = NodeConfig::new(self.name).with_ip(self.ip).with_port(self.port);
        node.workers = self.workers;

        BrokerConfig {
            node,
            beacon: BeaconConfig {
                enabled: !self.no_beacon,
                broadcast: self.broadcast,
                port: self.discovery_port,
                interval: Duration::from_millis(self.beacon_interval_ms),
            },
            rollcall_interval: Duration::from_millis(self.rollcall_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    #[arg(long, default_value = "Rohan")]
    pub name: String,

    /// Broker interface address. Discovered from the beacon when omitted.
    #[arg(long)]
    pub broker: Option<SocketAddr>,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// First port tried for the service's own interface socket.
    #[arg(long, default_value_t = DEFAULT_PORT + 1)]
    pub port: u16,

    /// Heartbeat interval promised to the broker.
    #[arg(long, default_value_t = DEFAULT_LIVELINESS_MS)]
    pub liveliness_ms: u64,

    /// Missed heartbeats tolerated before the broker forgets the service.
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Topic the service offers; repeat for several.
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,
}

impl ServiceArgs {
    pub fn into_config(self) -> ServiceConfig {
        let node = NodeConfig::new(self.name).with_ip(self.ip).with_port(self.port);
        let mut config = ServiceConfig::new(node);
        config.broker = self.broker;
        config.liveliness = Duration::from_millis(self.liveliness_ms);
        config.retries = self.retries;
        config.discovery_port = self.discovery_port;
        config.topics = (!self.topics.is_empty()).then_some(self.topics);
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Broker interface address. Discovered from the beacon when omitted.
    #[arg(long, global = true)]
    pub broker: Option<SocketAddr>,

    #[arg(long, global = true, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    #[command(subcommand)]
    pub action: ClientAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientAction {
    /// Print the catalog, or one service's record.
    Info {
        #[arg(long)]
        name: Option<String>,
    },
    /// Ask a broker or service to stop.
    Exit {
        #[arg(long)]
        target: SocketAddr,
    },
}
