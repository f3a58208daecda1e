use std::{net::SocketAddr, sync::Arc};

use tracing::{info, info_span, warn};

use crate::{
    beacon::BeaconSender,
    catalog::{ApprovalPolicy, ApproveAll, Catalog},
    clock::{Clock, MonotonicClock},
    config::BrokerConfig,
    error::Result,
    liveliness::LivelinessMonitor,
    reactor::{Reactor, ReactorHandle, SocketRole},
};

/// Name of the router socket services and clients talk to.
pub const INTERFACE: &str = "interface";

/// A reactor wired up with the catalog, the liveliness roll-call and the
/// discovery beacon.
pub struct Broker {
    reactor: Reactor,
    catalog: Arc<Catalog>,
    addr: SocketAddr,
}

impl Broker {
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        Self::bind_with(config, Arc::new(MonotonicClock::new()), ApproveAll).await
    }

    pub async fn bind_with<P: ApprovalPolicy>(
        config: BrokerConfig,
        clock: Arc<dyn Clock>,
        policy: P,
    ) -> Result<Self> {
        let mut reactor = Reactor::new(config.node.clone());
        let addr = reactor.register_socket(INTERFACE, SocketRole::Bind).await?;

        let catalog = Arc::new(
            Catalog::new(clock)
                .with_policy(policy)
                .with_span(info_span!(parent: reactor.span(), "catalog")),
        );
        catalog.install(&mut reactor);

        let monitor = LivelinessMonitor::new(Arc::clone(&catalog))
            .with_span(info_span!(parent: reactor.span(), "liveliness"));
        reactor.add_timer("rollcall", config.rollcall_interval, move || {
            monitor.tick();
        });

        if config.beacon.enabled {
            let sender = BeaconSender::new(&config.beacon, addr.port())?;
            info!(
                parent: reactor.span(),
                destination = %sender.target(),
                "broadcasting discovery beacon"
            );
            reactor.add_timer("beacon", config.beacon.interval, move || {
                if let Err(err) = sender.send() {
                    warn!(error = %err, "failed to send beacon");
                }
            });
        }

        Ok(Self {
            reactor,
            catalog,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Serves until a peer sends `Exit`.
    pub async fn run(mut self) -> Result<()> {
        self.reactor.run().await
    }
}
