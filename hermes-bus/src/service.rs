//! A node that registers with a broker and serves requests on its own
//! interface socket.

use std::{net::SocketAddr, time::Duration};

use serde_json::{Value, json};
use tokio::{
    select,
    time::{MissedTickBehavior, interval},
};
use tracing::{Instrument, debug, info, warn};

use crate::{
    beacon,
    broker::INTERFACE,
    catalog::{NOT_FOUND_PREFIX, ServiceRecord},
    clock::millis,
    command::Command,
    config::ServiceConfig,
    envelope::{Payload, Response, encode},
    error::{BusError, Result},
    reactor::{Handler, Reactor, ReactorHandle, SocketRole},
    transport::ReqSocket,
};

/// Finds the broker through the discovery beacon.
pub async fn discover_broker(port: u16, wait: Duration) -> Result<SocketAddr> {
    let sighting = beacon::listen(port, Some(wait)).await?;
    sighting.broker_addr().ok_or_else(|| {
        BusError::UnexpectedReply(format!("beacon from {} carried no port", sighting.sender))
    })
}

pub struct Service {
    config: ServiceConfig,
    reactor: Reactor,
    broker: ReqSocket,
    record: ServiceRecord,
    addr: SocketAddr,
}

impl Service {
    /// Registers with the broker and opens the interface socket.
    ///
    /// Fails with [`BusError::Denied`] when the broker refuses the
    /// registration.
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let reactor = Reactor::new(config.node.clone());
        let span = reactor.span().clone();
        Self::register_and_bind(config, reactor).instrument(span).await
    }

    async fn register_and_bind(config: ServiceConfig, mut reactor: Reactor) -> Result<Self> {
        let broker_addr = match config.broker {
            Some(addr) => addr,
            None => {
                info!(port = config.discovery_port, "waiting for broker beacon");
                discover_broker(config.discovery_port, config.discovery_timeout).await?
            }
        };

        let mut broker = ReqSocket::connect(broker_addr).await?;
        let mut record = ServiceRecord::new(config.node.ip, config.node.port);
        record.liveliness = millis(config.liveliness);
        record.retries = config.retries;
        record.topics = config.topics.clone();

        register(&mut broker, &config.node.name, &record, config.request_timeout).await?;
        info!(broker = %broker_addr, "registration approved");

        let addr = reactor.register_socket(INTERFACE, SocketRole::Bind).await?;
        if reactor.port_drifted() {
            info!(
                registered = record.port,
                bound = addr.port(),
                "interface port moved, updating broker"
            );
            record.port = addr.port();
            let body = json!({ "name": config.node.name, "port": record.port });
            let reply = broker
                .request(
                    &encode(Command::Update, vec![Payload::Json(body)], None)?,
                    config.request_timeout,
                )
                .await?;
            expect(Response::parse(&reply)?, Command::Acknowledged)?;
        }

        Ok(Self {
            config,
            reactor,
            broker,
            record,
            addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.node.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn broker_addr(&self) -> SocketAddr {
        self.broker.peer_addr()
    }

    /// The record as the broker last accepted it.
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn add_handler<H: Handler>(&mut self, command: Command, handler: H) -> bool {
        self.reactor.add_handler(command, handler)
    }

    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Serves until `Exit`, heartbeating the broker in the background.
    pub async fn run(self) -> Result<()> {
        let Service {
            config,
            mut reactor,
            broker,
            record,
            ..
        } = self;

        let heartbeat = Heartbeat {
            broker_addr: broker.peer_addr(),
            socket: Some(broker),
            name: config.node.name.clone(),
            record,
            every: config.liveliness,
            wait: config.request_timeout,
        };
        let mut stopped = reactor.handle();
        let beating = tokio::spawn(
            async move {
                select! {
                    _ = heartbeat.run() => {}
                    _ = stopped.stopped() => debug!("heartbeat stopped with reactor"),
                }
            }
            .instrument(reactor.span().clone()),
        );

        let result = reactor.run().await;
        drop(reactor);
        if let Err(err) = beating.await {
            warn!(error = ?err, "heartbeat task failed");
        }
        result
    }
}

async fn register(
    broker: &mut ReqSocket,
    name: &str,
    record: &ServiceRecord,
    wait: Duration,
) -> Result<()> {
    let body = record.registration_body(name)?;
    let frames = encode(Command::Registration, vec![Payload::Json(body)], None)?;
    let reply = broker.request(&frames, wait).await?;
    expect(Response::parse(&reply)?, Command::Approved)
}

/// Accepts `wanted`. A `Denied` reply becomes [`BusError::NotFound`] when the
/// broker does not know the name, [`BusError::Denied`] otherwise.
fn expect(response: Response, wanted: Command) -> Result<()> {
    match response {
        Response::Envelope(envelope) if envelope.command() == wanted => Ok(()),
        Response::Envelope(envelope) if envelope.command() == Command::Denied => {
            let reason = envelope
                .json_body::<Value>()
                .ok()
                .and_then(|body| body.get("Error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "no reason given".to_string());
            match reason.strip_prefix(NOT_FOUND_PREFIX) {
                Some(name) => Err(BusError::NotFound(name.to_string())),
                None => Err(BusError::Denied(reason)),
            }
        }
        Response::Envelope(envelope) => Err(BusError::UnexpectedReply(format!(
            "expected {wanted}, got {}",
            envelope.command()
        ))),
        Response::Notice(text) => Err(BusError::UnexpectedReply(text)),
    }
}

struct Heartbeat {
    broker_addr: SocketAddr,
    socket: Option<ReqSocket>,
    name: String,
    record: ServiceRecord,
    every: Duration,
    wait: Duration,
}

impl Heartbeat {
    async fn run(mut self) {
        if self.every.is_zero() {
            return std::future::pending().await;
        }

        let mut ticks = interval(self.every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;

        loop {
            ticks.tick().await;
            if let Err(err) = self.beat().await {
                warn!(broker = %self.broker_addr, error = %err, "heartbeat failed");
            }
        }
    }

    /// A failed beat drops the connection; the next one dials again.
    async fn beat(&mut self) -> Result<()> {
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let socket = ReqSocket::connect(self.broker_addr).await?;
                debug!(broker = %self.broker_addr, "reconnected to broker");
                socket
            }
        };

        let frames = encode(
            Command::Heartbeat,
            vec![Payload::from(self.name.as_str())],
            None,
        )?;
        let reply = socket.request(&frames, self.wait).await?;
        match expect(Response::parse(&reply)?, Command::Acknowledged) {
            Ok(()) => {}
            Err(BusError::NotFound(_)) => {
                warn!("broker forgot this service, registering again");
                register(&mut socket, &self.name, &self.record, self.wait).await?;
            }
            Err(err) => return Err(err),
        }

        self.socket = Some(socket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn denied(reason: &str) -> Response {
        let frames = encode(
            Command::Denied,
            vec![Payload::Json(json!({ "Error": reason }))],
            None,
        )
        .unwrap();
        Response::parse(&frames).unwrap()
    }

    #[test]
    fn unknown_name_is_not_found() {
        let missing = BusError::NotFound("Rohan".to_string()).to_string();
        let err = expect(denied(&missing), Command::Acknowledged).unwrap_err();
        assert!(matches!(err, BusError::NotFound(name) if name == "Rohan"));
    }

    #[test]
    fn policy_refusal_stays_denied() {
        let err = expect(denied("the broker is closed"), Command::Approved).unwrap_err();
        assert!(matches!(err, BusError::Denied(reason) if reason == "the broker is closed"));
    }

    #[test]
    fn wanted_command_is_accepted() {
        let frames = encode(Command::Acknowledged, Vec::new(), None).unwrap();
        let response = Response::parse(&frames).unwrap();
        assert!(expect(response, Command::Acknowledged).is_ok());
    }
}
