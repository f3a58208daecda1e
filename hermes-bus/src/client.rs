use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use serde_json::Value;
use tracing::debug;

use crate::{
    catalog::ServiceRecord,
    command::Command,
    envelope::{Frame, Payload, Response, encode},
    error::{BusError, Result},
    service::discover_broker,
    transport::ReqSocket,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// A short-lived peer that asks the broker about services and talks to them
/// directly.
pub struct Client {
    broker_addr: SocketAddr,
    /// Dropped after any failed exchange; the next request dials again.
    broker: Option<ReqSocket>,
    wait: Duration,
}

impl Client {
    pub async fn connect(broker_addr: SocketAddr) -> Result<Self> {
        let broker = ReqSocket::connect(broker_addr).await?;
        debug!(broker = %broker_addr, "connected to broker");
        Ok(Self {
            broker_addr,
            broker: Some(broker),
            wait: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Connects to whichever broker's beacon is heard first.
    pub async fn discover(discovery_port: u16, wait: Duration) -> Result<Self> {
        let broker = discover_broker(discovery_port, wait).await?;
        Self::connect(broker).await
    }

    pub fn with_timeout(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn broker_addr(&self) -> SocketAddr {
        self.broker_addr
    }

    /// One exchange with the broker. A timed out or broken socket would hand
    /// its late reply to the next request, so it is never reused.
    async fn ask_broker(&mut self, frames: &[Frame]) -> Result<Vec<Frame>> {
        let mut socket = match self.broker.take() {
            Some(socket) => socket,
            None => {
                let socket = ReqSocket::connect(self.broker_addr).await?;
                debug!(broker = %self.broker_addr, "reconnected to broker");
                socket
            }
        };
        let reply = socket.request(frames, self.wait).await?;
        self.broker = Some(socket);
        Ok(reply)
    }

    /// Every registered service, or just `name`.
    pub async fn services(&mut self, name: Option<&str>) -> Result<BTreeMap<String, ServiceRecord>> {
        let name = name.unwrap_or_default();
        let frames = encode(Command::InfoReq, vec![Payload::from(name)], None)?;
        let reply = self.ask_broker(&frames).await?;

        let envelope = match Response::parse(&reply)? {
            Response::Envelope(envelope) if envelope.command() == Command::InfoRep => envelope,
            Response::Envelope(envelope) => {
                return Err(BusError::UnexpectedReply(envelope.command().to_string()));
            }
            Response::Notice(text) => return Err(BusError::UnexpectedReply(text)),
        };

        let body: Value = envelope.json_body()?;
        if let Some(error) = body.get("Error").and_then(Value::as_str) {
            debug!(%error, "broker reported lookup failure");
            return Err(BusError::NotFound(name.to_string()));
        }
        Ok(serde_json::from_value(body)?)
    }

    /// One request/reply exchange with the node at `addr`.
    pub async fn request(
        addr: SocketAddr,
        command: Command,
        body: Vec<Payload>,
        wait: Duration,
    ) -> Result<Response> {
        let mut socket = ReqSocket::connect(addr).await?;
        let reply = socket.request(&encode(command, body, None)?, wait).await?;
        Response::parse(&reply)
    }

    /// Asks the node at `addr` to stop; returns its farewell.
    pub async fn exit(addr: SocketAddr, wait: Duration) -> Result<String> {
        match Self::request(addr, Command::Exit, Vec::new(), wait).await? {
            Response::Notice(text) => Ok(text),
            Response::Envelope(envelope) => Err(BusError::UnexpectedReply(
                envelope.command().to_string(),
            )),
        }
    }
}
