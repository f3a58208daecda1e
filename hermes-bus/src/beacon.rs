//! UDP discovery beacon.
//!
//! The broker broadcasts `SHALOM <port>` on the discovery port; anyone who
//! wants to find it binds that port and waits for the first datagram carrying
//! the magic token.

use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
    time::Duration,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, trace};

use crate::{
    config::BeaconConfig,
    error::{BusError, Result},
};

pub const MAGIC: &str = "SHALOM";

const MAX_DATAGRAM: usize = 512;

pub fn beacon_frame(port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{MAGIC} {port}"),
        None => MAGIC.to_string(),
    }
}

/// `None` when the datagram is not a beacon; otherwise the advertised port,
/// if the broker sent a readable one.
pub fn parse_beacon(datagram: &[u8]) -> Option<Option<u16>> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut tokens = text.split_whitespace();
    if tokens.next()? != MAGIC {
        return None;
    }
    Some(tokens.next().and_then(|port| port.parse().ok()))
}

/// One received beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub sender: SocketAddr,
    pub port: Option<u16>,
}

impl Sighting {
    /// Where the broker's interface socket should be reachable.
    pub fn broker_addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.sender.ip(), port))
    }
}

fn udp_socket(bind: SocketAddr, broadcast: bool) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SockAddr::from(bind))?;
    Ok(socket)
}

pub struct BeaconSender {
    socket: StdUdpSocket,
    target: SocketAddr,
    frame: String,
}

impl BeaconSender {
    pub fn new(config: &BeaconConfig, advertised_port: u16) -> Result<Self> {
        let socket = udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), true)?;
        let target = SocketAddr::new(config.broadcast, config.port);
        debug!(destination = %target, port = advertised_port, "beacon ready");
        Ok(Self {
            socket: socket.into(),
            target,
            frame: beacon_frame(Some(advertised_port)),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn send(&self) -> Result<()> {
        self.socket.send_to(self.frame.as_bytes(), self.target)?;
        trace!(destination = %self.target, frame = %self.frame, "beacon sent");
        Ok(())
    }
}

/// Binds the discovery port and waits for the next beacon.
pub async fn listen(port: u16, wait: Option<Duration>) -> Result<Sighting> {
    let socket = udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), false)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket.into())?;
    debug!(port, "listening for beacons");

    let receive = receive_beacon(&socket);
    match wait {
        Some(wait) => timeout(wait, receive)
            .await
            .map_err(|_| BusError::Timeout(wait))?,
        None => receive.await,
    }
}

async fn receive_beacon(socket: &UdpSocket) -> Result<Sighting> {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, sender) = socket.recv_from(&mut buf).await?;
        match parse_beacon(&buf[..len]) {
            Some(port) => {
                debug!(%sender, ?port, "beacon received");
                return Ok(Sighting { sender, port });
            }
            None => trace!(%sender, "ignoring datagram without beacon magic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    #[test]
    fn parses_magic_with_and_without_port() {
        assert_eq!(parse_beacon(b"SHALOM 5246"), Some(Some(5246)));
        assert_eq!(parse_beacon(b"SHALOM"), Some(None));
        assert_eq!(parse_beacon(b"SHALOM nope"), Some(None));
        assert_eq!(parse_beacon(b"SHALOMX 5246"), None);
        assert_eq!(parse_beacon(b"HELLO 5246"), None);
        assert_eq!(parse_beacon(&[0xff, 0xfe]), None);
    }

    #[test]
    fn sighting_points_at_the_advertised_port() {
        let sighting = Sighting {
            sender: "10.0.0.7:40000".parse().unwrap(),
            port: Some(5246),
        };
        assert_eq!(
            sighting.broker_addr(),
            Some("10.0.0.7:5246".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn beacon_reaches_a_listener() {
        let probe = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let config = BeaconConfig {
            broadcast: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            ..BeaconConfig::default()
        };
        let sender = BeaconSender::new(&config, 6123).unwrap();
        let noise = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

        let listener = tokio::spawn(listen(port, Some(Duration::from_secs(3))));
        for _ in 0..100 {
            if listener.is_finished() {
                break;
            }
            noise.send_to(b"not a beacon", (Ipv4Addr::LOCALHOST, port)).unwrap();
            sender.send().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let sighting = listener.await.unwrap().unwrap();
        assert_eq!(sighting.port, Some(6123));
        assert_eq!(
            sighting.broker_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 6123)))
        );
    }

    #[tokio::test]
    async fn listen_times_out_without_beacons() {
        let probe = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let err = listen(port, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }
}
