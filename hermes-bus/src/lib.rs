//! A small broker-mediated message bus.
//!
//! Services register with a broker, clients ask the broker where services
//! live, and everybody keeps everybody else honest with heartbeats. Each
//! module focuses on a concrete responsibility:
//!
//! - [`envelope`] and [`command`] define the multi-frame wire envelope and its
//!   closed set of command tags.
//! - [`transport`] carries those frames over TCP with router (many peers,
//!   identity-routed) and request (one peer) sockets.
//! - [`reactor`] polls every socket of a node, decodes each message once and
//!   hands it to a handler on a bounded worker pool.
//! - [`catalog`] and [`liveliness`] are the broker's record of registered
//!   services and the roll-call that evicts silent ones.
//! - [`beacon`] broadcasts and listens for the UDP discovery beacon.
//! - [`broker`], [`service`] and [`client`] assemble the pieces into the three
//!   node roles; [`cli`] and [`config`] describe how they are started.
//!
//! Integration tests under `tests/` run brokers, services and clients on
//! loopback against each other.

pub mod beacon;
pub mod broker;
pub mod catalog;
pub mod cli;
pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod liveliness;
pub mod reactor;
pub mod service;
pub mod transport;

pub use error::{BusError, Result};
