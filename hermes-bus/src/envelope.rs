//! The multi-frame envelope exchanged between peers.
//!
//! Router sockets see `[return_address][empty][command][body...]`, request
//! sockets see `[command][body...]`. Frame order is part of the wire contract.

use std::fmt::Write as _;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    command::Command,
    error::{BusError, Result},
};

pub type Frame = Bytes;

/// A single body value before it is turned into a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn into_frame(self) -> Result<Frame> {
        Ok(match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => Bytes::from(text),
            Payload::Json(value) => Bytes::from(serde_json::to_vec(&value)?),
        })
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Builds the frames for one message.
///
/// A `return_address` means the frames leave through a router socket and get
/// the identity prefix plus the empty delimiter.
pub fn encode(
    command: Command,
    body: Vec<Payload>,
    return_address: Option<&Bytes>,
) -> Result<Vec<Frame>> {
    let mut frames = Vec::with_capacity(body.len() + 3);
    if let Some(address) = return_address {
        frames.push(address.clone());
        frames.push(Bytes::new());
    }
    frames.push(Bytes::from_static(command.tag()));
    for value in body {
        frames.push(value.into_frame()?);
    }
    Ok(frames)
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    return_address: Option<Bytes>,
    command: Command,
    body: Vec<Frame>,
}

impl Envelope {
    pub fn decode(frames: &[Frame], has_identity_prefix: bool) -> Result<Self> {
        let mut frames = frames.iter();

        let return_address = if has_identity_prefix {
            let address = frames
                .next()
                .ok_or(BusError::InvalidEnvelope("missing return address"))?;
            match frames.next() {
                Some(delimiter) if delimiter.is_empty() => {}
                Some(_) => return Err(BusError::InvalidEnvelope("non-empty delimiter frame")),
                None => return Err(BusError::InvalidEnvelope("missing delimiter frame")),
            }
            Some(address.clone())
        } else {
            None
        };

        let tag = frames
            .next()
            .ok_or(BusError::InvalidEnvelope("missing command frame"))?;
        let command = Command::try_from(tag.as_ref())?;

        Ok(Self {
            return_address,
            command,
            body: frames.cloned().collect(),
        })
    }

    pub fn return_address(&self) -> Option<&Bytes> {
        self.return_address.as_ref()
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn body(&self) -> &[Frame] {
        &self.body
    }

    /// First body frame as UTF-8; an absent body reads as the empty string.
    pub fn text_body(&self) -> Result<&str> {
        match self.body.first() {
            Some(frame) => std::str::from_utf8(frame)
                .map_err(|err| BusError::InvalidBody(format!("body is not UTF-8: {err}"))),
            None => Ok(""),
        }
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        let frame = self
            .body
            .first()
            .ok_or_else(|| BusError::InvalidBody("expected a JSON body".to_string()))?;
        Ok(serde_json::from_slice(frame)?)
    }

    /// Renders every logical frame for debug logging.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let mut index = 0;
        if let Some(address) = &self.return_address {
            let _ = writeln!(out, "\tFrame {index}: {address:?}");
            let _ = writeln!(out, "\tFrame {}: b\"\"", index + 1);
            index += 2;
        }
        let _ = writeln!(out, "\tFrame {index}: {}", self.command);
        for frame in &self.body {
            index += 1;
            let _ = writeln!(out, "\tFrame {index}: {frame:?}");
        }
        out
    }
}

/// What a handler sends back on the socket a message arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Message { command: Command, body: Vec<Payload> },
    /// A single bare text frame, used for errors and the exit farewell.
    Notice(String),
}

impl Reply {
    pub fn message(command: Command, body: Vec<Payload>) -> Self {
        Reply::Message { command, body }
    }

    pub fn command(command: Command) -> Self {
        Reply::Message {
            command,
            body: Vec::new(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Reply::Notice(text.into())
    }

    pub fn into_frames(self, return_address: Option<&Bytes>) -> Result<Vec<Frame>> {
        match self {
            Reply::Message { command, body } => encode(command, body, return_address),
            Reply::Notice(text) => {
                let mut frames = Vec::with_capacity(3);
                if let Some(address) = return_address {
                    frames.push(address.clone());
                    frames.push(Bytes::new());
                }
                frames.push(Bytes::from(text));
                Ok(frames)
            }
        }
    }
}

/// A reply as seen by the point-to-point side of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Envelope(Envelope),
    Notice(String),
}

impl Response {
    pub fn parse(frames: &[Frame]) -> Result<Self> {
        match Envelope::decode(frames, false) {
            Ok(envelope) => Ok(Response::Envelope(envelope)),
            Err(BusError::UnknownCommand(_)) if frames.len() == 1 => Ok(Response::Notice(
                String::from_utf8_lossy(&frames[0]).into_owned(),
            )),
            Err(err) => Err(err),
        }
    }
}
