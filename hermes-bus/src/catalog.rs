//! The broker's table of registered services.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{Span, debug, info, info_span, warn};

use crate::{
    clock::{Clock, millis},
    command::Command,
    config::{DEFAULT_LIVELINESS_MS, DEFAULT_RETRIES},
    envelope::{Envelope, Payload, Reply},
    error::{BusError, Result},
    reactor::Reactor,
};

/// Opening of the `Error` text sent back for names missing from the catalog.
pub const NOT_FOUND_PREFIX: &str = "No Registered Service With the Name ";

/// What the broker knows about one service.
///
/// Fields outside the record are refused rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRecord {
    #[serde(alias = "ip_addr")]
    pub ip: IpAddr,
    pub port: u16,
    /// Broker clock reading of the last message from this service, in ms.
    #[serde(default)]
    pub last_beat: u64,
    /// Expected heartbeat interval in ms; zero disables expiry.
    #[serde(default = "default_liveliness")]
    pub liveliness: u64,
    #[serde(default = "default_retries", alias = "retry")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

fn default_liveliness() -> u64 {
    DEFAULT_LIVELINESS_MS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

impl ServiceRecord {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            last_beat: 0,
            liveliness: DEFAULT_LIVELINESS_MS,
            retries: DEFAULT_RETRIES,
            topics: None,
        }
    }

    /// Registration body: the record's fields plus the service `name`.
    pub fn registration_body(&self, name: &str) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("last_beat");
            fields.insert("name".to_string(), Value::String(name.to_string()));
        }
        Ok(value)
    }
}

/// Decides whether a service may join the catalog.
pub trait ApprovalPolicy: Send + Sync + 'static {
    /// `Err` carries the reason sent back to the service.
    fn review(&self, name: &str, record: &ServiceRecord) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

impl ApprovalPolicy for ApproveAll {
    fn review(&self, _name: &str, _record: &ServiceRecord) -> Result<(), String> {
        Ok(())
    }
}

/// Outcome of judging one record during a liveliness sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive { misses: u32 },
    Unreachable,
}

struct Entry {
    record: ServiceRecord,
    misses: u32,
}

pub struct Catalog {
    entries: Mutex<BTreeMap<String, Entry>>,
    policy: Box<dyn ApprovalPolicy>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl Catalog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::default(),
            policy: Box::new(ApproveAll),
            clock,
            span: info_span!("catalog"),
        }
    }

    pub fn with_policy<P: ApprovalPolicy>(mut self, policy: P) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        millis(self.clock.now())
    }

    /// Inserts or overwrites `name`; a re-registration never merges.
    pub fn register(&self, name: &str, mut record: ServiceRecord) -> Result<ServiceRecord> {
        if let Err(reason) = self.policy.review(name, &record) {
            warn!(service = name, %reason, "registration denied");
            return Err(BusError::Denied(reason));
        }

        record.last_beat = self.now_ms();
        let mut entries = self.lock();
        let replaced = entries
            .insert(
                name.to_string(),
                Entry {
                    record: record.clone(),
                    misses: 0,
                },
            )
            .is_some();
        info!(service = name, ip = %record.ip, port = record.port, replaced, "service registered");
        Ok(record)
    }

    /// Overwrites the given fields of an existing record, leaving the rest.
    pub fn update(&self, name: &str, fields: Map<String, Value>) -> Result<ServiceRecord> {
        let now = self.now_ms();
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| BusError::NotFound(name.to_string()))?;

        let mut merged = match serde_json::to_value(&entry.record)? {
            Value::Object(current) => current,
            _ => Map::new(),
        };
        for (key, value) in fields {
            let key = match key.as_str() {
                "name" | "last_beat" => continue,
                "ip_addr" => "ip".to_string(),
                "retry" => "retries".to_string(),
                _ => key,
            };
            merged.insert(key, value);
        }

        let mut record: ServiceRecord = serde_json::from_value(Value::Object(merged))?;
        record.last_beat = now;
        entry.record = record.clone();
        entry.misses = 0;
        info!(service = name, port = record.port, "service updated");
        Ok(record)
    }

    /// Refreshes `last_beat` and clears the miss counter.
    pub fn heartbeat(&self, name: &str) -> Result<()> {
        let now = self.now_ms();
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| BusError::NotFound(name.to_string()))?;
        entry.record.last_beat = now;
        entry.misses = 0;
        debug!(service = name, "heartbeat");
        Ok(())
    }

    /// The whole catalog for an empty name, otherwise the single named record.
    pub fn lookup(&self, name: &str) -> Result<BTreeMap<String, ServiceRecord>> {
        if name.is_empty() {
            return Ok(self.snapshot());
        }
        let record = self
            .get(name)
            .ok_or_else(|| BusError::NotFound(name.to_string()))?;
        Ok(BTreeMap::from([(name.to_string(), record)]))
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.lock().get(name).map(|entry| entry.record.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ServiceRecord> {
        self.lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.record.clone()))
            .collect()
    }

    pub fn misses(&self, name: &str) -> Option<u32> {
        self.lock().get(name).map(|entry| entry.misses)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Judges every record under one lock and evicts the unreachable ones.
    /// Returns the evicted names.
    pub fn sweep<F>(&self, mut judge: F) -> Vec<String>
    where
        F: FnMut(&ServiceRecord, u32, u64) -> Verdict,
    {
        let now = self.now_ms();
        let mut evicted = Vec::new();
        self.lock().retain(|name, entry| {
            match judge(&entry.record, entry.misses, now) {
                Verdict::Alive { misses } => {
                    entry.misses = misses;
                    true
                }
                Verdict::Unreachable => {
                    evicted.push(name.clone());
                    false
                }
            }
        });
        evicted
    }

    pub fn on_registration(&self, envelope: &Envelope) -> Result<Option<Reply>> {
        let _entered = self.span.enter();
        let mut fields: Map<String, Value> = envelope.json_body()?;
        let name = take_name(&mut fields)?;
        let record: ServiceRecord = serde_json::from_value(Value::Object(fields))?;

        match self.register(&name, record) {
            Ok(_) => Ok(Some(Reply::command(Command::Approved))),
            Err(BusError::Denied(reason)) => Ok(Some(error_reply(Command::Denied, &reason))),
            Err(err) => Err(err),
        }
    }

    pub fn on_update(&self, envelope: &Envelope) -> Result<Option<Reply>> {
        let _entered = self.span.enter();
        let mut fields: Map<String, Value> = envelope.json_body()?;
        let name = take_name(&mut fields)?;

        match self.update(&name, fields) {
            Ok(_) => Ok(Some(Reply::command(Command::Acknowledged))),
            Err(err @ BusError::NotFound(_)) => {
                warn!(service = %name, "update for unknown service");
                Ok(Some(error_reply(Command::Denied, &err.to_string())))
            }
            Err(err) => Err(err),
        }
    }

    pub fn on_info_request(&self, envelope: &Envelope) -> Result<Option<Reply>> {
        let _entered = self.span.enter();
        let name = envelope.text_body()?.trim();

        let body = match self.lookup(name) {
            Ok(records) => serde_json::to_value(records)?,
            Err(err @ BusError::NotFound(_)) => json!({ "Error": err.to_string() }),
            Err(err) => return Err(err),
        };
        Ok(Some(Reply::message(Command::InfoRep, vec![Payload::Json(body)])))
    }

    pub fn on_heartbeat(&self, envelope: &Envelope) -> Result<Option<Reply>> {
        let _entered = self.span.enter();
        let name = envelope.text_body()?.trim();

        match self.heartbeat(name) {
            Ok(()) => Ok(Some(Reply::command(Command::Acknowledged))),
            Err(err @ BusError::NotFound(_)) => {
                debug!(service = name, "heartbeat from unknown service");
                Ok(Some(error_reply(Command::Denied, &err.to_string())))
            }
            Err(err) => Err(err),
        }
    }

    /// Binds the catalog operations to their commands on `reactor`.
    pub fn install(self: &Arc<Self>, reactor: &mut Reactor) {
        let catalog = Arc::clone(self);
        reactor.add_handler(Command::Registration, move |envelope: &Envelope| {
            catalog.on_registration(envelope)
        });
        let catalog = Arc::clone(self);
        reactor.add_handler(Command::Update, move |envelope: &Envelope| {
            catalog.on_update(envelope)
        });
        let catalog = Arc::clone(self);
        reactor.add_handler(Command::InfoReq, move |envelope: &Envelope| {
            catalog.on_info_request(envelope)
        });
        let catalog = Arc::clone(self);
        reactor.add_handler(Command::Heartbeat, move |envelope: &Envelope| {
            catalog.on_heartbeat(envelope)
        });
    }
}

fn take_name(fields: &mut Map<String, Value>) -> Result<String> {
    match fields.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => Ok(name),
        Some(_) => Err(BusError::InvalidBody(
            "service name must be a non-empty string".to_string(),
        )),
        None => Err(BusError::InvalidBody("missing service name".to_string())),
    }
}

fn error_reply(command: Command, message: &str) -> Reply {
    Reply::message(command, vec![Payload::Json(json!({ "Error": message }))])
}
