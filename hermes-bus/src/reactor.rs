//! The polling and dispatch engine every node runs.
//!
//! A reactor owns a set of named sockets. Their inbound traffic is merged into
//! one queue that the loop polls together with its timers. Each message is
//! decoded exactly once; malformed or unroutable ones are answered straight
//! away, valid ones are handed to a bounded pool of blocking workers.
//!
//! Messages arriving on different sockets are not ordered with respect to each
//! other, and messages from one socket may finish out of order once they reach
//! the pool. Handlers that touch shared state must synchronise it themselves.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    select,
    sync::{Semaphore, mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::{
    command::Command,
    config::NodeConfig,
    envelope::{Envelope, Reply},
    error::{BusError, Result},
    transport::{Delivery, Outbox, PortAllocator, ReqSocket, serve_router},
};

pub const INVALID_ENVELOPE_REPLY: &str = "Error: Invalid Message Envelope.";
pub const UNRECOGNIZED_COMMAND_REPLY: &str = "Error: unrecognized command";
pub const EXIT_REPLY: &str = "Bye!";

const INBOUND_CAPACITY: usize = 1024;
const RELEASE_GRACE: Duration = Duration::from_secs(1);

/// Consumes one envelope and produces at most one reply.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, envelope: &Envelope) -> Result<Option<Reply>>;
}

impl<F> Handler for F
where
    F: Fn(&Envelope) -> Result<Option<Reply>> + Send + Sync + 'static,
{
    fn handle(&self, envelope: &Envelope) -> Result<Option<Reply>> {
        self(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Point-to-point socket to one remote acceptor. `None` targets the node's
    /// own configured `ip:port`.
    Connect(Option<SocketAddr>),
    /// Router acceptor on the first free port at or above the next candidate.
    Bind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Idle,
    Polling,
    Dispatching,
    Stopped,
}

/// Read-only view of a reactor's lifecycle, usable after `run` has taken
/// the reactor by mutable borrow.
#[derive(Clone)]
pub struct ReactorHandle {
    state: watch::Receiver<ReactorState>,
}

impl ReactorHandle {
    pub fn state(&self) -> ReactorState {
        *self.state.borrow()
    }

    /// Resolves once the reactor has stopped or been dropped.
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == ReactorState::Stopped)
            .await;
    }
}

enum Route {
    Stop,
    Handler(Arc<dyn Handler>),
}

enum Flow {
    Continue,
    Stop,
}

struct SocketEntry {
    role: SocketRole,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

struct Timer {
    name: String,
    period: Duration,
    next: Instant,
    action: Box<dyn FnMut() + Send>,
}

pub struct Reactor {
    config: NodeConfig,
    ports: PortAllocator,
    sockets: BTreeMap<String, SocketEntry>,
    handlers: HashMap<Command, Route>,
    timers: Vec<Timer>,
    inbound_tx: mpsc::Sender<Delivery>,
    inbound_rx: mpsc::Receiver<Delivery>,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    state: watch::Sender<ReactorState>,
    span: Span,
}

impl Reactor {
    pub fn new(config: NodeConfig) -> Self {
        let span = info_span!("node", name = %config.name);
        Self::with_span(config, span)
    }

    /// Builds a reactor that logs under the given span.
    pub fn with_span(config: NodeConfig, span: Span) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(ReactorState::Idle);
        let mut handlers = HashMap::new();
        handlers.insert(Command::Exit, Route::Stop);

        Self {
            ports: PortAllocator::new(config.ip, config.port),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            sockets: BTreeMap::new(),
            handlers,
            timers: Vec::new(),
            inbound_tx,
            inbound_rx,
            shutdown,
            state,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ReactorState {
        *self.state.borrow()
    }

    /// Port of the first bind-in socket, once one exists.
    pub fn advertised_port(&self) -> Option<u16> {
        self.ports.advertised_port()
    }

    /// Whether the advertised port moved away from the configured one, in
    /// which case peers told about the configured port need an `Update`.
    pub fn port_drifted(&self) -> bool {
        self.ports.drifted()
    }

    pub fn socket_addr(&self, name: &str) -> Option<SocketAddr> {
        self.sockets.get(name).map(|entry| entry.addr)
    }

    pub fn socket_role(&self, name: &str) -> Option<SocketRole> {
        self.sockets.get(name).map(|entry| entry.role)
    }

    pub async fn register_socket(&mut self, name: &str, role: SocketRole) -> Result<SocketAddr> {
        let span = self.span.clone();
        self.open_socket(name, role).instrument(span).await
    }

    async fn open_socket(&mut self, name: &str, role: SocketRole) -> Result<SocketAddr> {
        if self.sockets.contains_key(name) {
            return Err(BusError::DuplicateSocket(name.to_string()));
        }

        let socket: Arc<str> = Arc::from(name);
        let shutdown = self.shutdown.subscribe();
        let inbound = self.inbound_tx.clone();

        let (addr, task) = match role {
            SocketRole::Bind => {
                let (listener, _) = self.ports.bind().await?;
                let addr = listener.local_addr()?;
                info!(socket = name, %addr, "opened acceptor socket");
                let serve = serve_router(listener, socket, inbound, shutdown);
                (addr, tokio::spawn(serve.instrument(self.span.clone())))
            }
            SocketRole::Connect(remote) => {
                let remote =
                    remote.unwrap_or_else(|| SocketAddr::new(self.config.ip, self.config.port));
                let connection = ReqSocket::connect(remote).await?;
                info!(socket = name, %remote, "connected socket to remote address");
                let serve = connection.serve(socket, inbound, shutdown);
                (remote, tokio::spawn(serve.instrument(self.span.clone())))
            }
        };

        self.sockets
            .insert(name.to_string(), SocketEntry { role, addr, task });
        Ok(addr)
    }

    /// Binds `handler` to `command`. The first registration wins; later ones
    /// are ignored with a warning and return `false`.
    pub fn add_handler<H: Handler>(&mut self, command: Command, handler: H) -> bool {
        let _entered = self.span.enter();
        match self.handlers.entry(command) {
            Entry::Occupied(_) => {
                warn!(%command, "command already has a handler, keeping the first");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Route::Handler(Arc::new(handler)));
                info!(%command, "registered new handler");
                true
            }
        }
    }

    pub fn has_handler(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Runs `action` from inside the loop every `period`.
    pub fn add_timer<F>(&mut self, name: &str, period: Duration, action: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.push(Timer {
            name: name.to_string(),
            period,
            next: Instant::now() + period,
            action: Box::new(action),
        });
    }

    /// Polls and dispatches until an `Exit` command arrives.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() == ReactorState::Stopped {
            return Ok(());
        }
        let span = self.span.clone();
        self.event_loop().instrument(span).await
    }

    async fn event_loop(&mut self) -> Result<()> {
        info!("beginning event loop");
        let start = Instant::now();
        for timer in &mut self.timers {
            timer.next = start + timer.period;
        }

        loop {
            self.fire_due_timers();
            self.set_state(ReactorState::Polling);

            let wake = self.next_wake();
            let delivery = select! {
                delivery = self.inbound_rx.recv() => delivery,
                _ = sleep_until_or_forever(wake) => {
                    trace!("poll woke without messages");
                    continue;
                }
            };
            // The reactor keeps its own sender, so the queue never closes.
            let Some(delivery) = delivery else { break };

            self.set_state(ReactorState::Dispatching);
            if let Flow::Stop = self.dispatch(delivery).await {
                break;
            }
        }

        Ok(())
    }

    fn next_wake(&self) -> Option<Instant> {
        let timer = self.timers.iter().map(|timer| timer.next).min();
        let poll = self.config.poll_timeout.map(|wait| Instant::now() + wait);
        match (timer, poll) {
            (Some(timer), Some(poll)) => Some(timer.min(poll)),
            (timer, poll) => timer.or(poll),
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        for timer in &mut self.timers {
            if timer.next <= now {
                trace!(timer = %timer.name, "firing timer");
                (timer.action)();
                timer.next = now + timer.period;
            }
        }
    }

    async fn dispatch(&mut self, delivery: Delivery) -> Flow {
        let Delivery {
            socket,
            frames,
            outbox,
        } = delivery;
        let has_identity_prefix = outbox.has_identity_prefix();
        // Router sockets always put the peer identity first, even when the
        // rest of the envelope is malformed.
        let route = has_identity_prefix.then(|| frames.first().cloned()).flatten();

        let envelope = match Envelope::decode(&frames, has_identity_prefix) {
            Ok(envelope) => envelope,
            Err(err) => {
                info!(socket = %socket, error = %err, "dropping invalid message");
                let text = match err {
                    BusError::UnknownCommand(_) => UNRECOGNIZED_COMMAND_REPLY,
                    _ => INVALID_ENVELOPE_REPLY,
                };
                send_reply(&outbox, route.as_ref(), Reply::notice(text));
                return Flow::Continue;
            }
        };

        let command = envelope.command();
        debug!(socket = %socket, %command, "message received\n{}", envelope.describe());

        let handler = match self.handlers.get(&command) {
            None => {
                debug!(%command, "no handler registered for command");
                send_reply(
                    &outbox,
                    route.as_ref(),
                    Reply::notice(UNRECOGNIZED_COMMAND_REPLY),
                );
                return Flow::Continue;
            }
            Some(Route::Stop) => None,
            Some(Route::Handler(handler)) => Some(Arc::clone(handler)),
        };

        match handler {
            Some(handler) => {
                self.spawn_handler(handler, envelope, outbox);
                Flow::Continue
            }
            None => {
                self.stop(&outbox, route.as_ref()).await;
                Flow::Stop
            }
        }
    }

    fn spawn_handler(&self, handler: Arc<dyn Handler>, envelope: Envelope, outbox: Outbox) {
        let workers = Arc::clone(&self.workers);
        let task = async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let command = envelope.command();
            let route = envelope.return_address().cloned();
            let outcome = tokio::task::spawn_blocking(move || handler.handle(&envelope)).await;

            match outcome {
                Ok(Ok(Some(reply))) => send_reply(&outbox, route.as_ref(), reply),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    warn!(%command, error = %err, "handler failed");
                    send_reply(&outbox, route.as_ref(), Reply::notice(format!("Error: {err}")));
                }
                Err(join_err) => {
                    let fault = BusError::HandlerFault(join_err.to_string());
                    error!(%command, error = %fault, "handler crashed");
                    send_reply(
                        &outbox,
                        route.as_ref(),
                        Reply::notice(format!("Error: {fault}")),
                    );
                }
            }
        };
        tokio::spawn(task.instrument(self.span.clone()));
    }

    async fn stop(&mut self, outbox: &Outbox, route: Option<&Bytes>) {
        warn!("received exit command, node will stop receiving messages");
        send_reply(outbox, route, Reply::notice(EXIT_REPLY));
        self.set_state(ReactorState::Stopped);
        self.release_sockets().await;
    }

    async fn release_sockets(&mut self) {
        self.shutdown.send_replace(true);
        for (name, entry) in std::mem::take(&mut self.sockets) {
            let mut task = entry.task;
            if timeout(RELEASE_GRACE, &mut task).await.is_err() {
                warn!(socket = %name, "socket did not close in time, aborting");
                task.abort();
            }
            debug!(socket = %name, "removed socket");
        }
        info!("sockets closed");
    }

    fn set_state(&self, state: ReactorState) {
        self.state.send_replace(state);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn send_reply(outbox: &Outbox, route: Option<&Bytes>, reply: Reply) {
    let sent = reply
        .into_frames(route)
        .and_then(|frames| outbox.send(frames));
    if let Err(err) = sent {
        debug!(error = %err, "could not deliver reply");
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
