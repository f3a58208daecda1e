//! Multipart TCP transport.
//!
//! Every message is a big-endian `u32` frame count followed by each frame as a
//! big-endian `u32` length and its bytes. Two socket flavours sit on top:
//!
//! - a router socket accepts many peers, tags every inbound message with the
//!   peer's identity, and routes outbound messages by that identity;
//! - a request socket talks to one remote acceptor and wraps each message in an
//!   empty delimiter frame, so the router side sees
//!   `[identity][empty][command][body...]`.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use nanoid::nanoid;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    envelope::Frame,
    error::{BusError, Result},
};

pub const MAX_FRAMES: u32 = 64;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn read_frames<R>(reader: &mut R) -> io::Result<Option<Vec<Frame>>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if count == 0 || count > MAX_FRAMES {
        return Err(invalid_data(format!("frame count {count} out of range")));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(invalid_data(format!("frame of {len} bytes exceeds limit")));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }
    Ok(Some(frames))
}

pub async fn write_frames<W>(writer: &mut W, frames: &[Frame]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let count = u32::try_from(frames.len())
        .ok()
        .filter(|count| (1..=MAX_FRAMES).contains(count))
        .ok_or_else(|| invalid_input(format!("cannot send {} frames", frames.len())))?;

    // One buffer per message so a frame set is never interleaved on the wire.
    let size = 4 + frames.iter().map(|frame| 4 + frame.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(count);
    for frame in frames {
        let len = u32::try_from(frame.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| invalid_input(format!("frame of {} bytes exceeds limit", frame.len())))?;
        buf.put_u32(len);
        buf.extend_from_slice(frame);
    }

    writer.write_all(&buf).await?;
    writer.flush().await
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

type PeerTable = Mutex<HashMap<Bytes, mpsc::UnboundedSender<Vec<Frame>>>>;

fn lock(peers: &PeerTable) -> MutexGuard<'_, HashMap<Bytes, mpsc::UnboundedSender<Vec<Frame>>>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sending half of a socket, cloned into every delivery so replies go back
/// the way the request came in.
#[derive(Clone)]
pub enum Outbox {
    Router(Arc<PeerTable>),
    Request(mpsc::UnboundedSender<Vec<Frame>>),
}

impl Outbox {
    pub fn has_identity_prefix(&self) -> bool {
        matches!(self, Outbox::Router(_))
    }

    pub fn send(&self, mut frames: Vec<Frame>) -> Result<()> {
        match self {
            Outbox::Router(peers) => {
                if frames.is_empty() {
                    return Err(BusError::InvalidEnvelope("missing return address"));
                }
                let identity = frames.remove(0);
                let peers = lock(peers);
                let peer = peers.get(&identity).ok_or_else(|| disconnected(&identity))?;
                peer.send(frames).map_err(|_| disconnected(&identity))
            }
            Outbox::Request(outbound) => {
                frames.insert(0, Bytes::new());
                outbound
                    .send(frames)
                    .map_err(|_| BusError::Disconnected("request socket".to_string()))
            }
        }
    }
}

fn disconnected(identity: &Bytes) -> BusError {
    BusError::Disconnected(String::from_utf8_lossy(identity).into_owned())
}

/// One inbound message, tagged with the socket it arrived on.
pub struct Delivery {
    pub socket: Arc<str>,
    pub frames: Vec<Frame>,
    pub outbox: Outbox,
}

/// Hands out listening ports: the first free port at or above the next
/// candidate, moving the candidate past every port it binds.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    ip: IpAddr,
    start: u16,
    next: u16,
    advertised: Option<u16>,
}

impl PortAllocator {
    pub fn new(ip: IpAddr, start: u16) -> Self {
        Self {
            ip,
            start,
            next: start,
            advertised: None,
        }
    }

    pub async fn bind(&mut self) -> Result<(TcpListener, u16)> {
        let mut port = self.next;
        loop {
            match try_bind(self.ip, port).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?.port();
                    // Port 0 asks the OS for an ephemeral port every time.
                    if port != 0 {
                        self.next = bound.saturating_add(1);
                    }
                    self.advertised.get_or_insert(bound);
                    info!(port = bound, "opened new socket");
                    return Ok((listener, bound));
                }
                Err(BusError::BindConflict { port: taken }) => {
                    port = taken
                        .checked_add(1)
                        .ok_or(BusError::NoFreePort { start: self.next })?;
                    warn!(port, "port conflict, attempting to bind with new port");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Port of the first successful bind; the one peers should be told about.
    pub fn advertised_port(&self) -> Option<u16> {
        self.advertised
    }

    /// True once the advertised port differs from the configured start port.
    /// An ephemeral start (port 0) always drifts.
    pub fn drifted(&self) -> bool {
        self.advertised.is_some_and(|port| port != self.start)
    }
}

async fn try_bind(ip: IpAddr, port: u16) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(ip, port))
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => BusError::BindConflict { port },
            _ => BusError::Io(err),
        })
}

/// Accepts peers until `shutdown` flips, then lets every connection flush its
/// pending replies before returning.
pub async fn serve_router(
    listener: TcpListener,
    socket: Arc<str>,
    inbound: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peers: Arc<PeerTable> = Arc::default();
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let identity = Bytes::from(nanoid!());
                    debug!(socket = %socket, %peer, "peer connected");
                    connections.spawn(serve_peer(
                        stream,
                        peer,
                        identity,
                        Arc::clone(&peers),
                        Arc::clone(&socket),
                        inbound.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(socket = %socket, error = ?err, "failed to accept connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    warn!(socket = %socket, error = ?err, "peer task failed");
                }
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    debug!(socket = %socket, "router closed");
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    identity: Bytes,
    peers: Arc<PeerTable>,
    socket: Arc<str>,
    inbound: mpsc::Sender<Delivery>,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    lock(&peers).insert(identity.clone(), outbound_tx);

    let outbox = Outbox::Router(Arc::clone(&peers));
    let reading = forward_inbound(
        BufReader::new(reader),
        Some(identity.clone()),
        Arc::clone(&socket),
        outbox,
        inbound,
    );
    let writing = drain_outbound(writer, outbound_rx, shutdown);
    tokio::pin!(reading, writing);

    let reader_finished = select! {
        result = &mut reading => {
            if let Err(err) = result {
                debug!(socket = %socket, %peer, error = ?err, "peer read failed");
            }
            true
        }
        result = &mut writing => {
            if let Err(err) = result {
                debug!(socket = %socket, %peer, error = ?err, "peer write failed");
            }
            false
        }
    };

    lock(&peers).remove(&identity);
    if reader_finished {
        // Dropping the table entry closes the queue; flush what is left.
        if let Err(err) = writing.await {
            debug!(socket = %socket, %peer, error = ?err, "peer write failed");
        }
    }
    debug!(socket = %socket, %peer, "peer disconnected");
}

async fn forward_inbound<R>(
    mut reader: R,
    identity: Option<Bytes>,
    socket: Arc<str>,
    outbox: Outbox,
    inbound: mpsc::Sender<Delivery>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(mut frames) = read_frames(&mut reader).await? {
        match &identity {
            Some(identity) => frames.insert(0, identity.clone()),
            None => match strip_delimiter(frames) {
                Some(stripped) => frames = stripped,
                None => {
                    warn!(socket = %socket, "dropping message without empty delimiter");
                    continue;
                }
            },
        }

        let delivery = Delivery {
            socket: Arc::clone(&socket),
            frames,
            outbox: outbox.clone(),
        };
        if inbound.send(delivery).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn drain_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<Frame>>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        select! {
            biased;
            frames = outbound.recv() => match frames {
                Some(frames) => write_frames(&mut writer, &frames).await?,
                None => break,
            },
            _ = stop_requested(&mut shutdown) => {
                while let Ok(frames) = outbound.try_recv() {
                    write_frames(&mut writer, &frames).await?;
                }
                break;
            }
        }
    }
    writer.shutdown().await
}

/// Resolves once the shutdown flag is raised or its sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn strip_delimiter(mut frames: Vec<Frame>) -> Option<Vec<Frame>> {
    if frames.len() < 2 || !frames[0].is_empty() {
        return None;
    }
    frames.remove(0);
    Some(frames)
}

/// Point-to-point socket with strict send/receive alternation.
pub struct ReqSocket {
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ReqSocket {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer: addr,
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, frames: &[Frame]) -> Result<()> {
        let mut wrapped = Vec::with_capacity(frames.len() + 1);
        wrapped.push(Bytes::new());
        wrapped.extend_from_slice(frames);
        write_frames(&mut self.writer, &wrapped).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Vec<Frame>> {
        loop {
            let frames = read_frames(&mut self.reader)
                .await?
                .ok_or_else(|| BusError::Disconnected(self.peer.to_string()))?;
            match strip_delimiter(frames) {
                Some(frames) => return Ok(frames),
                None => warn!(peer = %self.peer, "dropping reply without empty delimiter"),
            }
        }
    }

    /// Sends one message and waits for its reply.
    ///
    /// After a timeout the conversation is out of step; reconnect before
    /// reusing the socket.
    pub async fn request(&mut self, frames: &[Frame], wait: Duration) -> Result<Vec<Frame>> {
        self.send(frames).await?;
        timeout(wait, self.recv())
            .await
            .map_err(|_| BusError::Timeout(wait))?
    }

    /// Runs the socket under a reactor: inbound messages become deliveries and
    /// replies queued on the outbox are written back.
    pub async fn serve(
        self,
        socket: Arc<str>,
        inbound: mpsc::Sender<Delivery>,
        shutdown: watch::Receiver<bool>,
    ) {
        let ReqSocket {
            peer,
            reader,
            writer,
        } = self;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let reading = forward_inbound(
            reader,
            None,
            Arc::clone(&socket),
            Outbox::Request(outbound_tx),
            inbound,
        );
        let writing = drain_outbound(writer, outbound_rx, shutdown);

        let result = select! {
            result = reading => result,
            result = writing => result,
        };
        if let Err(err) = result {
            debug!(socket = %socket, %peer, error = ?err, "connection closed with error");
        }
        debug!(socket = %socket, %peer, "connection closed");
    }
}
