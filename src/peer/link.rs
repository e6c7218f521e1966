use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::transport::{FrameReader, FrameWriter};

/// Lifecycle of a link. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// TCP connect in progress.
    Connecting,
    /// Exchanging the 68-byte handshake.
    Handshaking,
    /// Handshake done, reader/writer/keepalive tasks running.
    Established,
    /// Socket released.
    Disconnected,
}

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// The four protocol flags kept for each peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We are choking the peer.
    pub am_choking: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    /// We want pieces the peer has.
    pub am_interested: bool,
    /// The peer wants pieces we have.
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
        }
    }
}

/// Everything a link needs to know about the local session.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub keepalive_interval: Duration,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

/// What a link reports upward. Flag changes are absorbed by the link itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

/// The operations the choke controller and upload servicer need from a peer.
///
/// [`PeerLink`] is the production implementation; tests substitute
/// in-memory peers.
pub trait RemotePeer: Send + Sync + 'static {
    fn addr(&self) -> SocketAddr;
    fn is_connected(&self) -> bool;
    fn downloaded_since_reset(&self) -> u64;
    fn uploaded_since_reset(&self) -> u64;
    fn reset_counters(&self);
    fn choke(&self);
    fn unchoke(&self);
    fn interested(&self);
    /// Sends a `piece` message. Returns false if the send was suppressed.
    fn send_block(&self, piece: u32, offset: u32, data: Bytes) -> bool;
    fn close(&self);
}

/// One connection to a remote peer.
///
/// A link is shared behind an `Arc`. Once established it runs three tasks: a
/// reader that decodes frames and forwards events, a writer that is the only
/// path onto the socket, and a keepalive timer. All three stop when the
/// link's cancellation token fires, which [`close`](Self::close) does exactly
/// once.
///
/// # Examples
///
/// ```no_run
/// use rswarm::peer::{Direction, LinkSettings, PeerId, PeerLink};
/// use std::net::SocketAddr;
/// use std::time::Duration;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "192.168.1.100:6881".parse()?;
/// let settings = LinkSettings {
///     info_hash: [0u8; 20],
///     peer_id: PeerId::generate(),
///     keepalive_interval: Duration::from_secs(120),
///     read_timeout: Duration::from_secs(120),
///     connect_timeout: Duration::from_secs(10),
/// };
/// let (events_tx, mut events) = mpsc::channel(64);
///
/// let link = PeerLink::new(addr, Direction::Outbound, &CancellationToken::new());
/// link.connect(&settings, events_tx).await?;
/// link.send_interested();
///
/// while let Some(event) = events.recv().await {
///     println!("{} sent {:?}", event.addr, event.kind);
/// }
/// # Ok(())
/// # }
/// ```
pub struct PeerLink {
    addr: SocketAddr,
    direction: Direction,
    state: Mutex<LinkState>,
    flags: Mutex<PeerFlags>,
    remote_id: Mutex<Option<PeerId>>,
    downloaded_since_reset: AtomicU64,
    uploaded_since_reset: AtomicU64,
    downloaded_total: AtomicU64,
    uploaded_total: AtomicU64,
    outbox: mpsc::UnboundedSender<Message>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PeerLink {
    /// Creates a link in the `Connecting` state. `parent` is the session's
    /// token; cancelling it closes the link.
    pub fn new(addr: SocketAddr, direction: Direction, parent: &CancellationToken) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            addr,
            direction,
            state: Mutex::new(LinkState::Connecting),
            flags: Mutex::new(PeerFlags::default()),
            remote_id: Mutex::new(None),
            downloaded_since_reset: AtomicU64::new(0),
            uploaded_since_reset: AtomicU64::new(0),
            downloaded_total: AtomicU64::new(0),
            uploaded_total: AtomicU64::new(0),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
        })
    }

    /// Dials the peer and performs the outbound handshake.
    pub async fn connect(
        self: &Arc<Self>,
        settings: &LinkSettings,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), PeerError> {
        let stream = match timeout(settings.connect_timeout, TcpStream::connect(self.addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.close();
                return Err(e.into());
            }
            Err(_) => {
                self.close();
                return Err(PeerError::Timeout);
            }
        };
        let _ = stream.set_nodelay(true);
        self.establish(stream, settings, events).await
    }

    /// Runs the handshake over `stream` and, on success, starts the link's
    /// tasks. Outbound links write first; inbound links read first.
    ///
    /// On any failure the link ends up `Disconnected`.
    pub async fn establish<S>(
        self: &Arc<Self>,
        stream: S,
        settings: &LinkSettings,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.set_state(LinkState::Handshaking);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, settings.read_timeout);
        let mut writer = FrameWriter::new(write_half);

        let ours = Handshake::new(settings.info_hash, settings.peer_id.0);
        let handshake = async {
            if self.direction == Direction::Outbound {
                writer.write_handshake(&ours).await?;
            }
            let theirs = reader.read_handshake().await?;
            if theirs.info_hash != settings.info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
            if self.direction == Direction::Inbound {
                writer.write_handshake(&ours).await?;
            }
            Ok::<_, PeerError>(theirs)
        };

        let theirs = tokio::select! {
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            res = timeout(settings.connect_timeout, handshake) => {
                res.unwrap_or(Err(PeerError::Timeout))
            }
        };

        let theirs = match theirs {
            Ok(theirs) => theirs,
            Err(e) => {
                debug!(peer = %self.addr, error = %e, "handshake failed");
                self.close();
                return Err(e);
            }
        };

        let Some(outbox_rx) = self.outbox_rx.lock().take() else {
            self.close();
            return Err(PeerError::Cancelled);
        };

        *self.remote_id.lock() = Some(PeerId(theirs.peer_id));
        self.set_state(LinkState::Established);
        debug!(peer = %self.addr, direction = ?self.direction, "link established");

        tokio::spawn(Arc::clone(self).read_loop(reader, events));
        tokio::spawn(Arc::clone(self).write_loop(writer, outbox_rx));
        tokio::spawn(Arc::clone(self).keepalive_loop(settings.keepalive_interval));

        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: FrameReader<R>, events: mpsc::Sender<PeerEvent>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = reader.read_message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    if let Some(kind) = self.absorb(message) {
                        let event = PeerEvent {
                            addr: self.addr,
                            kind,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => trace!(peer = %self.addr, "ignoring unknown message id"),
                Err(e) => {
                    debug!(peer = %self.addr, error = %e, "read failed");
                    break;
                }
            }
        }

        self.close();
        let _ = events
            .send(PeerEvent {
                addr: self.addr,
                kind: PeerEventKind::Disconnected,
            })
            .await;
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut writer: FrameWriter<W>,
        mut outbox: mpsc::UnboundedReceiver<Message>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = outbox.recv() => message,
            };
            let Some(message) = message else { break };

            if let Err(e) = writer.write_message(&message).await {
                debug!(peer = %self.addr, error = %e, "write failed");
                break;
            }
        }

        self.close();
        writer.shutdown().await;
    }

    async fn keepalive_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.enqueue(Message::KeepAlive) {
                        break;
                    }
                }
            }
        }
    }

    /// Applies flag-only messages and turns the rest into events.
    fn absorb(&self, message: Message) -> Option<PeerEventKind> {
        match message {
            Message::KeepAlive => None,
            Message::Choke => {
                self.flags.lock().peer_choking = true;
                None
            }
            Message::Unchoke => {
                self.flags.lock().peer_choking = false;
                None
            }
            Message::Interested => {
                self.flags.lock().peer_interested = true;
                None
            }
            Message::NotInterested => {
                self.flags.lock().peer_interested = false;
                None
            }
            Message::Have { piece } => Some(PeerEventKind::Have(piece)),
            Message::Bitfield(bits) => Some(PeerEventKind::Bitfield(bits)),
            Message::Request {
                index,
                begin,
                length,
            } => Some(PeerEventKind::Request(BlockRequest::new(index, begin, length))),
            Message::Piece { index, begin, data } => {
                let len = data.len() as u64;
                self.downloaded_since_reset.fetch_add(len, Ordering::Relaxed);
                self.downloaded_total.fetch_add(len, Ordering::Relaxed);
                Some(PeerEventKind::Piece(Block::new(index, begin, data)))
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Some(PeerEventKind::Cancel(BlockRequest::new(index, begin, length))),
        }
    }

    fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock();
        if *state != LinkState::Disconnected {
            *state = next;
        }
    }

    fn enqueue(&self, message: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbox.send(message).is_ok()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn flags(&self) -> PeerFlags {
        *self.flags.lock()
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        *self.remote_id.lock()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.state() == LinkState::Established
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True if the peer is unchoking us and we are interested, i.e. a
    /// `request` would actually be sent.
    pub fn can_request(&self) -> bool {
        let flags = self.flags();
        self.is_connected() && flags.am_interested && !flags.peer_choking
    }

    pub fn downloaded_total(&self) -> u64 {
        self.downloaded_total.load(Ordering::Relaxed)
    }

    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total.load(Ordering::Relaxed)
    }

    pub fn send_choke(&self) {
        self.flags.lock().am_choking = true;
        self.enqueue(Message::Choke);
    }

    pub fn send_unchoke(&self) {
        self.flags.lock().am_choking = false;
        self.enqueue(Message::Unchoke);
    }

    /// Declares interest. A no-op if we already have.
    pub fn send_interested(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.am_interested {
                return;
            }
            flags.am_interested = true;
        }
        self.enqueue(Message::Interested);
    }

    pub fn send_not_interested(&self) {
        {
            let mut flags = self.flags.lock();
            if !flags.am_interested {
                return;
            }
            flags.am_interested = false;
        }
        self.enqueue(Message::NotInterested);
    }

    pub fn send_have(&self, piece: u32) {
        self.enqueue(Message::Have { piece });
    }

    pub fn send_bitfield(&self, bitfield: &Bitfield) {
        self.enqueue(Message::Bitfield(bitfield.to_bytes()));
    }

    /// Requests a range. Suppressed unless we are interested and the peer
    /// is not choking us.
    pub fn send_request(&self, piece: u32, offset: u32, length: u32) -> bool {
        if !self.can_request() {
            return false;
        }
        self.enqueue(Message::Request {
            index: piece,
            begin: offset,
            length,
        })
    }

    /// Sends piece data. Suppressed unless we unchoked the peer and it has
    /// declared interest.
    pub fn send_piece(&self, piece: u32, offset: u32, data: Bytes) -> bool {
        let flags = self.flags();
        if flags.am_choking || !flags.peer_interested {
            return false;
        }
        let len = data.len() as u64;
        let sent = self.enqueue(Message::Piece {
            index: piece,
            begin: offset,
            data,
        });
        if sent {
            self.uploaded_since_reset.fetch_add(len, Ordering::Relaxed);
            self.uploaded_total.fetch_add(len, Ordering::Relaxed);
        }
        sent
    }

    /// Marks the link disconnected and stops its tasks. Later calls do
    /// nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = LinkState::Disconnected;
        self.cancel.cancel();
        debug!(peer = %self.addr, "link closed");
    }

    #[cfg(test)]
    pub(crate) fn set_flags(&self, flags: PeerFlags) {
        *self.flags.lock() = flags;
    }
}

impl RemotePeer for PeerLink {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_connected(&self) -> bool {
        PeerLink::is_connected(self)
    }

    fn downloaded_since_reset(&self) -> u64 {
        self.downloaded_since_reset.load(Ordering::Relaxed)
    }

    fn uploaded_since_reset(&self) -> u64 {
        self.uploaded_since_reset.load(Ordering::Relaxed)
    }

    fn reset_counters(&self) {
        self.downloaded_since_reset.store(0, Ordering::Relaxed);
        self.uploaded_since_reset.store(0, Ordering::Relaxed);
    }

    fn choke(&self) {
        self.send_choke();
    }

    fn unchoke(&self) {
        self.send_unchoke();
    }

    fn interested(&self) {
        self.send_interested();
    }

    fn send_block(&self, piece: u32, offset: u32, data: Bytes) -> bool {
        self.send_piece(piece, offset, data)
    }

    fn close(&self) {
        PeerLink::close(self);
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}
