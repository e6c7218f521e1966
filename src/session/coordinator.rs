use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::choker::{ChokeConfig, ChokeController};
use super::registry::PeerRegistry;
use super::scheduler::{Assignment, Scheduler, SchedulerConfig};
use super::upload::{ServeOutcome, UploadRequest, UploadServicer};
use crate::config::Config;
use crate::constants::{DEFAULT_ANNOUNCE_INTERVAL, EVENT_CHANNEL_CAPACITY, SCHEDULER_IDLE};
use crate::error::{Error, Result};
use crate::metainfo::SessionInfo;
use crate::peer::{Bitfield, Direction, LinkSettings, PeerEvent, PeerEventKind, PeerId, PeerLink};
use crate::storage::{PieceStore, ResumeStatus, StorageError, StoreOutcome};
use crate::tracker::{Announce, AnnounceRequest, TrackerEvent};

/// A point-in-time view of a session for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Payload bytes received from peers this run.
    pub downloaded: u64,
    /// Payload bytes sent to peers this run.
    pub uploaded: u64,
    /// Bytes of pieces not yet verified.
    pub left: u64,
    pub total: u64,
    pub completed_pieces: usize,
    pub piece_count: usize,
    pub connected_peers: usize,
    pub paused: bool,
    pub complete: bool,
}

impl Progress {
    /// Fraction of the payload verified, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.total - self.left) as f64 / self.total as f64
    }
}

/// Drives one download: owns the links, the store and every background task.
///
/// [`start`](Self::start) spawns the tracker, event, scheduler, upload,
/// choke and listener tasks; [`shutdown`](Self::shutdown) cancels them all
/// and persists progress. Cloning is cheap and shares the session.
///
/// # Examples
///
/// ```no_run
/// use rswarm::{Config, Coordinator, HttpTracker, SessionInfo};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let session = SessionInfo::from_torrent_file("debian.iso.torrent").await?;
/// let tracker = HttpTracker::new(&session.announce, config.tracker_timeout())?;
///
/// let coordinator = Coordinator::new(config, Arc::new(session), "debian.iso".into(), tracker);
/// coordinator.start(true).await?;
///
/// let progress = coordinator.progress();
/// println!("{:.1}% done", progress.fraction() * 100.0);
///
/// coordinator.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    config: Config,
    session: Arc<SessionInfo>,
    store: PieceStore,
    scheduler: Mutex<Scheduler>,
    choker: ChokeController<PeerLink>,
    uploads: UploadServicer,
    registry: PeerRegistry,
    tracker: T,
    settings: LinkSettings,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    cancel: CancellationToken,
    completed: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    finished_this_run: AtomicBool,
    listen_port: AtomicU16,
    downloaded: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Announce> Coordinator<T> {
    /// Prepares a session that will write the payload to `payload_path`.
    pub fn new(config: Config, session: Arc<SessionInfo>, payload_path: PathBuf, tracker: T) -> Self {
        let resume_path = config.resume_path_for(&payload_path);
        let store = PieceStore::new(Arc::clone(&session), payload_path, resume_path);
        let scheduler = Scheduler::new(
            &session,
            SchedulerConfig {
                max_in_flight: config.max_in_flight_pieces,
                endgame_threshold: config.endgame_threshold,
                endgame_interval: config.endgame_interval(),
                request_timeout: config.request_timeout(),
            },
        );
        let choker = ChokeController::new(ChokeConfig {
            max_active: config.max_active_peers,
            max_optimistic: config.max_optimistic_peers,
        });
        let settings = LinkSettings {
            info_hash: session.info_hash,
            peer_id: PeerId::generate(),
            keepalive_interval: config.keepalive_interval(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.connect_timeout(),
        };
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                uploads: UploadServicer::new(config.max_queued_requests),
                config,
                session,
                store,
                scheduler: Mutex::new(scheduler),
                choker,
                registry: PeerRegistry::new(),
                tracker,
                settings,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                cancel: CancellationToken::new(),
                completed: Notify::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                finished_this_run: AtomicBool::new(false),
                listen_port: AtomicU16::new(0),
                downloaded: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Prepares storage and spawns the session's tasks. With `resume`, the
    /// saved completion bitfield is loaded first (and re-hashed if
    /// `verify_on_resume` is set).
    pub async fn start(&self, resume: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        inner.store.create_backing_file().await?;

        if resume {
            let status = inner.store.resume().await?;
            info!(
                ?status,
                completed = inner.store.completed_count(),
                pieces = inner.session.piece_count(),
                "resumed"
            );
            if inner.config.verify_on_resume && status != ResumeStatus::NoSavedState {
                let cleared = inner.store.verify_all().await?;
                if cleared > 0 {
                    warn!(cleared, "pieces failed verification on resume");
                }
            }
        }

        inner.scheduler.lock().enqueue_missing(&inner.store.bitfield());

        let listener = inner.bind_listener().await;

        let Some(events_rx) = inner.events_rx.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        let mut tasks = vec![
            tokio::spawn(Arc::clone(inner).event_loop(events_rx)),
            tokio::spawn(Arc::clone(inner).scheduler_loop()),
            tokio::spawn(Arc::clone(inner).upload_loop()),
            tokio::spawn(Arc::clone(inner).choke_loop()),
            tokio::spawn(Arc::clone(inner).tracker_loop()),
        ];
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(Arc::clone(inner).listen_loop(listener)));
        }
        inner.tasks.lock().extend(tasks);

        info!(
            name = %inner.session.name,
            info_hash = %inner.session.info_hash_hex(),
            "session started"
        );
        Ok(())
    }

    /// Stops issuing requests and serving uploads until [`unpause`](Self::unpause).
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            info!("paused");
        }
    }

    pub fn unpause(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!("unpaused");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Stops every task, closes every link and the listener, tells the
    /// tracker we stopped and writes the resume file. Later calls do nothing.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        inner.cancel.cancel();
        inner.registry.close_all();

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        join_all(tasks).await;

        if !inner.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let request = inner.announce_request(TrackerEvent::Stopped);
        match tokio::time::timeout(
            inner.config.tracker_timeout(),
            inner.tracker.announce(&request),
        )
        .await
        {
            Ok(Ok(_)) => debug!("announced stopped"),
            Ok(Err(e)) => debug!(error = %e, "stopped announce failed"),
            Err(_) => debug!("stopped announce timed out"),
        }

        inner.store.persist().await?;
        info!("session shut down");
        Ok(())
    }

    pub fn progress(&self) -> Progress {
        let inner = &self.inner;
        Progress {
            downloaded: inner.downloaded.load(Ordering::Relaxed),
            uploaded: inner.uploads.uploaded(),
            left: inner.store.bytes_left(),
            total: inner.session.file_length,
            completed_pieces: inner.store.completed_count(),
            piece_count: inner.session.piece_count(),
            connected_peers: inner.registry.connected_count(),
            paused: inner.paused.load(Ordering::Acquire),
            complete: inner.store.is_complete(),
        }
    }

    /// Replaces the outbound peer set with `peers`. New addresses are
    /// dialed up to `max_peers`; outbound links to addresses no longer
    /// listed are closed. Inbound links are left alone.
    pub fn set_peers(&self, peers: &[SocketAddr]) {
        self.inner.set_peers(peers);
    }

    /// The port the inbound listener is bound to, if any.
    pub fn listen_port(&self) -> Option<u16> {
        match self.inner.listen_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.settings.peer_id
    }

    pub fn session(&self) -> &SessionInfo {
        &self.inner.session
    }

    pub fn store(&self) -> &PieceStore {
        &self.inner.store
    }

    pub fn tracker(&self) -> &T {
        &self.inner.tracker
    }

    pub fn peers(&self) -> Vec<Arc<PeerLink>> {
        self.inner.registry.links()
    }
}

impl<T: Announce> Inner<T> {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn bind_listener(&self) -> Option<TcpListener> {
        for port in self.config.listen_port_start..=self.config.listen_port_end {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(listener) => {
                    self.listen_port.store(port, Ordering::Release);
                    info!(port, "listening for peers");
                    return Some(listener);
                }
                Err(e) => trace!(port, error = %e, "port unavailable"),
            }
        }
        warn!(
            start = self.config.listen_port_start,
            end = self.config.listen_port_end,
            "no listen port available, inbound connections disabled"
        );
        None
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        let port = match self.listen_port.load(Ordering::Acquire) {
            0 => self.config.listen_port_start,
            port => port,
        };
        AnnounceRequest {
            info_hash: self.session.info_hash,
            peer_id: self.settings.peer_id.0,
            port,
            uploaded: self.uploads.uploaded(),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.store.bytes_left(),
            event,
        }
    }

    fn set_peers(self: &Arc<Self>, peers: &[SocketAddr]) {
        for link in self.registry.outbound_not_in(peers) {
            debug!(peer = %link.addr(), "peer dropped by tracker");
            link.close();
            self.forget(&link);
        }

        let mut seen = HashSet::new();
        for &addr in peers {
            if !seen.insert(addr) || self.registry.contains(&addr) {
                continue;
            }
            if self.registry.len() >= self.config.max_peers {
                debug!("peer limit reached");
                break;
            }
            let link = PeerLink::new(addr, Direction::Outbound, &self.cancel);
            if !self.registry.insert(Arc::clone(&link)) {
                continue;
            }

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                match link.connect(&inner.settings, inner.events_tx.clone()).await {
                    Ok(()) => inner.on_established(&link),
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "connect failed");
                        inner.registry.remove(&link);
                    }
                }
            });
        }
    }

    fn on_established(&self, link: &Arc<PeerLink>) {
        if link.remote_id() == Some(self.settings.peer_id) {
            debug!(peer = %link.addr(), "connected to ourselves");
            link.close();
            self.registry.remove(link);
            return;
        }

        let ours = self.store.bitfield();
        if !ours.is_empty() {
            link.send_bitfield(&ours);
        }
        if !ours.is_complete() {
            link.send_interested();
        }
        let class = self.choker.admit(Arc::clone(link));
        debug!(peer = %link.addr(), ?class, "peer admitted");
    }

    /// Drops every trace of a closed link outside the choke lists, which
    /// prune themselves at the next tick.
    fn forget(&self, link: &Arc<PeerLink>) {
        if self.registry.remove(link) {
            self.scheduler.lock().remove_peer(link.addr());
            self.uploads.remove_peer(link.addr());
        }
    }

    async fn listen_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.registry.len() >= self.config.max_peers {
                debug!(peer = %addr, "rejecting inbound peer, limit reached");
                continue;
            }
            let link = PeerLink::new(addr, Direction::Inbound, &self.cancel);
            if !self.registry.insert(Arc::clone(&link)) {
                continue;
            }
            let _ = stream.set_nodelay(true);

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                match link
                    .establish(stream, &inner.settings, inner.events_tx.clone())
                    .await
                {
                    Ok(()) => inner.on_established(&link),
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "inbound handshake failed");
                        inner.registry.remove(&link);
                    }
                }
            });
        }
        debug!("listener stopped");
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: PeerEvent) {
        let addr = event.addr;
        let Some(link) = self.registry.get(&addr) else {
            return;
        };

        match event.kind {
            PeerEventKind::Have(piece) => {
                if piece as usize >= self.session.piece_count() {
                    debug!(peer = %addr, piece, "have for unknown piece");
                    return;
                }
                self.scheduler.lock().add_holder(piece, addr);
                if !self.store.have(piece) {
                    link.send_interested();
                }
            }
            PeerEventKind::Bitfield(bytes) => {
                let theirs = match Bitfield::try_from_bytes(&bytes, self.session.piece_count()) {
                    Ok(theirs) => theirs,
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "bad bitfield");
                        link.close();
                        return;
                    }
                };
                self.scheduler.lock().add_holders(&theirs, addr);
                if theirs.has_any_missing_from(&self.store.bitfield()) {
                    link.send_interested();
                }
            }
            PeerEventKind::Request(request) => {
                self.uploads.enqueue(UploadRequest::new(request, addr));
            }
            PeerEventKind::Cancel(request) => {
                self.uploads.cancel(&UploadRequest::new(request, addr));
            }
            PeerEventKind::Piece(block) => {
                let piece = block.piece;
                self.downloaded
                    .fetch_add(block.data.len() as u64, Ordering::Relaxed);
                match self.store.store_block(block).await {
                    Ok(StoreOutcome::CompleteAndVerified) => self.on_piece_complete(piece),
                    Ok(StoreOutcome::CorruptReset) => {
                        warn!(peer = %addr, piece, "piece failed verification");
                        self.scheduler.lock().requeue(piece);
                    }
                    Ok(StoreOutcome::NeedMore | StoreOutcome::DuplicateIgnored) => {}
                    Err(StorageError::Io(e)) => {
                        warn!(piece, error = %e, "failed to store block");
                        self.scheduler.lock().requeue(piece);
                    }
                    Err(e) => debug!(peer = %addr, error = %e, "rejected block"),
                }
            }
            PeerEventKind::Disconnected => {
                debug!(peer = %addr, "peer disconnected");
                self.forget(&link);
            }
        }
    }

    fn on_piece_complete(&self, piece: u32) {
        self.scheduler.lock().on_complete(piece);

        let links = self.registry.connected();
        for link in &links {
            link.send_have(piece);
        }
        debug!(
            piece,
            completed = self.store.completed_count(),
            total = self.session.piece_count(),
            "piece verified"
        );

        if self.store.is_complete() && !self.finished_this_run.swap(true, Ordering::AcqRel) {
            info!(name = %self.session.name, "download complete");
            for link in &links {
                link.send_not_interested();
            }
            self.completed.notify_one();
        }
    }

    async fn scheduler_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let sent = if self.is_paused() || self.store.is_complete() {
                0
            } else {
                self.schedule_round(Instant::now())
            };
            if sent > 0 {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(SCHEDULER_IDLE) => {}
            }
        }
    }

    /// Issues as many requests as the in-flight cap allows. Returns the
    /// number of requests sent.
    fn schedule_round(&self, now: Instant) -> usize {
        let ready: HashSet<SocketAddr> = self
            .registry
            .connected()
            .iter()
            .filter(|link| link.can_request())
            .map(|link| link.addr())
            .collect();
        if ready.is_empty() {
            return 0;
        }
        let is_ready = |addr: SocketAddr| ready.contains(&addr);

        let (endgame, assignments) = {
            let mut scheduler = self.scheduler.lock();
            let expired = scheduler.expire_stale(now);
            if !expired.is_empty() {
                debug!(?expired, "requeued stale pieces");
            }
            let endgame = scheduler.endgame_targets(now, is_ready);
            let mut assignments = Vec::new();
            while let Some(assignment) = scheduler.next_assignment(now, is_ready) {
                assignments.push(assignment);
            }
            (endgame, assignments)
        };

        let mut sent = 0;
        for assignment in endgame {
            sent += self.request_from_all(&assignment);
            trace!(piece = assignment.piece, holders = assignment.holders.len(), "end-game request");
        }

        for assignment in assignments {
            let accepted = self.request_from_all(&assignment);
            if accepted == 0 {
                self.scheduler.lock().requeue(assignment.piece);
            } else {
                trace!(piece = assignment.piece, holders = accepted, "requested piece");
                sent += accepted;
            }
        }
        sent
    }

    /// Sends a whole-piece request to every ready holder. Returns how many
    /// links accepted it.
    fn request_from_all(&self, assignment: &Assignment) -> usize {
        assignment
            .holders
            .iter()
            .filter_map(|addr| self.registry.get(addr))
            .filter(|link| link.send_request(assignment.piece, 0, assignment.length))
            .count()
    }

    async fn upload_loop(self: Arc<Self>) {
        while let Some(request) = self.uploads.next(&self.cancel).await {
            while self.is_paused() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(SCHEDULER_IDLE) => {}
                }
            }

            let peer = self.registry.get(&request.peer);
            match self
                .uploads
                .serve(request, peer, &self.choker, &self.store)
                .await
            {
                ServeOutcome::Sent(len) => {
                    trace!(peer = %request.peer, piece = request.piece, len, "uploaded block")
                }
                outcome => trace!(peer = %request.peer, ?outcome, "upload request dropped"),
            }
        }
    }

    async fn choke_loop(self: Arc<Self>) {
        let period = self.config.choke_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.choker.tick(self.store.is_complete());
                    let [choked, wait_list, active, optimistic] = self.choker.counts();
                    debug!(
                        baseline = report.baseline,
                        choked,
                        wait_list,
                        active,
                        optimistic,
                        pruned = report.pruned.len(),
                        displaced = report.displaced.len(),
                        "choke tick"
                    );
                }
            }
        }
    }

    async fn tracker_loop(self: Arc<Self>) {
        let retry = self.config.tracker_retry();
        let mut event = TrackerEvent::Started;

        loop {
            let request = self.announce_request(event);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = tokio::time::timeout(
                    self.config.tracker_timeout(),
                    self.tracker.announce(&request),
                ) => outcome,
            };

            let wait = match outcome {
                Ok(Ok(response)) => {
                    if let Some(warning) = &response.warning_message {
                        warn!(%warning, "tracker warning");
                    }
                    event = TrackerEvent::None;
                    if response.peers.is_empty() {
                        debug!("tracker returned no peers");
                        retry
                    } else {
                        debug!(peers = response.peers.len(), "tracker returned peers");
                        self.set_peers(&response.peers);
                        response.reannounce_after(DEFAULT_ANNOUNCE_INTERVAL)
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "announce failed");
                    retry
                }
                Err(_) => {
                    warn!("announce timed out");
                    retry
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.completed.notified() => event = TrackerEvent::Completed,
            }
        }
    }
}
