use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::choker::ChokeController;
use crate::peer::{BlockRequest, RemotePeer};
use crate::storage::PieceStore;

/// A block some peer asked us for. Equal when all four fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
    pub peer: SocketAddr,
}

impl UploadRequest {
    pub fn new(request: BlockRequest, peer: SocketAddr) -> Self {
        Self {
            piece: request.piece,
            offset: request.offset,
            length: request.length,
            peer,
        }
    }
}

/// What happened to one dequeued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Sent(u32),
    /// Peer is not in the active or optimistic list.
    Unauthorized,
    /// Block missing, out of range, or failed re-verification.
    Unavailable,
    Disconnected,
    /// The link refused to send, e.g. the peer withdrew interest.
    Suppressed,
}

/// FIFO queue of inbound block requests, drained by a single consumer.
#[derive(Debug)]
pub struct UploadServicer {
    queue: Mutex<VecDeque<UploadRequest>>,
    notify: Notify,
    per_peer_cap: usize,
    uploaded: AtomicU64,
}

impl UploadServicer {
    pub fn new(per_peer_cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            per_peer_cap,
            uploaded: AtomicU64::new(0),
        }
    }

    /// Queues a request. Duplicates and requests beyond the peer's queue
    /// allowance are dropped; returns whether the request was queued.
    pub fn enqueue(&self, request: UploadRequest) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.contains(&request) {
                return false;
            }
            let queued = queue.iter().filter(|r| r.peer == request.peer).count();
            if queued >= self.per_peer_cap {
                trace!(peer = %request.peer, "upload queue full for peer");
                return false;
            }
            queue.push_back(request);
        }
        self.notify.notify_one();
        true
    }

    /// Removes a matching queued request. Returns whether one was found.
    pub fn cancel(&self, request: &UploadRequest) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|r| r == request) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drops everything queued for `peer`.
    pub fn remove_peer(&self, peer: SocketAddr) {
        self.queue.lock().retain(|r| r.peer != peer);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Session-wide bytes sent.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Waits for the next request. Returns `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<UploadRequest> {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.queue.lock().pop_front() {
                return Some(request);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Serves one request through the reciprocity gate.
    pub async fn serve<P: RemotePeer>(
        &self,
        request: UploadRequest,
        peer: Option<Arc<P>>,
        choker: &ChokeController<P>,
        store: &PieceStore,
    ) -> ServeOutcome {
        let Some(peer) = peer.filter(|p| p.is_connected()) else {
            return ServeOutcome::Disconnected;
        };
        if !choker.is_authorized(request.peer) {
            trace!(peer = %request.peer, piece = request.piece, "dropping request from choked peer");
            return ServeOutcome::Unauthorized;
        }

        let Some(data) = store
            .retrieve_block(request.piece, request.offset, request.length)
            .await
        else {
            debug!(peer = %request.peer, piece = request.piece, "requested block unavailable");
            return ServeOutcome::Unavailable;
        };

        if !peer.send_block(request.piece, request.offset, data) {
            return ServeOutcome::Suppressed;
        }
        self.uploaded
            .fetch_add(u64::from(request.length), Ordering::Relaxed);
        ServeOutcome::Sent(request.length)
    }
}
