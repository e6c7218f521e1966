use std::future::Future;

use super::error::TrackerError;
use super::response::{AnnounceResponse, TrackerEvent};

/// Parameters of one announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

/// Something that can be asked for peers.
pub trait Announce: Send + Sync + 'static {
    fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> impl Future<Output = Result<AnnounceResponse, TrackerError>> + Send;
}
