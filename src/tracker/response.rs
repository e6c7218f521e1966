use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::error::TrackerError;
use crate::bencode::{decode, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    /// How long to wait before the next regular announce: `interval`,
    /// else `min interval`, else `fallback`.
    pub fn reannounce_after(&self, fallback: Duration) -> Duration {
        self.interval
            .or(self.min_interval)
            .filter(|&secs| secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(fallback)
    }
}

/// Decodes a bencoded announce response body.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    if let Some(failure) = value.get(b"failure reason").and_then(Value::as_str) {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let seconds = |key: &[u8]| {
        value
            .get(key)
            .and_then(Value::as_integer)
            .and_then(|n| u32::try_from(n).ok())
    };

    let mut response = AnnounceResponse {
        interval: seconds(b"interval"),
        min_interval: seconds(b"min interval"),
        peers: Vec::new(),
        warning_message: value
            .get(b"warning message")
            .and_then(Value::as_str)
            .map(String::from),
    };

    match value.get(b"peers") {
        Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(compact),
        Some(Value::List(list)) => {
            response.peers = list.iter().filter_map(dict_peer).collect();
        }
        Some(_) => return Err(TrackerError::InvalidResponse("peers has wrong type".into())),
        None => {}
    }

    Ok(response)
}

fn dict_peer(peer: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = peer.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(peer.get(b"port")?.as_integer()?).ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Parses the 6-bytes-per-peer compact format (IPv4 + big-endian port).
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
