use super::*;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_tag(), Some("RS0100"));
}

#[test]
fn test_bitfield_set_clear() {
    let mut bf = Bitfield::new(11);
    assert!(bf.is_empty());
    assert_eq!(bf.as_bytes().len(), 2);

    bf.set(0);
    bf.set(10);
    assert!(bf.has(0));
    assert!(bf.has(10));
    assert_eq!(bf.as_bytes(), &[0x80, 0x20]);

    bf.clear(0);
    assert!(!bf.has(0));
    assert_eq!(bf.count(), 1);

    // out of range is ignored
    bf.set(11);
    assert_eq!(bf.count(), 1);
    assert!(!bf.has(11));
}

#[test]
fn test_bitfield_full_clears_pad_bits() {
    let bf = Bitfield::full(10);
    assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
    assert!(bf.is_complete());
}

#[test]
fn test_bitfield_from_peer_bytes_masks_pad_bits() {
    let bf = Bitfield::from_bytes(&[0xFF, 0xFF, 0xFF], 10);
    assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);

    let short = Bitfield::from_bytes(&[0x80], 10);
    assert!(short.has(0));
    assert!(!short.has(9));
}

#[test]
fn test_bitfield_try_from_bytes_is_strict() {
    assert!(Bitfield::try_from_bytes(&[0xFF, 0xC0], 10).is_ok());
    assert!(Bitfield::try_from_bytes(&[0xFF, 0xE0], 10).is_err());
    assert!(Bitfield::try_from_bytes(&[0xFF], 10).is_err());
    assert!(Bitfield::try_from_bytes(&[], 0).is_ok());
}

#[test]
fn test_bitfield_missing_and_interest() {
    let mut ours = Bitfield::new(4);
    ours.set(0);
    ours.set(1);

    let mut theirs = Bitfield::new(4);
    theirs.set(1);
    assert!(!theirs.has_any_missing_from(&ours));

    theirs.set(3);
    assert!(theirs.has_any_missing_from(&ours));
    assert_eq!(ours.missing().collect::<Vec<_>>(), vec![2, 3]);
}

#[test]
fn test_handshake_layout() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();

    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");
    assert_eq!(&encoded[20..28], &[0u8; 8]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
}

#[test]
fn test_handshake_rejects_bad_protocol() {
    let mut encoded = Handshake::new([1u8; 20], [2u8; 20]).encode().to_vec();
    encoded[0] = 18;
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::InvalidHandshake)
    ));

    let mut encoded = Handshake::new([1u8; 20], [2u8; 20]).encode().to_vec();
    encoded[5] = b'X';
    assert!(Handshake::decode(&encoded).is_err());

    assert!(Handshake::decode(&[19u8; 40]).is_err());
}

#[test]
fn test_have_request_piece_encode_decode() {
    let have = Message::Have { piece: 42 };
    let encoded = have.encode();
    assert_eq!(&encoded[..], &[0, 0, 0, 5, 4, 0, 0, 0, 42]);
    assert_eq!(Message::decode(encoded).unwrap(), Some(have));

    let request = Message::Request {
        index: 3,
        begin: 16384,
        length: 16384,
    };
    assert_eq!(Message::decode(request.encode()).unwrap(), Some(request));

    let piece = Message::Piece {
        index: 7,
        begin: 32,
        data: Bytes::from_static(b"block data"),
    };
    let encoded = piece.encode();
    assert_eq!(&encoded[..4], &(9u32 + 10).to_be_bytes());
    assert_eq!(Message::decode(encoded).unwrap(), Some(piece));
}

#[test]
fn test_keepalive_is_zero_length() {
    let encoded = Message::KeepAlive.encode();
    assert_eq!(&encoded[..], &[0, 0, 0, 0]);
    assert_eq!(Message::decode(encoded).unwrap(), Some(Message::KeepAlive));
}

#[test]
fn test_negative_length_is_violation() {
    assert!(matches!(
        Message::frame_len(0xFFFF_FFFF),
        Err(PeerError::InvalidLength(-1))
    ));
    assert!(Message::frame_len(0x8000_0000).is_err());
    assert_eq!(Message::frame_len(13).unwrap(), 13);
}

#[test]
fn test_unknown_message_id_is_skipped() {
    let body = Bytes::from_static(&[20, 1, 2, 3]);
    assert_eq!(Message::decode_body(body).unwrap(), None);
}

#[test]
fn test_short_payload_is_violation() {
    let body = Bytes::from_static(&[6, 0, 0, 0, 1]);
    assert!(matches!(
        Message::decode_body(body),
        Err(PeerError::InvalidMessage(_))
    ));

    let body = Bytes::from_static(&[4, 0]);
    assert!(Message::decode_body(body).is_err());
}

// ---------------------------------------------------------------------------
// Link tests over in-memory streams
// ---------------------------------------------------------------------------

const INFO_HASH: [u8; 20] = [7u8; 20];

fn settings(info_hash: [u8; 20]) -> LinkSettings {
    LinkSettings {
        info_hash,
        peer_id: PeerId::generate(),
        keepalive_interval: Duration::from_secs(120),
        read_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

struct Pair {
    dialer: Arc<PeerLink>,
    listener: Arc<PeerLink>,
    dialer_events: mpsc::Receiver<PeerEvent>,
    listener_events: mpsc::Receiver<PeerEvent>,
}

async fn linked_pair() -> Pair {
    let token = CancellationToken::new();
    let (a, b) = tokio::io::duplex(1 << 20);
    let (dialer_tx, dialer_events) = mpsc::channel(64);
    let (listener_tx, listener_events) = mpsc::channel(64);

    let dialer = PeerLink::new(addr(6001), Direction::Outbound, &token);
    let listener = PeerLink::new(addr(6002), Direction::Inbound, &token);
    let s1 = settings(INFO_HASH);
    let s2 = settings(INFO_HASH);

    let (r1, r2) = tokio::join!(
        dialer.establish(a, &s1, dialer_tx),
        listener.establish(b, &s2, listener_tx)
    );
    r1.unwrap();
    r2.unwrap();

    Pair {
        dialer,
        listener,
        dialer_events,
        listener_events,
    }
}

/// Completes the handshake from a bare stream and returns it.
async fn raw_peer(link: &Arc<PeerLink>, events: mpsc::Sender<PeerEvent>) -> DuplexStream {
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    theirs
        .write_all(&Handshake::new(INFO_HASH, [9u8; 20]).encode())
        .await
        .unwrap();
    link.establish(ours, &settings(INFO_HASH), events)
        .await
        .unwrap();
    let mut reply = [0u8; 68];
    theirs.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[28..48], &INFO_HASH);
    theirs
}

#[tokio::test]
async fn test_link_handshake_establishes_both_sides() {
    let pair = linked_pair().await;

    assert_eq!(pair.dialer.state(), LinkState::Established);
    assert_eq!(pair.listener.state(), LinkState::Established);
    assert_eq!(pair.dialer.flags(), PeerFlags::default());
    assert_eq!(
        pair.listener.remote_id().and_then(|id| id.client_tag().map(String::from)),
        Some("RS0100".to_string())
    );
}

#[tokio::test]
async fn test_link_info_hash_mismatch_disconnects() {
    let token = CancellationToken::new();
    let (a, b) = tokio::io::duplex(4096);
    let (tx1, _rx1) = mpsc::channel(8);
    let (tx2, _rx2) = mpsc::channel(8);

    let dialer = PeerLink::new(addr(6001), Direction::Outbound, &token);
    let listener = PeerLink::new(addr(6002), Direction::Inbound, &token);
    let s1 = settings([1u8; 20]);
    let s2 = settings([2u8; 20]);

    let (r1, r2) = tokio::join!(
        dialer.establish(a, &s1, tx1),
        listener.establish(b, &s2, tx2)
    );

    assert!(r1.is_err());
    assert!(matches!(r2, Err(PeerError::InfoHashMismatch)));
    assert_eq!(dialer.state(), LinkState::Disconnected);
    assert_eq!(listener.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_link_flags_follow_remote_messages() {
    let pair = linked_pair().await;

    pair.dialer.send_interested();
    let listener = pair.listener.clone();
    wait_until(|| listener.flags().peer_interested).await;

    pair.listener.send_unchoke();
    let dialer = pair.dialer.clone();
    wait_until(|| !dialer.flags().peer_choking).await;

    pair.listener.send_choke();
    wait_until(|| dialer.flags().peer_choking).await;
}

#[tokio::test]
async fn test_link_request_gated_on_interest_and_unchoke() {
    let mut pair = linked_pair().await;

    assert!(!pair.dialer.send_request(0, 0, 16384));

    pair.dialer.send_interested();
    assert!(!pair.dialer.send_request(0, 0, 16384));

    pair.listener.send_unchoke();
    let dialer = pair.dialer.clone();
    wait_until(|| dialer.can_request()).await;

    assert!(pair.dialer.send_request(0, 0, 16384));
    let event = pair.listener_events.recv().await.unwrap();
    assert_eq!(event.addr, addr(6002));
    assert_eq!(
        event.kind,
        PeerEventKind::Request(BlockRequest::new(0, 0, 16384))
    );
}

#[tokio::test]
async fn test_link_piece_gated_on_unchoke_and_peer_interest() {
    let mut pair = linked_pair().await;
    let data = Bytes::from_static(b"0123456789abcdef");

    assert!(!pair.listener.send_piece(1, 0, data.clone()));

    pair.listener.send_unchoke();
    assert!(!pair.listener.send_piece(1, 0, data.clone()));

    pair.dialer.send_interested();
    let listener = pair.listener.clone();
    wait_until(|| listener.flags().peer_interested).await;

    assert!(pair.listener.send_piece(1, 0, data.clone()));
    assert_eq!(pair.listener.uploaded_since_reset(), 16);

    let event = pair.dialer_events.recv().await.unwrap();
    assert_eq!(event.kind, PeerEventKind::Piece(Block::new(1, 0, data)));
    assert_eq!(pair.dialer.downloaded_since_reset(), 16);

    pair.dialer.reset_counters();
    assert_eq!(pair.dialer.downloaded_since_reset(), 0);
    assert_eq!(pair.dialer.downloaded_total(), 16);
}

#[tokio::test]
async fn test_link_forwards_have_and_bitfield() {
    let mut pair = linked_pair().await;

    let mut bf = Bitfield::new(9);
    bf.set(8);
    pair.dialer.send_bitfield(&bf);
    pair.dialer.send_have(3);

    let first = pair.listener_events.recv().await.unwrap();
    assert_eq!(first.kind, PeerEventKind::Bitfield(bf.to_bytes()));
    let second = pair.listener_events.recv().await.unwrap();
    assert_eq!(second.kind, PeerEventKind::Have(3));
}

#[tokio::test]
async fn test_link_negative_length_disconnects() {
    let token = CancellationToken::new();
    let link = PeerLink::new(addr(7000), Direction::Inbound, &token);
    let (tx, mut rx) = mpsc::channel(8);
    let mut raw = raw_peer(&link, tx).await;

    raw.write_all(&[0xFF, 0xFF, 0xFF, 0xF0]).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, PeerEventKind::Disconnected);
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(!link.is_connected());
}

#[tokio::test]
async fn test_link_skips_unknown_ids_and_keepalives() {
    let token = CancellationToken::new();
    let link = PeerLink::new(addr(7000), Direction::Inbound, &token);
    let (tx, mut rx) = mpsc::channel(8);
    let mut raw = raw_peer(&link, tx).await;

    raw.write_all(&[0, 0, 0, 0]).await.unwrap();
    raw.write_all(&[0, 0, 0, 2, 20, 0]).await.unwrap();
    raw.write_all(&Message::Have { piece: 7 }.encode()).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, PeerEventKind::Have(7));
    assert!(link.is_connected());
}

#[tokio::test]
async fn test_link_sends_keepalive() {
    let token = CancellationToken::new();
    let link = PeerLink::new(addr(7000), Direction::Inbound, &token);
    let (tx, _rx) = mpsc::channel(8);
    let (ours, mut theirs) = tokio::io::duplex(4096);
    theirs
        .write_all(&Handshake::new(INFO_HASH, [9u8; 20]).encode())
        .await
        .unwrap();

    let mut s = settings(INFO_HASH);
    s.keepalive_interval = Duration::from_millis(50);
    link.establish(ours, &s, tx).await.unwrap();

    let mut reply = [0u8; 68];
    theirs.read_exact(&mut reply).await.unwrap();
    let mut frame = [0xAAu8; 4];
    theirs.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0, 0, 0, 0]);
}

#[tokio::test]
async fn test_link_silent_peer_times_out() {
    let token = CancellationToken::new();
    let link = PeerLink::new(addr(7000), Direction::Inbound, &token);
    let (tx, mut rx) = mpsc::channel(8);
    let (ours, mut theirs) = tokio::io::duplex(4096);
    theirs
        .write_all(&Handshake::new(INFO_HASH, [9u8; 20]).encode())
        .await
        .unwrap();

    let mut s = settings(INFO_HASH);
    s.read_timeout = Duration::from_millis(100);
    link.establish(ours, &s, tx).await.unwrap();
    let mut reply = [0u8; 68];
    theirs.read_exact(&mut reply).await.unwrap();

    // the stream stays open but nothing more is written
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("link outlived its read timeout")
        .unwrap();
    assert_eq!(event.kind, PeerEventKind::Disconnected);
    assert_eq!(link.state(), LinkState::Disconnected);
    drop(theirs);
}

#[tokio::test]
async fn test_link_close_is_idempotent_and_silences_sends() {
    let pair = linked_pair().await;

    pair.dialer.close();
    pair.dialer.close();
    assert_eq!(pair.dialer.state(), LinkState::Disconnected);

    pair.dialer.set_flags(PeerFlags {
        am_choking: false,
        peer_choking: false,
        am_interested: true,
        peer_interested: true,
    });
    assert!(!pair.dialer.send_request(0, 0, 1));
    assert!(!pair.dialer.send_piece(0, 0, Bytes::from_static(b"x")));

    let listener = pair.listener.clone();
    wait_until(|| !listener.is_connected()).await;
}

#[tokio::test]
async fn test_parent_token_cancels_links() {
    let token = CancellationToken::new();
    let link = PeerLink::new(addr(7000), Direction::Inbound, &token);
    let (tx, mut rx) = mpsc::channel(8);
    let _raw = raw_peer(&link, tx).await;

    token.cancel();
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, PeerEventKind::Disconnected);
    assert_eq!(link.state(), LinkState::Disconnected);
}
