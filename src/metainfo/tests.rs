use super::*;
use sha1::{Digest, Sha1};

fn torrent(info: &[u8]) -> Vec<u8> {
    let mut out = b"d8:announce28:http://tracker.test/announce4:info".to_vec();
    out.extend_from_slice(info);
    out.push(b'e');
    out
}

fn single_file_info(length: u64, piece_length: u32, pieces: usize) -> Vec<u8> {
    let mut info = format!("d6:lengthi{length}e4:name8:file.bin12:piece lengthi{piece_length}e6:pieces{}:", pieces * 20)
        .into_bytes();
    for i in 0..pieces {
        info.extend_from_slice(&[i as u8; 20]);
    }
    info.push(b'e');
    info
}

#[test]
fn test_parse_single_file_torrent() {
    let info = single_file_info(40_000, 16384, 3);
    let data = torrent(&info);

    let session = SessionInfo::from_torrent_bytes(&data).unwrap();
    assert_eq!(session.announce, "http://tracker.test/announce");
    assert_eq!(session.name, "file.bin");
    assert_eq!(session.file_length, 40_000);
    assert_eq!(session.piece_length, 16384);
    assert_eq!(session.piece_count(), 3);
    assert_eq!(session.last_piece_length, 40_000 - 2 * 16384);
    assert_eq!(session.piece_hash(2), Some(&[2u8; 20]));

    let expected: [u8; 20] = Sha1::digest(&info).into();
    assert_eq!(session.info_hash, expected);
}

#[test]
fn test_exact_multiple_has_full_last_piece() {
    let session = SessionInfo::new("u", [0; 20], "n", 32768, 16384, vec![[0; 20]; 2]).unwrap();
    assert_eq!(session.last_piece_length, 16384);
    assert_eq!(session.piece_len(1), 16384);
    assert_eq!(session.piece_len(2), 0);
    assert_eq!(session.piece_offset(1), 16384);
}

#[test]
fn test_hash_count_must_match_length() {
    assert!(matches!(
        SessionInfo::new("u", [0; 20], "n", 40_000, 16384, vec![[0; 20]; 2]),
        Err(MetainfoError::InvalidField("pieces"))
    ));
    assert!(SessionInfo::new("u", [0; 20], "n", 10, 0, vec![]).is_err());
}

#[test]
fn test_multi_file_rejected() {
    let info = b"d5:filesld6:lengthi1e4:pathl1:aeee4:name1:d12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
    assert!(matches!(
        SessionInfo::from_torrent_bytes(&torrent(info)),
        Err(MetainfoError::MultiFile)
    ));
}

#[test]
fn test_missing_fields() {
    assert!(matches!(
        SessionInfo::from_torrent_bytes(b"d4:infod6:lengthi1eee"),
        Err(MetainfoError::MissingField("announce"))
    ));
    assert!(matches!(
        SessionInfo::from_torrent_bytes(b"d8:announce1:ue"),
        Err(MetainfoError::MissingField("info"))
    ));
    assert!(matches!(
        SessionInfo::from_torrent_bytes(b"i1e"),
        Err(MetainfoError::InvalidField("root"))
    ));
}

#[test]
fn test_info_hash_hex() {
    let mut hash = [0u8; 20];
    hash[0] = 0xab;
    hash[19] = 0x01;
    let session = SessionInfo::new("u", hash, "n", 1, 1, vec![[0; 20]]).unwrap();
    assert_eq!(
        session.info_hash_hex(),
        "ab00000000000000000000000000000000000001"
    );
}
