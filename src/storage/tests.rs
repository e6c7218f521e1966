use super::*;
use crate::metainfo::SessionInfo;
use crate::peer::Block;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn session_for(data: &[u8], piece_length: u32) -> Arc<SessionInfo> {
    let hashes = data
        .chunks(piece_length as usize)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();
    Arc::new(
        SessionInfo::new(
            "http://tracker.test/announce",
            [1u8; 20],
            "payload.bin",
            data.len() as u64,
            piece_length,
            hashes,
        )
        .unwrap(),
    )
}

async fn create_test_store(temp: &TempDir, session: Arc<SessionInfo>) -> PieceStore {
    let store = PieceStore::new(
        session,
        temp.path().join("payload.bin"),
        temp.path().join("payload.bin.resume"),
    );
    store.create_backing_file().await.unwrap();
    store
}

fn piece_block(data: &[u8], piece_length: u32, index: u32) -> Block {
    let start = (index * piece_length) as usize;
    let end = (start + piece_length as usize).min(data.len());
    Block::new(index, 0, Bytes::copy_from_slice(&data[start..end]))
}

fn corrupt_on_disk(path: &Path, offset: u64) {
    let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[0xEE]).unwrap();
}

#[tokio::test]
async fn test_create_backing_file_preallocates() {
    let temp = TempDir::new().unwrap();
    let data = payload(40_000);
    let store = PieceStore::new(
        session_for(&data, 16384),
        temp.path().join("nested/dir/payload.bin"),
        temp.path().join("payload.resume"),
    );

    store.create_backing_file().await.unwrap();

    let metadata = tokio::fs::metadata(store.path()).await.unwrap();
    assert_eq!(metadata.len(), 40_000);
}

#[tokio::test]
async fn test_exact_piece_verifies() {
    let temp = TempDir::new().unwrap();
    let data = payload(16384);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let outcome = store
        .store_block(Block::new(0, 0, Bytes::from(data.clone())))
        .await
        .unwrap();

    assert_eq!(outcome, StoreOutcome::CompleteAndVerified);
    assert!(store.have(0));
    assert!(store.is_complete());

    let on_disk = tokio::fs::read(store.path()).await.unwrap();
    assert_eq!(on_disk, data);
}

#[tokio::test]
async fn test_flipped_bit_resets_piece() {
    let temp = TempDir::new().unwrap();
    let data = payload(16384);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let mut bad = data.clone();
    bad[100] ^= 0x01;
    let outcome = store
        .store_block(Block::new(0, 0, Bytes::from(bad)))
        .await
        .unwrap();

    assert_eq!(outcome, StoreOutcome::CorruptReset);
    assert!(!store.have(0));
    assert_eq!(store.bytes_received().await, 0);

    // a clean retry still completes
    let outcome = store
        .store_block(Block::new(0, 0, Bytes::from(data)))
        .await
        .unwrap();
    assert_eq!(outcome, StoreOutcome::CompleteAndVerified);
}

#[tokio::test]
async fn test_blocks_accumulate_into_piece() {
    let temp = TempDir::new().unwrap();
    let data = payload(16384);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let second = Block::new(0, 8192, Bytes::copy_from_slice(&data[8192..]));
    assert_eq!(store.store_block(second).await.unwrap(), StoreOutcome::NeedMore);
    assert_eq!(store.bytes_received().await, 8192);
    assert!(!store.have(0));

    let first = Block::new(0, 0, Bytes::copy_from_slice(&data[..8192]));
    assert_eq!(
        store.store_block(first).await.unwrap(),
        StoreOutcome::CompleteAndVerified
    );
    assert_eq!(store.bytes_received().await, 16384);
}

#[tokio::test]
async fn test_redelivered_block_not_double_counted() {
    let temp = TempDir::new().unwrap();
    let data = payload(16384);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let first = Block::new(0, 0, Bytes::copy_from_slice(&data[..8192]));
    assert_eq!(
        store.store_block(first.clone()).await.unwrap(),
        StoreOutcome::NeedMore
    );
    assert_eq!(
        store.store_block(first).await.unwrap(),
        StoreOutcome::NeedMore
    );
    assert_eq!(store.bytes_received().await, 8192);
    assert!(!store.have(0));
}

#[tokio::test]
async fn test_duplicate_piece_ignored() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let block = piece_block(&data, 16384, 1);
    assert_eq!(
        store.store_block(block.clone()).await.unwrap(),
        StoreOutcome::CompleteAndVerified
    );
    assert_eq!(
        store.store_block(block).await.unwrap(),
        StoreOutcome::DuplicateIgnored
    );
    assert!(store.have(1));
}

#[tokio::test]
async fn test_duplicate_after_disk_corruption_is_restored() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    let block = piece_block(&data, 16384, 0);
    store.store_block(block.clone()).await.unwrap();
    corrupt_on_disk(store.path(), 10);

    assert_eq!(
        store.store_block(block).await.unwrap(),
        StoreOutcome::CompleteAndVerified
    );
    assert!(store.have(0));
    let on_disk = tokio::fs::read(store.path()).await.unwrap();
    assert_eq!(&on_disk[..16384], &data[..16384]);
}

#[tokio::test]
async fn test_unwritable_resume_file_keeps_verified_piece() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let resume_path = temp.path().join("state");
    std::fs::create_dir(&resume_path).unwrap();
    std::fs::write(resume_path.join("occupied"), b"x").unwrap();

    let store = PieceStore::new(
        session_for(&data, 16384),
        temp.path().join("payload.bin"),
        resume_path,
    );
    store.create_backing_file().await.unwrap();

    let outcome = store.store_block(piece_block(&data, 16384, 0)).await.unwrap();
    assert_eq!(outcome, StoreOutcome::CompleteAndVerified);
    assert!(store.have(0));
    assert!(store.persist().await.is_err());

    let outcome = store.store_block(piece_block(&data, 16384, 0)).await.unwrap();
    assert_eq!(outcome, StoreOutcome::DuplicateIgnored);
}

#[tokio::test]
async fn test_short_last_piece() {
    let temp = TempDir::new().unwrap();
    let data = payload(40_000);
    let session = session_for(&data, 16384);
    assert_eq!(session.last_piece_length, 40_000 - 32768);
    let store = create_test_store(&temp, session).await;

    let last = piece_block(&data, 16384, 2);
    assert_eq!(last.data.len(), 40_000 - 32768);
    assert_eq!(
        store.store_block(last).await.unwrap(),
        StoreOutcome::CompleteAndVerified
    );
    assert_eq!(store.bytes_on_disk(), (40_000 - 32768) as u64);
    assert_eq!(store.bytes_left(), 32768);
}

#[tokio::test]
async fn test_out_of_range_blocks_rejected() {
    let temp = TempDir::new().unwrap();
    let data = payload(40_000);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    assert!(matches!(
        store
            .store_block(Block::new(3, 0, Bytes::from_static(b"x")))
            .await,
        Err(StorageError::InvalidPieceIndex(3))
    ));

    let overhang = Block::new(2, 7000, Bytes::from(vec![0u8; 1000]));
    assert!(matches!(
        store.store_block(overhang).await,
        Err(StorageError::InvalidBlock { piece: 2, .. })
    ));
}

#[tokio::test]
async fn test_retrieve_block_returns_verified_range() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    assert_eq!(store.retrieve_block(1, 0, 16).await, None);

    store
        .store_block(piece_block(&data, 16384, 1))
        .await
        .unwrap();

    let block = store.retrieve_block(1, 100, 50).await.unwrap();
    assert_eq!(&block[..], &data[16384 + 100..16384 + 150]);

    assert_eq!(store.retrieve_block(1, 16000, 1000).await, None);
}

#[tokio::test]
async fn test_retrieve_block_clears_corrupt_piece() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    store
        .store_block(piece_block(&data, 16384, 0))
        .await
        .unwrap();
    corrupt_on_disk(store.path(), 5);

    assert_eq!(store.retrieve_block(0, 0, 16384).await, None);
    assert!(!store.have(0));
}

#[tokio::test]
async fn test_resume_restores_completed_set() {
    let temp = TempDir::new().unwrap();
    let data = payload(40_000);
    let session = session_for(&data, 16384);

    let bytes_before = {
        let store = create_test_store(&temp, session.clone()).await;
        store
            .store_block(piece_block(&data, 16384, 0))
            .await
            .unwrap();
        store
            .store_block(piece_block(&data, 16384, 2))
            .await
            .unwrap();
        store.bytes_on_disk()
    };

    let store = create_test_store(&temp, session).await;
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::Partial);
    assert!(store.have(0));
    assert!(!store.have(1));
    assert!(store.have(2));
    assert_eq!(store.bytes_on_disk(), bytes_before);
    assert_eq!(store.bytes_received().await, bytes_before);
}

#[tokio::test]
async fn test_resume_statuses() {
    let temp = TempDir::new().unwrap();
    let data = payload(16384);
    let session = session_for(&data, 16384);
    let store = create_test_store(&temp, session.clone()).await;

    assert_eq!(store.resume().await.unwrap(), ResumeStatus::NoSavedState);

    store.persist().await.unwrap();
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::NoneComplete);

    store
        .store_block(Block::new(0, 0, Bytes::from(data)))
        .await
        .unwrap();
    let fresh = create_test_store(&temp, session).await;
    assert_eq!(fresh.resume().await.unwrap(), ResumeStatus::AllComplete);
}

#[tokio::test]
async fn test_resume_rejects_corrupt_file() {
    let temp = TempDir::new().unwrap();
    let data = payload(40_000);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    tokio::fs::write(store.resume_path(), b"RSWM").await.unwrap();
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::NoSavedState);

    // right header, wrong piece count
    tokio::fs::write(store.resume_path(), b"RSWM\x01\x00\x00\x00\x05\xf8")
        .await
        .unwrap();
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::NoSavedState);

    // pad bits set
    tokio::fs::write(store.resume_path(), b"RSWM\x01\x00\x00\x00\x03\xf0")
        .await
        .unwrap();
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::NoSavedState);

    tokio::fs::write(store.resume_path(), b"RSWM\x01\x00\x00\x00\x03\xa0")
        .await
        .unwrap();
    assert_eq!(store.resume().await.unwrap(), ResumeStatus::Partial);
    assert!(store.have(0));
    assert!(store.have(2));
}

#[tokio::test]
async fn test_verify_all_clears_bad_pieces() {
    let temp = TempDir::new().unwrap();
    let data = payload(32768);
    let store = create_test_store(&temp, session_for(&data, 16384)).await;

    store
        .store_block(piece_block(&data, 16384, 0))
        .await
        .unwrap();
    store
        .store_block(piece_block(&data, 16384, 1))
        .await
        .unwrap();
    corrupt_on_disk(store.path(), 16384 + 3);

    assert_eq!(store.verify_all().await.unwrap(), 1);
    assert!(store.have(0));
    assert!(!store.have(1));
}
