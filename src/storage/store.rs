use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::StorageError;
use super::resume;
use crate::metainfo::SessionInfo;
use crate::peer::{Bitfield, Block};

/// Result of handing a block to [`PieceStore::store_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The piece is still missing bytes.
    NeedMore,
    /// The piece hashed correctly and is now on disk.
    CompleteAndVerified,
    /// The piece was already complete and still verifies.
    DuplicateIgnored,
    /// The assembled piece failed its hash (or could not be written) and
    /// its progress was discarded.
    CorruptReset,
}

/// What [`PieceStore::resume`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    /// Every piece was already complete.
    AllComplete,
    /// A valid save with no completed pieces.
    NoneComplete,
    /// Some but not all pieces were complete.
    Partial,
    /// No usable save file.
    NoSavedState,
}

/// A piece being assembled in memory.
struct Partial {
    buf: Vec<u8>,
    /// offset -> length of every block written so far
    blocks: BTreeMap<u32, u32>,
    received: u32,
}

impl Partial {
    fn new(length: u32) -> Self {
        Self {
            buf: vec![0; length as usize],
            blocks: BTreeMap::new(),
            received: 0,
        }
    }
}

struct PieceTable {
    file: Option<File>,
    partials: HashMap<u32, Partial>,
    /// bytes received per piece; a complete piece counts its full length
    received: Vec<u32>,
}

/// Owns the payload file, partial piece buffers and the completion bitfield.
///
/// All mutation happens under one async lock. The bitfield is mirrored in a
/// leaf `RwLock` that is only written while that lock is held, so
/// [`have`](Self::have) and friends never wait on disk I/O.
///
/// # Examples
///
/// ```no_run
/// use rswarm::{Block, PieceStore, SessionInfo, StoreOutcome};
/// use std::sync::Arc;
///
/// # async fn example(piece: bytes::Bytes) -> Result<(), Box<dyn std::error::Error>> {
/// let session = Arc::new(SessionInfo::from_torrent_file("debian.iso.torrent").await?);
/// let store = PieceStore::new(session, "debian.iso".into(), "debian.iso.resume".into());
/// store.create_backing_file().await?;
/// store.resume().await?;
///
/// if store.store_block(Block::new(0, 0, piece)).await? == StoreOutcome::CompleteAndVerified {
///     assert!(store.have(0));
/// }
/// # Ok(())
/// # }
/// ```
pub struct PieceStore {
    session: Arc<SessionInfo>,
    path: PathBuf,
    resume_path: PathBuf,
    table: Mutex<PieceTable>,
    bitfield: RwLock<Bitfield>,
}

impl PieceStore {
    pub fn new(session: Arc<SessionInfo>, path: PathBuf, resume_path: PathBuf) -> Self {
        let piece_count = session.piece_count();
        Self {
            session,
            path,
            resume_path,
            table: Mutex::new(PieceTable {
                file: None,
                partials: HashMap::new(),
                received: vec![0; piece_count],
            }),
            bitfield: RwLock::new(Bitfield::new(piece_count)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resume_path(&self) -> &Path {
        &self.resume_path
    }

    /// Creates the payload file at its full length (zero-filled) if it does
    /// not exist yet, and opens it for reading and writing.
    pub async fn create_backing_file(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;

        if file.metadata().await?.len() != self.session.file_length {
            file.set_len(self.session.file_length).await?;
        }

        debug!(path = %self.path.display(), length = self.session.file_length, "backing file ready");
        self.table.lock().await.file = Some(file);
        Ok(())
    }

    pub fn have(&self, index: u32) -> bool {
        self.bitfield.read().has(index as usize)
    }

    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.bitfield.read().count()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.read().is_complete()
    }

    /// Sum of the lengths of all completed pieces.
    pub fn bytes_on_disk(&self) -> u64 {
        let bitfield = self.bitfield.read();
        bitfield
            .ones()
            .map(|i| self.session.piece_len(i as u32) as u64)
            .sum()
    }

    pub fn bytes_left(&self) -> u64 {
        self.session.file_length - self.bytes_on_disk()
    }

    /// Sum of the per-piece received counters, partial pieces included.
    pub async fn bytes_received(&self) -> u64 {
        let table = self.table.lock().await;
        table.received.iter().map(|&n| n as u64).sum()
    }

    /// Accepts one block of piece data.
    pub async fn store_block(&self, block: Block) -> Result<StoreOutcome, StorageError> {
        let index = block.piece;
        let length = self.check_range(index, block.offset, block.data.len() as u32)?;
        let mut table = self.table.lock().await;

        if self.have(index) {
            match self.read_verified(&mut table, index).await {
                Ok(Some(_)) => return Ok(StoreOutcome::DuplicateIgnored),
                Ok(None) => warn!(piece = index, "completed piece no longer verifies"),
                Err(e) => warn!(piece = index, error = %e, "failed to re-read completed piece"),
            }
            self.bitfield.write().clear(index as usize);
            table.received[index as usize] = 0;
            self.save_progress().await;
        }

        let partial = table
            .partials
            .entry(index)
            .or_insert_with(|| Partial::new(length));

        let start = block.offset as usize;
        let len = block.data.len() as u32;
        partial.buf[start..start + block.data.len()].copy_from_slice(&block.data);
        if let Some(previous) = partial.blocks.insert(block.offset, len) {
            partial.received -= previous;
        }
        partial.received += len;
        let received = partial.received;

        if received < length {
            table.received[index as usize] = received;
            return Ok(StoreOutcome::NeedMore);
        }

        let Some(partial) = table.partials.remove(&index) else {
            return Ok(StoreOutcome::NeedMore);
        };
        let (matches, data) = self.hash_matches(index, partial.buf).await?;

        let written = if matches {
            match self.write_piece(&mut table, index, &data).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(piece = index, error = %e, "failed to write piece");
                    false
                }
            }
        } else {
            debug!(piece = index, "piece failed hash check");
            false
        };

        if written {
            self.bitfield.write().set(index as usize);
            table.received[index as usize] = length;
            self.save_progress().await;
            Ok(StoreOutcome::CompleteAndVerified)
        } else {
            self.bitfield.write().clear(index as usize);
            table.received[index as usize] = 0;
            self.save_progress().await;
            Ok(StoreOutcome::CorruptReset)
        }
    }

    /// Reads `length` bytes at `offset` of a completed piece after
    /// re-verifying the whole piece. A piece that fails verification loses
    /// its completion bit.
    pub async fn retrieve_block(&self, index: u32, offset: u32, length: u32) -> Option<Bytes> {
        if !self.have(index) || self.check_range(index, offset, length).is_err() {
            return None;
        }

        let mut table = self.table.lock().await;
        match self.read_verified(&mut table, index).await {
            Ok(Some(data)) => {
                let start = offset as usize;
                Some(Bytes::copy_from_slice(&data[start..start + length as usize]))
            }
            outcome => {
                match outcome {
                    Err(e) => warn!(piece = index, error = %e, "failed to read piece for upload"),
                    _ => warn!(piece = index, "piece failed verification before upload"),
                }
                self.bitfield.write().clear(index as usize);
                table.received[index as usize] = 0;
                self.save_progress().await;
                None
            }
        }
    }

    /// Writes the completion bitfield to the resume file.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let _table = self.table.lock().await;
        self.persist_locked().await
    }

    /// Restores the completion bitfield from the resume file.
    ///
    /// A missing, truncated or inconsistent file is reported as
    /// [`ResumeStatus::NoSavedState`] and leaves the store empty.
    pub async fn resume(&self) -> Result<ResumeStatus, StorageError> {
        let data = match tokio::fs::read(&self.resume_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ResumeStatus::NoSavedState)
            }
            Err(e) => return Err(e.into()),
        };

        let restored = match resume::decode(&data, self.session.piece_count()) {
            Ok(bitfield) => bitfield,
            Err(e) => {
                warn!(path = %self.resume_path.display(), error = %e, "ignoring resume file");
                return Ok(ResumeStatus::NoSavedState);
            }
        };

        let mut table = self.table.lock().await;
        table.partials.clear();
        for (i, received) in table.received.iter_mut().enumerate() {
            *received = if restored.has(i) {
                self.session.piece_len(i as u32)
            } else {
                0
            };
        }

        let status = if restored.is_complete() {
            ResumeStatus::AllComplete
        } else if restored.is_empty() {
            ResumeStatus::NoneComplete
        } else {
            ResumeStatus::Partial
        };
        info!(
            completed = restored.count(),
            total = restored.len(),
            ?status,
            "restored progress"
        );
        *self.bitfield.write() = restored;

        Ok(status)
    }

    /// Re-hashes every completed piece on disk, clearing any that fail.
    /// Returns the number of pieces that were cleared.
    pub async fn verify_all(&self) -> Result<usize, StorageError> {
        let mut table = self.table.lock().await;
        let completed: Vec<u32> = self.bitfield.read().ones().map(|i| i as u32).collect();
        debug!(pieces = completed.len(), "verifying completed pieces");

        let mut cleared = 0;
        for index in completed {
            let ok = matches!(self.read_verified(&mut table, index).await, Ok(Some(_)));
            if !ok {
                self.bitfield.write().clear(index as usize);
                table.received[index as usize] = 0;
                cleared += 1;
            }
        }

        if cleared > 0 {
            warn!(cleared, "completed pieces failed verification");
            self.persist_locked().await?;
        }
        Ok(cleared)
    }

    /// Validates a (piece, offset, length) range and returns the piece length.
    fn check_range(&self, index: u32, offset: u32, length: u32) -> Result<u32, StorageError> {
        if index as usize >= self.session.piece_count() {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        let piece_len = self.session.piece_len(index);
        let end = offset as u64 + length as u64;
        if length == 0 || end > piece_len as u64 {
            return Err(StorageError::InvalidBlock {
                piece: index,
                offset,
                length,
            });
        }
        Ok(piece_len)
    }

    async fn persist_locked(&self) -> Result<(), StorageError> {
        let encoded = resume::encode(&self.bitfield.read());
        resume::write_atomic(&self.resume_path, &encoded).await
    }

    /// Persists after the bitfield has already changed. The in-memory state
    /// stays authoritative when the resume file cannot be written.
    async fn save_progress(&self) {
        if let Err(e) = self.persist_locked().await {
            warn!(path = %self.resume_path.display(), error = %e, "failed to persist progress");
        }
    }

    async fn open_file<'a>(&self, table: &'a mut PieceTable) -> Result<&'a mut File, StorageError> {
        if table.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .await?;
            table.file = Some(file);
        }
        table
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("backing file unavailable")))
    }

    async fn write_piece(
        &self,
        table: &mut PieceTable,
        index: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let offset = self.session.piece_offset(index);
        let file = self.open_file(table).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads a piece from disk and returns it only if its hash matches.
    async fn read_verified(
        &self,
        table: &mut PieceTable,
        index: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let offset = self.session.piece_offset(index);
        let mut data = vec![0u8; self.session.piece_len(index) as usize];

        let file = self.open_file(table).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut data).await?;

        let (matches, data) = self.hash_matches(index, data).await?;
        Ok(matches.then_some(data))
    }

    async fn hash_matches(&self, index: u32, data: Vec<u8>) -> Result<(bool, Vec<u8>), StorageError> {
        let expected = self
            .session
            .piece_hash(index)
            .copied()
            .ok_or(StorageError::InvalidPieceIndex(index))?;

        tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&data).into();
            (digest == expected, data)
        })
        .await
        .map_err(|e| StorageError::Hasher(e.to_string()))
    }
}
