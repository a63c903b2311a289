//! Durable consensus metadata.
//!
//! Each tablet replica persists a single metadata record holding the current
//! term, the vote cast in that term (if any), and the committed quorum. The
//! record must be durably flushed before a new term, vote, or quorum becomes
//! observable to external callers; recovery reads it back to decide whether
//! the replica may grant votes without double-voting.
//!
//! File format:
//! ```text
//! [magic: 4][version: 4][current_term: 8][voted_for_present: 1]
//! [voted_for_len: 2][voted_for bytes]          (only when present)
//! [committed_quorum]                            (see Quorum::encode)
//! [crc32: 4]
//! ```

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use slate_core::limits::PEER_UUID_LEN_MAX;
use slate_core::{PeerId, TermId};
use thiserror::Error;
use tracing::debug;

use crate::quorum::Quorum;

/// Magic bytes for the consensus metadata file format.
const METADATA_MAGIC: u32 = 0x434D_4554; // "CMET"

/// Current version of the metadata format.
const METADATA_VERSION: u32 = 1;

/// Errors from metadata persistence.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// I/O error during load or save.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record is malformed.
    #[error("invalid metadata format: {0}")]
    InvalidFormat(String),

    /// The stored record's checksum does not match its contents.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value.
        expected: u32,
        /// Actual checksum value.
        actual: u32,
    },
}

/// The durable consensus record for one tablet replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMetadataRecord {
    /// Latest term this replica has seen.
    pub current_term: TermId,
    /// Peer voted for in the current term, if any.
    pub voted_for: Option<PeerId>,
    /// The durably committed quorum.
    pub committed_quorum: Quorum,
}

impl ConsensusMetadataRecord {
    /// Creates a fresh record at term 0 with no vote.
    #[must_use]
    pub const fn new(committed_quorum: Quorum) -> Self {
        Self {
            current_term: TermId::new(0),
            voted_for: None,
            committed_quorum,
        }
    }

    /// Serializes the record, including the checksum trailer.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(METADATA_MAGIC);
        buf.put_u32_le(METADATA_VERSION);
        buf.put_u64_le(self.current_term.get());
        match &self.voted_for {
            Some(uuid) => {
                buf.put_u8(1);
                let bytes = uuid.as_str().as_bytes();
                // Safe cast: uuid length is bounded by PEER_UUID_LEN_MAX.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16_le(bytes.len() as u16);
                buf.put_slice(bytes);
            }
            None => buf.put_u8(0),
        }
        self.committed_quorum.encode(&mut buf);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserializes a record, verifying magic, version, and checksum.
    ///
    /// # Errors
    /// Returns an error if the data is truncated, carries the wrong magic or
    /// version, or fails the checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self, MetadataError> {
        let min_size = 4 + 4 + 8 + 1 + 4;
        if data.len() < min_size {
            return Err(MetadataError::InvalidFormat(format!(
                "data too short: {} bytes, minimum {min_size}",
                data.len()
            )));
        }

        let payload = &data[..data.len() - 4];
        let expected = crc32fast::hash(payload);
        let mut trailer = &data[data.len() - 4..];
        let actual = trailer.get_u32_le();
        if expected != actual {
            return Err(MetadataError::ChecksumMismatch { expected, actual });
        }

        let mut buf = payload;
        let magic = buf.get_u32_le();
        if magic != METADATA_MAGIC {
            return Err(MetadataError::InvalidFormat(format!(
                "bad magic: {magic:#x}"
            )));
        }
        let version = buf.get_u32_le();
        if version != METADATA_VERSION {
            return Err(MetadataError::InvalidFormat(format!(
                "unsupported version: {version}"
            )));
        }

        let current_term = TermId::new(buf.get_u64_le());
        let voted_for = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 2 {
                    return Err(MetadataError::InvalidFormat("truncated vote".to_string()));
                }
                let len = buf.get_u16_le() as usize;
                if len > PEER_UUID_LEN_MAX || buf.remaining() < len {
                    return Err(MetadataError::InvalidFormat("truncated vote".to_string()));
                }
                let mut uuid = vec![0u8; len];
                buf.copy_to_slice(&mut uuid);
                let uuid = String::from_utf8(uuid)
                    .map_err(|_| MetadataError::InvalidFormat("vote not utf-8".to_string()))?;
                Some(PeerId::new(uuid))
            }
            tag => {
                return Err(MetadataError::InvalidFormat(format!(
                    "bad voted_for tag: {tag}"
                )))
            }
        };

        let committed_quorum = Quorum::decode(&mut buf)
            .ok_or_else(|| MetadataError::InvalidFormat("truncated quorum".to_string()))?;

        Ok(Self {
            current_term,
            voted_for,
            committed_quorum,
        })
    }
}

/// Durable storage for the consensus metadata record.
///
/// Implementations must persist atomically: a crash during `save` must leave
/// either the previous record or the new one readable, never a torn write.
pub trait MetadataStorage: Send {
    /// Persists the record durably.
    ///
    /// # Errors
    /// Returns an error if the record cannot be made durable. The previous
    /// record must remain intact in that case.
    fn save(&mut self, record: &ConsensusMetadataRecord) -> Result<(), MetadataError>;

    /// Loads the most recently saved record.
    ///
    /// Returns `Ok(None)` if nothing has been saved yet (fresh replica).
    ///
    /// # Errors
    /// Returns an error if a stored record exists but cannot be read.
    fn load(&self) -> Result<Option<ConsensusMetadataRecord>, MetadataError>;
}

/// File-backed metadata storage.
///
/// Saves write a temp file in the same directory, fsync it, and rename it
/// over the target so a crash can never expose a torn record.
#[derive(Debug)]
pub struct FileMetadataStorage {
    path: PathBuf,
}

impl FileMetadataStorage {
    /// Creates storage writing to the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataStorage for FileMetadataStorage {
    fn save(&mut self, record: &ConsensusMetadataRecord) -> Result<(), MetadataError> {
        let data = record.serialize();
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            // Make the rename itself durable.
            File::open(dir)?.sync_all()?;
        }
        debug!(path = %self.path.display(), bytes = data.len(), "flushed consensus metadata");
        Ok(())
    }

    fn load(&self) -> Result<Option<ConsensusMetadataRecord>, MetadataError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        ConsensusMetadataRecord::deserialize(&data).map(Some)
    }
}

/// In-memory metadata storage for tests.
///
/// Not durable. The failure toggle lets tests exercise the contract that a
/// failed flush leaves the replica's in-memory state unchanged.
#[derive(Debug, Default)]
pub struct MemoryMetadataStorage {
    record: Option<ConsensusMetadataRecord>,
    fail_saves: bool,
}

impl MemoryMetadataStorage {
    /// Creates empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes all subsequent saves fail with an I/O error.
    pub fn fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }
}

impl MetadataStorage for MemoryMetadataStorage {
    fn save(&mut self, record: &ConsensusMetadataRecord) -> Result<(), MetadataError> {
        if self.fail_saves {
            return Err(MetadataError::Io(std::io::Error::other(
                "injected save failure",
            )));
        }
        // Round-trip through the wire form so format bugs surface in tests.
        let data = record.serialize();
        self.record = Some(ConsensusMetadataRecord::deserialize(&data)?);
        Ok(())
    }

    fn load(&self) -> Result<Option<ConsensusMetadataRecord>, MetadataError> {
        Ok(self.record.clone())
    }
}

/// The consensus metadata owned by one replica.
///
/// Holds the current in-memory record and the storage that makes it durable.
/// Mutations are staged by value and installed only after a successful save,
/// so a failed flush leaves the observable record unchanged.
pub struct ConsensusMetadata {
    record: ConsensusMetadataRecord,
    storage: Box<dyn MetadataStorage>,
}

impl ConsensusMetadata {
    /// Creates metadata for a fresh replica and flushes the initial record.
    ///
    /// # Errors
    /// Returns an error if the initial flush fails.
    pub fn create(
        mut storage: Box<dyn MetadataStorage>,
        initial_quorum: Quorum,
    ) -> Result<Self, MetadataError> {
        let record = ConsensusMetadataRecord::new(initial_quorum);
        storage.save(&record)?;
        Ok(Self { record, storage })
    }

    /// Loads existing metadata, or creates and flushes a fresh record if
    /// none has been saved yet.
    ///
    /// # Errors
    /// Returns an error if the stored record cannot be read or the initial
    /// flush fails.
    pub fn load_or_create(
        storage: Box<dyn MetadataStorage>,
        initial_quorum: Quorum,
    ) -> Result<Self, MetadataError> {
        match storage.load()? {
            Some(record) => Ok(Self { record, storage }),
            None => Self::create(storage, initial_quorum),
        }
    }

    /// Returns the current in-memory record.
    #[must_use]
    pub const fn record(&self) -> &ConsensusMetadataRecord {
        &self.record
    }

    /// Persists `new_record` and installs it as the current record.
    ///
    /// # Errors
    /// Returns an error if the save fails; the in-memory record is then
    /// unchanged.
    pub fn update(&mut self, new_record: ConsensusMetadataRecord) -> Result<(), MetadataError> {
        self.storage.save(&new_record)?;
        self.record = new_record;
        Ok(())
    }
}
