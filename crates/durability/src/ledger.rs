//! Channel position ledger
//!
//! Records, per upstream channel, the highest offset whose effect is durable.
//! A record whose offset is not above the ledger position is a redelivery
//! and must be dropped.
//!
//! # File Layout (`ledger.bin`)
//!
//! ```text
//! ┌──────────┬─────────────┬────────────┬──────────────────────────┬──────────┐
//! │ Magic (4)│ Version (4) │ Count (4)  │ Entries (count × 10)     │ CRC32 (4)│
//! └──────────┴─────────────┴────────────┴──────────────────────────┴──────────┘
//!
//! Entry: channel (u16 LE) + offset (u64 LE)
//! ```
//!
//! The CRC covers every byte before it. The file is replaced atomically
//! (temp + fsync + rename).
//!
//! # Write Ordering
//!
//! A position on disk must never cover a record that is not durable yet.
//! In Always mode buckets sync every append, so each commit is written
//! through. In Standard mode commits stay in memory until
//! [`ChannelLedger::checkpoint`], which first makes the guarded writes
//! durable and only then replaces the file.

use crate::mode::DurabilityMode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tmstore_core::{ChannelId, Error, Offset, Result};
use tracing::{debug, info};

/// Ledger file name inside the store root
pub const LEDGER_FILE_NAME: &str = "ledger.bin";

/// Magic bytes for the ledger file: "TMLG"
pub const LEDGER_MAGIC: [u8; 4] = *b"TMLG";

/// Current ledger format version
pub const LEDGER_VERSION: u32 = 1;

const LEDGER_HEADER_SIZE: usize = 12;
const LEDGER_ENTRY_SIZE: usize = 10;

/// Per-channel last-applied offsets.
///
/// Thread-safe; all methods take `&self`.
pub struct ChannelLedger {
    /// Backing file (None in Cache mode)
    path: Option<PathBuf>,
    /// Persist on every commit instead of at checkpoints
    write_through: bool,
    positions: Mutex<BTreeMap<ChannelId, Offset>>,
    /// Positions as last written to disk; also serializes writers
    persisted: Mutex<BTreeMap<ChannelId, Offset>>,
}

impl ChannelLedger {
    /// Open the ledger at `path`, creating an empty one if missing.
    ///
    /// In Cache mode nothing is read or written.
    pub fn open(path: &Path, mode: DurabilityMode) -> Result<Self> {
        if !mode.requires_files() {
            return Ok(Self::in_memory());
        }

        let positions = if path.exists() {
            let bytes = std::fs::read(path)?;
            let positions = decode(&bytes)?;
            info!(
                path = %path.display(),
                channels = positions.len(),
                "Loaded channel ledger"
            );
            positions
        } else {
            BTreeMap::new()
        };

        Ok(ChannelLedger {
            path: Some(path.to_path_buf()),
            write_through: mode.requires_immediate_fsync(),
            persisted: Mutex::new(positions.clone()),
            positions: Mutex::new(positions),
        })
    }

    /// Create a ledger that is never persisted
    pub fn in_memory() -> Self {
        ChannelLedger {
            path: None,
            write_through: true,
            positions: Mutex::new(BTreeMap::new()),
            persisted: Mutex::new(BTreeMap::new()),
        }
    }

    /// True if `offset` has not been applied yet on `channel`
    pub fn is_new(&self, channel: ChannelId, offset: Offset) -> bool {
        match self.positions.lock().get(&channel) {
            Some(&last) => offset > last,
            None => true,
        }
    }

    /// Record `offset` as applied on `channel`.
    ///
    /// Never moves a position backwards; a lower or equal offset is a no-op.
    /// When writing through, the ledger file is durable when this returns;
    /// otherwise the position reaches disk at the next checkpoint.
    pub fn commit(&self, channel: ChannelId, offset: Offset) -> Result<()> {
        if !self.write_through {
            let mut positions = self.positions.lock();
            if is_above(&positions, channel, offset) {
                positions.insert(channel, offset);
            }
            return Ok(());
        }

        let mut persisted = self.persisted.lock();
        let mut positions = self.positions.lock();
        if !is_above(&positions, channel, offset) {
            return Ok(());
        }

        let previous = positions.insert(channel, offset);
        if let Err(e) = self.persist(&positions) {
            // Keep memory consistent with disk
            match previous {
                Some(prev) => positions.insert(channel, prev),
                None => positions.remove(&channel),
            };
            return Err(e);
        }
        *persisted = positions.clone();
        Ok(())
    }

    /// Write every position committed since the last checkpoint.
    ///
    /// `make_durable` runs first and must make durable every write the
    /// pending positions guard; the file is left untouched if it fails.
    /// Returns `true` if the file was replaced.
    pub fn checkpoint<F>(&self, make_durable: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut persisted = self.persisted.lock();
        let pending = self.positions.lock().clone();
        if pending == *persisted {
            return Ok(false);
        }

        make_durable()?;
        self.persist(&pending)?;
        debug!(channels = pending.len(), "Checkpointed channel ledger");
        *persisted = pending;
        Ok(true)
    }

    /// Raise positions to at least the given offsets.
    ///
    /// Used by recovery to cover offsets already durable in the index, so
    /// the raised positions are written immediately. Returns the number of
    /// channels that moved.
    pub fn raise_to(&self, targets: &BTreeMap<ChannelId, Offset>) -> Result<usize> {
        let mut persisted = self.persisted.lock();
        let mut positions = self.positions.lock();
        let mut durable = persisted.clone();
        let mut raised = 0;

        for (&channel, &offset) in targets {
            if is_above(&positions, channel, offset) {
                raised += 1;
            }
            if is_above(&durable, channel, offset) {
                durable.insert(channel, offset);
            }
        }

        if durable != *persisted {
            self.persist(&durable)?;
            *persisted = durable;
        }
        for (&channel, &offset) in targets {
            if is_above(&positions, channel, offset) {
                positions.insert(channel, offset);
            }
        }
        if raised > 0 {
            debug!(channels = raised, "Raised ledger positions");
        }
        Ok(raised)
    }

    /// Current positions of every known channel
    pub fn snapshot(&self) -> BTreeMap<ChannelId, Offset> {
        self.positions.lock().clone()
    }

    /// Position of one channel
    pub fn position(&self, channel: ChannelId) -> Option<Offset> {
        self.positions.lock().get(&channel).copied()
    }

    /// Backing file path (None in Cache mode)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, positions: &BTreeMap<ChannelId, Offset>) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let buf = encode(positions)?;
        let tmp_path = path.with_extension("bin.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn is_above(positions: &BTreeMap<ChannelId, Offset>, channel: ChannelId, offset: Offset) -> bool {
    positions.get(&channel).map_or(true, |&last| offset > last)
}

fn encode(positions: &BTreeMap<ChannelId, Offset>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(LEDGER_HEADER_SIZE + positions.len() * LEDGER_ENTRY_SIZE + 4);
    buf.extend_from_slice(&LEDGER_MAGIC);
    buf.write_u32::<LittleEndian>(LEDGER_VERSION)?;
    buf.write_u32::<LittleEndian>(positions.len() as u32)?;
    for (&channel, &offset) in positions {
        buf.write_u16::<LittleEndian>(channel)?;
        buf.write_u64::<LittleEndian>(offset)?;
    }
    let crc = compute_crc(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<ChannelId, Offset>> {
    if bytes.len() < LEDGER_HEADER_SIZE + 4 {
        return Err(Error::corruption("ledger file too small"));
    }
    if bytes[0..4] != LEDGER_MAGIC {
        return Err(Error::corruption("bad ledger magic"));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed_crc = compute_crc(body);
    if stored_crc != computed_crc {
        return Err(Error::corruption(format!(
            "ledger checksum mismatch: expected {:08x}, computed {:08x}",
            stored_crc, computed_crc
        )));
    }

    let mut cursor = Cursor::new(&body[4..]);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != LEDGER_VERSION {
        return Err(Error::corruption(format!(
            "unsupported ledger version {}",
            version
        )));
    }
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    if body.len() != LEDGER_HEADER_SIZE + count * LEDGER_ENTRY_SIZE {
        return Err(Error::corruption(format!(
            "ledger length mismatch for {} entries",
            count
        )));
    }

    let mut positions = BTreeMap::new();
    for _ in 0..count {
        let channel = cursor.read_u16::<LittleEndian>()?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        positions.insert(channel, offset);
    }
    Ok(positions)
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn durable() -> DurabilityMode {
        DurabilityMode::Always
    }

    #[test]
    fn test_new_ledger_accepts_everything() {
        let ledger = ChannelLedger::in_memory();
        assert!(ledger.is_new(0, 0));
        assert!(ledger.is_new(7, u64::MAX));
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn test_commit_makes_offsets_old() {
        let ledger = ChannelLedger::in_memory();
        ledger.commit(1, 10).unwrap();
        assert!(!ledger.is_new(1, 9));
        assert!(!ledger.is_new(1, 10));
        assert!(ledger.is_new(1, 11));
        assert!(ledger.is_new(2, 0));
    }

    #[test]
    fn test_commit_never_moves_backwards() {
        let ledger = ChannelLedger::in_memory();
        ledger.commit(0, 50).unwrap();
        ledger.commit(0, 20).unwrap();
        assert_eq!(ledger.position(0), Some(50));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);

        {
            let ledger = ChannelLedger::open(&path, durable()).unwrap();
            ledger.commit(0, 3).unwrap();
            ledger.commit(5, 99).unwrap();
        }

        let ledger = ChannelLedger::open(&path, durable()).unwrap();
        let snap = ledger.snapshot();
        assert_eq!(snap.get(&0), Some(&3));
        assert_eq!(snap.get(&5), Some(&99));
        assert!(!ledger.is_new(5, 99));
    }

    #[test]
    fn test_cache_mode_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let ledger = ChannelLedger::open(&path, DurabilityMode::Cache).unwrap();
        ledger.commit(0, 1).unwrap();
        assert!(!path.exists());
        assert!(ledger.path().is_none());
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        {
            let ledger = ChannelLedger::open(&path, durable()).unwrap();
            ledger.commit(0, 3).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = ChannelLedger::open(&path, durable()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(&path, b"XXXXXXXXXXXXXXXXXXXX").unwrap();
        let err = ChannelLedger::open(&path, durable()).err().unwrap();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_raise_to() {
        let ledger = ChannelLedger::in_memory();
        ledger.commit(0, 10).unwrap();

        let mut targets = BTreeMap::new();
        targets.insert(0, 5);
        targets.insert(1, 7);
        let raised = ledger.raise_to(&targets).unwrap();

        assert_eq!(raised, 1);
        assert_eq!(ledger.position(0), Some(10));
        assert_eq!(ledger.position(1), Some(7));
    }

    #[test]
    fn test_standard_mode_waits_for_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mode = DurabilityMode::standard_default();
        let ledger = ChannelLedger::open(&path, mode).unwrap();

        ledger.commit(0, 5).unwrap();
        assert!(!ledger.is_new(0, 5));
        assert!(ChannelLedger::open(&path, mode).unwrap().snapshot().is_empty());

        let mut synced = false;
        assert!(ledger
            .checkpoint(|| {
                synced = true;
                Ok(())
            })
            .unwrap());
        assert!(synced);
        assert_eq!(ChannelLedger::open(&path, mode).unwrap().position(0), Some(5));

        // Nothing new to write
        assert!(!ledger.checkpoint(|| unreachable!("no pending positions")).unwrap());
    }

    #[test]
    fn test_failed_checkpoint_leaves_file_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mode = DurabilityMode::standard_default();
        let ledger = ChannelLedger::open(&path, mode).unwrap();
        ledger.commit(0, 1).unwrap();
        ledger.checkpoint(|| Ok(())).unwrap();

        ledger.commit(0, 2).unwrap();
        let err = ledger
            .checkpoint(|| Err(Error::corruption("sync failed")))
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert_eq!(ledger.position(0), Some(2));
        assert_eq!(ChannelLedger::open(&path, mode).unwrap().position(0), Some(1));
    }

    #[test]
    fn test_raise_to_keeps_pending_commits_off_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mode = DurabilityMode::standard_default();
        let ledger = ChannelLedger::open(&path, mode).unwrap();
        ledger.commit(0, 9).unwrap();

        let mut targets = BTreeMap::new();
        targets.insert(1, 4);
        assert_eq!(ledger.raise_to(&targets).unwrap(), 1);

        let on_disk = ChannelLedger::open(&path, mode).unwrap().snapshot();
        assert_eq!(on_disk.get(&1), Some(&4));
        assert_eq!(on_disk.get(&0), None);
        assert_eq!(ledger.position(0), Some(9));
    }

    proptest! {
        #[test]
        fn prop_position_is_running_max(offsets in proptest::collection::vec(0u64..1000, 1..50)) {
            let ledger = ChannelLedger::in_memory();
            let mut max = None;
            for offset in offsets {
                let was_new = ledger.is_new(0, offset);
                prop_assert_eq!(was_new, max.map_or(true, |m| offset > m));
                ledger.commit(0, offset).unwrap();
                max = Some(max.map_or(offset, |m: u64| m.max(offset)));
                prop_assert_eq!(ledger.position(0), max);
            }
        }

        #[test]
        fn prop_encode_decode(entries in proptest::collection::btree_map(any::<u16>(), any::<u64>(), 0..32)) {
            let bytes = encode(&entries).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), entries);
        }
    }
}
