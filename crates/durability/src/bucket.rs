//! Durable write buffer ("bucket")
//!
//! One append-only file per language direction, holding sentence pairs that
//! were accepted by the gateway but are not yet in the index. A bucket is
//! always drained as a whole and then reset; it is never partially flushed.
//!
//! # File Layout (`<src>__<tgt>.bkt`)
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (16 bytes)                  │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! See [`crate::record`] for the record framing.
//!
//! On open, a torn trailing record is truncated away. A checksum mismatch on
//! a complete record is corruption.

use crate::mode::DurabilityMode;
use crate::record::{BufferedUnit, RecordError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tmstore_core::{Error, LanguageDirection, MemoryId, Result};
use tracing::{debug, warn};

/// Magic bytes identifying a bucket file: "TMBK"
pub const BUCKET_MAGIC: [u8; 4] = *b"TMBK";

/// Current bucket format version
pub const BUCKET_FORMAT_VERSION: u32 = 1;

/// Size of bucket header in bytes
pub const BUCKET_HEADER_SIZE: usize = 16;

/// File extension of bucket files
pub const BUCKET_EXTENSION: &str = "bkt";

// ============================================================================
// Header
// ============================================================================

/// Bucket file header (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketHeader {
    /// Magic bytes: "TMBK"
    pub magic: [u8; 4],
    /// Format version for forward compatibility
    pub format_version: u32,
    /// Reserved, zero
    pub reserved: [u8; 8],
}

impl BucketHeader {
    /// Create a header for the current format
    pub fn new() -> Self {
        BucketHeader {
            magic: BUCKET_MAGIC,
            format_version: BUCKET_FORMAT_VERSION,
            reserved: [0u8; 8],
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; BUCKET_HEADER_SIZE] {
        let mut bytes = [0u8; BUCKET_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.reserved);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; BUCKET_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[8..16]);
        BucketHeader {
            magic,
            format_version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            reserved,
        }
    }

    /// Validate magic and version.
    pub fn is_valid(&self) -> bool {
        self.magic == BUCKET_MAGIC && self.format_version == BUCKET_FORMAT_VERSION
    }
}

impl Default for BucketHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Bucket
// ============================================================================

/// Cumulative I/O counters of a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounters {
    /// Total appended records
    pub appends: u64,
    /// Total fsync calls
    pub sync_calls: u64,
    /// Total bytes written
    pub bytes_written: u64,
}

enum Storage {
    File(File),
    Memory(Vec<BufferedUnit>),
}

/// Append-only buffer of one language direction.
///
/// Not internally synchronized: callers serialize append/drain/reset with a
/// mutex around the bucket.
pub struct Bucket {
    direction: LanguageDirection,
    path: Option<PathBuf>,
    storage: Storage,
    mode: DurabilityMode,

    /// Records currently buffered
    records: usize,
    /// Bytes of buffered records (header excluded)
    bytes: u64,
    /// Time of the first append since the last reset
    first_append: Option<Instant>,

    writes_since_sync: usize,
    has_unsynced_data: bool,
    /// A failed append may have left bytes past the last good record
    torn_tail: bool,
    counters: BucketCounters,
}

impl Bucket {
    /// Path of the bucket file for `direction` inside `dir`
    pub fn path_for(dir: &Path, direction: &LanguageDirection) -> PathBuf {
        dir.join(format!("{}.{}", direction.file_stem(), BUCKET_EXTENSION))
    }

    /// Directions that have a bucket file inside `dir`
    pub fn list(dir: &Path) -> Result<Vec<LanguageDirection>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut directions = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXTENSION) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            match LanguageDirection::from_file_stem(stem) {
                Some(direction) => directions.push(direction),
                None => warn!(path = %path.display(), "Ignoring bucket file with unparsable name"),
            }
        }
        directions.sort();
        Ok(directions)
    }

    /// Open (or create) the bucket of `direction` inside `dir`.
    ///
    /// An existing file is validated and any torn trailing record is
    /// truncated. In Cache mode the bucket lives in memory.
    pub fn open(dir: &Path, direction: LanguageDirection, mode: DurabilityMode) -> Result<Self> {
        if !mode.requires_files() {
            return Ok(Self::with_storage(direction, None, Storage::Memory(Vec::new()), mode));
        }

        std::fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, &direction);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.len() < BUCKET_HEADER_SIZE {
            // Crashed while creating the file
            if !contents.is_empty() {
                warn!(path = %path.display(), bytes = contents.len(), "Rewriting torn bucket header");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&BucketHeader::new().to_bytes())?;
            file.sync_all()?;
            return Ok(Self::with_storage(direction, Some(path), Storage::File(file), mode));
        }

        let mut header_bytes = [0u8; BUCKET_HEADER_SIZE];
        header_bytes.copy_from_slice(&contents[..BUCKET_HEADER_SIZE]);
        let header = BucketHeader::from_bytes(&header_bytes);
        if !header.is_valid() {
            return Err(Error::corruption(format!(
                "invalid bucket header in {}",
                path.display()
            )));
        }

        let scan = scan_records(&contents[BUCKET_HEADER_SIZE..])
            .map_err(|e| Error::corruption(format!("{}: {}", path.display(), e)))?;

        let valid_end = (BUCKET_HEADER_SIZE + scan.valid_len) as u64;
        if scan.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                torn_bytes = scan.torn_bytes,
                "Truncating torn record at end of bucket"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        let mut bucket = Self::with_storage(direction, Some(path), Storage::File(file), mode);
        bucket.records = scan.units.len();
        bucket.bytes = scan.valid_len as u64;
        if bucket.records > 0 {
            bucket.first_append = Some(Instant::now());
            debug!(
                direction = %bucket.direction,
                records = bucket.records,
                "Reopened non-empty bucket"
            );
        }
        Ok(bucket)
    }

    fn with_storage(
        direction: LanguageDirection,
        path: Option<PathBuf>,
        storage: Storage,
        mode: DurabilityMode,
    ) -> Self {
        Bucket {
            direction,
            path,
            storage,
            mode,
            records: 0,
            bytes: 0,
            first_append: None,
            writes_since_sync: 0,
            has_unsynced_data: false,
            torn_tail: false,
            counters: BucketCounters::default(),
        }
    }

    /// Append a unit.
    ///
    /// The record is written with a single sequential write and synced
    /// according to the durability mode. A failed write is cut back to the
    /// last good record, so the append can simply be retried.
    pub fn append(&mut self, unit: &BufferedUnit) -> Result<()> {
        let len = unit.encoded_len() as u64;
        if self.torn_tail {
            self.roll_back_tail()?;
        }
        match &mut self.storage {
            Storage::Memory(units) => units.push(unit.clone()),
            Storage::File(file) => {
                if let Err(e) = file.write_all(&unit.to_bytes()) {
                    self.torn_tail = true;
                    if let Err(rollback) = self.roll_back_tail() {
                        warn!(
                            direction = %self.direction,
                            error = %rollback,
                            "Failed to cut partial record from bucket"
                        );
                    }
                    return Err(e.into());
                }
                self.writes_since_sync += 1;
                self.has_unsynced_data = true;
                self.counters.bytes_written += len;
            }
        }

        self.records += 1;
        self.bytes += len;
        self.counters.appends += 1;
        self.first_append.get_or_insert_with(Instant::now);

        self.maybe_sync()
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.mode {
            DurabilityMode::Always => self.sync(),
            DurabilityMode::Standard { batch_size, .. } => {
                if self.writes_since_sync >= batch_size {
                    self.sync()?;
                }
                Ok(())
            }
            DurabilityMode::Cache => Ok(()),
        }
    }

    /// Truncate the file to the last good record and move the write
    /// position there.
    fn roll_back_tail(&mut self) -> Result<()> {
        if let Storage::File(file) = &mut self.storage {
            let valid_end = BUCKET_HEADER_SIZE as u64 + self.bytes;
            file.set_len(valid_end)?;
            file.seek(SeekFrom::Start(valid_end))?;
        }
        self.torn_tail = false;
        Ok(())
    }

    /// Force buffered data to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Storage::File(file) = &mut self.storage {
            if self.has_unsynced_data {
                file.sync_data()?;
                self.counters.sync_calls += 1;
            }
        }
        self.writes_since_sync = 0;
        self.has_unsynced_data = false;
        Ok(())
    }

    /// Read every buffered unit in append order.
    ///
    /// The bucket keeps its contents; call [`Bucket::reset`] once the units
    /// are safely indexed.
    pub fn drain(&mut self) -> Result<Vec<BufferedUnit>> {
        let file = match &mut self.storage {
            Storage::Memory(units) => return Ok(units.clone()),
            Storage::File(file) => file,
        };

        file.seek(SeekFrom::Start(BUCKET_HEADER_SIZE as u64))?;
        let mut contents = Vec::with_capacity(self.bytes as usize);
        file.read_to_end(&mut contents)?;

        let scan = scan_records(&contents).map_err(|e| {
            Error::corruption(format!("bucket {}: {}", self.direction, e))
        })?;
        if scan.torn_bytes > 0 {
            return Err(Error::corruption(format!(
                "bucket {} has {} unreadable trailing bytes",
                self.direction, scan.torn_bytes
            )));
        }
        Ok(scan.units)
    }

    /// Drop every buffered unit (after a successful flush).
    pub fn reset(&mut self) -> Result<()> {
        match &mut self.storage {
            Storage::Memory(units) => units.clear(),
            Storage::File(file) => {
                file.set_len(BUCKET_HEADER_SIZE as u64)?;
                file.seek(SeekFrom::Start(BUCKET_HEADER_SIZE as u64))?;
                file.sync_all()?;
                self.counters.sync_calls += 1;
            }
        }
        self.records = 0;
        self.bytes = 0;
        self.first_append = None;
        self.writes_since_sync = 0;
        self.has_unsynced_data = false;
        self.torn_tail = false;
        Ok(())
    }

    /// Remove every buffered unit of `memory`.
    ///
    /// The file is rewritten atomically (temp + fsync + rename). Returns the
    /// number of removed units.
    pub fn purge_memory(&mut self, memory: MemoryId) -> Result<usize> {
        let units = self.drain()?;
        let kept: Vec<BufferedUnit> = units.iter().filter(|u| u.memory != memory).cloned().collect();
        let removed = units.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        match (&mut self.storage, &self.path) {
            (Storage::Memory(buffered), _) => *buffered = kept.clone(),
            (Storage::File(file), Some(path)) => {
                let tmp_path = path.with_extension("bkt.tmp");
                {
                    let mut tmp = File::create(&tmp_path)?;
                    let mut buf = Vec::new();
                    buf.extend_from_slice(&BucketHeader::new().to_bytes());
                    for unit in &kept {
                        buf.extend_from_slice(&unit.to_bytes());
                    }
                    tmp.write_all(&buf)?;
                    tmp.sync_all()?;
                }
                std::fs::rename(&tmp_path, path)?;

                let mut reopened = OpenOptions::new().read(true).write(true).open(path)?;
                reopened.seek(SeekFrom::End(0))?;
                *file = reopened;
            }
            (Storage::File(_), None) => {
                return Err(Error::invalid_input("file-backed bucket without a path"));
            }
        }

        self.records = kept.len();
        self.bytes = kept.iter().map(|u| u.encoded_len() as u64).sum();
        self.has_unsynced_data = false;
        self.torn_tail = false;
        self.writes_since_sync = 0;
        if self.records == 0 {
            self.first_append = None;
        }

        debug!(
            direction = %self.direction,
            memory = %memory,
            removed,
            "Purged memory from bucket"
        );
        Ok(removed)
    }

    /// Sync and release the file.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Direction this bucket buffers
    pub fn direction(&self) -> &LanguageDirection {
        &self.direction
    }

    /// Backing file (None in Cache mode)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bytes of buffered records
    pub fn size(&self) -> u64 {
        self.bytes
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records
    }

    /// True if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Time since the first append after the last reset (zero when empty)
    pub fn age(&self) -> Duration {
        self.first_append
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Cumulative I/O counters
    pub fn counters(&self) -> BucketCounters {
        self.counters
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if self.has_unsynced_data {
            if let Storage::File(file) = &mut self.storage {
                let _ = file.sync_data();
            }
        }
    }
}

// ============================================================================
// Record scanning
// ============================================================================

struct Scan {
    units: Vec<BufferedUnit>,
    /// Bytes occupied by complete, valid records
    valid_len: usize,
    /// Trailing bytes that do not form a complete record
    torn_bytes: usize,
}

fn scan_records(bytes: &[u8]) -> std::result::Result<Scan, RecordError> {
    let mut units = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        match BufferedUnit::from_bytes(&bytes[pos..]) {
            Ok((unit, consumed)) => {
                units.push(unit);
                pos += consumed;
            }
            Err(RecordError::InsufficientData) => break,
            // Zero-filled tail left by a crash during file extension
            Err(RecordError::InvalidFormat) if bytes[pos..].iter().all(|&b| b == 0) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(Scan {
        units,
        valid_len: pos,
        torn_bytes: bytes.len() - pos,
    })
}
