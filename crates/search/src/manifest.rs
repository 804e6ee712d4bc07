//! Index manifest (`index.manifest`)
//!
//! The manifest stores:
//! - Live segment list (segment_id, direction, doc_count, tombstoned memories)
//! - Per-direction, per-channel applied watermarks
//! - Next segment id and next insertion sequence
//!
//! Written atomically via temp + fsync + rename. A segment file that the
//! manifest does not reference is garbage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tmstore_core::{ChannelId, Error, LanguageDirection, MemoryId, Offset, Result};

/// Manifest file name inside the index directory
pub const MANIFEST_FILE_NAME: &str = "index.manifest";
/// Magic bytes for the index manifest
const MANIFEST_MAGIC: &[u8; 4] = b"TMIX";
/// Current manifest version
const MANIFEST_VERSION: u32 = 1;

// ============================================================================
// Manifest Data (serializable)
// ============================================================================

/// Serializable representation of the whole index state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestData {
    /// Next segment ID to assign
    pub next_segment_id: u64,
    /// Next insertion sequence to assign
    pub next_seq: u64,
    /// Live segments
    pub segments: Vec<SegmentManifestEntry>,
    /// Highest applied offset per (direction, channel)
    pub watermarks: Vec<WatermarkEntry>,
}

/// Manifest entry for a single segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifestEntry {
    /// Unique segment identifier
    pub segment_id: u64,
    /// Direction of the segment's documents
    pub direction: LanguageDirection,
    /// Number of documents in the segment file
    pub doc_count: u32,
    /// Memories deleted after the segment was written
    pub tombstones: BTreeSet<MemoryId>,
}

/// Highest offset of one channel already present in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    /// Direction
    pub direction: LanguageDirection,
    /// Channel
    pub channel: ChannelId,
    /// Highest applied offset
    pub offset: Offset,
}

// ============================================================================
// Read / Write
// ============================================================================

/// Write manifest data to a file atomically (temp + rename).
pub fn write_manifest(path: &Path, data: &ManifestData) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let payload = rmp_serde::to_vec(data)
        .map_err(|e| Error::Serialization(format!("manifest encode error: {}", e)))?;

    // magic + version + payload
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(MANIFEST_MAGIC);
    buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);

    let tmp_path = path.with_extension("manifest.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load manifest data from a file.
pub fn load_manifest(path: &Path) -> Result<ManifestData> {
    let buf = std::fs::read(path)?;
    if buf.len() < 8 {
        return Err(Error::corruption("manifest too small"));
    }
    if &buf[0..4] != MANIFEST_MAGIC {
        return Err(Error::corruption("bad manifest magic"));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != MANIFEST_VERSION {
        return Err(Error::corruption(format!(
            "unsupported manifest version {}",
            version
        )));
    }
    rmp_serde::from_slice(&buf[8..])
        .map_err(|e| Error::corruption(format!("manifest decode error: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================
