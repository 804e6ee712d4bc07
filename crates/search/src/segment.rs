//! Immutable index segments (`seg-NNNNNNNN.tms`)
//!
//! A segment holds the documents added by one flush batch (or one merge)
//! for a single language direction, plus in-memory postings and per-memory
//! statistics rebuilt when the segment is loaded.
//!
//! ## File Format
//!
//! ```text
//! HEADER:
//!   magic "TMSG"            4B
//!   version                 u32 LE
//!   segment_id              u64 LE
//!   direction_len           u16 LE
//!   direction               [u8; direction_len]   ("en:it")
//!   doc_count               u32 LE
//!
//! DOCS (doc_count entries, varint = LEB128):
//!   seq                     varint
//!   memory                  varint
//!   channel                 varint
//!   offset                  varint
//!   source, target          varint len + UTF-8
//!   source_words            varint count + (varint len + UTF-8)*
//!   target_words            varint count + (varint len + UTF-8)*
//!   terms                   varint count + (varint len + UTF-8)*
//!
//! TRAILER:
//!   crc32                   u32 LE over every preceding byte
//! ```

use crc32fast::Hasher;
use rustc_hash::FxHashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tmstore_core::{ChannelId, Error, LanguageDirection, MemoryId, Offset, Result};

/// Magic bytes for segment files
const SEGMENT_MAGIC: &[u8; 4] = b"TMSG";
/// Current format version
const SEGMENT_VERSION: u32 = 1;
/// File extension of segment files
pub const SEGMENT_EXTENSION: &str = "tms";

// ============================================================================
// Varint (LEB128) Codec
// ============================================================================

/// Encode a u64 as a variable-length integer (LEB128).
pub(crate) fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from a byte slice, returning (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift >= 70 {
            return None; // overflow
        }
    }
    None // truncated
}

// ============================================================================
// IndexedDoc
// ============================================================================

/// A sentence pair stored in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDoc {
    /// Store-wide insertion sequence, assigned by the index
    pub seq: u64,
    /// Memory the pair belongs to
    pub memory: MemoryId,
    /// Channel the pair was delivered on
    pub channel: ChannelId,
    /// Position inside the channel
    pub offset: Offset,
    /// Source sentence
    pub source: String,
    /// Target sentence
    pub target: String,
    /// Source surface words
    pub source_words: Vec<String>,
    /// Target surface words
    pub target_words: Vec<String>,
    /// Normalized source terms (duplicates kept)
    pub terms: Vec<String>,
}

impl IndexedDoc {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_varint(self.seq, buf);
        encode_varint(self.memory.as_u64(), buf);
        encode_varint(self.channel as u64, buf);
        encode_varint(self.offset, buf);
        encode_str(&self.source, buf);
        encode_str(&self.target, buf);
        encode_str_list(&self.source_words, buf);
        encode_str_list(&self.target_words, buf);
        encode_str_list(&self.terms, buf);
    }

    fn decode(reader: &mut Reader<'_>) -> Option<Self> {
        let seq = reader.varint()?;
        let memory = MemoryId(reader.varint()?);
        let channel = ChannelId::try_from(reader.varint()?).ok()?;
        let offset = reader.varint()?;
        Some(IndexedDoc {
            seq,
            memory,
            channel,
            offset,
            source: reader.string()?,
            target: reader.string()?,
            source_words: reader.string_list()?,
            target_words: reader.string_list()?,
            terms: reader.string_list()?,
        })
    }
}

fn encode_str(s: &str, buf: &mut Vec<u8>) {
    encode_varint(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_str_list(list: &[String], buf: &mut Vec<u8>) {
    encode_varint(list.len() as u64, buf);
    for s in list {
        encode_str(s, buf);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn varint(&mut self) -> Option<u64> {
        let (value, n) = decode_varint(&self.data[self.pos..])?;
        self.pos += n;
        Some(value)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn string(&mut self) -> Option<String> {
        let len = usize::try_from(self.varint()?).ok()?;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn string_list(&mut self) -> Option<Vec<String>> {
        let count = usize::try_from(self.varint()?).ok()?;
        // Every entry takes at least one byte
        if count > self.data.len() - self.pos {
            return None;
        }
        (0..count).map(|_| self.string()).collect()
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Occurrence of a term in one document of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Position of the document inside the segment
    pub doc: u32,
    /// Term frequency in the document
    pub tf: u32,
}

/// Per-memory totals inside one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Documents of the memory
    pub docs: u32,
    /// Sum of term counts of those documents
    pub term_len: u64,
}

/// An immutable set of documents of one language direction.
pub struct Segment {
    id: u64,
    direction: LanguageDirection,
    docs: Vec<IndexedDoc>,
    postings: FxHashMap<String, Vec<Posting>>,
    memory_stats: FxHashMap<MemoryId, MemoryStats>,
    memory_terms: FxHashMap<MemoryId, FxHashMap<String, u32>>,
    total_term_len: u64,
}

impl Segment {
    /// Build a segment from documents (already carrying their `seq`).
    pub fn build(id: u64, direction: LanguageDirection, docs: Vec<IndexedDoc>) -> Self {
        let mut postings: FxHashMap<String, Vec<Posting>> = FxHashMap::default();
        let mut memory_stats: FxHashMap<MemoryId, MemoryStats> = FxHashMap::default();
        let mut memory_terms: FxHashMap<MemoryId, FxHashMap<String, u32>> = FxHashMap::default();
        let mut total_term_len = 0u64;

        for (pos, doc) in docs.iter().enumerate() {
            let mut tfs: FxHashMap<&str, u32> = FxHashMap::default();
            for term in &doc.terms {
                *tfs.entry(term.as_str()).or_insert(0) += 1;
            }

            let per_memory = memory_terms.entry(doc.memory).or_default();
            for (term, tf) in tfs {
                postings.entry(term.to_string()).or_default().push(Posting {
                    doc: pos as u32,
                    tf,
                });
                *per_memory.entry(term.to_string()).or_insert(0) += tf;
            }

            let stats = memory_stats.entry(doc.memory).or_default();
            stats.docs += 1;
            stats.term_len += doc.terms.len() as u64;
            total_term_len += doc.terms.len() as u64;
        }

        Segment {
            id,
            direction,
            docs,
            postings,
            memory_stats,
            memory_terms,
            total_term_len,
        }
    }

    /// Segment ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Direction of every document in this segment
    pub fn direction(&self) -> &LanguageDirection {
        &self.direction
    }

    /// Documents in insertion order
    pub fn docs(&self) -> &[IndexedDoc] {
        &self.docs
    }

    /// Document at a position
    pub fn doc(&self, pos: u32) -> Option<&IndexedDoc> {
        self.docs.get(pos as usize)
    }

    /// Number of documents (including tombstoned ones)
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Sum of term counts over all documents
    pub fn total_term_len(&self) -> u64 {
        self.total_term_len
    }

    /// Postings of a term
    pub fn postings(&self, term: &str) -> &[Posting] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Per-memory document totals
    pub fn memory_stats(&self) -> &FxHashMap<MemoryId, MemoryStats> {
        &self.memory_stats
    }

    /// True if the segment holds documents of `memory`
    pub fn contains_memory(&self, memory: MemoryId) -> bool {
        self.memory_stats.contains_key(&memory)
    }

    /// Term frequencies of a memory summed over its documents
    pub fn memory_terms(&self, memory: MemoryId) -> Option<&FxHashMap<String, u32>> {
        self.memory_terms.get(&memory)
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Serialize to the on-disk format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let direction = self.direction.to_string();
        let mut buf = Vec::with_capacity(64 + self.docs.len() * 64);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(direction.len() as u16).to_le_bytes());
        buf.extend_from_slice(direction.as_bytes());
        buf.extend_from_slice(&(self.docs.len() as u32).to_le_bytes());
        for doc in &self.docs {
            doc.encode(&mut buf);
        }
        let crc = compute_crc(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserialize from the on-disk format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 26 {
            return Err(Error::corruption("segment too small"));
        }
        if &bytes[0..4] != SEGMENT_MAGIC {
            return Err(Error::corruption("bad segment magic"));
        }

        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed_crc = compute_crc(body);
        if stored_crc != computed_crc {
            return Err(Error::corruption(format!(
                "segment checksum mismatch: expected {:08x}, computed {:08x}",
                stored_crc, computed_crc
            )));
        }

        let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        if version != SEGMENT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&body[8..16]);
        let id = u64::from_le_bytes(id_bytes);

        let dir_len = u16::from_le_bytes([body[16], body[17]]) as usize;
        let dir_end = 18 + dir_len;
        if body.len() < dir_end + 4 {
            return Err(Error::corruption("segment header truncated"));
        }
        let direction: LanguageDirection = std::str::from_utf8(&body[18..dir_end])
            .map_err(|_| Error::corruption("segment direction is not UTF-8"))?
            .parse()
            .map_err(|_| Error::corruption("segment direction is invalid"))?;
        let doc_count = u32::from_le_bytes([
            body[dir_end],
            body[dir_end + 1],
            body[dir_end + 2],
            body[dir_end + 3],
        ]) as usize;

        let mut reader = Reader {
            data: body,
            pos: dir_end + 4,
        };
        let mut docs = Vec::with_capacity(doc_count.min(body.len()));
        for i in 0..doc_count {
            let doc = IndexedDoc::decode(&mut reader)
                .ok_or_else(|| Error::corruption(format!("segment {} doc {} is malformed", id, i)))?;
            docs.push(doc);
        }
        if reader.pos != body.len() {
            return Err(Error::corruption(format!(
                "segment {} has {} trailing bytes",
                id,
                body.len() - reader.pos
            )));
        }

        Ok(Segment::build(id, direction, docs))
    }

    /// File name of segment `id`: `seg-NNNNNNNN.tms`
    pub fn file_name(id: u64) -> String {
        format!("seg-{:08}.{}", id, SEGMENT_EXTENSION)
    }

    /// Parse a segment id out of a file name
    pub fn parse_file_name(name: &str) -> Option<u64> {
        name.strip_prefix("seg-")?
            .strip_suffix(&format!(".{}", SEGMENT_EXTENSION))?
            .parse()
            .ok()
    }

    /// Path of segment `id` inside `dir`
    pub fn path_in(dir: &Path, id: u64) -> PathBuf {
        dir.join(Self::file_name(id))
    }

    /// Write this segment to a file (atomic temp+rename).
    ///
    /// Returns the number of bytes written.
    pub fn write_to_file(&self, path: &Path) -> Result<u64> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let bytes = self.to_bytes();
        let tmp_path = path.with_extension("tms.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(bytes.len() as u64)
    }

    /// Load a segment from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
            .map_err(|e| Error::corruption(format!("{}: {}", path.display(), e)))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("docs", &self.docs.len())
            .field("terms", &self.postings.len())
            .finish()
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
