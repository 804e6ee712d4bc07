//! Segmented inverted index partitioned by language direction
//!
//! Each flush batch becomes one immutable [`Segment`]. Readers clone the
//! published `Arc<Snapshot>` and never block on writers; writers build the
//! next snapshot off to the side, persist it, then swap it in.
//!
//! ## Write order
//!
//! 1. Segment file (temp + fsync + rename)
//! 2. Manifest (temp + fsync + rename)
//! 3. Publish the new snapshot
//!
//! A crash between 1 and 2 leaves an unreferenced segment file, removed on
//! the next open.

use crate::manifest::{
    load_manifest, write_manifest, ManifestData, SegmentManifestEntry, WatermarkEntry,
    MANIFEST_FILE_NAME,
};
use crate::scorer::{cosine_similarity, Bm25Scorer};
use crate::segment::{IndexedDoc, Segment};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tmstore_core::{
    ChannelId, ContextVector, DumpEntry, Error, LanguageDirection, MemoryId, Offset, Result,
    ScoreEntry, SearchResults, SearchStats,
};
use tracing::{debug, info, warn};

// ============================================================================
// Snapshot
// ============================================================================

/// A segment plus the memories deleted after it was written
#[derive(Clone)]
struct LiveSegment {
    segment: Arc<Segment>,
    tombstones: Arc<FxHashSet<MemoryId>>,
}

impl LiveSegment {
    fn new(segment: Segment) -> Self {
        LiveSegment {
            segment: Arc::new(segment),
            tombstones: Arc::new(FxHashSet::default()),
        }
    }

    #[inline]
    fn is_live(&self, doc: &IndexedDoc) -> bool {
        !self.tombstones.contains(&doc.memory)
    }

    fn live_docs(&self) -> usize {
        let dead: u32 = self
            .tombstones
            .iter()
            .filter_map(|m| self.segment.memory_stats().get(m))
            .map(|s| s.docs)
            .sum();
        self.segment.doc_count() - dead as usize
    }

    fn live_term_len(&self) -> u64 {
        let dead: u64 = self
            .tombstones
            .iter()
            .filter_map(|m| self.segment.memory_stats().get(m))
            .map(|s| s.term_len)
            .sum();
        self.segment.total_term_len() - dead
    }

    fn live(&self) -> impl Iterator<Item = &IndexedDoc> {
        self.segment.docs().iter().filter(move |d| self.is_live(d))
    }
}

/// Immutable view of the whole index
#[derive(Clone, Default)]
struct Snapshot {
    partitions: BTreeMap<LanguageDirection, Vec<LiveSegment>>,
    watermarks: BTreeMap<(LanguageDirection, ChannelId), Offset>,
}

impl Snapshot {
    fn to_manifest(&self, next_segment_id: u64, next_seq: u64) -> ManifestData {
        let segments = self
            .partitions
            .iter()
            .flat_map(|(direction, segments)| {
                segments.iter().map(move |live| SegmentManifestEntry {
                    segment_id: live.segment.id(),
                    direction: direction.clone(),
                    doc_count: live.segment.doc_count() as u32,
                    tombstones: live.tombstones.iter().copied().collect::<BTreeSet<_>>(),
                })
            })
            .collect();
        let watermarks = self
            .watermarks
            .iter()
            .map(|((direction, channel), offset)| WatermarkEntry {
                direction: direction.clone(),
                channel: *channel,
                offset: *offset,
            })
            .collect();
        ManifestData {
            next_segment_id,
            next_seq,
            segments,
            watermarks,
        }
    }

    fn segments(&self, direction: &LanguageDirection) -> &[LiveSegment] {
        self.partitions
            .get(direction)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Writer-side counters, guarded by the writer mutex
struct WriterState {
    next_segment_id: u64,
    next_seq: u64,
}

// ============================================================================
// IndexStats
// ============================================================================

/// Index-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Directions with at least one segment
    pub directions: usize,
    /// Live segments
    pub segments: usize,
    /// Documents not removed by a deletion
    pub live_docs: usize,
    /// Documents still stored but tombstoned
    pub deleted_docs: usize,
}

// ============================================================================
// TranslationIndex
// ============================================================================

/// Retrieval index over sentence pairs
///
/// Thread-safe: queries run concurrently with each other and with writers;
/// `add_batch`, `delete_by_memory` and `optimize` are serialized.
pub struct TranslationIndex {
    dir: Option<PathBuf>,
    published: RwLock<Arc<Snapshot>>,
    writer: Mutex<WriterState>,
    bm25: Bm25Scorer,
}

impl TranslationIndex {
    /// Open (or create) an index stored in `dir`.
    ///
    /// Loads the manifest and every segment it references. Segment files the
    /// manifest does not reference are deleted.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let manifest = if manifest_path.exists() {
            load_manifest(&manifest_path)?
        } else {
            ManifestData::default()
        };

        let mut snapshot = Snapshot::default();
        let mut referenced = FxHashSet::default();
        for entry in &manifest.segments {
            let segment = Segment::load(&Segment::path_in(dir, entry.segment_id))?;
            if segment.direction() != &entry.direction
                || segment.doc_count() != entry.doc_count as usize
            {
                return Err(Error::corruption(format!(
                    "segment {} does not match the manifest",
                    entry.segment_id
                )));
            }
            referenced.insert(entry.segment_id);
            snapshot
                .partitions
                .entry(entry.direction.clone())
                .or_default()
                .push(LiveSegment {
                    segment: Arc::new(segment),
                    tombstones: Arc::new(entry.tombstones.iter().copied().collect()),
                });
        }
        for w in &manifest.watermarks {
            snapshot
                .watermarks
                .insert((w.direction.clone(), w.channel), w.offset);
        }

        remove_garbage(dir, &referenced)?;

        info!(
            dir = %dir.display(),
            segments = manifest.segments.len(),
            directions = snapshot.partitions.len(),
            "Opened translation index"
        );

        Ok(TranslationIndex {
            dir: Some(dir.to_path_buf()),
            published: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(WriterState {
                next_segment_id: manifest.next_segment_id,
                next_seq: manifest.next_seq,
            }),
            bm25: Bm25Scorer::default(),
        })
    }

    /// Index without any files
    pub fn in_memory() -> Self {
        TranslationIndex {
            dir: None,
            published: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(WriterState {
                next_segment_id: 0,
                next_seq: 0,
            }),
            bm25: Bm25Scorer::default(),
        }
    }

    /// Directory of the index, `None` when in memory
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.published.read())
    }

    fn persist(&self, snapshot: &Snapshot, state: &WriterState) -> Result<()> {
        if let Some(dir) = &self.dir {
            let data = snapshot.to_manifest(state.next_segment_id, state.next_seq);
            write_manifest(&dir.join(MANIFEST_FILE_NAME), &data)?;
        }
        Ok(())
    }

    fn publish(&self, snapshot: Snapshot) {
        *self.published.write() = Arc::new(snapshot);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Add documents of one direction as a new segment.
    ///
    /// `seq` is assigned here, in the given order. `applied` carries the
    /// highest channel offsets the batch covers; watermarks only move up.
    /// Returns the number of documents added.
    pub fn add_batch(
        &self,
        direction: &LanguageDirection,
        mut docs: Vec<IndexedDoc>,
        applied: &BTreeMap<ChannelId, Offset>,
    ) -> Result<usize> {
        if docs.is_empty() && applied.is_empty() {
            return Ok(0);
        }

        let mut state = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        let mut next_state = WriterState {
            next_segment_id: state.next_segment_id,
            next_seq: state.next_seq,
        };

        let added = docs.len();
        if !docs.is_empty() {
            for doc in docs.iter_mut() {
                doc.seq = next_state.next_seq;
                next_state.next_seq += 1;
            }
            let id = next_state.next_segment_id;
            next_state.next_segment_id += 1;

            let segment = Segment::build(id, direction.clone(), docs);
            if let Some(dir) = &self.dir {
                segment.write_to_file(&Segment::path_in(dir, id))?;
            }
            next.partitions
                .entry(direction.clone())
                .or_default()
                .push(LiveSegment::new(segment));
        }

        for (&channel, &offset) in applied {
            let mark = next
                .watermarks
                .entry((direction.clone(), channel))
                .or_insert(offset);
            *mark = (*mark).max(offset);
        }

        self.persist(&next, &next_state)?;
        self.publish(next);
        *state = next_state;

        debug!(direction = %direction, docs = added, "Added segment");
        Ok(added)
    }

    /// Add a single document (one-document segment).
    pub fn add(&self, direction: &LanguageDirection, doc: IndexedDoc) -> Result<()> {
        self.add_batch(direction, vec![doc], &BTreeMap::new())?;
        Ok(())
    }

    /// Remove every document of `memory`, in every direction.
    ///
    /// Only segments that exist now are tombstoned, so documents added
    /// afterwards stay visible. Returns the number of documents removed.
    pub fn delete_by_memory(&self, memory: MemoryId) -> Result<usize> {
        let state = self.writer.lock();
        let mut next = (*self.snapshot()).clone();

        let mut removed = 0usize;
        for segments in next.partitions.values_mut() {
            for live in segments.iter_mut() {
                if live.tombstones.contains(&memory) {
                    continue;
                }
                if let Some(stats) = live.segment.memory_stats().get(&memory) {
                    removed += stats.docs as usize;
                    let mut tombstones = (*live.tombstones).clone();
                    tombstones.insert(memory);
                    live.tombstones = Arc::new(tombstones);
                }
            }
        }

        if removed == 0 {
            return Ok(0);
        }

        self.persist(&next, &state)?;
        self.publish(next);

        info!(memory = %memory, docs = removed, "Deleted memory from index");
        Ok(removed)
    }

    /// Merge all segments of each direction into one, dropping tombstoned
    /// documents. Returns the number of segments removed.
    pub fn optimize(&self) -> Result<usize> {
        let started = Instant::now();
        let mut state = self.writer.lock();
        let current = self.snapshot();
        let mut next = Snapshot {
            partitions: BTreeMap::new(),
            watermarks: current.watermarks.clone(),
        };
        let mut next_state = WriterState {
            next_segment_id: state.next_segment_id,
            next_seq: state.next_seq,
        };

        let mut obsolete = Vec::new();
        let mut written = Vec::new();
        for (direction, segments) in &current.partitions {
            let dirty = segments.iter().any(|s| !s.tombstones.is_empty());
            if segments.len() <= 1 && !dirty {
                next.partitions.insert(direction.clone(), segments.clone());
                continue;
            }

            let mut docs: Vec<IndexedDoc> = segments
                .iter()
                .flat_map(|s| s.live().cloned())
                .collect();
            docs.sort_by_key(|d| d.seq);
            obsolete.extend(segments.iter().map(|s| s.segment.id()));

            if docs.is_empty() {
                continue;
            }

            let id = next_state.next_segment_id;
            next_state.next_segment_id += 1;
            let segment = Segment::build(id, direction.clone(), docs);
            if let Some(dir) = &self.dir {
                segment.write_to_file(&Segment::path_in(dir, id))?;
            }
            written.push(id);
            next.partitions
                .insert(direction.clone(), vec![LiveSegment::new(segment)]);
        }

        if obsolete.is_empty() {
            return Ok(0);
        }

        self.persist(&next, &next_state)?;
        self.publish(next);
        *state = next_state;

        if let Some(dir) = &self.dir {
            for id in &obsolete {
                let path = Segment::path_in(dir, *id);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove merged segment");
                }
            }
        }

        let removed = obsolete.len() - written.len();
        info!(
            merged = obsolete.len(),
            written = written.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Optimized index"
        );
        Ok(removed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// BM25 search over the source-side terms of `direction`.
    ///
    /// Returns at most `candidate_limit` entries, best first, ties by
    /// insertion order. If `deadline` passes between segments the scan stops
    /// and the results are flagged `truncated`.
    pub fn search(
        &self,
        direction: &LanguageDirection,
        query_terms: &[String],
        candidate_limit: usize,
        deadline: Option<Instant>,
    ) -> Result<SearchResults> {
        let started = Instant::now();
        let snapshot = self.snapshot();
        let segments = snapshot.segments(direction);

        let terms = unique_terms(query_terms);
        if segments.is_empty() || terms.is_empty() || candidate_limit == 0 {
            return Ok(SearchResults::empty());
        }

        // Collection statistics over live documents only
        let mut total_docs = 0usize;
        let mut total_len = 0u64;
        let mut doc_freq: FxHashMap<&str, usize> = FxHashMap::default();
        for live in segments {
            total_docs += live.live_docs();
            total_len += live.live_term_len();
            for term in &terms {
                let df = live
                    .segment
                    .postings(term)
                    .iter()
                    .filter(|p| live.segment.doc(p.doc).map_or(false, |d| live.is_live(d)))
                    .count();
                *doc_freq.entry(term.as_str()).or_insert(0) += df;
            }
        }
        if total_docs == 0 {
            return Ok(SearchResults::empty());
        }
        let avg_len = total_len as f32 / total_docs as f32;

        let mut truncated = false;
        let mut scanned = 0usize;
        let mut candidates: Vec<(f32, &IndexedDoc)> = Vec::new();
        for live in segments {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                truncated = true;
                break;
            }
            scanned += 1;

            let mut scores: FxHashMap<u32, f32> = FxHashMap::default();
            for term in &terms {
                let df = doc_freq.get(term.as_str()).copied().unwrap_or(0);
                if df == 0 {
                    continue;
                }
                let idf = Bm25Scorer::idf(total_docs, df);
                for posting in live.segment.postings(term) {
                    let Some(doc) = live.segment.doc(posting.doc) else {
                        continue;
                    };
                    if !live.is_live(doc) {
                        continue;
                    }
                    let s = self
                        .bm25
                        .term_score(idf, posting.tf, doc.terms.len(), avg_len);
                    *scores.entry(posting.doc).or_insert(0.0) += s;
                }
            }
            candidates.extend(
                scores
                    .into_iter()
                    .filter_map(|(pos, score)| live.segment.doc(pos).map(|d| (score, d))),
            );
        }

        let considered = candidates.len();
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.seq.cmp(&b.1.seq))
        });
        candidates.truncate(candidate_limit);

        let entries = candidates
            .into_iter()
            .map(|(score, doc)| {
                ScoreEntry::new(
                    doc.memory,
                    doc.source_words.clone(),
                    doc.target_words.clone(),
                    score,
                )
            })
            .collect();

        let stats = SearchStats::new(started.elapsed().as_micros() as u64, considered, scanned);
        Ok(SearchResults::new(entries, truncated, stats))
    }

    /// Similarity of a query document to each memory of `direction`.
    ///
    /// Every memory is one pseudo-document (term frequencies summed over its
    /// live sentences). Weights are `(1 + ln tf) · idf`; the score is the
    /// cosine between query and memory vectors. Best first, at most `limit`.
    /// When `deadline` passes mid-scan only the memories of the segments
    /// already read are scored and the vector is flagged truncated.
    pub fn document_similarity(
        &self,
        direction: &LanguageDirection,
        query_terms: &[String],
        limit: usize,
        deadline: Option<Instant>,
    ) -> Result<ContextVector> {
        let snapshot = self.snapshot();
        let segments = snapshot.segments(direction);
        if segments.is_empty() || query_terms.is_empty() || limit == 0 {
            return Ok(ContextVector::new());
        }

        let mut truncated = false;
        let mut memories: FxHashMap<MemoryId, FxHashMap<&str, u32>> = FxHashMap::default();
        for live in segments {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                debug!(direction = %direction, "Document similarity hit its deadline");
                truncated = true;
                break;
            }
            for memory in live.segment.memory_stats().keys() {
                if live.tombstones.contains(memory) {
                    continue;
                }
                let Some(terms) = live.segment.memory_terms(*memory) else {
                    continue;
                };
                let vector = memories.entry(*memory).or_default();
                for (term, tf) in terms {
                    *vector.entry(term.as_str()).or_insert(0) += tf;
                }
            }
        }
        if memories.is_empty() {
            return Ok(ContextVector::new().with_truncated(truncated));
        }

        let mut doc_freq: FxHashMap<&str, usize> = FxHashMap::default();
        for vector in memories.values() {
            for term in vector.keys() {
                *doc_freq.entry(*term).or_insert(0) += 1;
            }
        }
        let total = memories.len();
        let idf = |term: &str| Bm25Scorer::idf(total, doc_freq.get(term).copied().unwrap_or(0)) as f64;
        let weight = |tf: u32| 1.0 + (tf as f64).ln();

        let mut query: FxHashMap<&str, u32> = FxHashMap::default();
        for term in query_terms {
            *query.entry(term.as_str()).or_insert(0) += 1;
        }
        let query_vec: Vec<(&str, f64)> = query
            .iter()
            .map(|(term, tf)| (*term, weight(*tf) * idf(*term)))
            .collect();
        let query_norm = query_vec.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();

        let mut scored: Vec<(MemoryId, f32)> = memories
            .iter()
            .filter_map(|(memory, vector)| {
                let dot: f64 = query_vec
                    .iter()
                    .filter_map(|(term, qw)| vector.get(term).map(|tf| qw * weight(*tf) * idf(*term)))
                    .sum();
                if dot <= 0.0 {
                    return None;
                }
                let norm = vector
                    .iter()
                    .map(|(term, tf)| {
                        let w = weight(*tf) * idf(*term);
                        w * w
                    })
                    .sum::<f64>()
                    .sqrt();
                Some((*memory, cosine_similarity(dot, query_norm, norm)))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        Ok(ContextVector::from_pairs(scored).with_truncated(truncated))
    }

    /// Walk every live document, direction by direction, in insertion order.
    pub fn dump<F>(&self, mut consumer: F)
    where
        F: FnMut(DumpEntry),
    {
        let snapshot = self.snapshot();
        for (direction, segments) in &snapshot.partitions {
            for doc in sorted_live(segments) {
                consumer(dump_entry(direction, doc));
            }
        }
    }

    /// Walk the live documents of one memory.
    pub fn dump_memory<F>(&self, memory: MemoryId, mut consumer: F)
    where
        F: FnMut(DumpEntry),
    {
        let snapshot = self.snapshot();
        for (direction, segments) in &snapshot.partitions {
            for doc in sorted_live(segments).filter(|d| d.memory == memory) {
                consumer(dump_entry(direction, doc));
            }
        }
    }

    // ========================================================================
    // Watermarks and stats
    // ========================================================================

    /// Highest offset of `channel` already indexed for `direction`
    pub fn applied_position(
        &self,
        direction: &LanguageDirection,
        channel: ChannelId,
    ) -> Option<Offset> {
        self.snapshot()
            .watermarks
            .get(&(direction.clone(), channel))
            .copied()
    }

    /// Highest indexed offset per channel, over all directions
    pub fn applied_positions(&self) -> BTreeMap<ChannelId, Offset> {
        let mut positions = BTreeMap::new();
        for ((_, channel), offset) in &self.snapshot().watermarks {
            let entry = positions.entry(*channel).or_insert(*offset);
            *entry = (*entry).max(*offset);
        }
        positions
    }

    /// Directions with at least one segment
    pub fn directions(&self) -> Vec<LanguageDirection> {
        self.snapshot().partitions.keys().cloned().collect()
    }

    /// Number of segments of `direction`
    pub fn segment_count(&self, direction: &LanguageDirection) -> usize {
        self.snapshot().segments(direction).len()
    }

    /// Largest segment count over all directions
    pub fn max_segments_per_direction(&self) -> usize {
        self.snapshot()
            .partitions
            .values()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    /// Number of live documents
    pub fn live_doc_count(&self) -> usize {
        self.snapshot()
            .partitions
            .values()
            .flatten()
            .map(LiveSegment::live_docs)
            .sum()
    }

    /// Index-wide counters
    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        let mut stats = IndexStats {
            directions: snapshot.partitions.len(),
            ..IndexStats::default()
        };
        for live in snapshot.partitions.values().flatten() {
            let alive = live.live_docs();
            stats.segments += 1;
            stats.live_docs += alive;
            stats.deleted_docs += live.segment.doc_count() - alive;
        }
        stats
    }
}

impl std::fmt::Debug for TranslationIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationIndex")
            .field("dir", &self.dir)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn unique_terms(terms: &[String]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    terms
        .iter()
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}

fn sorted_live(segments: &[LiveSegment]) -> impl Iterator<Item = &IndexedDoc> {
    let mut docs: Vec<&IndexedDoc> = segments.iter().flat_map(|s| s.live()).collect();
    docs.sort_by_key(|d| d.seq);
    docs.into_iter()
}

fn dump_entry(direction: &LanguageDirection, doc: &IndexedDoc) -> DumpEntry {
    DumpEntry {
        memory: doc.memory,
        direction: direction.clone(),
        source: doc.source.clone(),
        target: doc.target.clone(),
    }
}

/// Delete segment files (and leftover temp files) the manifest does not reference.
fn remove_garbage(dir: &Path, referenced: &FxHashSet<u64>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let garbage = match Segment::parse_file_name(name) {
            Some(id) => !referenced.contains(&id),
            None => name.ends_with(".tmp"),
        };
        if garbage {
            warn!(file = name, "Removing unreferenced index file");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
