//! Bucket registry: routes units to per-direction buckets and flushes them
//!
//! ## Flush protocol
//!
//! 1. Lock the bucket (appends to it wait)
//! 2. Read every buffered record
//! 3. Skip records at or below the direction's applied watermark, and
//!    offsets already seen earlier in the batch
//! 4. Analyze the rest and add them to the index as one segment, moving the
//!    watermarks in the same manifest write
//! 5. Truncate the bucket
//!
//! A crash after 4 and before 5 leaves records in the bucket that step 3
//! skips on replay.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tmstore_core::{ChannelId, LanguageDirection, MemoryId, Offset, Result, TranslationUnit};
use tmstore_durability::{Bucket, BufferedUnit, DurabilityMode};
use tmstore_search::{AnalyzerRegistry, IndexedDoc, TranslationIndex};
use tracing::{debug, info};

/// Thresholds that make a bucket due for flushing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushThresholds {
    /// Buffered records
    pub max_records: usize,
    /// Buffered bytes
    pub max_bytes: u64,
    /// Age of the oldest buffered record
    pub max_age: Duration,
}

impl Default for FlushThresholds {
    fn default() -> Self {
        FlushThresholds {
            max_records: 1000,
            max_bytes: 8 * 1024 * 1024,
            max_age: Duration::from_secs(5),
        }
    }
}

impl FlushThresholds {
    fn is_due(&self, bucket: &Bucket) -> bool {
        !bucket.is_empty()
            && (bucket.len() >= self.max_records
                || bucket.size() >= self.max_bytes
                || bucket.age() >= self.max_age)
    }
}

/// Routing options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingOptions {
    /// Also buffer the reversed pair under the reversed direction
    pub direction_symmetric: bool,
    /// Key buckets by primary language only
    pub mask_language_region: bool,
}

/// Buffered records of one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    /// Direction of the bucket
    pub direction: LanguageDirection,
    /// Buffered records
    pub records: usize,
    /// Buffered bytes
    pub bytes: u64,
    /// Total fsync calls on the bucket file
    pub sync_calls: u64,
}

/// Owns every bucket and moves their contents into the index.
pub struct BucketRegistry {
    dir: Option<PathBuf>,
    mode: DurabilityMode,
    buckets: DashMap<LanguageDirection, Arc<Mutex<Bucket>>>,
    index: Arc<TranslationIndex>,
    analyzers: AnalyzerRegistry,
    thresholds: FlushThresholds,
    routing: RoutingOptions,
}

impl BucketRegistry {
    /// Open the registry, reopening every bucket file found in `dir`.
    ///
    /// `dir` is `None` in Cache mode.
    pub fn open(
        dir: Option<&Path>,
        mode: DurabilityMode,
        index: Arc<TranslationIndex>,
        analyzers: AnalyzerRegistry,
        thresholds: FlushThresholds,
        routing: RoutingOptions,
    ) -> Result<Self> {
        let registry = BucketRegistry {
            dir: dir.map(Path::to_path_buf),
            mode,
            buckets: DashMap::new(),
            index,
            analyzers,
            thresholds,
            routing,
        };

        if let Some(dir) = dir.filter(|_| mode.requires_files()) {
            for direction in Bucket::list(dir)? {
                let bucket = Bucket::open(dir, direction.clone(), mode)?;
                if !bucket.is_empty() {
                    info!(
                        direction = %direction,
                        records = bucket.len(),
                        "Reopened bucket with buffered records"
                    );
                }
                registry
                    .buckets
                    .insert(direction, Arc::new(Mutex::new(bucket)));
            }
        }
        Ok(registry)
    }

    /// Bucket key of a unit's direction
    pub fn key_for(&self, direction: &LanguageDirection) -> LanguageDirection {
        if self.routing.mask_language_region {
            direction.masked()
        } else {
            direction.clone()
        }
    }

    fn bucket(&self, direction: &LanguageDirection) -> Result<Arc<Mutex<Bucket>>> {
        if let Some(bucket) = self.buckets.get(direction) {
            return Ok(Arc::clone(bucket.value()));
        }
        let entry = self.buckets.entry(direction.clone()).or_try_insert_with(|| {
            debug!(direction = %direction, "Creating bucket");
            let dir = self.dir.as_deref().unwrap_or(Path::new("."));
            Bucket::open(dir, direction.clone(), self.mode).map(|b| Arc::new(Mutex::new(b)))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Buffer a unit in the bucket of its (masked) direction and, in
    /// symmetric mode, the swapped pair in the reversed bucket.
    ///
    /// Appending the same unit twice is harmless: flush skips repeated offsets.
    pub fn route(&self, unit: &TranslationUnit) -> Result<()> {
        let direction = self.key_for(&unit.direction);
        let buffered = BufferedUnit::from(unit);

        self.bucket(&direction)?.lock().append(&buffered)?;
        if self.routing.direction_symmetric {
            let reversed = direction.reversed();
            if reversed != direction {
                self.bucket(&reversed)?.lock().append(&buffered.reversed())?;
            }
        }
        Ok(())
    }

    /// Directions whose bucket crossed a flush threshold
    pub fn flush_due(&self) -> Vec<LanguageDirection> {
        let mut due: Vec<LanguageDirection> = self
            .buckets
            .iter()
            .filter(|entry| self.thresholds.is_due(&entry.value().lock()))
            .map(|entry| entry.key().clone())
            .collect();
        due.sort();
        due
    }

    /// Move the contents of one bucket into the index.
    ///
    /// Returns the number of documents added.
    pub fn flush(&self, direction: &LanguageDirection) -> Result<usize> {
        let Some(bucket) = self.buckets.get(direction).map(|b| Arc::clone(b.value())) else {
            return Ok(0);
        };
        let mut bucket = bucket.lock();
        if bucket.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let units = bucket.drain()?;
        let buffered = units.len();
        let (docs, applied) = self.prepare(direction, units);
        let added = self.index.add_batch(direction, docs, &applied)?;
        bucket.reset()?;

        info!(
            direction = %direction,
            records = buffered,
            indexed = added,
            skipped = buffered - added,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed bucket"
        );
        Ok(added)
    }

    /// Analyze drained records, dropping the ones the index already holds.
    fn prepare(
        &self,
        direction: &LanguageDirection,
        units: Vec<BufferedUnit>,
    ) -> (Vec<IndexedDoc>, BTreeMap<ChannelId, Offset>) {
        let source = self.analyzers.analyzer_for(&direction.source);
        let target = self.analyzers.analyzer_for(&direction.target);

        let mut last: BTreeMap<ChannelId, Option<Offset>> = BTreeMap::new();
        let mut applied: BTreeMap<ChannelId, Offset> = BTreeMap::new();
        let mut docs = Vec::with_capacity(units.len());

        for unit in units {
            let mark = last
                .entry(unit.channel)
                .or_insert_with(|| self.index.applied_position(direction, unit.channel));
            if mark.map_or(false, |m| unit.offset <= m) {
                continue;
            }
            *mark = Some(unit.offset);
            let high = applied.entry(unit.channel).or_insert(unit.offset);
            *high = (*high).max(unit.offset);

            docs.push(IndexedDoc {
                seq: 0,
                memory: unit.memory,
                channel: unit.channel,
                offset: unit.offset,
                source_words: source.words(&unit.source),
                target_words: target.words(&unit.target),
                terms: source.terms(&unit.source),
                source: unit.source,
                target: unit.target,
            });
        }
        (docs, applied)
    }

    /// Flush every bucket. Returns the number of documents added.
    pub fn flush_all(&self) -> Result<usize> {
        let mut added = 0;
        for direction in self.directions() {
            added += self.flush(&direction)?;
        }
        Ok(added)
    }

    /// Remove buffered records of `memory` from every bucket.
    pub fn purge_memory(&self, memory: MemoryId) -> Result<usize> {
        let mut removed = 0;
        for direction in self.directions() {
            if let Some(bucket) = self.buckets.get(&direction).map(|b| Arc::clone(b.value())) {
                removed += bucket.lock().purge_memory(memory)?;
            }
        }
        Ok(removed)
    }

    /// Sync every bucket.
    pub fn sync_all(&self) -> Result<()> {
        for direction in self.directions() {
            if let Some(bucket) = self.buckets.get(&direction).map(|b| Arc::clone(b.value())) {
                bucket.lock().sync()?;
            }
        }
        Ok(())
    }

    /// Directions with a bucket, sorted
    pub fn directions(&self) -> Vec<LanguageDirection> {
        let mut directions: Vec<LanguageDirection> =
            self.buckets.iter().map(|e| e.key().clone()).collect();
        directions.sort();
        directions
    }

    /// Buffered records per bucket
    pub fn buckets(&self) -> Vec<BucketInfo> {
        self.directions()
            .into_iter()
            .filter_map(|direction| {
                let bucket = self.buckets.get(&direction).map(|b| Arc::clone(b.value()))?;
                let bucket = bucket.lock();
                Some(BucketInfo {
                    records: bucket.len(),
                    bytes: bucket.size(),
                    sync_calls: bucket.counters().sync_calls,
                    direction,
                })
            })
            .collect()
    }

    /// Buffered records over all buckets
    pub fn buffered_records(&self) -> usize {
        self.buckets.iter().map(|e| e.value().lock().len()).sum()
    }

    /// The index the registry flushes into
    pub fn index(&self) -> &Arc<TranslationIndex> {
        &self.index
    }
}

impl std::fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("dir", &self.dir)
            .field("mode", &self.mode)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
