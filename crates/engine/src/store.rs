//! Store facade: recovery, background flushing and the query API
//!
//! On-disk layout under the store root:
//!
//! ```text
//! <root>/
//!   .lock
//!   tmstore.toml
//!   ledger.bin
//!   buckets/<src>__<tgt>.bkt
//!   index/index.manifest
//!   index/seg-NNNNNNNN.tms
//! ```

use crate::background::{BackgroundScheduler, SchedulerStats, TaskPriority};
use crate::config::{StoreConfig, CONFIG_FILE_NAME};
use crate::filter::{AlignmentFilter, ThresholdAlignmentFilter};
use crate::gateway::{GatewayParts, GatewayStats, IngestionGateway};
use crate::registry::{BucketInfo, BucketRegistry, FlushThresholds, RoutingOptions};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tmstore_core::{
    ContextVector, DumpEntry, Error, LanguageDirection, Limits, MemoryId, Result, SearchResults,
};
use tmstore_durability::{ChannelLedger, DurabilityMode, LEDGER_FILE_NAME};
use tmstore_search::{AnalyzerRegistry, ContextScorer, F1BleuRescorer, IndexStats, TranslationIndex};
use tracing::{debug, info, warn};

/// Directory of bucket files under the store root
pub const BUCKETS_DIR: &str = "buckets";

/// Directory of the index under the store root
pub const INDEX_DIR: &str = "index";

const LOCK_FILE_NAME: &str = ".lock";

// ============================================================================
// StoreBuilder
// ============================================================================

/// Builder for [`TranslationMemoryStore`]
///
/// ```ignore
/// use tmstore_engine::TranslationMemoryStore;
///
/// // Configuration from <dir>/tmstore.toml (written with defaults if missing)
/// let store = TranslationMemoryStore::open("/data/tm")?;
///
/// // Injected collaborators
/// let store = TranslationMemoryStore::builder()
///     .with_analyzers(analyzers)
///     .with_alignment_filter(Arc::new(AcceptAll))
///     .open("/data/tm")?;
///
/// // No files at all (tests)
/// let store = TranslationMemoryStore::builder().open_in_memory()?;
/// ```
pub struct StoreBuilder {
    config: Option<StoreConfig>,
    analyzers: AnalyzerRegistry,
    filter: Option<Arc<dyn AlignmentFilter>>,
    limits: Limits,
    cache: bool,
}

impl StoreBuilder {
    /// Builder with default collaborators
    pub fn new() -> Self {
        StoreBuilder {
            config: None,
            analyzers: AnalyzerRegistry::new(),
            filter: None,
            limits: Limits::default(),
            cache: false,
        }
    }

    /// Use this configuration instead of the one in `tmstore.toml`.
    ///
    /// It is written to `tmstore.toml` when that file does not exist yet.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Analyzers used at index and query time
    pub fn with_analyzers(mut self, analyzers: AnalyzerRegistry) -> Self {
        self.analyzers = analyzers;
        self
    }

    /// Filter applied to well-formed units.
    ///
    /// Defaults to a [`ThresholdAlignmentFilter`] built from `[alignment]`.
    pub fn with_alignment_filter(mut self, filter: Arc<dyn AlignmentFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Size limits for ingested sentences
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Keep buckets, ledger and index in memory regardless of `durability`
    pub fn cache(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Open (or create) the store rooted at `dir`, recovering buffered data
    pub fn open<P: AsRef<Path>>(self, dir: P) -> Result<TranslationMemoryStore> {
        let root = dir.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        let lock_file = acquire_lock(&root)?;

        let config_path = root.join(CONFIG_FILE_NAME);
        let config = match self.config.clone() {
            Some(config) => {
                config.validate()?;
                if !config_path.exists() {
                    config.write_to_file(&config_path)?;
                }
                config
            }
            None => {
                StoreConfig::write_default_if_missing(&config_path)?;
                StoreConfig::from_file(&config_path)?
            }
        };

        self.assemble(Some(root), config, Some(lock_file))
    }

    /// Open a store that never touches the filesystem
    pub fn open_in_memory(mut self) -> Result<TranslationMemoryStore> {
        let config = self.config.take().unwrap_or_default();
        config.validate()?;
        self.cache = true;
        self.assemble(None, config, None)
    }

    fn assemble(
        self,
        root: Option<PathBuf>,
        config: StoreConfig,
        lock_file: Option<File>,
    ) -> Result<TranslationMemoryStore> {
        let mode = if self.cache {
            DurabilityMode::Cache
        } else {
            config.durability_mode()?
        };
        let on_disk = root.as_deref().filter(|_| mode.requires_files());

        let ledger = Arc::new(match on_disk {
            Some(root) => ChannelLedger::open(&root.join(LEDGER_FILE_NAME), mode)?,
            None => ChannelLedger::in_memory(),
        });

        let index = Arc::new(match on_disk {
            Some(root) => TranslationIndex::open(&root.join(INDEX_DIR))?,
            None => TranslationIndex::in_memory(),
        });

        let buckets_dir = on_disk.map(|root| root.join(BUCKETS_DIR));
        let registry = Arc::new(BucketRegistry::open(
            buckets_dir.as_deref(),
            mode,
            Arc::clone(&index),
            self.analyzers.clone(),
            FlushThresholds {
                max_records: config.max_bucket_records,
                max_bytes: config.max_bucket_bytes,
                max_age: config.max_bucket_age(),
            },
            RoutingOptions {
                direction_symmetric: config.direction_symmetric,
                mask_language_region: config.mask_language_region,
            },
        )?);

        // Replay whatever survived in the buckets, then make redelivery of
        // everything already in the index a no-op
        let replayed = registry.flush_all()?;
        let raised = ledger.raise_to(&index.applied_positions())?;
        if replayed > 0 || raised > 0 {
            info!(replayed, raised, "Recovered buffered records");
        }

        let allowed = config
            .allowed_directions()?
            .map(|directions| -> BTreeSet<LanguageDirection> {
                directions.iter().map(|d| config.key_direction(d)).collect()
            });

        let filter: Arc<dyn AlignmentFilter> = match self.filter {
            Some(filter) => filter,
            None => {
                let filter = config
                    .alignment_thresholds()?
                    .into_iter()
                    .fold(
                        ThresholdAlignmentFilter::new(config.alignment.default_threshold),
                        |filter, (direction, threshold)| filter.with_threshold(direction, threshold),
                    )
                    .with_region_masking(config.mask_language_region);
                Arc::new(filter)
            }
        };

        let gateway = Arc::new(IngestionGateway::new(GatewayParts {
            ledger: Arc::clone(&ledger),
            registry: Arc::clone(&registry),
            index: Arc::clone(&index),
            filter,
            analyzers: self.analyzers.clone(),
            limits: self.limits,
            retry: config.retry_policy(),
            allowed: allowed.clone(),
        }));

        let scheduler = Arc::new(BackgroundScheduler::new(
            config.background_threads,
            config.max_queue_depth,
        )?);

        let (ticker_tx, ticker_rx) = mpsc::channel::<()>();
        let ticker = {
            let gateway = Arc::clone(&gateway);
            let registry = Arc::clone(&registry);
            let index = Arc::clone(&index);
            let scheduler = Arc::clone(&scheduler);
            // Standard mode checkpoints at its sync interval
            let interval = match (mode, on_disk) {
                (DurabilityMode::Standard { interval_ms, .. }, Some(_)) => config
                    .flush_interval()
                    .min(Duration::from_millis(interval_ms.max(1))),
                _ => config.flush_interval(),
            };
            let max_segments = config.max_segments_per_direction;
            std::thread::Builder::new()
                .name("tmstore-flush".to_string())
                .spawn(move || loop {
                    match ticker_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            tick(&gateway, &registry, &index, &scheduler, max_segments)
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(Error::Io)?
        };

        let context_scorer = ContextScorer::new(config.blend_mode()?, config.default_context_weight);
        let rescorer = config.f1_bleu_rescoring.then(F1BleuRescorer::new);

        info!(
            root = ?root,
            durability = %mode,
            live_docs = index.live_doc_count(),
            channels = ledger.snapshot().len(),
            "Opened translation memory store"
        );

        Ok(TranslationMemoryStore {
            root,
            config,
            mode,
            index,
            registry,
            gateway,
            analyzers: self.analyzers,
            scheduler,
            context_scorer,
            rescorer,
            allowed,
            open: AtomicBool::new(true),
            ticker_tx: Mutex::new(Some(ticker_tx)),
            ticker: Mutex::new(Some(ticker)),
            _lock_file: lock_file,
        })
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn acquire_lock(root: &Path) -> Result<File> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(root.join(LOCK_FILE_NAME))?;
    fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
        Error::config(format!(
            "store at '{}' is already in use by another process",
            root.display()
        ))
    })?;
    Ok(lock_file)
}

/// One pass of the flush ticker
fn tick(
    gateway: &IngestionGateway,
    registry: &Arc<BucketRegistry>,
    index: &Arc<TranslationIndex>,
    scheduler: &BackgroundScheduler,
    max_segments: usize,
) {
    if let Err(e) = gateway.checkpoint() {
        warn!(error = %e, "Ledger checkpoint failed");
    }

    for direction in registry.flush_due() {
        let key = format!("flush:{}", direction);
        let task_registry = Arc::clone(registry);
        let task_direction = direction.clone();
        let submitted = scheduler.submit(TaskPriority::Normal, key, move || {
            if let Err(e) = task_registry.flush(&task_direction) {
                warn!(direction = %task_direction, error = %e, "Background flush failed");
            }
        });
        match submitted {
            Ok(_) => {}
            Err(Error::Backpressure) => {
                debug!(direction = %direction, "Background queue full, flush deferred");
                break;
            }
            Err(_) => return,
        }
    }

    if index.max_segments_per_direction() > max_segments {
        let task_index = Arc::clone(index);
        let submitted = scheduler.submit(TaskPriority::Low, "optimize", move || {
            match task_index.optimize() {
                Ok(removed) => debug!(removed, "Background optimize complete"),
                Err(e) => warn!(error = %e, "Background optimize failed"),
            }
        });
        match submitted {
            Ok(_) => {}
            Err(Error::Backpressure) => debug!("Background queue full, optimize deferred"),
            Err(e) => debug!(error = %e, "Optimize not scheduled"),
        }
    }
}

// ============================================================================
// TranslationMemoryStore
// ============================================================================

/// Snapshot of store-wide counters
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    /// Index partitions and documents
    pub index: IndexStats,
    /// Ingestion outcomes
    pub gateway: GatewayStats,
    /// Background work
    pub scheduler: SchedulerStats,
    /// Records waiting in each bucket
    pub buckets: Vec<BucketInfo>,
}

impl StoreStats {
    /// Records buffered but not yet indexed
    pub fn buffered_records(&self) -> usize {
        self.buckets.iter().map(|b| b.records).sum()
    }
}

/// Translation memory: stream ingestion, fuzzy-match retrieval and context
/// vectors over one store root.
pub struct TranslationMemoryStore {
    root: Option<PathBuf>,
    config: StoreConfig,
    mode: DurabilityMode,
    index: Arc<TranslationIndex>,
    registry: Arc<BucketRegistry>,
    gateway: Arc<IngestionGateway>,
    analyzers: AnalyzerRegistry,
    scheduler: Arc<BackgroundScheduler>,
    context_scorer: ContextScorer,
    rescorer: Option<F1BleuRescorer>,
    allowed: Option<BTreeSet<LanguageDirection>>,
    open: AtomicBool,
    ticker_tx: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Held for the lifetime of the store
    _lock_file: Option<File>,
}

impl TranslationMemoryStore {
    /// Builder with default collaborators
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Open (or create) the store at `dir` with default collaborators
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        StoreBuilder::new().open(dir)
    }

    /// Store root, `None` for in-memory stores
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Effective configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Effective durability mode
    pub fn durability_mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Stream entry point
    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    /// True until [`close`](Self::close)
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Partition key of a query direction, if the direction is served
    fn partition_for(&self, direction: &LanguageDirection) -> Result<LanguageDirection> {
        let key = self.config.key_direction(direction);
        let served = match &self.allowed {
            None => true,
            Some(allowed) => {
                allowed.contains(&key)
                    || (self.config.direction_symmetric && allowed.contains(&key.reversed()))
            }
        };
        if !served {
            return Err(Error::UnsupportedDirection(direction.clone()));
        }
        Ok(key)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fuzzy-match retrieval of up to `limit` pairs for `sentence`.
    ///
    /// Candidates come from BM25 over the source side, are rescored with
    /// F1-BLEU when enabled, then blended with `context`. When `timeout`
    /// expires mid-scan the partial results are flagged `truncated`.
    pub fn search(
        &self,
        direction: &LanguageDirection,
        sentence: &str,
        context: Option<&ContextVector>,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<SearchResults> {
        self.check_open()?;
        let partition = self.partition_for(direction)?;
        if limit == 0 {
            return Ok(SearchResults::empty());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let analyzer = self.analyzers.analyzer_for(&direction.source);
        let terms = analyzer.terms(sentence);
        let candidate_limit = self.config.min_query_size.max(limit.saturating_mul(2));

        let mut results = self.index.search(&partition, &terms, candidate_limit, deadline)?;
        if let Some(rescorer) = &self.rescorer {
            rescorer.rescore(&analyzer.words(sentence), &mut results.entries);
        }
        let candidates = std::mem::take(&mut results.entries);
        let entries = self.context_scorer.rescore(candidates, context, limit);

        debug!(
            direction = %partition,
            candidates = results.stats.candidates_considered,
            returned = entries.len(),
            truncated = results.truncated,
            "Search complete"
        );
        Ok(SearchResults::new(entries, results.truncated, results.stats))
    }

    /// Similarity of `document` to every memory of `direction`, best first.
    ///
    /// When `timeout` expires mid-scan the vector is flagged truncated.
    pub fn context_vector_for(
        &self,
        direction: &LanguageDirection,
        document: &str,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<ContextVector> {
        self.check_open()?;
        let partition = self.partition_for(direction)?;
        if limit == 0 {
            return Ok(ContextVector::new());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let terms = self.analyzers.analyzer_for(&direction.source).terms(document);
        let context = self.index.document_similarity(&partition, &terms, limit, deadline)?;
        debug!(
            direction = %partition,
            memories = context.len(),
            truncated = context.is_truncated(),
            "Context vector complete"
        );
        Ok(context)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Merge the segments of every direction; returns segments removed
    pub fn optimize(&self) -> Result<usize> {
        self.check_open()?;
        self.index.optimize()
    }

    /// Walk every indexed pair of a consistent snapshot
    pub fn dump<F>(&self, consumer: F) -> Result<()>
    where
        F: FnMut(DumpEntry),
    {
        self.check_open()?;
        self.index.dump(consumer);
        Ok(())
    }

    /// Walk the indexed pairs of one memory
    pub fn dump_memory<F>(&self, memory: MemoryId, consumer: F) -> Result<()>
    where
        F: FnMut(DumpEntry),
    {
        self.check_open()?;
        self.index.dump_memory(memory, consumer);
        Ok(())
    }

    /// Index every buffered record now; returns records indexed
    pub fn flush_all(&self) -> Result<usize> {
        self.check_open()?;
        self.registry.flush_all()
    }

    /// Live indexed documents
    pub fn size(&self) -> usize {
        self.index.live_doc_count()
    }

    /// Store-wide counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            index: self.index.stats(),
            gateway: self.gateway.stats(),
            scheduler: self.scheduler.stats(),
            buckets: self.registry.buckets(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop ingestion, finish background work and flush every bucket.
    ///
    /// Every later call returns `Error::Closed`. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.gateway.close();

        // Dropping the sender wakes the ticker
        self.ticker_tx.lock().take();
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }

        self.scheduler.drain();
        self.scheduler.shutdown();

        let flushed = self.registry.flush_all()?;
        self.gateway.checkpoint()?;

        info!(root = ?self.root, flushed, "Closed translation memory store");
        Ok(())
    }
}

impl Drop for TranslationMemoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close translation memory store cleanly");
        }
    }
}

impl std::fmt::Debug for TranslationMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationMemoryStore")
            .field("root", &self.root)
            .field("durability", &self.mode)
            .field("open", &self.is_open())
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DataListener, Ingested};
    use tempfile::TempDir;
    use tmstore_core::{Deletion, TranslationUnit};

    fn en_es() -> LanguageDirection {
        "en:es".parse().unwrap()
    }

    fn unit(offset: u64, memory: u64, source: &str, target: &str) -> TranslationUnit {
        TranslationUnit::new(0, offset, MemoryId(memory), en_es(), source, target)
    }

    fn quiet_config() -> StoreConfig {
        StoreConfig {
            flush_interval_ms: 60_000,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_open_writes_default_config() {
        let temp = TempDir::new().unwrap();
        let store = TranslationMemoryStore::open(temp.path()).unwrap();
        assert!(temp.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(store.config(), &StoreConfig::default());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_second_open_is_locked() {
        let temp = TempDir::new().unwrap();
        let _store = TranslationMemoryStore::open(temp.path()).unwrap();
        let err = TranslationMemoryStore::open(temp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_search_with_context() {
        let store = StoreBuilder::new().with_config(quiet_config()).open_in_memory().unwrap();
        let gateway = store.gateway();
        gateway.on_unit(&unit(0, 1, "the cat sat", "el gato se sentó")).unwrap();
        gateway.on_unit(&unit(1, 2, "the cat sat", "el gato estaba sentado")).unwrap();
        store.flush_all().unwrap();

        let context = ContextVector::new().with(MemoryId(1), 1.0).with(MemoryId(2), 0.0);
        let results = store
            .search(&en_es(), "the cat sat", Some(&context), 1, None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.entries[0].memory, MemoryId(1));

        let context = ContextVector::new().with(MemoryId(1), 0.1).with(MemoryId(2), 0.9);
        let results = store
            .search(&en_es(), "the cat sat", Some(&context), 1, None)
            .unwrap();
        assert_eq!(results.entries[0].memory, MemoryId(2));
    }

    #[test]
    fn test_unsupported_direction() {
        let config = StoreConfig {
            languages: Some(vec!["en-es".to_string()]),
            ..quiet_config()
        };
        let store = StoreBuilder::new().with_config(config).open_in_memory().unwrap();
        let err = store
            .search(&"en:de".parse().unwrap(), "hello", None, 5, None)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDirection(_)));
        assert!(store.search(&"en-GB:es".parse().unwrap(), "hello", None, 5, None).is_ok());
    }

    #[test]
    fn test_context_vector_for() {
        let store = StoreBuilder::new().with_config(quiet_config()).open_in_memory().unwrap();
        let gateway = store.gateway();
        gateway.on_unit(&unit(0, 1, "invoice payment due", "factura")).unwrap();
        gateway.on_unit(&unit(1, 2, "the striker scored a goal", "gol")).unwrap();
        store.flush_all().unwrap();

        let context = store
            .context_vector_for(&en_es(), "please settle the invoice payment", 10, None)
            .unwrap();
        assert_eq!(context.entries()[0].memory, MemoryId(1));
        assert!(context.weight_of(MemoryId(2)).is_none());
        assert!(!context.is_truncated());
    }

    #[test]
    fn test_context_vector_expired_timeout_truncates() {
        let store = StoreBuilder::new().with_config(quiet_config()).open_in_memory().unwrap();
        store
            .gateway()
            .on_unit(&unit(0, 1, "invoice payment due", "factura"))
            .unwrap();
        store.flush_all().unwrap();

        let context = store
            .context_vector_for(&en_es(), "invoice payment", 10, Some(Duration::ZERO))
            .unwrap();
        assert!(context.is_truncated());
        assert!(context.is_empty());
    }

    #[test]
    fn test_tick_defers_optimize_when_queue_is_full() {
        let store = StoreBuilder::new().with_config(quiet_config()).open_in_memory().unwrap();
        let gateway = store.gateway();
        gateway.on_unit(&unit(0, 1, "first pair", "primer par")).unwrap();
        store.flush_all().unwrap();
        gateway.on_unit(&unit(1, 1, "second pair", "segundo par")).unwrap();
        store.flush_all().unwrap();
        assert_eq!(store.index.segment_count(&en_es()), 2);

        // One busy worker and a full queue
        let scheduler = BackgroundScheduler::new(1, 1).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Normal, "busy", move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        scheduler.submit(TaskPriority::Normal, "queued", || {}).unwrap();

        tick(&store.gateway, &store.registry, &store.index, &scheduler, 1);
        assert_eq!(scheduler.stats().queue_depth, 1);
        barrier.wait();
        scheduler.drain();
        assert_eq!(store.index.segment_count(&en_es()), 2);

        // Picked up by the next tick once there is room
        tick(&store.gateway, &store.registry, &store.index, &scheduler, 1);
        scheduler.drain();
        assert_eq!(store.index.segment_count(&en_es()), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_deletion_and_dump() {
        let store = StoreBuilder::new().with_config(quiet_config()).open_in_memory().unwrap();
        let gateway = store.gateway();
        gateway.on_unit(&unit(0, 1, "the cat sat", "el gato se sentó")).unwrap();
        gateway.on_unit(&unit(1, 2, "the cat sat", "el gato estaba sentado")).unwrap();
        store.flush_all().unwrap();

        let outcome = gateway.on_deletion(&Deletion::new(0, 2, MemoryId(1))).unwrap();
        assert_eq!(outcome, Ingested::Deleted { indexed: 1, buffered: 0 });

        let mut dumped = Vec::new();
        store.dump(|e| dumped.push(e)).unwrap();
        assert_eq!(dumped.len(), 1);
        assert_eq!(dumped[0].memory, MemoryId(2));
        assert_eq!(dumped[0].target, "el gato estaba sentado");
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_close_rejects_calls() {
        let temp = TempDir::new().unwrap();
        let store = StoreBuilder::new().with_config(quiet_config()).open(temp.path()).unwrap();
        store.gateway().on_unit(&unit(0, 1, "buffered only", "solo en búfer")).unwrap();
        store.close().unwrap();

        assert!(!store.is_open());
        assert!(matches!(store.search(&en_es(), "buffered", None, 1, None), Err(Error::Closed)));
        assert!(matches!(store.flush_all(), Err(Error::Closed)));
        assert!(matches!(
            store.gateway().on_unit(&unit(1, 1, "late", "tarde")),
            Err(Error::Closed)
        ));
        // Close flushed the bucket
        assert_eq!(store.size(), 1);
        store.close().unwrap();
    }

    #[test]
    fn test_background_flush() {
        let config = StoreConfig {
            flush_interval_ms: 10,
            max_bucket_records: 2,
            ..StoreConfig::default()
        };
        let store = StoreBuilder::new().with_config(config).open_in_memory().unwrap();
        store.gateway().on_unit(&unit(0, 1, "first pair", "primer par")).unwrap();
        store.gateway().on_unit(&unit(1, 1, "second pair", "segundo par")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.size() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.size(), 2);
    }
}
