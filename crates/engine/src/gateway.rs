//! Ingestion gateway: the stream-facing entry point of the store
//!
//! Every record goes through the same steps under one mutex, so the ledger
//! check, the durable write and the ledger commit are atomic per record:
//!
//! ```text
//! duplicate?  ──yes──► drop
//!     │no
//! malformed?  ──yes──► count, commit
//!     │no
//! filtered?   ──yes──► count, commit
//!     │no
//! buffer (retry transient I/O) ──err──► return error, nothing committed
//!     │ok
//! commit
//! ```
//!
//! In Standard durability commits stay in memory until
//! [`IngestionGateway::checkpoint`] syncs the buckets and writes the ledger.
//! A deletion checkpoints right away: replaying it after a crash could
//! remove pairs that other channels delivered later.

use crate::filter::AlignmentFilter;
use crate::registry::BucketRegistry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tmstore_core::{
    ChannelId, Deletion, Error, LanguageDirection, LimitError, Limits, Offset, Result, Side,
    TranslationUnit,
};
use tmstore_durability::{ChannelLedger, RetryPolicy};
use tmstore_search::{AnalyzerRegistry, TranslationIndex};
use tracing::{debug, info, warn};

// ============================================================================
// DataListener
// ============================================================================

/// What happened to one stream record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Buffered for indexing
    Accepted,
    /// Offset already applied; dropped
    Duplicate,
    /// Failed validation; dropped and committed
    Malformed {
        /// Reason code of the violated limit
        reason: &'static str,
    },
    /// Rejected by the alignment filter or not a served direction
    Filtered,
    /// Memory removed
    Deleted {
        /// Documents tombstoned in the index
        indexed: usize,
        /// Records removed from buckets
        buffered: usize,
    },
}

/// A stream record, for ordering mixed batches
#[derive(Debug, Clone, Copy)]
pub enum StreamRecord<'a> {
    /// Sentence pair
    Unit(&'a TranslationUnit),
    /// Memory deletion
    Deletion(&'a Deletion),
}

impl StreamRecord<'_> {
    fn position(&self) -> (ChannelId, Offset) {
        match self {
            StreamRecord::Unit(u) => (u.channel, u.offset),
            StreamRecord::Deletion(d) => (d.channel, d.offset),
        }
    }
}

/// Consumer of the upstream record stream.
pub trait DataListener: Send + Sync {
    /// Handle one sentence pair
    fn on_unit(&self, unit: &TranslationUnit) -> Result<Ingested>;

    /// Handle one memory deletion
    fn on_deletion(&self, deletion: &Deletion) -> Result<Ingested>;

    /// Last applied offset of every channel, used to resume the stream
    fn channel_positions(&self) -> BTreeMap<ChannelId, Offset>;

    /// Handle units and deletions together, in (channel, offset) order.
    ///
    /// Stops at the first error; records before it stay applied.
    fn on_batch(&self, units: &[TranslationUnit], deletions: &[Deletion]) -> Result<Vec<Ingested>> {
        let mut records: Vec<StreamRecord<'_>> = units
            .iter()
            .map(StreamRecord::Unit)
            .chain(deletions.iter().map(StreamRecord::Deletion))
            .collect();
        records.sort_by_key(StreamRecord::position);

        records
            .into_iter()
            .map(|record| match record {
                StreamRecord::Unit(u) => self.on_unit(u),
                StreamRecord::Deletion(d) => self.on_deletion(d),
            })
            .collect()
    }
}

// ============================================================================
// GatewayStats
// ============================================================================

/// Ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Units buffered for indexing
    pub accepted: u64,
    /// Records dropped as already applied
    pub duplicates: u64,
    /// Units rejected by validation
    pub malformed: u64,
    /// Units rejected by the filter or direction allow-list
    pub filtered: u64,
    /// Deletions applied
    pub deletions: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    deletions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            deletions: self.deletions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// IngestionGateway
// ============================================================================

/// Validates, filters and buffers stream records; owns the ledger discipline.
pub struct IngestionGateway {
    ledger: Arc<ChannelLedger>,
    registry: Arc<BucketRegistry>,
    index: Arc<TranslationIndex>,
    filter: Arc<dyn AlignmentFilter>,
    analyzers: AnalyzerRegistry,
    limits: Limits,
    retry: RetryPolicy,
    allowed: Option<BTreeSet<LanguageDirection>>,
    lock: Mutex<()>,
    closed: AtomicBool,
    counters: Counters,
}

/// Collaborators and policies of a gateway
pub struct GatewayParts {
    /// Applied offsets
    pub ledger: Arc<ChannelLedger>,
    /// Buckets
    pub registry: Arc<BucketRegistry>,
    /// Index (for deletions)
    pub index: Arc<TranslationIndex>,
    /// Unit filter
    pub filter: Arc<dyn AlignmentFilter>,
    /// Analyzers (for word counts)
    pub analyzers: AnalyzerRegistry,
    /// Size limits
    pub limits: Limits,
    /// Retry policy for transient I/O
    pub retry: RetryPolicy,
    /// Served directions (already key-normalized), `None` for all
    pub allowed: Option<BTreeSet<LanguageDirection>>,
}

impl IngestionGateway {
    /// Assemble a gateway
    pub fn new(parts: GatewayParts) -> Self {
        IngestionGateway {
            ledger: parts.ledger,
            registry: parts.registry,
            index: parts.index,
            filter: parts.filter,
            analyzers: parts.analyzers,
            limits: parts.limits,
            retry: parts.retry,
            allowed: parts.allowed,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Ingestion counters
    pub fn stats(&self) -> GatewayStats {
        self.counters.snapshot()
    }

    /// Reject every further record with `Error::Closed`.
    ///
    /// Waits for the record in progress, if any.
    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Sync every bucket, then write the ledger positions they cover.
    ///
    /// Returns `true` if the ledger file changed.
    pub fn checkpoint(&self) -> Result<bool> {
        self.ledger.checkpoint(|| self.registry.sync_all())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn validate(&self, unit: &TranslationUnit) -> std::result::Result<(), LimitError> {
        self.limits.validate_sentence(Side::Source, &unit.source)?;
        self.limits.validate_sentence(Side::Target, &unit.target)?;

        let source_words = self
            .analyzers
            .analyzer_for(&unit.direction.source)
            .words(&unit.source)
            .len();
        let target_words = self
            .analyzers
            .analyzer_for(&unit.direction.target)
            .words(&unit.target)
            .len();
        self.limits.validate_word_count(Side::Source, source_words)?;
        self.limits.validate_word_count(Side::Target, target_words)?;

        if let Some(alignment) = &unit.alignment {
            self.limits.validate_alignment_len(alignment.links.len())?;
            let outside = alignment
                .links
                .iter()
                .find(|&&(s, t)| s as usize >= source_words || t as usize >= target_words);
            if let Some(&(source_index, target_index)) = outside {
                return Err(LimitError::LinkOutOfRange {
                    source_index,
                    target_index,
                    source_words,
                    target_words,
                });
            }
        }
        Ok(())
    }

    fn is_served(&self, unit: &TranslationUnit) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(&self.registry.key_for(&unit.direction)),
            None => true,
        }
    }
}

impl DataListener for IngestionGateway {
    fn on_unit(&self, unit: &TranslationUnit) -> Result<Ingested> {
        let _guard = self.lock.lock();
        self.check_open()?;

        if !self.ledger.is_new(unit.channel, unit.offset) {
            Counters::bump(&self.counters.duplicates);
            debug!(channel = unit.channel, offset = unit.offset, "Dropped redelivered unit");
            return Ok(Ingested::Duplicate);
        }

        if let Err(violation) = self.validate(unit) {
            warn!(
                channel = unit.channel,
                offset = unit.offset,
                memory = %unit.memory,
                reason = violation.reason_code(),
                error = %violation,
                "Rejected malformed unit"
            );
            self.ledger.commit(unit.channel, unit.offset)?;
            Counters::bump(&self.counters.malformed);
            return Ok(Ingested::Malformed {
                reason: violation.reason_code(),
            });
        }

        if !self.is_served(unit) || !self.filter.accept(unit) {
            debug!(
                channel = unit.channel,
                offset = unit.offset,
                direction = %unit.direction,
                filter = self.filter.name(),
                "Filtered unit"
            );
            self.ledger.commit(unit.channel, unit.offset)?;
            Counters::bump(&self.counters.filtered);
            return Ok(Ingested::Filtered);
        }

        self.retry.run("buffer unit", || self.registry.route(unit))?;
        self.ledger.commit(unit.channel, unit.offset)?;
        Counters::bump(&self.counters.accepted);
        Ok(Ingested::Accepted)
    }

    fn on_deletion(&self, deletion: &Deletion) -> Result<Ingested> {
        let _guard = self.lock.lock();
        self.check_open()?;

        if !self.ledger.is_new(deletion.channel, deletion.offset) {
            Counters::bump(&self.counters.duplicates);
            debug!(
                channel = deletion.channel,
                offset = deletion.offset,
                "Dropped redelivered deletion"
            );
            return Ok(Ingested::Duplicate);
        }

        // Buckets first: purging waits for any flush in progress, so its
        // documents are in the index before the tombstones are written
        let buffered = self
            .retry
            .run("purge memory", || self.registry.purge_memory(deletion.memory))?;
        let indexed = self
            .retry
            .run("delete memory", || self.index.delete_by_memory(deletion.memory))?;
        self.ledger.commit(deletion.channel, deletion.offset)?;
        self.checkpoint()?;
        Counters::bump(&self.counters.deletions);

        info!(
            channel = deletion.channel,
            offset = deletion.offset,
            memory = %deletion.memory,
            indexed,
            buffered,
            "Applied deletion"
        );
        Ok(Ingested::Deleted { indexed, buffered })
    }

    fn channel_positions(&self) -> BTreeMap<ChannelId, Offset> {
        self.ledger.snapshot()
    }
}

impl std::fmt::Debug for IngestionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionGateway")
            .field("filter", &self.filter.name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AcceptAll, ThresholdAlignmentFilter};
    use crate::registry::{FlushThresholds, RoutingOptions};
    use tmstore_core::{Alignment, MemoryId};
    use tmstore_durability::DurabilityMode;

    struct Fixture {
        gateway: IngestionGateway,
        registry: Arc<BucketRegistry>,
        index: Arc<TranslationIndex>,
    }

    fn fixture_with(filter: Arc<dyn AlignmentFilter>, allowed: Option<BTreeSet<LanguageDirection>>) -> Fixture {
        let index = Arc::new(TranslationIndex::in_memory());
        let registry = Arc::new(
            BucketRegistry::open(
                None,
                DurabilityMode::Cache,
                Arc::clone(&index),
                AnalyzerRegistry::new(),
                FlushThresholds::default(),
                RoutingOptions::default(),
            )
            .unwrap(),
        );
        let gateway = IngestionGateway::new(GatewayParts {
            ledger: Arc::new(ChannelLedger::in_memory()),
            registry: Arc::clone(&registry),
            index: Arc::clone(&index),
            filter,
            analyzers: AnalyzerRegistry::new(),
            limits: Limits::with_small_limits(),
            retry: RetryPolicy::no_retry(),
            allowed,
        });
        Fixture {
            gateway,
            registry,
            index,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(AcceptAll), None)
    }

    fn unit(offset: Offset, memory: u64, source: &str, target: &str) -> TranslationUnit {
        TranslationUnit::new(0, offset, MemoryId(memory), "en:es".parse().unwrap(), source, target)
    }

    #[test]
    fn test_accept_then_duplicate() {
        let f = fixture();
        let u = unit(0, 1, "the cat sat", "el gato se sentó");
        assert_eq!(f.gateway.on_unit(&u).unwrap(), Ingested::Accepted);
        assert_eq!(f.gateway.on_unit(&u).unwrap(), Ingested::Duplicate);
        assert_eq!(f.registry.buffered_records(), 1);
        assert_eq!(f.gateway.channel_positions().get(&0), Some(&0));

        let stats = f.gateway.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_malformed_units_are_committed() {
        let f = fixture();
        let outcome = f.gateway.on_unit(&unit(0, 1, "   ", "algo")).unwrap();
        assert_eq!(outcome, Ingested::Malformed { reason: "empty_sentence" });

        let long = "word ".repeat(9);
        let outcome = f.gateway.on_unit(&unit(1, 1, &long, "algo")).unwrap();
        assert_eq!(outcome, Ingested::Malformed { reason: "too_many_words" });

        let bad = unit(2, 1, "two words", "dos palabras").with_alignment(Alignment::new(vec![(0, 0), (2, 1)], 0.9));
        let outcome = f.gateway.on_unit(&bad).unwrap();
        assert_eq!(outcome, Ingested::Malformed { reason: "alignment_out_of_range" });

        assert_eq!(f.gateway.stats().malformed, 3);
        assert_eq!(f.registry.buffered_records(), 0);
        // Redelivery of a malformed record is a duplicate
        assert_eq!(f.gateway.on_unit(&unit(2, 1, "two words", "dos palabras")).unwrap(), Ingested::Duplicate);
    }

    #[test]
    fn test_filtered_units_are_committed() {
        let f = fixture_with(Arc::new(ThresholdAlignmentFilter::new(0.5)), None);
        let weak = unit(0, 1, "two words", "dos palabras").with_alignment(Alignment::new(vec![(0, 0)], 0.2));
        let strong = unit(1, 1, "two words", "dos palabras").with_alignment(Alignment::new(vec![(0, 0)], 0.8));

        assert_eq!(f.gateway.on_unit(&weak).unwrap(), Ingested::Filtered);
        assert_eq!(f.gateway.on_unit(&strong).unwrap(), Ingested::Accepted);
        assert_eq!(f.gateway.channel_positions().get(&0), Some(&1));
        assert_eq!(f.gateway.stats().filtered, 1);
    }

    #[test]
    fn test_unserved_direction_is_filtered() {
        let allowed: BTreeSet<LanguageDirection> = ["en:it".parse().unwrap()].into_iter().collect();
        let f = fixture_with(Arc::new(AcceptAll), Some(allowed));
        assert_eq!(f.gateway.on_unit(&unit(0, 1, "hello", "hola")).unwrap(), Ingested::Filtered);
    }

    #[test]
    fn test_deletion_removes_indexed_and_buffered() {
        let f = fixture();
        f.gateway.on_unit(&unit(0, 1, "indexed pair", "par indexado")).unwrap();
        f.registry.flush_all().unwrap();
        f.gateway.on_unit(&unit(1, 1, "buffered pair", "par en espera")).unwrap();
        f.gateway.on_unit(&unit(2, 2, "other memory", "otra memoria")).unwrap();

        let outcome = f.gateway.on_deletion(&Deletion::new(0, 3, MemoryId(1))).unwrap();
        assert_eq!(outcome, Ingested::Deleted { indexed: 1, buffered: 1 });

        f.registry.flush_all().unwrap();
        let mut memories = Vec::new();
        f.index.dump(|e| memories.push(e.memory));
        assert_eq!(memories, vec![MemoryId(2)]);

        // A late add at or below the deletion offset never resurrects it
        assert_eq!(f.gateway.on_unit(&unit(1, 1, "buffered pair", "par")).unwrap(), Ingested::Duplicate);
    }

    #[test]
    fn test_on_batch_orders_by_offset() {
        let f = fixture();
        let units = vec![unit(2, 1, "after deletion", "después"), unit(0, 1, "before deletion", "antes")];
        let deletions = vec![Deletion::new(0, 1, MemoryId(1))];

        let outcomes = f.gateway.on_batch(&units, &deletions).unwrap();
        assert_eq!(outcomes[0], Ingested::Accepted);
        assert_eq!(outcomes[1], Ingested::Deleted { indexed: 0, buffered: 1 });
        assert_eq!(outcomes[2], Ingested::Accepted);

        f.registry.flush_all().unwrap();
        let mut sources = Vec::new();
        f.index.dump(|e| sources.push(e.source));
        assert_eq!(sources, vec!["after deletion".to_string()]);
    }

    #[test]
    fn test_closed_gateway_rejects() {
        let f = fixture();
        f.gateway.close();
        assert!(matches!(f.gateway.on_unit(&unit(0, 1, "a b", "c d")), Err(Error::Closed)));
        assert!(matches!(
            f.gateway.on_deletion(&Deletion::new(0, 1, MemoryId(1))),
            Err(Error::Closed)
        ));
    }
}
