//! Shared test utilities for the integration suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use std::sync::Once;
use tempfile::TempDir;
use tmstore::{
    DataListener, DumpEntry, Ingested, LanguageDirection, MemoryId, StoreBuilder, StoreConfig,
    TranslationMemoryStore, TranslationUnit,
};

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output to the test harness (shown for failing tests).
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Configuration with the ticker effectively disabled, so tests decide
/// when buckets are flushed.
pub fn manual_flush_config() -> StoreConfig {
    StoreConfig {
        durability: "always".to_string(),
        flush_interval_ms: 60_000,
        ..StoreConfig::default()
    }
}

/// `en:es`
pub fn en_es() -> LanguageDirection {
    "en:es".parse().unwrap()
}

/// Unit on channel 0 in `en:es`
pub fn unit(offset: u64, memory: u64, source: &str, target: &str) -> TranslationUnit {
    TranslationUnit::new(0, offset, MemoryId(memory), en_es(), source, target)
}

/// Store on disk with manual flushing.
pub struct TestStore {
    pub store: TranslationMemoryStore,
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let store = StoreBuilder::new()
            .with_config(manual_flush_config())
            .open(dir.path())
            .unwrap();
        TestStore { store, dir }
    }

    /// Close and open the same directory again
    pub fn reopen(self) -> Self {
        let TestStore { store, dir } = self;
        store.close().unwrap();
        drop(store);
        let store = StoreBuilder::new()
            .with_config(manual_flush_config())
            .open(dir.path())
            .unwrap();
        TestStore { store, dir }
    }

    pub fn ingest(&self, unit: &TranslationUnit) -> Ingested {
        self.store.gateway().on_unit(unit).unwrap()
    }

    pub fn dump(&self) -> Vec<DumpEntry> {
        let mut entries = Vec::new();
        self.store.dump(|e| entries.push(e)).unwrap();
        entries
    }

    pub fn dump_memory(&self, memory: u64) -> Vec<DumpEntry> {
        let mut entries = Vec::new();
        self.store
            .dump_memory(MemoryId(memory), |e| entries.push(e))
            .unwrap();
        entries
    }
}
