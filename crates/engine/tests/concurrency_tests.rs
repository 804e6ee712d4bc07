//! Concurrency Tests
//!
//! Ingestion from several channels, background flushing and queries running
//! at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tmstore_core::{LanguageDirection, MemoryId, TranslationUnit};
use tmstore_engine::{DataListener, Ingested, StoreBuilder, StoreConfig, TranslationMemoryStore};

fn en_es() -> LanguageDirection {
    "en:es".parse().unwrap()
}

fn busy_store() -> Arc<TranslationMemoryStore> {
    let config = StoreConfig {
        flush_interval_ms: 5,
        max_bucket_records: 16,
        max_segments_per_direction: 4,
        ..StoreConfig::default()
    };
    Arc::new(StoreBuilder::new().with_config(config).open_in_memory().unwrap())
}

fn wait_for_size(store: &TranslationMemoryStore, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.size() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

/// Concurrent channels: every unit is indexed exactly once
#[test]
fn test_parallel_channels() {
    let store = busy_store();
    let channels = 4u16;
    let per_channel = 100u64;
    let barrier = Arc::new(Barrier::new(channels as usize));

    let handles: Vec<_> = (0..channels)
        .map(|channel| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for offset in 0..per_channel {
                    let unit = TranslationUnit::new(
                        channel,
                        offset,
                        MemoryId(channel as u64),
                        en_es(),
                        format!("sentence {} of channel {}", offset, channel),
                        format!("frase {} del canal {}", offset, channel),
                    );
                    assert_eq!(store.gateway().on_unit(&unit).unwrap(), Ingested::Accepted);
                    // Redelivery of the same offset interleaved with new work
                    assert_eq!(store.gateway().on_unit(&unit).unwrap(), Ingested::Duplicate);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    store.flush_all().unwrap();
    let expected = channels as usize * per_channel as usize;
    assert_eq!(store.size(), expected);

    let mut count = 0;
    store.dump(|_| count += 1).unwrap();
    assert_eq!(count, expected);

    let positions = store.gateway().channel_positions();
    for channel in 0..channels {
        assert_eq!(positions.get(&channel), Some(&(per_channel - 1)));
    }
}

/// Readers never fail or block while the ticker flushes and optimizes
#[test]
fn test_queries_during_background_flush() {
    let store = busy_store();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last_size = 0;
                while !done.load(Ordering::Relaxed) {
                    let results = store
                        .search(&en_es(), "the quick brown fox", None, 5, None)
                        .unwrap();
                    assert!(results.len() <= 5);
                    let size = store.size();
                    assert!(size >= last_size, "indexed size went backwards");
                    last_size = size;
                }
            })
        })
        .collect();

    for offset in 0..300u64 {
        let unit = TranslationUnit::new(
            0,
            offset,
            MemoryId(offset % 3),
            en_es(),
            format!("the quick brown fox number {}", offset),
            format!("el rápido zorro marrón número {}", offset),
        );
        store.gateway().on_unit(&unit).unwrap();
    }

    wait_for_size(&store, 300);
    done.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(store.size(), 300);
    let results = store
        .search(&en_es(), "the quick brown fox number 7", None, 1, None)
        .unwrap();
    assert_eq!(results.entries[0].target.join(" "), "el rápido zorro marrón número 7");
}

/// Close while ingestion threads are running
#[test]
fn test_close_during_ingestion() {
    let store = busy_store();
    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut accepted = 0u64;
            for offset in 0..10_000u64 {
                let unit = TranslationUnit::new(0, offset, MemoryId(1), en_es(), "a pair", "un par");
                match store.gateway().on_unit(&unit) {
                    Ok(_) => accepted += 1,
                    Err(tmstore_core::Error::Closed) => break,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            accepted
        })
    };

    thread::sleep(Duration::from_millis(20));
    store.close().unwrap();
    let accepted = writer.join().unwrap();
    assert_eq!(store.size() as u64, accepted);
}
