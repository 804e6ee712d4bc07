//! Translation memory engine
//!
//! This crate orchestrates the lower layers:
//! - Store: open/recover/close, query API, background flushing
//! - Ingestion gateway: ledger discipline, validation, filtering
//! - Bucket registry: per-direction write buffers and their flush
//! - Background scheduler: worker pool for flush and optimize tasks
//!
//! The engine is the only component that knows about:
//! - How buckets, ledger and index recover together
//! - The store configuration file

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod filter;
pub mod gateway;
pub mod registry;
pub mod store;

pub use background::{BackgroundScheduler, SchedulerStats, Submitted, TaskPriority};
pub use config::{parse_direction_key, AlignmentConfig, StoreConfig, CONFIG_FILE_NAME};
pub use filter::{AcceptAll, AlignmentFilter, ThresholdAlignmentFilter};
pub use gateway::{
    DataListener, GatewayParts, GatewayStats, Ingested, IngestionGateway, StreamRecord,
};
pub use registry::{BucketInfo, BucketRegistry, FlushThresholds, RoutingOptions};
pub use store::{StoreBuilder, StoreStats, TranslationMemoryStore, BUCKETS_DIR, INDEX_DIR};
