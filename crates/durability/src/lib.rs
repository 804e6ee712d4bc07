//! Durability layer for the translation memory store
//!
//! This crate handles the write path before indexing:
//!
//! - Channel ledger: per-channel last-applied offsets (`ledger.bin`)
//! - Buckets: per-direction append-only buffers of accepted units
//! - Record framing: length-prefixed, CRC-checked bucket records
//! - Durability modes: Always, Standard (default), Cache
//! - Retry policy for transient I/O failures

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bucket;
pub mod ledger;
pub mod mode;
pub mod record;
pub mod retry;

pub use bucket::{Bucket, BucketCounters, BucketHeader, BUCKET_EXTENSION, BUCKET_HEADER_SIZE};
pub use ledger::{ChannelLedger, LEDGER_FILE_NAME};
pub use mode::DurabilityMode;
pub use record::{BufferedUnit, RecordError};
pub use retry::RetryPolicy;
