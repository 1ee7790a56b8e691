//! Tally - embedded memory-mapped counter store.
//!
//! This crate provides a process-local engine for large sets of named
//! numeric counters (signed, unsigned, floating point) backed by a
//! memory-mapped slot table.
//!
//! # Components
//!
//! - [`CounterStore`]: fixed-size hash-indexed slot table with an
//!   append-only overflow store for key text and merge descriptors
//! - [`CounterKey`]: hierarchical key model deriving rollup ancestor keys
//! - [`MergeOp`] / [`CounterStore::merge`]: counters derived from other
//!   counters via arithmetic merge rules with source-set drift detection
//! - [`Wal`]: durable, segment-rotated, CRC-checked mutation log with
//!   sequential replay
//!
//! # Example
//!
//! ```rust,ignore
//! use tally::{CounterStore, CounterKey, CounterValue, StoreConfig};
//!
//! let store = CounterStore::open(&StoreConfig::new("/var/lib/tally"))?;
//!
//! // One logical event updates every ancestor aggregate bucket.
//! let key = CounterKey::from("users/1/products/42/order_count");
//! store.increment_rollup(&key, CounterValue::Int(1))?;
//!
//! // Derived counter over a fixed source set.
//! store.merge(
//!     MergeOp::Add,
//!     ValueKind::Int64,
//!     "product/all_stock",
//!     &["product/stock", "product/pending_stock"],
//! )?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod key;
pub mod store;
pub mod wal;

pub use error::{Result, TallyError};
pub use key::{CounterKey, NestedKey, ROLLUP_PLACEHOLDER};
pub use store::merge::MergeOp;
pub use store::overflow::{IterAction, OverflowStore};
pub use store::slot::{CounterValue, KeyKind, ValueKind};
pub use store::{CounterStore, StoreConfig, DEFAULT_SLOT_COUNT};
pub use wal::{SyncMode, Wal, WalConfig, WalRecord};
