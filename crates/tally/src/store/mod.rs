//! Counter slot table and store facade.
//!
//! [`CounterStore`] owns two cooperating memory-mapped regions: the
//! fixed-size slot table (one 33-byte slot per addressable key, see
//! [`slot`]) and the append-only [`overflow`] store holding each key's text
//! and auxiliary payloads. A key's first write lazily initializes its slot,
//! pins the counter's value type, and persists the key text in the overflow
//! store so snapshots can recover it later.
//!
//! All structural mutation is serialized under one table-wide lock; the
//! overflow store takes its own lock strictly after the table lock. That
//! Table → Overflow acquisition order is a hard invariant — the overflow
//! store never calls back into the table.

pub mod addressing;
pub mod merge;
pub mod overflow;
pub mod slot;

use crate::error::{Result, TallyError};
use crate::key::CounterKey;
use addressing::SlotAddresser;
use memmap2::{MmapMut, MmapOptions};
use overflow::{IterAction, OverflowStore};
use parking_lot::Mutex;
use slot::{CounterValue, KeyKind, SlotMut, SlotRef, ValueKind, SLOT_SIZE, TABLE_HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default number of slots in the counter table.
pub const DEFAULT_SLOT_COUNT: u64 = 1 << 20;

/// Configuration for a [`CounterStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the slot table file.
    pub counter_path: PathBuf,
    /// Path of the overflow store file.
    pub overflow_path: PathBuf,
    /// Number of slots in the table. Must be a power of two and is fixed at
    /// creation; growing it requires a full rebuild.
    pub slot_count: u64,
}

impl StoreConfig {
    /// Creates a configuration rooted in `dir` with the default slot count.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_slot_count(dir, DEFAULT_SLOT_COUNT)
    }

    /// Creates a configuration rooted in `dir` with an explicit slot count.
    pub fn with_slot_count(dir: impl AsRef<Path>, slot_count: u64) -> Self {
        let dir = dir.as_ref();
        Self {
            counter_path: dir.join("counters.tly"),
            overflow_path: dir.join("overflow.tly"),
            slot_count,
        }
    }
}

struct TableInner {
    #[allow(dead_code)]
    file: File,
    map: MmapMut,
    key_count: u64,
}

impl TableInner {
    fn slot_ref(&self, offset: u64) -> SlotRef<'_> {
        let start = (TABLE_HEADER_SIZE + offset) as usize;
        SlotRef::new(&self.map[start..start + SLOT_SIZE as usize])
    }

    fn slot_mut(&mut self, offset: u64) -> SlotMut<'_> {
        let start = (TABLE_HEADER_SIZE + offset) as usize;
        SlotMut::new(&mut self.map[start..start + SLOT_SIZE as usize])
    }

    fn bump_key_count(&mut self) {
        self.key_count += 1;
        self.map[0..8].copy_from_slice(&self.key_count.to_le_bytes());
    }
}

/// Embedded counter store backed by a memory-mapped slot table.
pub struct CounterStore {
    pub(crate) inner: Mutex<TableInner>,
    pub(crate) overflow: OverflowStore,
    pub(crate) addresser: SlotAddresser,
    slot_count: u64,
}

impl CounterStore {
    /// Opens (or creates) the store described by `config`.
    ///
    /// The table file is sized to `8 + slot_count * SLOT_SIZE` bytes; a
    /// fresh file starts with a zero live-key count, an existing one resumes
    /// from the persisted count.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::InvalidSlotCount`] for a slot count that is not
    /// a power of two, or an I/O error if either file cannot be opened,
    /// sized, or mapped.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let addresser = SlotAddresser::new(config.slot_count)?;
        let overflow = OverflowStore::open(&config.overflow_path)?;

        let table_size = TABLE_HEADER_SIZE + config.slot_count * SLOT_SIZE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.counter_path)?;

        let is_new = file.metadata()?.len() == 0;
        file.set_len(table_size)?;

        // SAFETY: the store assumes exclusive ownership of the backing file;
        // all access to the mapping goes through the inner mutex.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

        let key_count = if is_new {
            map[0..8].copy_from_slice(&0u64.to_le_bytes());
            0
        } else {
            u64::from_le_bytes(map[0..8].try_into().unwrap())
        };

        Ok(Self {
            inner: Mutex::new(TableInner {
                file,
                map,
                key_count,
            }),
            overflow,
            addresser,
            slot_count: config.slot_count,
        })
    }

    /// Applies `delta` to `key`'s counter and returns the new value.
    ///
    /// The first write to a key pins the slot's value type from `delta` and
    /// persists the key text in the overflow store. Subsequent writes must
    /// present the same type or fail with [`TallyError::TypeConflict`]
    /// without mutating the slot. With `replace` the stored value is
    /// overwritten instead of accumulated; integer accumulation wraps.
    ///
    /// # Errors
    ///
    /// Returns a type-conflict error on a value type mismatch, or a storage
    /// error if the overflow store cannot persist the key text.
    pub fn increment(&self, key: &str, delta: CounterValue, replace: bool) -> Result<CounterValue> {
        let offset = self.addresser.slot_offset(key);
        let now = now_millis();

        let mut inner = self.inner.lock();

        if !inner.slot_ref(offset).is_initialized() {
            // Persist the key text first so a growth failure leaves the slot
            // untouched. Lock order: table held, then overflow.
            let ptr = self
                .overflow
                .write(key, offset, &[KeyKind::Counter as u64 as u8])?;

            let mut slot = inner.slot_mut(offset);
            slot.set_value_kind(delta.kind());
            slot.set_key_kind(KeyKind::Counter);
            slot.set_overflow_ptr(ptr);
            slot.set_raw_value(delta.to_bits());
            slot.set_last_modified(now);
            inner.bump_key_count();
            return Ok(delta);
        }

        let view = inner.slot_ref(offset);
        // An initialized slot always carries a concrete tag; a zero tag here
        // means the table file was corrupted externally.
        let stored = view.value_kind()?.ok_or(TallyError::UnknownTypeTag(0))?;
        if stored != delta.kind() {
            return Err(TallyError::TypeConflict {
                key: key.to_string(),
                stored,
                supplied: delta.kind(),
            });
        }

        let prev = view.raw_value();
        let next = match delta {
            CounterValue::Uint(d) => {
                let base = if replace { 0 } else { prev };
                CounterValue::Uint(base.wrapping_add(d))
            }
            CounterValue::Int(d) => {
                let base = if replace { 0 } else { prev as i64 };
                CounterValue::Int(base.wrapping_add(d))
            }
            CounterValue::Float(d) => {
                let base = if replace { 0.0 } else { f64::from_bits(prev) };
                CounterValue::Float(base + d)
            }
        };

        let mut slot = inner.slot_mut(offset);
        slot.set_raw_value(next.to_bits());
        slot.set_last_modified(now);
        Ok(next)
    }

    /// Reads `key`'s current value.
    ///
    /// A never-written key decodes as the zero value of `expected`, so
    /// absent keys read as zero rather than failing.
    pub fn get(&self, key: &str, expected: ValueKind) -> Result<CounterValue> {
        let offset = self.addresser.slot_offset(key);
        let inner = self.inner.lock();
        inner.slot_ref(offset).decode(expected)
    }

    /// Feeds every rollup ancestor of `key` through [`increment`](Self::increment)
    /// and returns the full key's new value.
    ///
    /// A key without an entity path has no rollup expansion and is
    /// incremented directly.
    pub fn increment_rollup(&self, key: &CounterKey, delta: CounterValue) -> Result<CounterValue> {
        let rollups = key.rollup_keys();
        if rollups.is_empty() {
            return self.increment(key.as_str(), delta, false);
        }

        let mut last = delta;
        for rollup in &rollups {
            last = self.increment(rollup.as_str(), delta, false)?;
        }
        Ok(last)
    }

    /// Visits every live key whose slot was modified at or after `since_ms`.
    ///
    /// Keys are enumerated from the overflow store in first-touch order; the
    /// visitor receives the key text and its decoded current value. The walk
    /// stops at the first visitor error, which is propagated.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `visit`.
    pub fn snapshot<F>(&self, since_ms: u64, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, CounterValue) -> Result<()>,
    {
        let inner = self.inner.lock();
        let table_span = self.slot_count * SLOT_SIZE;

        self.overflow.iterate(|key, slot_offset, _payload| {
            if slot_offset + SLOT_SIZE > table_span {
                warn!(key, slot_offset, "Overflow record points outside the slot table");
                return Ok(IterAction::Continue);
            }

            let slot = inner.slot_ref(slot_offset);
            if slot.last_modified() < since_ms {
                return Ok(IterAction::Continue);
            }

            let value = slot.decode(ValueKind::Uint64)?;
            visit(key, value)?;
            Ok(IterAction::Continue)
        })
    }

    /// Number of live keys in the table.
    pub fn key_count(&self) -> u64 {
        self.inner.lock().key_count
    }

    /// Flushes both mapped regions to their backing files.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().map.flush()?;
        self.overflow.flush()
    }

    /// Increments an unsigned counter. See [`increment`](Self::increment).
    pub fn incr_u64(&self, key: &str, delta: u64) -> Result<u64> {
        let value = self.increment(key, CounterValue::Uint(delta), false)?;
        Ok(value.as_u64().expect("uint increment yields a uint"))
    }

    /// Increments a signed counter. See [`increment`](Self::increment).
    pub fn incr_i64(&self, key: &str, delta: i64) -> Result<i64> {
        let value = self.increment(key, CounterValue::Int(delta), false)?;
        Ok(value.as_i64().expect("int increment yields an int"))
    }

    /// Increments a float counter. See [`increment`](Self::increment).
    pub fn incr_f64(&self, key: &str, delta: f64) -> Result<f64> {
        let value = self.increment(key, CounterValue::Float(delta), false)?;
        Ok(value.as_f64().expect("float increment yields a float"))
    }

    /// Reads an unsigned counter; absent keys read as zero.
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        match self.get(key, ValueKind::Uint64)? {
            CounterValue::Uint(v) => Ok(v),
            other => Err(TallyError::TypeConflict {
                key: key.to_string(),
                stored: other.kind(),
                supplied: ValueKind::Uint64,
            }),
        }
    }

    /// Reads a signed counter; absent keys read as zero.
    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.get(key, ValueKind::Int64)? {
            CounterValue::Int(v) => Ok(v),
            other => Err(TallyError::TypeConflict {
                key: key.to_string(),
                stored: other.kind(),
                supplied: ValueKind::Int64,
            }),
        }
    }

    /// Reads a float counter; absent keys read as zero.
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        match self.get(key, ValueKind::Float64)? {
            CounterValue::Float(v) => Ok(v),
            other => Err(TallyError::TypeConflict {
                key: key.to_string(),
                stored: other.kind(),
                supplied: ValueKind::Float64,
            }),
        }
    }
}

impl Drop for CounterStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush counter store on drop: {:?}", e);
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
