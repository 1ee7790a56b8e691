//! Append-only overflow store for variable-length key data.
//!
//! Slots in the counter table are fixed width, so the original key text (and
//! any payload too large for a slot, such as a merge descriptor) lives here.
//! The store is a memory-mapped log that only ever appends:
//!
//! ```text
//! | tail_offset (8) | record | record | ...
//! record = | key_len (8) | payload_len (8) | key_hash (8) | key bytes | payload bytes |
//! ```
//!
//! Records are never mutated or reclaimed; growth is unbounded and the file
//! is only ever reset externally. The mapped region grows by a fixed
//! increment whenever the next write would exceed it.

use crate::error::Result;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, warn};

/// Fixed growth increment for the backing file, in bytes.
pub const GROWTH_INCREMENT: u64 = 5_000_000;

/// Size of the store header (8-byte tail offset).
const HEADER_SIZE: u64 = 8;

/// Size of a record's fixed prefix (key_len + payload_len + key_hash).
const RECORD_HEADER_SIZE: u64 = 24;

/// Headroom kept between the tail and the end of the mapped region.
const GROWTH_MARGIN: u64 = 10_000;

/// Visitor verdict for [`OverflowStore::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAction {
    /// Keep walking records.
    Continue,
    /// Stop the walk without error.
    Stop,
}

struct OverflowInner {
    file: File,
    map: MmapMut,
    file_size: u64,
    tail: u64,
}

/// Append-only, memory-mapped store of key text and auxiliary payloads.
pub struct OverflowStore {
    inner: Mutex<OverflowInner>,
}

impl OverflowStore {
    /// Opens (or creates) the overflow store at `path`.
    ///
    /// A fresh file is sized to one growth increment with the tail offset
    /// pointing just past the header; an existing file resumes from its
    /// persisted tail offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, sized, or mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let mut file_size = file.metadata()?.len();
        let is_new = file_size == 0;
        if is_new {
            file_size = GROWTH_INCREMENT;
            file.set_len(file_size)?;
        }

        // SAFETY: the store assumes exclusive ownership of the backing file;
        // all access to the mapping goes through the inner mutex.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

        let tail = if is_new {
            write_tail(&mut map, HEADER_SIZE);
            HEADER_SIZE
        } else {
            read_tail(&map)
        };

        Ok(Self {
            inner: Mutex::new(OverflowInner {
                file,
                map,
                file_size,
                tail,
            }),
        })
    }

    /// Appends a record and returns the byte offset it was written at.
    ///
    /// The tail offset is only advanced (and persisted) after the record
    /// bytes are in place, so a failed growth leaves no partial record
    /// visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be grown or remapped.
    pub fn write(&self, key: &str, key_hash: u64, payload: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();

        let key_len = key.len() as u64;
        let payload_len = payload.len() as u64;
        let record_end = inner.tail + RECORD_HEADER_SIZE + key_len + payload_len;
        if record_end + GROWTH_MARGIN > inner.file_size {
            inner.grow(record_end + GROWTH_MARGIN)?;
        }

        let record_offset = inner.tail;
        let start = record_offset as usize;
        inner.map[start..start + 8].copy_from_slice(&key_len.to_le_bytes());
        inner.map[start + 8..start + 16].copy_from_slice(&payload_len.to_le_bytes());
        inner.map[start + 16..start + 24].copy_from_slice(&key_hash.to_le_bytes());

        let key_start = start + RECORD_HEADER_SIZE as usize;
        inner.map[key_start..key_start + key.len()].copy_from_slice(key.as_bytes());
        let payload_start = key_start + key.len();
        inner.map[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        inner.tail = record_end;
        let tail = inner.tail;
        write_tail(&mut inner.map, tail);

        Ok(record_offset)
    }

    /// Reads the record at `offset`, returning its key text and payload.
    pub fn read(&self, offset: u64) -> Result<(String, Vec<u8>)> {
        let inner = self.inner.lock();
        let (key, payload) = read_record(&inner.map, offset);
        Ok((key, payload))
    }

    /// Reads only the payload of the record at `offset`.
    pub fn read_payload(&self, offset: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let (_, payload) = read_record(&inner.map, offset);
        Ok(payload)
    }

    /// Walks every record in append order.
    ///
    /// The visitor receives the key text, the key hash recorded at write
    /// time, and the payload; returning [`IterAction::Stop`] ends the walk
    /// without error. The walk ends when the next record boundary would pass
    /// the persisted tail offset.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by the visitor.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, u64, &[u8]) -> Result<IterAction>,
    {
        let inner = self.inner.lock();
        let mut offset = HEADER_SIZE;

        loop {
            let start = offset as usize;
            if offset + RECORD_HEADER_SIZE > inner.tail {
                break;
            }
            let key_len = u64::from_le_bytes(inner.map[start..start + 8].try_into().unwrap());
            let payload_len =
                u64::from_le_bytes(inner.map[start + 8..start + 16].try_into().unwrap());
            let key_hash =
                u64::from_le_bytes(inner.map[start + 16..start + 24].try_into().unwrap());

            let next_offset = offset + RECORD_HEADER_SIZE + key_len + payload_len;
            if next_offset > inner.tail {
                break;
            }

            let key_start = start + RECORD_HEADER_SIZE as usize;
            let key_bytes = &inner.map[key_start..key_start + key_len as usize];
            let payload_start = key_start + key_len as usize;
            let payload = &inner.map[payload_start..payload_start + payload_len as usize];

            let key = String::from_utf8_lossy(key_bytes);
            if visit(&key, key_hash, payload)? == IterAction::Stop {
                break;
            }

            offset = next_offset;
        }

        Ok(())
    }

    /// Flushes the mapped region to the backing file.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.map.flush()?;
        Ok(())
    }
}

impl OverflowInner {
    /// Grows the backing file in fixed increments until it covers `needed`
    /// bytes, then remaps. Previously-durable data is untouched on failure.
    fn grow(&mut self, needed: u64) -> Result<()> {
        self.map.flush()?;

        let mut new_size = self.file_size;
        while new_size < needed {
            new_size += GROWTH_INCREMENT;
        }
        self.file.set_len(new_size)?;

        // SAFETY: same file, same exclusive ownership; the old mapping is
        // dropped on assignment.
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        self.file_size = new_size;

        debug!(new_size, "Grew overflow store region");
        Ok(())
    }
}

impl Drop for OverflowStore {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        if let Err(e) = inner.map.flush() {
            warn!("Failed to flush overflow store on drop: {:?}", e);
        }
    }
}

fn read_record(map: &MmapMut, offset: u64) -> (String, Vec<u8>) {
    let start = offset as usize;
    let key_len = u64::from_le_bytes(map[start..start + 8].try_into().unwrap()) as usize;
    let payload_len = u64::from_le_bytes(map[start + 8..start + 16].try_into().unwrap()) as usize;

    let key_start = start + RECORD_HEADER_SIZE as usize;
    let key = String::from_utf8_lossy(&map[key_start..key_start + key_len]).into_owned();
    let payload = map[key_start + key_len..key_start + key_len + payload_len].to_vec();
    (key, payload)
}

fn read_tail(map: &MmapMut) -> u64 {
    u64::from_le_bytes(map[0..8].try_into().unwrap())
}

fn write_tail(map: &mut MmapMut, tail: u64) {
    map[0..8].copy_from_slice(&tail.to_le_bytes());
}
