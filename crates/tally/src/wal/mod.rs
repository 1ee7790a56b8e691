//! Write-Ahead Log for counter mutations.
//!
//! The WAL is a durability side-channel, not transactional with the slot
//! table: callers mirror mutations into it and reconstruct the logical
//! mutation stream with [`Wal::replay`] after a crash. Frames are written as
//!
//! ```text
//! | magic (4) | payload_len (4) | crc32 (4) | payload |
//! ```
//!
//! grouped into segment files capped at a fixed size and named by a
//! zero-padded segment number. Replay walks segments in ascending numeric
//! order; a short read or CRC mismatch at a frame boundary is the expected
//! signature of a torn write and ends that segment quietly, while invalid
//! magic is a fatal format error.

use crate::error::{Result, TallyError};
use crate::store::merge::MergeOp;
use crate::store::slot::{CounterValue, ValueKind};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default maximum segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL frame magic bytes.
const WAL_MAGIC: [u8; 4] = *b"TWAL";

/// Frame header size: magic (4) + payload length (4) + CRC32 (4).
const FRAME_HEADER_SIZE: u64 = 12;

const RECORD_INCREMENT: u8 = 1;
const RECORD_MERGE: u8 = 2;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each append (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum size of a single WAL segment file.
    pub segment_size: u64,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

/// One logical counter mutation carried through the WAL.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// A plain counter update.
    Increment {
        /// Counter key.
        key: String,
        /// Typed delta (or replacement value).
        delta: CounterValue,
        /// Whether the value overwrites instead of accumulating.
        replace: bool,
    },
    /// A merge-derived counter definition or recomputation.
    Merge {
        /// Fold operator.
        op: MergeOp,
        /// Value type of the derived counter.
        kind: ValueKind,
        /// Derived counter key.
        target: String,
        /// Source counter keys.
        sources: Vec<String>,
    },
}

impl WalRecord {
    /// Serializes the record to its little-endian payload form.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Increment {
                key,
                delta,
                replace,
            } => {
                let mut bytes = Vec::with_capacity(15 + key.len());
                bytes.push(RECORD_INCREMENT);
                bytes.push(delta.kind().tag());
                bytes.push(u8::from(*replace));
                bytes.extend_from_slice(&delta.to_bits().to_le_bytes());
                bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
                bytes.extend_from_slice(key.as_bytes());
                bytes
            }
            Self::Merge {
                op,
                kind,
                target,
                sources,
            } => {
                let mut bytes = Vec::new();
                bytes.push(RECORD_MERGE);
                bytes.push(*op as u8);
                bytes.push(kind.tag());
                bytes.extend_from_slice(&(sources.len() as u32).to_le_bytes());
                bytes.extend_from_slice(&(target.len() as u32).to_le_bytes());
                bytes.extend_from_slice(target.as_bytes());
                for source in sources {
                    bytes.extend_from_slice(&(source.len() as u32).to_le_bytes());
                    bytes.extend_from_slice(source.as_bytes());
                }
                bytes
            }
        }
    }

    /// Deserializes a record from a CRC-verified frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::MalformedRecord`] if the payload is shorter
    /// than its declared fields or carries an unknown tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        match cursor.u8()? {
            RECORD_INCREMENT => {
                let kind = required_kind(cursor.u8()?)?;
                let replace = cursor.u8()? != 0;
                let bits = cursor.u64()?;
                let key = cursor.string()?;
                Ok(Self::Increment {
                    key,
                    delta: CounterValue::from_bits(kind, bits),
                    replace,
                })
            }
            RECORD_MERGE => {
                let op = match cursor.u8()? {
                    0 => MergeOp::Add,
                    1 => MergeOp::Subtract,
                    2 => MergeOp::Multiply,
                    3 => MergeOp::Divide,
                    other => return Err(TallyError::UnknownMergeOp(u64::from(other))),
                };
                let kind = required_kind(cursor.u8()?)?;
                let source_count = cursor.u32()? as usize;
                let target = cursor.string()?;
                let mut sources = Vec::with_capacity(source_count);
                for _ in 0..source_count {
                    sources.push(cursor.string()?);
                }
                Ok(Self::Merge {
                    op,
                    kind,
                    target,
                    sources,
                })
            }
            other => Err(TallyError::MalformedRecord(format!(
                "unknown record tag {other}"
            ))),
        }
    }
}

fn required_kind(tag: u8) -> Result<ValueKind> {
    ValueKind::from_tag(tag)?
        .ok_or_else(|| TallyError::MalformedRecord("record carries the unset type tag".to_string()))
}

/// Bounds-checked little-endian reader over a record payload.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(TallyError::MalformedRecord(
                "record payload ends mid-field".to_string(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

struct WalInner {
    file: File,
    segment_id: u64,
    size: u64,
}

/// Segment-rotated, CRC-checked append log of counter mutations.
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens the WAL in `dir`, continuing the highest-numbered existing
    /// segment or creating segment 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the segment
    /// file cannot be opened.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segment_id = list_segments(&dir)?.last().copied().unwrap_or(1);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&dir, segment_id))?;
        let size = file.metadata()?.len();

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(WalInner {
                file,
                segment_id,
                size,
            }),
        })
    }

    /// Appends one record, rotating the segment first if the frame would
    /// push it past the size cap, and flushes durably per the configured
    /// sync mode before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the write, rotation, or sync fails.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let payload = record.to_bytes();
        let frame_size = FRAME_HEADER_SIZE + payload.len() as u64;

        let mut inner = self.inner.lock();

        if inner.size + frame_size > self.config.segment_size {
            self.rotate(&mut inner)?;
        }

        let mut frame = Vec::with_capacity(frame_size as usize);
        frame.extend_from_slice(&WAL_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        inner.file.write_all(&frame)?;
        match self.config.sync_mode {
            SyncMode::Fsync => inner.file.sync_all()?,
            SyncMode::Fdatasync => inner.file.sync_data()?,
            SyncMode::None => {}
        }

        inner.size += frame_size;
        Ok(())
    }

    /// Closes the current segment and opens the next-numbered one.
    fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        inner.file.sync_all()?;

        inner.segment_id += 1;
        let path = segment_path(&self.dir, inner.segment_id);
        inner.file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.size = 0;

        debug!("Rotated to new WAL segment: {}", path.display());
        Ok(())
    }

    /// Forces a durable flush of the current segment.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    /// The segment number currently being appended to.
    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// The WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replays every valid record in `dir`, in segment then file order.
    ///
    /// A short read or CRC mismatch at a frame boundary marks the end of
    /// valid data for that segment — the expected shape of a torn write
    /// after a crash — and replay proceeds to the next segment. Invalid
    /// magic aborts replay entirely.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid magic, an undecodable CRC-valid payload,
    /// a directory read failure, or the first error from `apply`.
    pub fn replay<F>(dir: impl AsRef<Path>, mut apply: F) -> Result<()>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let dir = dir.as_ref();
        for segment_id in list_segments(dir)? {
            let path = segment_path(dir, segment_id);
            let mut reader = BufReader::new(File::open(&path)?);
            let mut frames = 0u64;

            loop {
                let mut header = [0u8; FRAME_HEADER_SIZE as usize];
                match reader.read_exact(&mut header) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }

                let magic: [u8; 4] = header[0..4].try_into().unwrap();
                if magic != WAL_MAGIC {
                    return Err(TallyError::InvalidMagic(magic));
                }

                let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
                let expected_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

                let mut payload = vec![0u8; len];
                match reader.read_exact(&mut payload) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        warn!("Torn frame at tail of WAL segment {}", path.display());
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }

                if crc32fast::hash(&payload) != expected_crc {
                    warn!("CRC mismatch at tail of WAL segment {}", path.display());
                    break;
                }

                apply(WalRecord::from_bytes(&payload)?)?;
                frames += 1;
            }

            debug!(segment_id, frames, "Replayed WAL segment");
        }

        Ok(())
    }
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:016}.{SEGMENT_EXTENSION}"))
}

/// Segment numbers present in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn incr(key: &str, delta: i64) -> WalRecord {
        WalRecord::Increment {
            key: key.to_string(),
            delta: CounterValue::Int(delta),
            replace: false,
        }
    }

    fn replay_all(dir: &Path) -> Vec<WalRecord> {
        let mut records = Vec::new();
        Wal::replay(dir, |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();
        records
    }

    #[test]
    fn increment_record_roundtrip() {
        let record = WalRecord::Increment {
            key: "users/1/order_count".to_string(),
            delta: CounterValue::Float(2.5),
            replace: true,
        };
        assert_eq!(WalRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn merge_record_roundtrip() {
        let record = WalRecord::Merge {
            op: MergeOp::Subtract,
            kind: ValueKind::Uint64,
            target: "product/net_stock".to_string(),
            sources: vec!["product/stock".to_string(), "product/reserved".to_string()],
        };
        assert_eq!(WalRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let bytes = incr("k", 1).to_bytes();
        assert!(matches!(
            WalRecord::from_bytes(&bytes[..bytes.len() - 1]),
            Err(TallyError::MalformedRecord(_))
        ));
    }

    #[test]
    fn append_then_replay_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            wal.append(&incr("a", 1)).unwrap();
            wal.append(&incr("b", 2)).unwrap();
            wal.append(&incr("c", 3)).unwrap();
        }

        let records = replay_all(temp_dir.path());
        assert_eq!(records, vec![incr("a", 1), incr("b", 2), incr("c", 3)]);
    }

    #[test]
    fn reopen_continues_highest_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            assert_eq!(wal.current_segment_id(), 1);
            wal.append(&incr("a", 1)).unwrap();
        }
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            assert_eq!(wal.current_segment_id(), 1);
            wal.append(&incr("b", 2)).unwrap();
        }

        assert_eq!(replay_all(temp_dir.path()).len(), 2);
    }

    #[test]
    fn rotation_caps_segment_size() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            segment_size: 64,
            sync_mode: SyncMode::None,
        };
        let wal = Wal::open(temp_dir.path(), config).unwrap();

        for i in 0..10 {
            wal.append(&incr(&format!("key/{i}"), i)).unwrap();
        }
        assert!(wal.current_segment_id() > 1);

        // Rotation must not lose or reorder anything.
        drop(wal);
        let records = replay_all(temp_dir.path());
        assert_eq!(records.len(), 10);
        assert_eq!(records[9], incr("key/9", 9));
    }

    #[test]
    fn torn_tail_is_skipped_not_fatal() {
        use std::io::Write as _;

        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            wal.append(&incr("a", 1)).unwrap();
            wal.append(&incr("b", 2)).unwrap();
        }

        // Simulate a crash mid-frame: a full header promising more payload
        // bytes than were ever written.
        let path = segment_path(temp_dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&WAL_MAGIC).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(&[0xde, 0xad]).unwrap();

        let records = replay_all(temp_dir.path());
        assert_eq!(records, vec![incr("a", 1), incr("b", 2)]);
    }

    #[test]
    fn torn_segment_does_not_block_later_segments() {
        use std::io::Write as _;

        let temp_dir = TempDir::new().unwrap();

        // Segment 1 ends in a CRC-corrupt frame.
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            wal.append(&incr("a", 1)).unwrap();
        }
        {
            let payload = incr("broken", 9).to_bytes();
            let mut file = OpenOptions::new()
                .append(true)
                .open(segment_path(temp_dir.path(), 1))
                .unwrap();
            file.write_all(&WAL_MAGIC).unwrap();
            file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&0xbad1deau32.to_le_bytes()).unwrap();
            file.write_all(&payload).unwrap();
        }

        // Segment 2 is untouched and must still replay.
        {
            let mut file = File::create(segment_path(temp_dir.path(), 2)).unwrap();
            let payload = incr("c", 3).to_bytes();
            file.write_all(&WAL_MAGIC).unwrap();
            file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&crc32fast::hash(&payload).to_le_bytes())
                .unwrap();
            file.write_all(&payload).unwrap();
        }

        let records = replay_all(temp_dir.path());
        assert_eq!(records, vec![incr("a", 1), incr("c", 3)]);
    }

    #[test]
    fn invalid_magic_is_fatal() {
        use std::io::Write as _;

        let temp_dir = TempDir::new().unwrap();
        let path = segment_path(temp_dir.path(), 1);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"NOPE").unwrap();
        file.write_all(&[0u8; 8]).unwrap();

        let result = Wal::replay(temp_dir.path(), |_| Ok(()));
        assert!(matches!(result, Err(TallyError::InvalidMagic(_))));
    }

    #[test]
    fn apply_error_stops_replay() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path(), WalConfig::default()).unwrap();
            wal.append(&incr("a", 1)).unwrap();
            wal.append(&incr("b", 2)).unwrap();
        }

        let mut seen = 0;
        let result = Wal::replay(temp_dir.path(), |_| {
            seen += 1;
            Err(TallyError::MalformedRecord("handler refused".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
    }
}
