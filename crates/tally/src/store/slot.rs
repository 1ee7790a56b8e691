//! Binary slot layout for the counter table.
//!
//! Every counter occupies one fixed-width slot inside the memory-mapped
//! table region:
//!
//! ```text
//! | type_tag (1) | key_kind (8) | overflow_ptr (8) | value (8) | last_modified (8) |
//! ```
//!
//! The 8-byte value field is reinterpreted per the type tag: a two's
//! complement integer or an IEEE-754 bit pattern. `last_modified` is
//! milliseconds since epoch; zero is the sentinel for "slot never
//! initialized" and is the sole existence test for a key.

use crate::error::{Result, TallyError};

/// Width of one counter slot in bytes.
pub const SLOT_SIZE: u64 = 33;

/// Size of the table file header (8-byte live-key counter).
pub const TABLE_HEADER_SIZE: u64 = 8;

const TYPE_TAG_OFFSET: usize = 0;
const KEY_KIND_OFFSET: usize = 1;
const OVERFLOW_PTR_OFFSET: usize = 9;
const VALUE_OFFSET: usize = 17;
const LAST_MODIFIED_OFFSET: usize = 25;

const TAG_UNSET: u8 = 0;
const TAG_UINT64: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT64: u8 = 3;

/// The value type pinned to a slot by its first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Unsigned 64-bit integer counter.
    Uint64,
    /// Signed 64-bit integer counter.
    Int64,
    /// IEEE-754 double counter.
    Float64,
}

impl ValueKind {
    /// Decodes a slot tag byte. `None` means the slot has never pinned a type.
    pub(crate) fn from_tag(tag: u8) -> Result<Option<Self>> {
        match tag {
            TAG_UNSET => Ok(None),
            TAG_UINT64 => Ok(Some(Self::Uint64)),
            TAG_INT64 => Ok(Some(Self::Int64)),
            TAG_FLOAT64 => Ok(Some(Self::Float64)),
            other => Err(TallyError::UnknownTypeTag(other)),
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Uint64 => TAG_UINT64,
            Self::Int64 => TAG_INT64,
            Self::Float64 => TAG_FLOAT64,
        }
    }

    /// Returns the zero value of this kind, used for absent-key reads.
    pub fn zero(self) -> CounterValue {
        match self {
            Self::Uint64 => CounterValue::Uint(0),
            Self::Int64 => CounterValue::Int(0),
            Self::Float64 => CounterValue::Float(0.0),
        }
    }
}

/// A typed counter value carried across the public API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    /// Unsigned 64-bit integer.
    Uint(u64),
    /// Signed 64-bit integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
}

impl CounterValue {
    /// The value kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Uint(_) => ValueKind::Uint64,
            Self::Int(_) => ValueKind::Int64,
            Self::Float(_) => ValueKind::Float64,
        }
    }

    /// Raw 8-byte slot representation of this value.
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            Self::Uint(v) => v,
            Self::Int(v) => v as u64,
            Self::Float(v) => v.to_bits(),
        }
    }

    /// Reinterprets raw slot bits per the given kind.
    pub(crate) fn from_bits(kind: ValueKind, bits: u64) -> Self {
        match kind {
            ValueKind::Uint64 => Self::Uint(bits),
            ValueKind::Int64 => Self::Int(bits as i64),
            ValueKind::Float64 => Self::Float(f64::from_bits(bits)),
        }
    }

    /// Returns the inner value if this is a `Uint`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the inner value if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the inner value if this is a `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Role of the key occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum KeyKind {
    /// Slot role has never been recorded.
    Unknown = 0,
    /// Plain accumulating counter.
    Counter = 1,
    /// Counter derived from other counters via a merge descriptor.
    Merge = 2,
    /// Reserved for variable-payload keys.
    Dynamic = 3,
}

impl KeyKind {
    pub(crate) fn from_u64(raw: u64) -> Self {
        match raw {
            1 => Self::Counter,
            2 => Self::Merge,
            3 => Self::Dynamic,
            _ => Self::Unknown,
        }
    }
}

/// Read-only view over one slot's bytes.
#[derive(Clone, Copy)]
pub(crate) struct SlotRef<'a> {
    buf: &'a [u8],
}

impl<'a> SlotRef<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        debug_assert_eq!(buf.len(), SLOT_SIZE as usize);
        Self { buf }
    }

    pub(crate) fn value_kind(&self) -> Result<Option<ValueKind>> {
        ValueKind::from_tag(self.buf[TYPE_TAG_OFFSET])
    }

    pub(crate) fn key_kind(&self) -> KeyKind {
        KeyKind::from_u64(read_u64(self.buf, KEY_KIND_OFFSET))
    }

    pub(crate) fn overflow_ptr(&self) -> u64 {
        read_u64(self.buf, OVERFLOW_PTR_OFFSET)
    }

    pub(crate) fn raw_value(&self) -> u64 {
        read_u64(self.buf, VALUE_OFFSET)
    }

    pub(crate) fn last_modified(&self) -> u64 {
        read_u64(self.buf, LAST_MODIFIED_OFFSET)
    }

    /// Whether the slot has ever been written. Zero timestamp is the sentinel.
    pub(crate) fn is_initialized(&self) -> bool {
        self.last_modified() != 0
    }

    /// Decodes the stored value per the slot's own tag, falling back to the
    /// caller's expected kind for a never-initialized slot.
    pub(crate) fn decode(&self, fallback: ValueKind) -> Result<CounterValue> {
        let kind = self.value_kind()?.unwrap_or(fallback);
        Ok(CounterValue::from_bits(kind, self.raw_value()))
    }
}

/// Mutable view over one slot's bytes.
pub(crate) struct SlotMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> SlotMut<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        debug_assert_eq!(buf.len(), SLOT_SIZE as usize);
        Self { buf }
    }

    pub(crate) fn as_ref(&self) -> SlotRef<'_> {
        SlotRef::new(&self.buf[..])
    }

    pub(crate) fn set_value_kind(&mut self, kind: ValueKind) {
        self.buf[TYPE_TAG_OFFSET] = kind.tag();
    }

    pub(crate) fn set_key_kind(&mut self, kind: KeyKind) {
        write_u64(self.buf, KEY_KIND_OFFSET, kind as u64);
    }

    pub(crate) fn set_overflow_ptr(&mut self, ptr: u64) {
        write_u64(self.buf, OVERFLOW_PTR_OFFSET, ptr);
    }

    pub(crate) fn set_raw_value(&mut self, bits: u64) {
        write_u64(self.buf, VALUE_OFFSET, bits);
    }

    pub(crate) fn set_last_modified(&mut self, ts_ms: u64) {
        write_u64(self.buf, LAST_MODIFIED_OFFSET, ts_ms);
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
