//! Derived counters: merge descriptors and recomputation.
//!
//! A merge-derived counter's value is a fold over a fixed set of source
//! counters. The definition is persisted in the overflow store as a
//! descriptor:
//!
//! ```text
//! | operator (8) | source_count (8) | fingerprint (8) | sorted source slot offsets (8 each) |
//! ```
//!
//! Source offsets are stored sorted and the fingerprint hashes the sorted
//! list, so the source set is order-independent and a later call that names
//! a different set is detected as drift and rejected without mutation.

use crate::error::{Result, TallyError};
use crate::store::addressing::SlotAddresser;
use crate::store::slot::{CounterValue, KeyKind, ValueKind};
use crate::store::{now_millis, CounterStore};

const DESCRIPTOR_HEADER_SIZE: usize = 24;

/// Arithmetic rule folding a derived counter's sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MergeOp {
    /// Sum of all sources.
    Add = 0,
    /// First source minus the sum of the rest.
    Subtract = 1,
    /// Product of all sources.
    Multiply = 2,
    /// First source divided by each of the rest, left to right.
    Divide = 3,
}

impl MergeOp {
    fn from_u64(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(Self::Add),
            1 => Ok(Self::Subtract),
            2 => Ok(Self::Multiply),
            3 => Ok(Self::Divide),
            other => Err(TallyError::UnknownMergeOp(other)),
        }
    }
}

/// Persisted definition of a derived counter's operator and source set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MergeDescriptor {
    pub(crate) op: MergeOp,
    pub(crate) fingerprint: u64,
    pub(crate) source_offsets: Vec<u64>,
}

impl MergeDescriptor {
    /// Builds a descriptor from unsorted source slot offsets.
    pub(crate) fn build(op: MergeOp, mut source_offsets: Vec<u64>) -> Self {
        source_offsets.sort_unstable();

        let mut offset_bytes = Vec::with_capacity(source_offsets.len() * 8);
        for offset in &source_offsets {
            offset_bytes.extend_from_slice(&offset.to_le_bytes());
        }
        let fingerprint = SlotAddresser::fingerprint(&offset_bytes);

        Self {
            op,
            fingerprint,
            source_offsets,
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(DESCRIPTOR_HEADER_SIZE + self.source_offsets.len() * 8);
        bytes.extend_from_slice(&(self.op as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.source_offsets.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&self.fingerprint.to_le_bytes());
        for offset in &self.source_offsets {
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_HEADER_SIZE {
            return Err(TallyError::MalformedRecord(
                "merge descriptor shorter than its header".to_string(),
            ));
        }

        let op = MergeOp::from_u64(u64::from_le_bytes(bytes[0..8].try_into().unwrap()))?;
        let count = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let fingerprint = u64::from_le_bytes(bytes[16..24].try_into().unwrap());

        if bytes.len() < DESCRIPTOR_HEADER_SIZE + count * 8 {
            return Err(TallyError::MalformedRecord(
                "merge descriptor source list truncated".to_string(),
            ));
        }

        let mut source_offsets = Vec::with_capacity(count);
        for i in 0..count {
            let start = DESCRIPTOR_HEADER_SIZE + i * 8;
            source_offsets.push(u64::from_le_bytes(
                bytes[start..start + 8].try_into().unwrap(),
            ));
        }

        Ok(Self {
            op,
            fingerprint,
            source_offsets,
        })
    }
}

impl CounterStore {
    /// Defines or recomputes the merge-derived counter `target`.
    ///
    /// The first call pins `target`'s value type to `kind`, persists the
    /// descriptor in the overflow store, and marks the slot merge-derived.
    /// Later calls must present the same source set (in any order) and the
    /// same kind; a changed source set fails with
    /// [`TallyError::DescriptorDrift`] and leaves the stored value
    /// untouched. Every call folds the sources' current values — each
    /// converted from its own stored type into `kind` — and overwrites the
    /// target's value with the result. Recomputation alone does not advance
    /// the target's last-modified stamp.
    ///
    /// # Errors
    ///
    /// Fails before any hashing or locking on an empty source list or an
    /// empty-string source key. Also fails on descriptor drift, a value
    /// type mismatch, or integer division by a zero-valued source.
    pub fn merge(
        &self,
        op: MergeOp,
        kind: ValueKind,
        target: &str,
        sources: &[&str],
    ) -> Result<CounterValue> {
        if sources.is_empty() {
            return Err(TallyError::EmptySourceSet(target.to_string()));
        }
        if sources.iter().any(|s| s.is_empty()) {
            return Err(TallyError::EmptySourceKey(target.to_string()));
        }

        let offsets = sources
            .iter()
            .map(|s| self.addresser.slot_offset(s))
            .collect();
        let descriptor = MergeDescriptor::build(op, offsets);
        let target_offset = self.addresser.slot_offset(target);

        let mut inner = self.inner.lock();

        if !inner.slot_ref(target_offset).is_initialized() {
            // Lock order: table held, then overflow.
            let ptr = self
                .overflow
                .write(target, target_offset, &descriptor.to_bytes())?;

            let mut slot = inner.slot_mut(target_offset);
            slot.set_value_kind(kind);
            slot.set_key_kind(KeyKind::Merge);
            slot.set_overflow_ptr(ptr);
            slot.set_last_modified(now_millis());
            inner.bump_key_count();
        } else {
            let view = inner.slot_ref(target_offset);
            if view.key_kind() != KeyKind::Merge {
                return Err(TallyError::DescriptorDrift(target.to_string()));
            }

            let stored_kind = view.value_kind()?.ok_or(TallyError::UnknownTypeTag(0))?;
            if stored_kind != kind {
                return Err(TallyError::TypeConflict {
                    key: target.to_string(),
                    stored: stored_kind,
                    supplied: kind,
                });
            }

            let stored = MergeDescriptor::from_bytes(&self.overflow.read_payload(view.overflow_ptr())?)?;
            if stored.fingerprint != descriptor.fingerprint {
                return Err(TallyError::DescriptorDrift(target.to_string()));
            }
        }

        // Recompute from the sources' current values. Sources may have
        // heterogeneous types; each converts into the accumulator's kind.
        let mut acc: Option<CounterValue> = None;
        for offset in &descriptor.source_offsets {
            let source = inner.slot_ref(*offset);
            let value = convert(kind, source.decode(kind)?);
            acc = Some(match acc {
                None => value,
                Some(current) => apply(op, current, value, target)?,
            });
        }
        let result = acc.expect("source set is non-empty");

        inner.slot_mut(target_offset).set_raw_value(result.to_bits());
        Ok(result)
    }
}

/// Casts `value` into `kind` with truncating numeric conversion.
fn convert(kind: ValueKind, value: CounterValue) -> CounterValue {
    match kind {
        ValueKind::Uint64 => CounterValue::Uint(match value {
            CounterValue::Uint(v) => v,
            CounterValue::Int(v) => v as u64,
            CounterValue::Float(v) => v as u64,
        }),
        ValueKind::Int64 => CounterValue::Int(match value {
            CounterValue::Uint(v) => v as i64,
            CounterValue::Int(v) => v,
            CounterValue::Float(v) => v as i64,
        }),
        ValueKind::Float64 => CounterValue::Float(match value {
            CounterValue::Uint(v) => v as f64,
            CounterValue::Int(v) => v as f64,
            CounterValue::Float(v) => v,
        }),
    }
}

/// Applies `op` to two same-kind operands. Integer arithmetic wraps;
/// integer division truncates and rejects a zero divisor.
fn apply(
    op: MergeOp,
    acc: CounterValue,
    operand: CounterValue,
    target: &str,
) -> Result<CounterValue> {
    let value = match (acc, operand) {
        (CounterValue::Uint(a), CounterValue::Uint(b)) => CounterValue::Uint(match op {
            MergeOp::Add => a.wrapping_add(b),
            MergeOp::Subtract => a.wrapping_sub(b),
            MergeOp::Multiply => a.wrapping_mul(b),
            MergeOp::Divide => a
                .checked_div(b)
                .ok_or_else(|| TallyError::DivisionByZero(target.to_string()))?,
        }),
        (CounterValue::Int(a), CounterValue::Int(b)) => CounterValue::Int(match op {
            MergeOp::Add => a.wrapping_add(b),
            MergeOp::Subtract => a.wrapping_sub(b),
            MergeOp::Multiply => a.wrapping_mul(b),
            MergeOp::Divide => a
                .checked_div(b)
                .ok_or_else(|| TallyError::DivisionByZero(target.to_string()))?,
        }),
        (CounterValue::Float(a), CounterValue::Float(b)) => CounterValue::Float(match op {
            MergeOp::Add => a + b,
            MergeOp::Subtract => a - b,
            MergeOp::Multiply => a * b,
            MergeOp::Divide => a / b,
        }),
        _ => unreachable!("operands are converted to the accumulator kind"),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let descriptor = MergeDescriptor::build(MergeOp::Divide, vec![99, 33, 66]);
        let decoded = MergeDescriptor::from_bytes(&descriptor.to_bytes()).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.source_offsets, vec![33, 66, 99]);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = MergeDescriptor::build(MergeOp::Add, vec![1, 2, 3]);
        let b = MergeDescriptor::build(MergeOp::Add, vec![3, 1, 2]);
        assert_eq!(a.fingerprint, b.fingerprint);

        let c = MergeDescriptor::build(MergeOp::Add, vec![1, 2, 4]);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let bytes = MergeDescriptor::build(MergeOp::Add, vec![1, 2]).to_bytes();
        assert!(MergeDescriptor::from_bytes(&bytes[..16]).is_err());
        assert!(MergeDescriptor::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn subtract_is_first_minus_rest() {
        let first = CounterValue::Int(10);
        let acc = apply(MergeOp::Subtract, first, CounterValue::Int(3), "t").unwrap();
        let acc = apply(MergeOp::Subtract, acc, CounterValue::Int(2), "t").unwrap();
        assert_eq!(acc, CounterValue::Int(5));
    }

    #[test]
    fn integer_divide_truncates_and_rejects_zero() {
        let acc = apply(MergeOp::Divide, CounterValue::Int(7), CounterValue::Int(2), "t").unwrap();
        assert_eq!(acc, CounterValue::Int(3));

        assert!(matches!(
            apply(MergeOp::Divide, CounterValue::Int(7), CounterValue::Int(0), "t"),
            Err(TallyError::DivisionByZero(_))
        ));
    }

    #[test]
    fn float_divide_follows_ieee() {
        let acc = apply(
            MergeOp::Divide,
            CounterValue::Float(1.0),
            CounterValue::Float(0.0),
            "t",
        )
        .unwrap();
        assert_eq!(acc, CounterValue::Float(f64::INFINITY));
    }

    #[test]
    fn convert_truncates_across_kinds() {
        assert_eq!(
            convert(ValueKind::Int64, CounterValue::Float(2.9)),
            CounterValue::Int(2)
        );
        assert_eq!(
            convert(ValueKind::Uint64, CounterValue::Int(7)),
            CounterValue::Uint(7)
        );
        assert_eq!(
            convert(ValueKind::Float64, CounterValue::Uint(3)),
            CounterValue::Float(3.0)
        );
    }
}
