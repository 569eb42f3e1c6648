//! Utilities for the handle tables
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Uniquely identifies a handle table for the life of the process.
///
/// The id is also stamped into every segment header,
/// so a segment can be traced back to its owner.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TableId(u64);
impl TableId {
    pub(crate) fn acquire() -> TableId {
        loop {
            let prev = NEXT_TABLE_ID.load(Ordering::SeqCst);
            let Some(updated) = prev.checked_add(1) else {
                panic!("Overflow table ids")
            };
            if NEXT_TABLE_ID
                .compare_exchange(prev, updated, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break TableId(prev);
            }
        }
    }
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}
impl slog::Value for TableId {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_u64(key, self.0)
    }
}

/// The size of memory in bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemorySize {
    pub bytes: usize,
}
impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}", self.bytes)
        } else {
            // Write approximation
            let bytes = self.bytes;
            let (amount, suffix) = if bytes > 1024 * 1024 * 1024 {
                (1024 * 1024 * 1024, "GB")
            } else if bytes > 1024 * 1024 {
                (1024 * 1024, "MB")
            } else if bytes > 1024 {
                (1024, "KB")
            } else {
                (1, "")
            };
            write!(f, "{:.2}{}", bytes as f64 / amount as f64, suffix)
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
