//! Matrix clock
//!
//! An NxN grid of counters where row `i` is the local view of process `i`'s
//! vector clock. `MatrixClock` is the plain grid; `SharedMatrixClock` puts it
//! behind a single lock and replaces the whole grid when it grows, so readers
//! never see a half-resized or half-written row.

use std::fmt;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{MulticastError, MulticastResult};

/// Rank of a process inside the current membership epoch.
pub type ProcessId = usize;

// ============================================================================
// Plain Grid
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatrixClock {
    rows: Vec<Vec<u64>>,
}

impl MatrixClock {
    /// Create a zero-filled `size x size` clock.
    pub fn new(size: usize) -> Self {
        Self {
            rows: vec![vec![0; size]; size],
        }
    }

    pub fn dimension(&self) -> usize {
        self.rows.len()
    }

    /// Copy of row `process`, or `None` when out of bounds.
    pub fn row(&self, process: ProcessId) -> Option<Vec<u64>> {
        self.rows.get(process).cloned()
    }

    /// Overwrite row `process`. Cells past the end of `values` are zeroed and
    /// values past the dimension are ignored.
    pub fn set_row(&mut self, process: ProcessId, values: &[u64]) -> bool {
        let Some(row) = self.rows.get_mut(process) else {
            return false;
        };
        for (idx, cell) in row.iter_mut().enumerate() {
            *cell = values.get(idx).copied().unwrap_or(0);
        }
        true
    }

    /// Raise row `process` to the element-wise maximum of itself and `values`.
    pub fn merge_row(&mut self, process: ProcessId, values: &[u64]) -> bool {
        let Some(row) = self.rows.get_mut(process) else {
            return false;
        };
        for (cell, value) in row.iter_mut().zip(values) {
            *cell = (*cell).max(*value);
        }
        true
    }

    pub fn get(&self, process: ProcessId, origin: ProcessId) -> Option<u64> {
        self.rows.get(process)?.get(origin).copied()
    }

    /// Increment one cell and return its new value.
    pub fn increment(&mut self, process: ProcessId, origin: ProcessId) -> Option<u64> {
        let cell = self.rows.get_mut(process)?.get_mut(origin)?;
        *cell += 1;
        Some(*cell)
    }

    /// Minimum of column `origin` across every row.
    pub fn column_min(&self, origin: ProcessId) -> Option<u64> {
        if origin >= self.dimension() {
            return None;
        }
        self.rows.iter().map(|row| row[origin]).min()
    }

    /// Build a larger clock with the current contents at identical offsets.
    pub fn grown(&self, size: usize) -> MulticastResult<Self> {
        let current = self.dimension();
        if size < current {
            return Err(MulticastError::ClockShrink {
                current,
                requested: size,
            });
        }

        let mut next = Self::new(size);
        for (dst, src) in next.rows.iter_mut().zip(&self.rows) {
            dst[..src.len()].copy_from_slice(src);
        }
        Ok(next)
    }

    pub fn to_rows(&self) -> Vec<Vec<u64>> {
        self.rows.clone()
    }
}

impl fmt::Display for MatrixClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, row) in self.rows.iter().enumerate() {
            let cells: Vec<String> = row.iter().map(u64::to_string).collect();
            writeln!(f, "P{}: [{}]", idx, cells.join(", "))?;
        }
        Ok(())
    }
}

// ============================================================================
// Shared Clock - Whole-Grid Swap Under One Lock
// ============================================================================

/// Thread-safe matrix clock shared by discovery, send, receive and the
/// stability sweep.
#[derive(Debug)]
pub struct SharedMatrixClock {
    inner: RwLock<MatrixClock>,
    limit: usize,
}

impl SharedMatrixClock {
    /// Create an empty clock that refuses to grow beyond `limit` members.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(MatrixClock::default()),
            limit,
        }
    }

    pub fn dimension(&self) -> usize {
        self.inner.read().dimension()
    }

    pub fn row(&self, process: ProcessId) -> Option<Vec<u64>> {
        self.inner.read().row(process)
    }

    pub fn set_row(&self, process: ProcessId, values: &[u64]) -> bool {
        self.inner.write().set_row(process, values)
    }

    pub fn get(&self, process: ProcessId, origin: ProcessId) -> Option<u64> {
        self.inner.read().get(process, origin)
    }

    pub fn increment(&self, process: ProcessId, origin: ProcessId) -> Option<u64> {
        self.inner.write().increment(process, origin)
    }

    pub fn snapshot(&self) -> MatrixClock {
        self.inner.read().clone()
    }

    /// Run `f` against a consistent view of the whole grid.
    pub fn view<R>(&self, f: impl FnOnce(&MatrixClock) -> R) -> R {
        f(&self.inner.read())
    }

    /// Grow to exactly `size`. Growing to the current size is a no-op and a
    /// smaller size is rejected.
    pub fn grow(&self, size: usize) -> MulticastResult<()> {
        let mut clock = self.inner.write();
        Self::grow_locked(&mut clock, size, self.limit)
    }

    /// Grow just enough to hold `process`; never shrinks.
    pub fn ensure_capacity(&self, process: ProcessId) -> MulticastResult<()> {
        let mut clock = self.inner.write();
        Self::ensure_locked(&mut clock, process, self.limit)
    }

    /// Count a local send: bump `MC[id][id]` and return the post-increment row.
    pub fn stamp_send(&self, local: ProcessId) -> Option<Vec<u64>> {
        let mut clock = self.inner.write();
        clock.increment(local, local)?;
        clock.row(local)
    }

    /// Account for a message from `sender` carrying `vector`.
    ///
    /// Grows for a late joiner, folds the carried vector into the sender's
    /// row and, for remote senders, bumps `MC[local][sender]`. The local row
    /// is never taken from the wire.
    pub fn record_receipt(
        &self,
        local: Option<ProcessId>,
        sender: ProcessId,
        vector: &[u64],
    ) -> MulticastResult<()> {
        let mut clock = self.inner.write();
        let needed = local.map_or(sender, |id| id.max(sender));
        Self::ensure_locked(&mut clock, needed, self.limit)?;

        if local != Some(sender) {
            clock.merge_row(sender, vector);
        }
        if let Some(id) = local.filter(|id| *id != sender) {
            clock.increment(id, sender);
        }
        Ok(())
    }

    fn ensure_locked(clock: &mut MatrixClock, process: ProcessId, limit: usize) -> MulticastResult<()> {
        let needed = process + 1;
        if needed <= clock.dimension() {
            return Ok(());
        }
        Self::grow_locked(clock, needed, limit)
    }

    fn grow_locked(clock: &mut MatrixClock, size: usize, limit: usize) -> MulticastResult<()> {
        if size == clock.dimension() {
            return Ok(());
        }
        if size > limit {
            return Err(MulticastError::ClockLimit {
                requested: size,
                limit,
            });
        }
        let next = clock.grown(size)?;
        debug!("Resizing matrix clock from {} to {}", clock.dimension(), size);
        *clock = next;
        Ok(())
    }
}
