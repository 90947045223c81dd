use std::collections::BTreeMap;

use tracing::warn;

/// Releases values in index order, whatever order they arrive in.
///
/// Result callbacks run on whichever pump finishes a sample; consumers that
/// need results in input order push them through a `Reorder`.
#[derive(Debug)]
pub struct Reorder<T> {
    next: usize,
    parked: BTreeMap<usize, T>,
}

impl<T> Default for Reorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reorder<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(next: usize) -> Self {
        Self {
            next,
            parked: BTreeMap::new(),
        }
    }

    /// Accepts `value` for `index` and returns every value now contiguous
    /// with what was already released.
    ///
    /// Indices already released, or already parked, are dropped with a warning.
    pub fn push(&mut self, index: usize, value: T) -> Vec<T> {
        if index < self.next || self.parked.contains_key(&index) {
            warn!(index, next = self.next, "duplicate index ignored");
            return Vec::new();
        }
        self.parked.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.parked.remove(&self.next) {
            ready.push(value);
            self.next += 1;
        }
        ready
    }

    /// The index the buffer is waiting on.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Values held back behind a gap.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}
