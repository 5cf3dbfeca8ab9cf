//! Per-region live byte accounting.
//!
//! Workers never write the shared table while tracing. Each one counts into a
//! private [`LiveData`] and merges it into the [`LivenessTable`] exactly once,
//! when its marking loop exits.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared per-region live byte counters for the current cycle.
#[derive(Debug)]
pub struct LivenessTable {
    regions: Box<[AtomicUsize]>,
}

impl LivenessTable {
    /// A zeroed table for `region_count` regions.
    #[must_use]
    pub fn new(region_count: usize) -> Self {
        Self {
            regions: (0..region_count).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Number of regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Live bytes recorded for `region`.
    ///
    /// # Panics
    ///
    /// Panics if `region` is out of bounds.
    #[must_use]
    pub fn live_bytes(&self, region: usize) -> usize {
        self.regions[region].load(Ordering::Acquire)
    }

    /// Sum over all regions.
    #[must_use]
    pub fn total_live_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.load(Ordering::Acquire)).sum()
    }

    /// Zero every counter before a new cycle.
    pub fn clear(&self) {
        for r in self.regions.iter() {
            r.store(0, Ordering::Release);
        }
    }

    fn add(&self, region: usize, bytes: usize) {
        self.regions[region].fetch_add(bytes, Ordering::AcqRel);
    }
}

/// A worker-private liveness accumulator.
#[derive(Debug)]
pub struct LiveData {
    bytes: Vec<usize>,
    touched: Vec<usize>,
}

impl LiveData {
    /// An empty accumulator for `region_count` regions.
    #[must_use]
    pub fn new(region_count: usize) -> Self {
        Self {
            bytes: vec![0; region_count],
            touched: Vec::new(),
        }
    }

    /// Count `size` live bytes in `region`.
    #[inline]
    pub fn count(&mut self, region: usize, size: usize) {
        if size == 0 {
            return;
        }
        let slot = &mut self.bytes[region];
        if *slot == 0 {
            self.touched.push(region);
        }
        *slot += size;
    }

    /// Total bytes counted and not yet flushed.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.touched.iter().map(|&r| self.bytes[r]).sum()
    }

    /// Merge into `table` and reset. Only regions that were touched are
    /// written.
    pub fn flush(&mut self, table: &LivenessTable) {
        for region in self.touched.drain(..) {
            let bytes = std::mem::take(&mut self.bytes[region]);
            if bytes > 0 {
                table.add(region, bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LiveData, LivenessTable};

    #[test]
    fn test_flush_merges_once() {
        let table = LivenessTable::new(4);
        let mut live = LiveData::new(4);
        live.count(1, 16);
        live.count(1, 32);
        live.count(3, 8);
        assert_eq!(live.pending_bytes(), 56);

        live.flush(&table);
        assert_eq!(table.live_bytes(1), 48);
        assert_eq!(table.live_bytes(3), 8);
        assert_eq!(live.pending_bytes(), 0);

        // A second flush adds nothing.
        live.flush(&table);
        assert_eq!(table.total_live_bytes(), 56);
    }

    #[test]
    fn test_workers_add_up() {
        let table = LivenessTable::new(2);
        let mut a = LiveData::new(2);
        let mut b = LiveData::new(2);
        a.count(0, 10);
        b.count(0, 5);
        b.count(1, 7);
        a.flush(&table);
        b.flush(&table);
        assert_eq!(table.live_bytes(0), 15);
        assert_eq!(table.live_bytes(1), 7);

        table.clear();
        assert_eq!(table.total_live_bytes(), 0);
    }
}
