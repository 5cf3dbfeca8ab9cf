//! Tuning knobs for the marking engine.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Configuration for concurrent marking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkConfig {
    /// Maximum number of marking workers, and number of task queues.
    pub max_workers: usize,
    /// Tasks processed between two cancellation / termination checks.
    pub mark_loop_stride: usize,
    /// Largest number of reference fields one task scans. Bigger objects are
    /// split into chunk tasks.
    pub array_chunk_size: usize,
    /// Entries in a mutator's write-barrier buffer before it is completed.
    pub satb_buffer_size: usize,
    /// Length of one wait slice in the termination protocol.
    pub termination_wait: Duration,
    /// Steal attempts per idle round, as a multiple of the queue count.
    pub steal_attempts_multiplier: usize,
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            max_workers: available_parallelism(),
            mark_loop_stride: 1000,
            array_chunk_size: 512,
            satb_buffer_size: 1024,
            termination_wait: Duration::from_millis(1),
            steal_attempts_multiplier: 2,
        }
    }
}

impl MarkConfig {
    /// Create a new configuration with the given maximum worker count.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            ..Default::default()
        }
    }

    /// Set the maximum number of worker threads.
    pub const fn set_max_workers(&mut self, workers: usize) {
        self.max_workers = if workers < 1 { 1 } else { workers };
    }

    /// Set the mark loop stride.
    pub const fn set_mark_loop_stride(&mut self, stride: usize) {
        self.mark_loop_stride = if stride < 1 { 1 } else { stride };
    }

    /// Set the array chunk size. Values below 2 are raised to 2 so splitting
    /// always makes progress.
    pub const fn set_array_chunk_size(&mut self, size: usize) {
        self.array_chunk_size = if size < 2 { 2 } else { size };
    }

    /// Set the write-barrier buffer size.
    pub const fn set_satb_buffer_size(&mut self, size: usize) {
        self.satb_buffer_size = if size < 1 { 1 } else { size };
    }

    /// Set the termination wait slice.
    pub const fn set_termination_wait(&mut self, wait: Duration) {
        self.termination_wait = wait;
    }

    /// Set the steal attempts multiplier.
    pub const fn set_steal_attempts_multiplier(&mut self, multiplier: usize) {
        self.steal_attempts_multiplier = if multiplier < 1 { 1 } else { multiplier };
    }
}

/// Get the number of CPUs available for parallel marking.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::MarkConfig;

    #[test]
    fn test_defaults() {
        let config = MarkConfig::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.mark_loop_stride, 1000);
        assert_eq!(config.array_chunk_size, 512);
    }

    #[test]
    fn test_setters_clamp() {
        let mut config = MarkConfig::new(0);
        assert_eq!(config.max_workers, 1);
        config.set_mark_loop_stride(0);
        config.set_array_chunk_size(1);
        config.set_steal_attempts_multiplier(0);
        assert_eq!(config.mark_loop_stride, 1);
        assert_eq!(config.array_chunk_size, 2);
        assert_eq!(config.steal_attempts_multiplier, 1);
    }
}
