use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-range batch size target.
///
/// When adaptive, the target halves after a batch that was throttled and
/// grows by one after a batch that was not, between 1 and the configured
/// maximum. Otherwise the target is always the maximum.
#[derive(Debug)]
pub(crate) struct BatchSizeThresholds {
    max_operation_count: usize,
    adaptive: bool,
    target: AtomicUsize,
}

impl BatchSizeThresholds {
    pub fn new(max_operation_count: usize, adaptive: bool) -> Self {
        let max_operation_count = max_operation_count.max(1);
        Self {
            max_operation_count,
            adaptive,
            target: AtomicUsize::new(max_operation_count),
        }
    }

    /// The current maximum number of operations per batch.
    pub fn target(&self) -> usize {
        if self.adaptive {
            self.target.load(Ordering::Relaxed)
        } else {
            self.max_operation_count
        }
    }

    /// Feed back the outcome of a dispatched batch.
    pub fn record(&self, throttled: bool) {
        if !self.adaptive {
            return;
        }

        let max = self.max_operation_count;
        let _ = self
            .target
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = if throttled {
                    (current / 2).max(1)
                } else {
                    (current + 1).min(max)
                };
                (next != current).then_some(next)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_target() {
        let thresholds = BatchSizeThresholds::new(100, false);
        thresholds.record(true);
        assert_eq!(thresholds.target(), 100);
    }

    #[test]
    fn test_adaptive_target() {
        let thresholds = BatchSizeThresholds::new(10, true);
        assert_eq!(thresholds.target(), 10);

        thresholds.record(true);
        assert_eq!(thresholds.target(), 5);
        thresholds.record(true);
        thresholds.record(true);
        thresholds.record(true);
        assert_eq!(thresholds.target(), 1);
        thresholds.record(true);
        assert_eq!(thresholds.target(), 1);

        thresholds.record(false);
        thresholds.record(false);
        assert_eq!(thresholds.target(), 3);
        for _ in 0..20 {
            thresholds.record(false);
        }
        assert_eq!(thresholds.target(), 10);
    }
}
