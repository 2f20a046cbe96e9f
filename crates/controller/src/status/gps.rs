//! GPS timestamp outlier filtering.
//!
//! The controller keeps a bounded queue of deltas between node-reported GPS
//! time and its own view. Chauvenet's criterion over that queue decides
//! whether a new sample is trustworthy enough to advance the global GPS
//! clock. Every sample, outlier or not, joins the queue: a data set made
//! entirely of bad samples must not be able to lock good data out forever.

use std::collections::VecDeque;
use std::f64::consts::FRAC_1_SQRT_2;

#[derive(Debug)]
pub struct GpsOutlierFilter {
    deltas: VecDeque<i64>,
    min_samples: usize,
    max_samples: usize,
}

impl GpsOutlierFilter {
    pub fn new(min_samples: usize, max_samples: usize) -> Self {
        Self {
            deltas: VecDeque::with_capacity(max_samples),
            min_samples,
            max_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Record `delta` (local GPS time minus reported GPS time, microseconds)
    /// and report whether it is an outlier. With fewer than the minimum
    /// number of samples everything is accepted, so the clock can be set as
    /// early as possible; later data corrects any damage.
    pub fn observe(&mut self, delta: i64) -> bool {
        if self.deltas.len() < self.min_samples {
            self.push(delta);
            return false;
        }

        let n = self.deltas.len() as f64;
        let mean = self.deltas.iter().map(|&d| d as f64).sum::<f64>() / n;
        let variance = self
            .deltas
            .iter()
            .map(|&d| {
                let diff = d as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();

        let outlier = if std_dev == 0.0 {
            delta as f64 != mean
        } else {
            // Chauvenet's criterion on a standard normal: the expected count
            // of samples at least this far out must reach one half.
            let z_value = -((delta as f64 - mean) / std_dev).abs();
            let probability = 0.5 * libm::erfc(-z_value * FRAC_1_SQRT_2);
            probability * n < 0.5
        };

        self.push(delta);
        outlier
    }

    fn push(&mut self, delta: i64) {
        self.deltas.push_back(delta);
        while self.deltas.len() > self.max_samples {
            self.deltas.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_everything_below_minimum() {
        let mut filter = GpsOutlierFilter::new(6, 20);
        for delta in [0, 1_000_000, -5_000_000, 10_000_000_000] {
            assert!(!filter.observe(delta));
        }
    }

    #[test]
    fn flags_large_jump_after_stable_samples() {
        let mut filter = GpsOutlierFilter::new(6, 20);
        // ten samples of roughly zero delta
        for i in 0..10 {
            assert!(!filter.observe(i % 3 - 1));
        }
        // a ten-second jump is an outlier, but still joins the queue
        let before = filter.len();
        assert!(filter.observe(10_000_000));
        assert_eq!(filter.len(), before + 1);
    }

    #[test]
    fn identical_samples_do_not_divide_by_zero() {
        let mut filter = GpsOutlierFilter::new(3, 20);
        for _ in 0..5 {
            filter.observe(42);
        }
        assert!(!filter.observe(42));
        assert!(filter.observe(43));
    }

    #[test]
    fn queue_is_bounded() {
        let mut filter = GpsOutlierFilter::new(2, 5);
        for i in 0..50 {
            filter.observe(i);
        }
        assert_eq!(filter.len(), 5);
    }
}
