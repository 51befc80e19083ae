//! Numerically stable log-sum-exp accumulation.

use crate::math_utils::LOG_ZERO;

/// Accumulator computing `log Σ exp(x_i)` over up to a fixed number of
/// stored terms, tracking the running maximum so the exponentials never
/// overflow.
///
/// `store` accepts any finite real or `-inf`; `compute` returns
/// `m + log Σ exp(x_i − m)` where m is the maximum stored value, and
/// `-inf` when every stored value is `-inf`.
#[derive(Debug)]
pub struct LogSum {
    values: Vec<f64>,
    max: f64,
}

impl LogSum {
    /// Create an accumulator sized for `capacity` terms.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            max: LOG_ZERO,
        }
    }

    /// Drop all stored terms.
    pub fn clear(&mut self) {
        self.values.clear();
        self.max = LOG_ZERO;
    }

    /// Store one log-domain term.
    pub fn store(&mut self, x: f64) {
        debug_assert!(!x.is_nan());
        if x > self.max {
            self.max = x;
        }
        self.values.push(x);
    }

    /// Log of the sum of the exponentials of the stored terms.
    pub fn compute(&self) -> f64 {
        if self.max == LOG_ZERO {
            return LOG_ZERO;
        }
        let mut sum = 0.0;
        for &x in &self.values {
            sum += (x - self.max).exp();
        }
        self.max + sum.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_two_terms() {
        let mut ls = LogSum::new(2);
        ls.store((0.3f64).ln());
        ls.store((0.7f64).ln());
        assert_approx_eq!(ls.compute(), 0.0, 1e-12);
    }

    #[test]
    fn test_all_neg_infinity() {
        let mut ls = LogSum::new(4);
        for _ in 0..4 {
            ls.store(LOG_ZERO);
        }
        assert_eq!(ls.compute(), LOG_ZERO);
    }

    #[test]
    fn test_mixed_neg_infinity() {
        let mut ls = LogSum::new(3);
        ls.store(LOG_ZERO);
        ls.store(-2.0);
        ls.store(LOG_ZERO);
        assert_approx_eq!(ls.compute(), -2.0, 1e-12);
    }

    #[test]
    fn test_large_magnitudes_stable() {
        // naive exp would underflow to zero for all terms
        let mut ls = LogSum::new(3);
        ls.store(-1000.0);
        ls.store(-1000.0 + (2.0f64).ln());
        let expected = -1000.0 + (3.0f64).ln();
        assert_approx_eq!(ls.compute(), expected, 1e-9);
    }

    #[test]
    fn test_clear_resets() {
        let mut ls = LogSum::new(2);
        ls.store(5.0);
        ls.clear();
        assert_eq!(ls.compute(), LOG_ZERO);
        ls.store(-1.0);
        assert_approx_eq!(ls.compute(), -1.0, 1e-12);
    }
}
