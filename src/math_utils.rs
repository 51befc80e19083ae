//! Mathematical utility functions for log-domain HMM computation.
//!
//! Log-probability conversions, approximate float comparison, and the
//! trigamma function needed by the Newton updates in the M-steps.
//! Digamma and log-gamma come from `statrs`; trigamma is not provided
//! there, so it is implemented here with the standard recurrence plus
//! asymptotic series.

/// Log-domain zero.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// Convert a probability to the log domain; `log 0 = -inf`.
#[inline]
pub fn prob_to_log(p: f64) -> f64 {
    if p == 0.0 {
        LOG_ZERO
    } else {
        p.ln()
    }
}

/// Approximate equality with an explicit epsilon.
#[inline]
pub fn approx_eq_eps(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps
}

/// Probability-sum comparison used when validating discrete parameter
/// vectors that are allowed a rounding slack.
#[inline]
pub fn same_probability(sum: f64, target: f64) -> bool {
    approx_eq_eps(sum, target, 1e-9)
}

/// Relative agreement check for forward/backward log-likelihood pairs.
pub fn loglik_agree(a: f64, b: f64, rel_tol: f64) -> bool {
    if a == b {
        return true; // covers the -inf / -inf case
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= rel_tol * scale
}

/// Trigamma function ψ'(x) for x > 0.
///
/// Uses the recurrence ψ'(x) = ψ'(x + 1) + 1/x² to push the argument
/// above 8, then the asymptotic expansion
/// ψ'(x) ≈ 1/x + 1/(2x²) + 1/(6x³) − 1/(30x⁵) + 1/(42x⁷) − 1/(30x⁹).
pub fn trigamma(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }

    let mut value = 0.0;
    let mut z = x;
    while z < 8.0 {
        value += 1.0 / (z * z);
        z += 1.0;
    }

    let inv = 1.0 / z;
    let inv2 = inv * inv;
    // Horner form of the Bernoulli-number series in 1/z².
    let series = inv
        * (1.0
            + inv * (0.5
                + inv * (1.0 / 6.0
                    + inv2 * (-1.0 / 30.0 + inv2 * (1.0 / 42.0 + inv2 * (-1.0 / 30.0))))));
    value + series
}
