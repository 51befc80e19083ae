//! Reference emission families: discrete, gamma, and scaled negative
//! binomial.
//!
//! Each family owns its parameters and any precomputed caches and
//! implements the Baum–Welch M-step over a parameter-sharing group:
//! sufficient statistics are gathered across every member, parameters are
//! estimated once, then written into all members.

use std::any::Any;

use log::warn;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::distribution::EmissionDistribution;
use crate::em::EmSequences;
use crate::errors::{HmmError, HmmResult};
use crate::math_utils::{prob_to_log, trigamma, LOG_ZERO};
use crate::params::Params;
use crate::sequence::SeqIter;

/// Dispersion estimates above this are rejected as degenerate.
const MAX_ACCEPTED_PARAM: f64 = 1000.0;

/// Cap applied to the method-of-moments dispersion start value.
const MOM_INIT_CAP: f64 = 500.0;

fn invalid_group_member(family: &str) -> HmmError {
    HmmError::InvalidParameters {
        family: family.to_string(),
        reason: "parameter-sharing group member is not of this family".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Discrete emission
// ---------------------------------------------------------------------------

/// Discrete emission over the alphabet {offset, ..., offset + K - 1}.
///
/// `log_probability` returns -inf outside that range. Valid parameters
/// are a probability vector of length ≥ 1 summing to exactly 1.
pub struct DiscreteEmission {
    state_id: usize,
    slot_id: usize,
    offset: f64,
    log_probs: Vec<f64>,
    fixed: bool,
}

impl DiscreteEmission {
    /// Create a discrete emission with an empty alphabet; parameters must
    /// be set before use.
    pub fn new(state_id: usize, slot_id: usize) -> Self {
        Self {
            state_id,
            slot_id,
            offset: 0.0,
            log_probs: Vec::new(),
            fixed: false,
        }
    }

    /// Create with an initial probability vector.
    pub fn with_probs(state_id: usize, slot_id: usize, probs: &[f64]) -> HmmResult<Self> {
        let mut emission = Self::new(state_id, slot_id);
        emission.set_params(&Params::new(probs))?;
        Ok(emission)
    }

    fn alphabet_size(&self) -> usize {
        self.log_probs.len()
    }
}

impl EmissionDistribution for DiscreteEmission {
    fn state_id(&self) -> usize {
        self.state_id
    }

    fn slot_id(&self) -> usize {
        self.slot_id
    }

    fn valid_params(&self, params: &Params) -> bool {
        let sum: f64 = params.iter().sum();
        !params.is_empty() && sum == 1.0
    }

    fn get_params(&self) -> Params {
        let probs: Vec<f64> = self.log_probs.iter().map(|&lp| lp.exp()).collect();
        let mut params = Params::new(&probs);
        if self.fixed {
            for i in 0..params.len() {
                params.set_fixed(i, true);
            }
        }
        params
    }

    fn set_params(&mut self, params: &Params) -> HmmResult<()> {
        if !self.valid_params(params) {
            return Err(HmmError::InvalidParameters {
                family: "discrete".to_string(),
                reason: format!(
                    "expected a probability vector summing to 1, got {:?}",
                    params.values()
                ),
            });
        }
        self.log_probs = params.iter().map(|&p| prob_to_log(p)).collect();
        self.fixed = params.any_fixed();
        Ok(())
    }

    fn get_option(&self, name: &str) -> Option<f64> {
        match name {
            "offset" => Some(self.offset),
            _ => None,
        }
    }

    fn set_option(&mut self, name: &str, value: f64) -> bool {
        match name {
            "offset" => {
                self.offset = value;
                true
            }
            _ => false,
        }
    }

    fn log_probability(&self, iter: &SeqIter<'_>) -> f64 {
        let x = iter.emission(self.slot_id) as i64;
        let y = x - self.offset as i64;
        if y < 0 || y >= self.alphabet_size() as i64 {
            return LOG_ZERO;
        }
        self.log_probs[y as usize]
    }

    fn update_params(
        &mut self,
        sequences: &EmSequences<'_>,
        peers: &mut [&mut dyn EmissionDistribution],
    ) -> HmmResult<()> {
        if self.fixed {
            return Ok(());
        }

        let mut members = vec![(self.state_id, self.slot_id)];
        for peer in peers.iter() {
            let de = peer
                .as_any()
                .downcast_ref::<DiscreteEmission>()
                .ok_or_else(|| invalid_group_member("discrete"))?;
            members.push((de.state_id, de.slot_id));
        }

        // expected symbol counts across the group
        let k = self.alphabet_size();
        let mut counts = vec![0.0; k];
        for &(state, slot) in &members {
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let y = it.emission(slot) as i64 - self.offset as i64;
                    if y >= 0 && (y as usize) < k {
                        counts[y as usize] += w;
                    }
                    it.next();
                }
            }
        }

        let total: f64 = counts.iter().sum();
        if !(total > 0.0) || !total.is_finite() {
            warn!(
                "state {} slot {}: discrete emission update failed: zero posterior mass (keeping old values)",
                self.state_id, self.slot_id
            );
            return Ok(());
        }

        for (lp, &c) in self.log_probs.iter_mut().zip(counts.iter()) {
            *lp = prob_to_log(c / total);
        }

        // propagate to the other elements in the group
        for peer in peers.iter_mut() {
            let de = peer
                .as_any_mut()
                .downcast_mut::<DiscreteEmission>()
                .ok_or_else(|| invalid_group_member("discrete"))?;
            de.log_probs = self.log_probs.clone();
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Gamma emission
// ---------------------------------------------------------------------------

/// Gamma emission with shape α and scale θ, both > 0.
///
/// Caches `A = -ln Γ(α) - α ln θ`; the log-probability at x (offset
/// applied) is `A + (α - 1) ln x - x / θ`.
pub struct GammaEmission {
    state_id: usize,
    slot_id: usize,
    shape: f64,
    scale: f64,
    fixed: bool,
    offset: f64,
    tolerance: f64,
    max_iter: usize,
    log_norm: f64,
}

impl GammaEmission {
    /// Create with the default parameters (α = 1, θ = 2).
    pub fn new(state_id: usize, slot_id: usize) -> Self {
        let mut emission = Self {
            state_id,
            slot_id,
            shape: 1.0,
            scale: 2.0,
            fixed: false,
            offset: 0.0,
            tolerance: 1e-6,
            max_iter: 100,
            log_norm: 0.0,
        };
        emission.update_constants();
        emission
    }

    fn update_constants(&mut self) {
        self.log_norm = -ln_gamma(self.shape) - self.shape * self.scale.ln();
    }

    /// Posterior-weighted sufficient statistics over the group members.
    fn gather_statistics(
        &self,
        sequences: &EmSequences<'_>,
        members: &[(usize, usize)],
    ) -> (f64, f64, f64) {
        let mut sum_p = 0.0;
        let mut sum_px = 0.0;
        let mut sum_plogx = 0.0;

        for &(state, slot) in members {
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let x = it.emission(slot) + self.offset;
                    sum_p += w;
                    sum_px += w * x;
                    sum_plogx += w * x.ln();
                    it.next();
                }
            }
        }

        (sum_p, sum_px, sum_plogx)
    }
}

impl EmissionDistribution for GammaEmission {
    fn state_id(&self) -> usize {
        self.state_id
    }

    fn slot_id(&self) -> usize {
        self.slot_id
    }

    fn valid_params(&self, params: &Params) -> bool {
        params.len() == 2 && params.iter().all(|&p| p > 0.0)
    }

    fn get_params(&self) -> Params {
        let mut params = Params::new(&[self.shape, self.scale]);
        if self.fixed {
            params.set_fixed(0, true);
            params.set_fixed(1, true);
        }
        params
    }

    fn set_params(&mut self, params: &Params) -> HmmResult<()> {
        if !self.valid_params(params) {
            return Err(HmmError::InvalidParameters {
                family: "gamma".to_string(),
                reason: format!("shape and scale must be > 0, got {:?}", params.values()),
            });
        }
        self.fixed = params.any_fixed();
        self.shape = params[0];
        self.scale = params[1];
        self.update_constants();
        Ok(())
    }

    fn get_option(&self, name: &str) -> Option<f64> {
        match name {
            "offset" => Some(self.offset),
            "maxIter" => Some(self.max_iter as f64),
            "tolerance" => Some(self.tolerance),
            _ => None,
        }
    }

    fn set_option(&mut self, name: &str, value: f64) -> bool {
        match name {
            "offset" => {
                self.offset = value;
                true
            }
            "maxIter" => {
                let max_iter = value as i64;
                if max_iter <= 0 {
                    warn!("maxIter must be > 0: {}", max_iter);
                    return false;
                }
                self.max_iter = max_iter as usize;
                true
            }
            "tolerance" => {
                if value < 0.0 {
                    warn!("tolerance must be >= 0: {}", value);
                    return false;
                }
                self.tolerance = value;
                true
            }
            _ => false,
        }
    }

    fn log_probability(&self, iter: &SeqIter<'_>) -> f64 {
        let x = iter.emission(self.slot_id) + self.offset;
        debug_assert!(x >= 0.0);
        self.log_norm + (self.shape - 1.0) * x.ln() - x / self.scale
    }

    fn update_params(
        &mut self,
        sequences: &EmSequences<'_>,
        peers: &mut [&mut dyn EmissionDistribution],
    ) -> HmmResult<()> {
        if self.fixed {
            return Ok(());
        }

        let mut members = vec![(self.state_id, self.slot_id)];
        for peer in peers.iter() {
            let ge = peer
                .as_any()
                .downcast_ref::<GammaEmission>()
                .ok_or_else(|| invalid_group_member("gamma"))?;
            members.push((ge.state_id, ge.slot_id));
        }

        let (sum_p, sum_px, sum_plogx) = self.gather_statistics(sequences, &members);

        let mean = sum_px / sum_p;
        let s = mean.ln() - sum_plogx / sum_p;

        // closed-form initial guess
        let mut shape = (3.0 - s + ((s - 3.0).powi(2) + 24.0 * s).sqrt()) / (12.0 * s);
        if !shape.is_finite() || shape <= 0.0 {
            warn!(
                "state {} slot {}: initial shape guess failed: {} (starting with old value: {})",
                self.state_id, self.slot_id, shape, self.shape
            );
            shape = self.shape;
        }

        // Newton refinement of the shape MLE
        for _ in 0..self.max_iter {
            let candidate =
                shape - (shape.ln() - digamma(shape) - s) / (1.0 / shape - trigamma(shape));

            if !candidate.is_finite() || candidate <= 0.0 {
                warn!(
                    "state {} slot {}: shape update failed: {} (keeping iterate: {})",
                    self.state_id, self.slot_id, candidate, shape
                );
                break;
            }

            let change = (candidate - shape).abs();
            shape = candidate;
            if change <= self.tolerance {
                break;
            }
        }

        if shape > MAX_ACCEPTED_PARAM || !shape.is_finite() {
            warn!(
                "state {} slot {}: shape update failed: {} (keeping old value: {})",
                self.state_id, self.slot_id, shape, self.shape
            );
            return Ok(());
        }

        self.shape = shape;
        self.scale = mean / shape;
        self.update_constants();

        // propagate to the other elements in the group
        for peer in peers.iter_mut() {
            let ge = peer
                .as_any_mut()
                .downcast_mut::<GammaEmission>()
                .ok_or_else(|| invalid_group_member("gamma"))?;
            ge.shape = self.shape;
            ge.scale = self.scale;
            ge.update_constants();
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Scaled negative binomial emission
// ---------------------------------------------------------------------------

/// Negative binomial with a per-instance multiplicative scale on the
/// dispersion, letting states with different effective exposures share an
/// underlying (mean, dispersion) pair.
///
/// In the log domain at integer x ≥ 0:
/// `log P(x) = r·s(ln r − ln(r+m)) − ln Γ(s·r) + x(ln m − ln(r+m))
///             + ln Γ(s·r + x) − ln Γ(x+1)`.
/// The first three terms are cached as `A1`, `A2`, `A3`; values below
/// `tblSize` are memoised.
pub struct NegBinomialScaled {
    state_id: usize,
    slot_id: usize,
    mean: f64,
    dispersion: f64,
    scale: f64,
    fixed: bool,
    offset: f64,
    tolerance: f64,
    max_iter: usize,
    tbl_size: usize,
    mom_init: bool,
    a1: f64,
    a2: f64,
    a3: f64,
    logp_tbl: Vec<f64>,
}

impl NegBinomialScaled {
    /// Create with mean 1, dispersion 1, scale 1.
    pub fn new(state_id: usize, slot_id: usize) -> Self {
        Self::with_scale(state_id, slot_id, 1.0)
    }

    /// Create with an explicit scale factor.
    pub fn with_scale(state_id: usize, slot_id: usize, scale: f64) -> Self {
        let mut emission = Self {
            state_id,
            slot_id,
            mean: 1.0,
            dispersion: 1.0,
            scale,
            fixed: false,
            offset: 0.0,
            tolerance: 1e-6,
            max_iter: 100,
            tbl_size: 64,
            mom_init: false,
            a1: 0.0,
            a2: 0.0,
            a3: 0.0,
            logp_tbl: Vec::new(),
        };
        emission.update_logp_tbl();
        emission
    }

    fn logprob(&self, x: f64) -> f64 {
        self.a1 - self.a3 + x * self.a2 + ln_gamma(self.scale * self.dispersion + x)
            - ln_gamma(x + 1.0)
    }

    fn update_logp_tbl(&mut self) {
        let r = self.dispersion;
        let m = self.mean;
        self.a1 = r * self.scale * (r.ln() - (r + m).ln());
        self.a2 = m.ln() - (r + m).ln();
        self.a3 = ln_gamma(self.scale * r);

        self.logp_tbl.clear();
        self.logp_tbl.reserve(self.tbl_size);
        for i in 0..self.tbl_size {
            self.logp_tbl.push(self.logprob(i as f64));
        }
    }

    /// Scale-weighted method-of-moments dispersion start value:
    /// the average of per-member `μ²/(σ²−μ)` estimates weighted by scale.
    fn mom_start_value(
        &self,
        sequences: &EmSequences<'_>,
        members: &[(usize, usize, f64)],
    ) -> f64 {
        let mut sum_scale = 0.0;
        let mut sum_estimates = 0.0;

        for &(state, slot, scale) in members {
            let mut sum_p = 0.0;
            let mut sum_px = 0.0;
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let x = (it.emission(slot) + self.offset).trunc();
                    sum_p += w;
                    sum_px += w * x;
                    it.next();
                }
            }
            let mean = sum_px / sum_p;

            let mut sum_sqdiff = 0.0;
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let x = (it.emission(slot) + self.offset).trunc();
                    sum_sqdiff += w * (x - mean) * (x - mean);
                    it.next();
                }
            }
            let var = sum_sqdiff / sum_p;

            sum_estimates += (mean * mean / (var - mean)).abs();
            sum_scale += scale;
        }

        let estimate = sum_estimates / sum_scale;
        if estimate > MAX_ACCEPTED_PARAM {
            return MOM_INIT_CAP;
        }
        estimate
    }

    /// One Newton step ratio f(r)/g(r) for the dispersion estimate.
    fn newton_ratio(
        &self,
        sequences: &EmSequences<'_>,
        members: &[(usize, usize, f64)],
        a_s: f64,
        b: f64,
        r: f64,
    ) -> f64 {
        let const_num = (a_s * r).ln() - (a_s * r + b).ln();
        let const_denom = b / (r * (a_s * r + b));

        let mut sum_num = 0.0;
        let mut sum_denom = 0.0;
        for &(state, slot, scale) in members {
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let x = (it.emission(slot) + self.offset).trunc();
                    sum_num += w * scale * (digamma(x + scale * r) - digamma(scale * r));
                    sum_denom +=
                        w * scale * scale * (trigamma(x + scale * r) - trigamma(scale * r));
                    it.next();
                }
            }
        }

        let f_r = sum_num / a_s + const_num;
        let g_r = sum_denom / a_s + const_denom;
        f_r / g_r
    }
}

impl EmissionDistribution for NegBinomialScaled {
    fn state_id(&self) -> usize {
        self.state_id
    }

    fn slot_id(&self) -> usize {
        self.slot_id
    }

    fn valid_params(&self, params: &Params) -> bool {
        params.len() == 2 && params.iter().all(|&p| p > 0.0)
    }

    fn get_params(&self) -> Params {
        let mut params = Params::new(&[self.mean, self.dispersion]);
        if self.fixed {
            params.set_fixed(0, true);
            params.set_fixed(1, true);
        }
        params
    }

    fn set_params(&mut self, params: &Params) -> HmmResult<()> {
        if !self.valid_params(params) {
            return Err(HmmError::InvalidParameters {
                family: "negbinomial_scaled".to_string(),
                reason: format!("mean and dispersion must be > 0, got {:?}", params.values()),
            });
        }
        self.mean = params[0];
        self.dispersion = params[1];
        self.fixed = params.any_fixed();
        self.update_logp_tbl();
        Ok(())
    }

    fn get_option(&self, name: &str) -> Option<f64> {
        match name {
            "offset" => Some(self.offset),
            "maxIter" => Some(self.max_iter as f64),
            "tolerance" => Some(self.tolerance),
            "tblSize" => Some(self.tbl_size as f64),
            "momInit" => Some(if self.mom_init { 1.0 } else { 0.0 }),
            "scale" => Some(self.scale),
            _ => None,
        }
    }

    fn set_option(&mut self, name: &str, value: f64) -> bool {
        match name {
            "offset" => {
                self.offset = value;
                true
            }
            "maxIter" => {
                let max_iter = value as i64;
                if max_iter <= 0 {
                    warn!("maxIter must be > 0: {}", max_iter);
                    return false;
                }
                self.max_iter = max_iter as usize;
                true
            }
            "tolerance" => {
                if value < 0.0 {
                    warn!("tolerance must be >= 0: {}", value);
                    return false;
                }
                self.tolerance = value;
                true
            }
            "tblSize" => {
                let tbl_size = value as i64;
                self.tbl_size = if tbl_size <= 0 { 0 } else { tbl_size as usize };
                self.update_logp_tbl();
                true
            }
            "momInit" => {
                self.mom_init = value != 0.0;
                true
            }
            "scale" => {
                if value <= 0.0 {
                    warn!("scale must be > 0: {}", value);
                    return false;
                }
                self.scale = value;
                self.update_logp_tbl();
                true
            }
            _ => false,
        }
    }

    fn log_probability(&self, iter: &SeqIter<'_>) -> f64 {
        let x = (iter.emission(self.slot_id) + self.offset) as i64;
        debug_assert!(x >= 0);
        if (x as usize) < self.tbl_size {
            return self.logp_tbl[x as usize];
        }
        self.logprob(x as f64)
    }

    fn update_params(
        &mut self,
        sequences: &EmSequences<'_>,
        peers: &mut [&mut dyn EmissionDistribution],
    ) -> HmmResult<()> {
        if self.fixed {
            return Ok(());
        }

        let mut members = vec![(self.state_id, self.slot_id, self.scale)];
        for peer in peers.iter() {
            let nb = peer
                .as_any()
                .downcast_ref::<NegBinomialScaled>()
                .ok_or_else(|| invalid_group_member("negbinomial_scaled"))?;
            members.push((nb.state_id, nb.slot_id, nb.scale));
        }

        // sufficient statistics in the (r, p) parameterisation
        let mut sum_p = 0.0;
        let mut sum_ps = 0.0; // scaled counts
        let mut sum_px = 0.0;
        for &(state, slot, scale) in &members {
            for visit in sequences.posteriors(state) {
                let mut it = visit.iter;
                it.reset_first();
                for &w in visit.weights {
                    let x = (it.emission(slot) + self.offset).trunc();
                    sum_p += w;
                    sum_ps += w * scale;
                    sum_px += w * x;
                    it.next();
                }
            }
        }
        if !(sum_p > 0.0) || !sum_px.is_finite() {
            warn!(
                "state {} slot {}: dispersion update failed: zero posterior mass (keeping old values)",
                self.state_id, self.slot_id
            );
            return Ok(());
        }

        // 1. estimate dispersion by Newton iteration
        let mut r_prev = if self.mom_init {
            self.mom_start_value(sequences, &members)
        } else {
            self.dispersion
        };
        let mut r = r_prev;
        let mut reduction = 2.0;
        let mut change = f64::INFINITY;
        let mut i = 0;

        while change > self.tolerance && i < self.max_iter {
            i += 1;
            let candidate = r_prev - self.newton_ratio(sequences, &members, sum_ps, sum_px, r_prev);

            if !candidate.is_finite() {
                warn!(
                    "state {} slot {}: dispersion update failed: {} (keeping old value: {})",
                    self.state_id, self.slot_id, candidate, self.dispersion
                );
                r = self.dispersion;
                break;
            }

            if candidate <= 0.0 {
                // overshot below zero; either restart from a fraction of
                // the current parameter or clamp by tolerance
                if r_prev > self.dispersion {
                    let restart = self.dispersion / reduction;
                    warn!(
                        "state {} slot {}: dispersion lower bound hit: {} (using {})",
                        self.state_id, self.slot_id, candidate, restart
                    );
                    r_prev = restart;
                    reduction *= reduction;
                } else {
                    warn!(
                        "state {} slot {}: dispersion lower bound hit: {} (using {})",
                        self.state_id, self.slot_id, candidate, self.tolerance
                    );
                    r_prev = self.tolerance;
                }
                r = r_prev;
                continue;
            }

            r = candidate;
            change = (r - r_prev).abs();
            r_prev = r;
        }

        // 2. check for degenerate estimates
        if r > MAX_ACCEPTED_PARAM || !r.is_finite() {
            warn!(
                "state {} slot {}: dispersion update failed: {} (keeping old value: {})",
                self.state_id, self.slot_id, r, self.dispersion
            );
            return Ok(());
        }

        // 3. estimate p and convert back to (mean, dispersion)
        let p = sum_px / (sum_ps * r + sum_px);
        self.mean = (p * r) / (1.0 - p);
        self.dispersion = r;
        self.update_logp_tbl();

        // propagate to the other elements in the group; each peer's cache
        // depends on its own scale, so it is refreshed rather than copied
        for peer in peers.iter_mut() {
            let nb = peer
                .as_any_mut()
                .downcast_mut::<NegBinomialScaled>()
                .ok_or_else(|| invalid_group_member("negbinomial_scaled"))?;
            nb.mean = self.mean;
            nb.dispersion = self.dispersion;
            nb.update_logp_tbl();
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
