//! Dynamic-programming engine: forward, backward, Viterbi, posterior
//! decoding, and stochastic backtrace.
//!
//! The engine is parameterised over a transition table and an emission
//! table and owns the log initial distribution. All recurrences run in
//! the log domain; -inf is a valid value and propagates through max and
//! sum correctly. Forward/backward matrices are caller-owned flat N×L
//! column-major buffers (column t starts at `t * n_states`); posterior
//! output transposes to state-major rows (`state * len + t`).
//!
//! The inner recurrence is enum-dispatched: when the transition table
//! reports a sparse structure, only the listed valid edges are visited.
//!
//! An engine instance is single-threaded: the caller owns the matrices,
//! each sequence needs its own iterator, and running a DP sweep while an
//! EM step mutates the same tables is not supported.

use crate::errors::{validate_buffer_len, validate_loglik, HmmError, HmmResult};
use crate::func_table::{EmissionTable, TransitionTable};
use crate::logsum::LogSum;
use crate::math_utils::{prob_to_log, LOG_ZERO};
use crate::rng::rnd_prepare;
use crate::sequence::SeqIter;

/// Inner-recurrence strategy chosen from the transition structure.
#[derive(Debug, Clone)]
enum Recurrence {
    Dense,
    Sparse {
        /// Valid source states per target.
        prev: Vec<Vec<usize>>,
        /// Valid destination states per source.
        next: Vec<Vec<usize>>,
    },
}

/// Hidden Markov Model: tables, initial distribution, and the DP engine.
pub struct Hmm<A: TransitionTable, E: EmissionTable> {
    pub(crate) n_states: usize,
    pub(crate) transitions: A,
    pub(crate) emissions: E,
    init_log_probs: Vec<f64>,
    recurrence: Recurrence,
}

impl<A: TransitionTable, E: EmissionTable> Hmm<A, E> {
    /// Assemble an HMM from its tables and initial distribution.
    ///
    /// Probabilities equal to 0 become -inf on conversion.
    pub fn new(transitions: A, emissions: E, initial_probs: &[f64]) -> HmmResult<Self> {
        let n_states = transitions.n_states();
        if emissions.n_states() != n_states {
            return Err(HmmError::DimensionMismatch {
                context: "emission table states".to_string(),
                expected: n_states,
                actual: emissions.n_states(),
            });
        }
        validate_buffer_len(initial_probs, n_states, "initial probabilities")?;

        let recurrence = Self::choose_recurrence(&transitions);
        Ok(Self {
            n_states,
            transitions,
            emissions,
            init_log_probs: initial_probs.iter().map(|&p| prob_to_log(p)).collect(),
            recurrence,
        })
    }

    fn choose_recurrence(transitions: &A) -> Recurrence {
        if transitions.is_sparse() {
            if let (Some(prev), Some(next)) =
                (transitions.previous_states(), transitions.next_states())
            {
                return Recurrence::Sparse { prev, next };
            }
        }
        Recurrence::Dense
    }

    /// Number of states N.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// The transition table.
    pub fn transitions(&self) -> &A {
        &self.transitions
    }

    /// The emission table.
    pub fn emissions(&self) -> &E {
        &self.emissions
    }

    /// Log initial distribution.
    pub fn init_log_probs(&self) -> &[f64] {
        &self.init_log_probs
    }

    /// Replace the initial distribution, storing `ln p[i]`.
    pub fn set_initial_probs(&mut self, probs: &[f64]) -> HmmResult<()> {
        validate_buffer_len(probs, self.n_states, "initial probabilities")?;
        for (slot, &p) in self.init_log_probs.iter_mut().zip(probs.iter()) {
            *slot = prob_to_log(p);
        }
        Ok(())
    }

    /// Recompute cached transition probabilities and re-derive the inner
    /// recurrence; called after every M-step that touches transitions.
    pub(crate) fn refresh_transitions(&mut self) {
        self.transitions.refresh();
        self.recurrence = Self::choose_recurrence(&self.transitions);
    }

    #[inline]
    fn inner_fwd(
        &self,
        prev_col: &[f64],
        l: usize,
        iter: &SeqIter<'_>,
        logsum: &mut LogSum,
    ) -> f64 {
        logsum.clear();
        match &self.recurrence {
            Recurrence::Dense => {
                for k in 0..self.n_states {
                    logsum.store(prev_col[k] + self.transitions.log_probability(iter, k, l));
                }
            }
            Recurrence::Sparse { prev, .. } => {
                for &k in &prev[l] {
                    logsum.store(prev_col[k] + self.transitions.log_probability(iter, k, l));
                }
            }
        }
        logsum.compute()
    }

    #[inline]
    fn inner_bck(
        &self,
        next_col: &[f64],
        k: usize,
        iter: &SeqIter<'_>,
        logsum: &mut LogSum,
    ) -> f64 {
        logsum.clear();
        match &self.recurrence {
            Recurrence::Dense => {
                for l in 0..self.n_states {
                    logsum.store(
                        self.transitions.log_probability(iter, k, l)
                            + self.emissions.log_probability(iter, l)
                            + next_col[l],
                    );
                }
            }
            Recurrence::Sparse { next, .. } => {
                for &l in &next[k] {
                    logsum.store(
                        self.transitions.log_probability(iter, k, l)
                            + self.emissions.log_probability(iter, l)
                            + next_col[l],
                    );
                }
            }
        }
        logsum.compute()
    }

    /// Forward sweep; fills `matrix` (N×L column-major) and returns the
    /// sequence log-likelihood.
    pub fn forward(&self, iter: &mut SeqIter<'_>, matrix: &mut [f64]) -> HmmResult<f64> {
        self.forward_inner(iter, matrix)
            .map_err(|e| e.with_frame("forward"))
    }

    fn forward_inner(&self, iter: &mut SeqIter<'_>, matrix: &mut [f64]) -> HmmResult<f64> {
        let n = self.n_states;
        let len = iter.len();
        validate_buffer_len(matrix, n * len, "forward matrix")?;

        let mut logsum = LogSum::new(n);
        iter.reset_first();

        // border conditions, position 0:
        // log f_k(0) = log e_k(0) + log a0k
        for k in 0..n {
            matrix[k] = self.emissions.log_probability(iter, k) + self.init_log_probs[k];
        }

        // inner columns
        let mut col = 0;
        while iter.next() {
            col += 1;
            let (head, tail) = matrix.split_at_mut(col * n);
            let prev_col = &head[(col - 1) * n..];
            for (l, cell) in tail[..n].iter_mut().enumerate() {
                *cell = self.emissions.log_probability(iter, l)
                    + self.inner_fwd(prev_col, l, iter, &mut logsum);
            }
        }

        // log-likelihood from the last column
        logsum.clear();
        for k in 0..n {
            logsum.store(matrix[(len - 1) * n + k]);
        }
        let loglik = logsum.compute();
        validate_loglik(loglik, "forward")?;
        Ok(loglik)
    }

    /// Backward sweep; fills `matrix` (N×L column-major) and returns the
    /// sequence log-likelihood recomputed from position 0.
    pub fn backward(&self, iter: &mut SeqIter<'_>, matrix: &mut [f64]) -> HmmResult<f64> {
        self.backward_inner(iter, matrix)
            .map_err(|e| e.with_frame("backward"))
    }

    fn backward_inner(&self, iter: &mut SeqIter<'_>, matrix: &mut [f64]) -> HmmResult<f64> {
        let n = self.n_states;
        let len = iter.len();
        validate_buffer_len(matrix, n * len, "backward matrix")?;

        let mut logsum = LogSum::new(n);

        // border conditions, position L-1: log 1
        for k in 0..n {
            matrix[(len - 1) * n + k] = 0.0;
        }

        // inner columns; while computing column c the iterator sits at
        // c+1, so emission and covariate reads refer to the symbol being
        // entered
        iter.reset_last();
        for c in (0..len.saturating_sub(1)).rev() {
            let (head, tail) = matrix.split_at_mut((c + 1) * n);
            let next_col = &tail[..n];
            let col = &mut head[c * n..];
            for k in 0..n {
                col[k] = self.inner_bck(next_col, k, iter, &mut logsum);
            }
            if c > 0 {
                iter.prev();
            }
        }

        // log-likelihood check column at position 0
        iter.reset_first();
        logsum.clear();
        for k in 0..n {
            logsum.store(
                matrix[k] + self.init_log_probs[k] + self.emissions.log_probability(iter, k),
            );
        }
        let loglik = logsum.compute();
        validate_loglik(loglik, "backward")?;
        Ok(loglik)
    }

    /// Most likely state path via max/argmax DP with back-pointers.
    ///
    /// Ties are broken toward the lowest state index attaining the max.
    pub fn viterbi(&self, iter: &mut SeqIter<'_>, path: &mut [usize]) -> HmmResult<()> {
        self.viterbi_inner(iter, path)
            .map_err(|e| e.with_frame("viterbi"))
    }

    fn viterbi_inner(&self, iter: &mut SeqIter<'_>, path: &mut [usize]) -> HmmResult<()> {
        let n = self.n_states;
        let len = iter.len();
        if path.len() != len {
            return Err(HmmError::DimensionMismatch {
                context: "viterbi path".to_string(),
                expected: len,
                actual: path.len(),
            });
        }

        let mut matrix = vec![LOG_ZERO; n * len];
        let mut backptr = vec![-1isize; n * len];

        iter.reset_first();
        for l in 0..n {
            matrix[l] = self.emissions.log_probability(iter, l) + self.init_log_probs[l];
        }

        let mut col = 0;
        while iter.next() {
            col += 1;
            for l in 0..n {
                let mut max = LOG_ZERO;
                let mut argmax = -1isize;
                for k in 0..n {
                    let value =
                        matrix[(col - 1) * n + k] + self.transitions.log_probability(iter, k, l);
                    if value > max {
                        max = value;
                        argmax = k as isize;
                    }
                }
                matrix[col * n + l] = self.emissions.log_probability(iter, l) + max;
                backptr[col * n + l] = argmax;
            }
        }

        // last state
        let mut max = LOG_ZERO;
        let mut argmax = 0usize;
        for k in 0..n {
            let value = matrix[(len - 1) * n + k];
            if value > max {
                max = value;
                argmax = k;
            }
        }
        path[len - 1] = argmax;

        // walk the back-pointers
        let mut z = argmax as isize;
        for t in (1..len).rev() {
            z = backptr[t * n + z as usize];
            debug_assert!(z >= 0);
            path[t - 1] = z as usize;
        }

        Ok(())
    }

    /// Per-position state posterior; `out` is state-major N×L
    /// (`out[state * len + t]`).
    pub fn state_posterior(
        &self,
        iter: &SeqIter<'_>,
        fw: &[f64],
        bk: &[f64],
        out: &mut [f64],
    ) -> HmmResult<()> {
        let n = self.n_states;
        let len = iter.len();
        validate_buffer_len(out, n * len, "posterior matrix")?;

        let mut logsum = LogSum::new(n);
        for i in 0..len {
            logsum.clear();
            for j in 0..n {
                logsum.store(fw[i * n + j] + bk[i * n + j]);
            }
            let log_px = logsum.compute();
            for j in 0..n {
                out[j * len + i] = (fw[i * n + j] + bk[i * n + j] - log_px).exp();
            }
        }
        Ok(())
    }

    /// Per-position local log-likelihood `log P(x_i | x_{-i})` terms.
    pub fn local_loglik(
        &self,
        iter: &SeqIter<'_>,
        fw: &[f64],
        bk: &[f64],
        out: &mut [f64],
    ) -> HmmResult<()> {
        let n = self.n_states;
        let len = iter.len();
        validate_buffer_len(out, len, "local log-likelihood")?;

        let mut logsum = LogSum::new(n);
        for i in 0..len {
            logsum.clear();
            for j in 0..n {
                logsum.store(fw[i * n + j] + bk[i * n + j]);
            }
            out[i] = logsum.compute();
        }
        Ok(())
    }

    /// Posterior transition probabilities into the cursor position.
    ///
    /// For each source state k in `src` and each of the first `n_tgt`
    /// targets l of k's transition function:
    /// `ξ[k,l] = exp(fw[k,t-1] + logA(k,l) + logE(l) + bk[l,t] − loglik)`
    /// written to `out` in (src-major, target-minor) order.
    pub fn transition_posterior(
        &self,
        iter_at_target: &SeqIter<'_>,
        fw: &[f64],
        bk: &[f64],
        loglik: f64,
        src: &[usize],
        n_tgt: usize,
        out: &mut [f64],
    ) -> HmmResult<()> {
        let n = self.n_states;
        let index_tgt = iter_at_target.index();
        validate_buffer_len(out, src.len() * n_tgt, "transition posterior")?;
        if index_tgt == 0 {
            return Err(HmmError::DimensionMismatch {
                context: "transition posterior target position".to_string(),
                expected: 1,
                actual: 0,
            });
        }

        let fw_src = &fw[(index_tgt - 1) * n..index_tgt * n];
        let bk_tgt = &bk[index_tgt * n..(index_tgt + 1) * n];

        let mut r = 0;
        for &k in src {
            let targets = self.transitions.function(k).targets();
            for &l in targets.iter().take(n_tgt) {
                let log_emission = self.emissions.log_probability(iter_at_target, l);
                let log_trans = self.transitions.log_probability(iter_at_target, k, l);
                out[r] = (fw_src[k] + log_trans + log_emission + bk_tgt[l] - loglik).exp();
                r += 1;
            }
        }
        Ok(())
    }

    /// Sample a state path from the posterior given a forward matrix.
    ///
    /// The last state is drawn proportional to the exponentials of the
    /// final forward column; each step backwards draws state s' at
    /// position t proportional to `exp(fw[k,t] + logA(iter_at_t+1, k, s))`.
    /// Probabilities are renormalised at every step to absorb rounding,
    /// and a sampled index past N-1 is clamped.
    pub fn stochastic_backtrace(
        &self,
        iter: &mut SeqIter<'_>,
        fw: &[f64],
        path: &mut [usize],
    ) -> HmmResult<()> {
        let n = self.n_states;
        let len = iter.len();
        if path.len() != len {
            return Err(HmmError::DimensionMismatch {
                context: "stochastic backtrace path".to_string(),
                expected: len,
                actual: path.len(),
            });
        }

        let mut handle = rnd_prepare();
        let mut probs = vec![0.0; n];

        // sample the last state from the final forward column
        let last_col = &fw[(len - 1) * n..len * n];
        shifted_exp(last_col, &mut probs);
        let mut state = sample_state(&mut probs, handle.runif());
        path[len - 1] = state;

        // walk backwards; the iterator sits at t+1 while sampling t
        iter.reset_last();
        let mut terms = vec![0.0; n];
        for t in (0..len - 1).rev() {
            for (k, term) in terms.iter_mut().enumerate() {
                *term = fw[t * n + k] + self.transitions.log_probability(iter, k, state);
            }
            shifted_exp(&terms, &mut probs);
            state = sample_state(&mut probs, handle.runif());
            path[t] = state;
            if t > 0 {
                iter.prev();
            }
        }

        Ok(())
    }
}

/// Exponentiate log values shifted by their maximum.
fn shifted_exp(log_values: &[f64], out: &mut [f64]) {
    let max = log_values.iter().cloned().fold(LOG_ZERO, f64::max);
    if max == LOG_ZERO {
        out.fill(0.0);
        return;
    }
    for (o, &v) in out.iter_mut().zip(log_values.iter()) {
        *o = (v - max).exp();
    }
}

/// Draw an index with probability proportional to `probs`, renormalising
/// in place; rounding overflow clamps to the last index.
fn sample_state(probs: &mut [f64], u: f64) -> usize {
    let sum: f64 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }

    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if u <= acc {
            return i;
        }
    }
    probs.len() - 1
}
