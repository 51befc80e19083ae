//! Baum–Welch EM driver and the posterior iterators handed to M-steps.
//!
//! One iteration runs forward/backward over every sequence, materialises
//! posterior-weighted visit data, then walks the parameter-sharing groups:
//! for each group one member's `update_params` gathers sufficient
//! statistics across the whole group, estimates new parameters, and
//! propagates them so every member observes identical parameter state.
//! Homogeneous transition caches are refreshed afterwards.
//!
//! Transition posterior arrays are materialised from the pre-update
//! tables, so emission updates earlier in the same iteration cannot skew
//! the transition statistics.

use log::warn;

use crate::engine::Hmm;
use crate::errors::{HmmError, HmmResult};
use crate::func_table::{EmissionTable, TransitionTable};
use crate::math_utils::loglik_agree;
use crate::sequence::{SeqIter, Sequence};

/// Relative tolerance for the forward/backward agreement check.
const LOGLIK_AGREEMENT_TOL: f64 = 1e-9;

/// Posterior-weighted visit data for one sequence.
pub struct PosteriorVisit<'a> {
    /// Posterior weight of the target state at each position (length L).
    pub weights: &'a [f64],
    /// Cursor over the sequence, positioned at index 0.
    pub iter: SeqIter<'a>,
}

/// Owned posterior state for one EM iteration across all sequences.
///
/// State posteriors are stored state-major per sequence so a
/// distribution's weights are one contiguous slice.
pub struct EmSequences<'a> {
    sequences: &'a [Sequence],
    n_states: usize,
    posteriors: Vec<Vec<f64>>,
    logliks: Vec<f64>,
}

impl<'a> EmSequences<'a> {
    /// Per-sequence posterior visits for one state.
    pub fn posteriors(&self, state: usize) -> impl Iterator<Item = PosteriorVisit<'_>> {
        debug_assert!(state < self.n_states);
        self.sequences
            .iter()
            .zip(self.posteriors.iter())
            .map(move |(seq, post)| {
                let len = seq.len();
                PosteriorVisit {
                    weights: &post[state * len..(state + 1) * len],
                    iter: seq.iter(),
                }
            })
    }

    /// Sum of the per-sequence log-likelihoods.
    pub fn total_loglik(&self) -> f64 {
        self.logliks.iter().sum()
    }

    /// Number of sequences.
    pub fn n_sequences(&self) -> usize {
        self.sequences.len()
    }
}

/// Expected transition counts for one parameter-sharing group,
/// materialised per sequence.
///
/// `xi(t, member, target_idx)` is the posterior probability of taking the
/// `target_idx`-th listed transition of group member `member` into
/// position `t` (t ranges over 1..L).
pub struct TransitionPosteriors {
    members: Vec<usize>,
    n_targets: usize,
    data: Vec<Vec<f64>>,
    lens: Vec<usize>,
}

impl TransitionPosteriors {
    /// Group member source states.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// Number of targets per member.
    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Per-sequence views over the materialised values.
    pub fn visits(&self) -> impl Iterator<Item = XiVisit<'_>> {
        self.data
            .iter()
            .zip(self.lens.iter())
            .map(move |(values, &len)| XiVisit {
                values,
                n_members: self.members.len(),
                n_targets: self.n_targets,
                len,
            })
    }
}

/// Transition posteriors of one sequence.
pub struct XiVisit<'a> {
    values: &'a [f64],
    n_members: usize,
    n_targets: usize,
    len: usize,
}

impl XiVisit<'_> {
    /// Sequence length L; valid target positions are 1..L.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the sequence has no transitions.
    pub fn is_empty(&self) -> bool {
        self.len < 2
    }

    /// ξ value for entering position `t` via group member `member`'s
    /// `target_idx`-th listed transition.
    #[inline]
    pub fn xi(&self, t: usize, member: usize, target_idx: usize) -> f64 {
        debug_assert!(t >= 1 && t < self.len);
        self.values[((t - 1) * self.n_members + member) * self.n_targets + target_idx]
    }
}

/// Convergence controls for the [`Hmm::train`] loop.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Maximum number of EM iterations.
    pub max_iterations: usize,
    /// Stop when the log-likelihood improvement drops below this.
    pub tolerance: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

/// Outcome of a [`Hmm::train`] run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// EM iterations performed.
    pub iterations: usize,
    /// Log-likelihood under the parameters in place at the start of the
    /// final iteration.
    pub log_likelihood: f64,
}

impl<A: TransitionTable, E: EmissionTable> Hmm<A, E> {
    /// Run one Baum–Welch iteration over `sequences`.
    ///
    /// `emission_groups` partitions the emission distributions by
    /// (state, slot); `transition_groups` partitions the transition
    /// distributions by source state. Every distribution belongs to
    /// exactly one group; a singleton group runs the same path. Returns
    /// the total log-likelihood under the pre-update parameters.
    pub fn em_iteration(
        &mut self,
        sequences: &[Sequence],
        emission_groups: &[Vec<(usize, usize)>],
        transition_groups: &[Vec<usize>],
    ) -> HmmResult<f64> {
        let n = self.n_states;

        // E-step: forward/backward per sequence plus state posteriors
        let mut forwards = Vec::with_capacity(sequences.len());
        let mut backwards = Vec::with_capacity(sequences.len());
        let mut posteriors = Vec::with_capacity(sequences.len());
        let mut logliks = Vec::with_capacity(sequences.len());

        for seq in sequences {
            let len = seq.len();
            let mut iter = seq.iter();
            let mut fw = vec![0.0; n * len];
            let mut bk = vec![0.0; n * len];

            let fw_loglik = self
                .forward(&mut iter, &mut fw)
                .map_err(|e| e.with_frame("em"))?;
            let bk_loglik = self
                .backward(&mut iter, &mut bk)
                .map_err(|e| e.with_frame("em"))?;

            if !loglik_agree(fw_loglik, bk_loglik, LOGLIK_AGREEMENT_TOL) {
                return Err(HmmError::NumericalFailure {
                    reason: format!(
                        "forward/backward log-likelihood mismatch: {} vs {}",
                        fw_loglik, bk_loglik
                    ),
                }
                .with_frame("em"));
            }

            let mut post = vec![0.0; n * len];
            self.state_posterior(&iter, &fw, &bk, &mut post)
                .map_err(|e| e.with_frame("em"))?;

            forwards.push(fw);
            backwards.push(bk);
            posteriors.push(post);
            logliks.push(fw_loglik);
        }

        // materialise transition posteriors before any parameter changes
        let transition_stats: Vec<TransitionPosteriors> = transition_groups
            .iter()
            .map(|group| {
                self.collect_transition_posteriors(
                    sequences, &forwards, &backwards, &logliks, group,
                )
            })
            .collect();

        let total_loglik: f64 = logliks.iter().sum();
        let em_seqs = EmSequences {
            sequences,
            n_states: n,
            posteriors,
            logliks,
        };

        // M-step: emission groups
        for group in emission_groups {
            let mut members = self.emissions.members_mut(group);
            let Some((leader, peers)) = members.split_first_mut() else {
                continue;
            };
            let (state_id, slot_id) = (leader.state_id(), leader.slot_id());
            match leader.update_params(&em_seqs, peers) {
                Ok(()) => {}
                Err(HmmError::NotConverged { .. }) | Err(HmmError::NumericalFailure { .. }) => {
                    warn!(
                        "state {} slot {}: emission M-step kept previous parameters",
                        state_id, slot_id
                    );
                }
                Err(e) => return Err(e.with_frame("em")),
            }
        }

        // M-step: transition groups
        for (group, stats) in transition_groups.iter().zip(transition_stats.iter()) {
            let mut members = self.transitions.members_mut(group);
            let Some((leader, peers)) = members.split_first_mut() else {
                continue;
            };
            let state_id = leader.state_id();
            match leader.update_params(stats, peers) {
                Ok(()) => {}
                Err(HmmError::NotConverged { .. }) | Err(HmmError::NumericalFailure { .. }) => {
                    warn!(
                        "state {}: transition M-step kept previous parameters",
                        state_id
                    );
                }
                Err(e) => return Err(e.with_frame("em")),
            }
        }

        self.refresh_transitions();
        Ok(total_loglik)
    }

    /// Iterate [`Hmm::em_iteration`] until the log-likelihood improvement
    /// drops below tolerance or the iteration limit is reached.
    pub fn train(
        &mut self,
        sequences: &[Sequence],
        emission_groups: &[Vec<(usize, usize)>],
        transition_groups: &[Vec<usize>],
        config: &TrainConfig,
    ) -> HmmResult<TrainReport> {
        let mut prev_loglik = f64::NEG_INFINITY;
        let mut loglik = f64::NEG_INFINITY;

        for iteration in 0..config.max_iterations {
            loglik = self.em_iteration(sequences, emission_groups, transition_groups)?;

            if iteration > 0 && (loglik - prev_loglik).abs() < config.tolerance {
                return Ok(TrainReport {
                    iterations: iteration + 1,
                    log_likelihood: loglik,
                });
            }
            prev_loglik = loglik;
        }

        Ok(TrainReport {
            iterations: config.max_iterations,
            log_likelihood: loglik,
        })
    }

    fn collect_transition_posteriors(
        &self,
        sequences: &[Sequence],
        forwards: &[Vec<f64>],
        backwards: &[Vec<f64>],
        logliks: &[f64],
        group: &[usize],
    ) -> TransitionPosteriors {
        let n = self.n_states;
        let n_targets = group
            .first()
            .map_or(0, |&k| self.transitions.function(k).targets().len());

        let mut data = Vec::with_capacity(sequences.len());
        let mut lens = Vec::with_capacity(sequences.len());

        for (s, seq) in sequences.iter().enumerate() {
            let len = seq.len();
            let fw = &forwards[s];
            let bk = &backwards[s];
            let loglik = logliks[s];

            let mut values = vec![0.0; len.saturating_sub(1) * group.len() * n_targets];
            let mut iter = seq.iter();
            iter.reset_first();
            let mut t = 1;
            while iter.next() {
                for (g, &k) in group.iter().enumerate() {
                    let targets = self.transitions.function(k).targets();
                    for (ti, &l) in targets.iter().take(n_targets).enumerate() {
                        let value = fw[(t - 1) * n + k]
                            + self.transitions.log_probability(&iter, k, l)
                            + self.emissions.log_probability(&iter, l)
                            + bk[t * n + l]
                            - loglik;
                        values[((t - 1) * group.len() + g) * n_targets + ti] = value.exp();
                    }
                }
                t += 1;
            }

            data.push(values);
            lens.push(len);
        }

        TransitionPosteriors {
            members: group.to_vec(),
            n_targets,
            data,
            lens,
        }
    }
}
