//! Reference transition family: discrete transitions with
//! tied-probability groups.

use std::any::Any;

use log::warn;

use crate::distribution::TransitionDistribution;
use crate::em::TransitionPosteriors;
use crate::errors::{HmmError, HmmResult};
use crate::math_utils::{prob_to_log, same_probability, LOG_ZERO};
use crate::params::Params;

/// Discrete transition distribution over an explicit target list.
///
/// Log-probabilities are stored per destination state; states outside
/// the target list stay at -inf. New instances start equi-probable at
/// `1/n_states` on each listed target.
pub struct DiscreteTransition {
    n_states: usize,
    state_id: usize,
    targets: Vec<usize>,
    log_probs: Vec<f64>,
    fixed: bool,
}

impl DiscreteTransition {
    /// Create a transition out of `state_id` restricted to `targets`.
    pub fn new(n_states: usize, state_id: usize, targets: &[usize]) -> Self {
        let mut log_probs = vec![LOG_ZERO; n_states];
        let log_prob = -(n_states as f64).ln();
        for &t in targets {
            log_probs[t] = log_prob;
        }
        Self {
            n_states,
            state_id,
            targets: targets.to_vec(),
            log_probs,
            fixed: false,
        }
    }

    /// Create with an explicit probability per target.
    pub fn with_probs(
        n_states: usize,
        state_id: usize,
        targets: &[usize],
        probs: &[f64],
    ) -> HmmResult<Self> {
        let mut transition = Self::new(n_states, state_id, targets);
        transition.set_params(&Params::new(probs))?;
        Ok(transition)
    }
}

impl TransitionDistribution for DiscreteTransition {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn state_id(&self) -> usize {
        self.state_id
    }

    fn targets(&self) -> &[usize] {
        &self.targets
    }

    fn valid_params(&self, params: &Params) -> bool {
        let sum: f64 = params.iter().sum();
        params.len() == self.targets.len() && same_probability(sum, 1.0)
    }

    fn get_params(&self) -> Params {
        let probs: Vec<f64> = self
            .targets
            .iter()
            .map(|&t| self.log_probs[t].exp())
            .collect();
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
                    "expected {} probabilities summing to 1, got {:?}",
                    self.targets.len(),
                    params.values()
                ),
            });
        }
        for (i, &t) in self.targets.iter().enumerate() {
            self.log_probs[t] = prob_to_log(params[i]);
        }
        self.fixed = params.any_fixed();
        Ok(())
    }

    fn get_option(&self, _name: &str) -> Option<f64> {
        None
    }

    fn set_option(&mut self, _name: &str, _value: f64) -> bool {
        false
    }

    fn log_probability(&self, target: usize) -> f64 {
        self.log_probs[target]
    }

    fn update_params(
        &mut self,
        stats: &TransitionPosteriors,
        peers: &mut [&mut dyn TransitionDistribution],
    ) -> HmmResult<()> {
        if self.fixed {
            return Ok(());
        }

        let n_targets = self.targets.len();
        if stats.n_targets() != n_targets {
            return Err(HmmError::DimensionMismatch {
                context: "discrete transition statistics".to_string(),
                expected: n_targets,
                actual: stats.n_targets(),
            });
        }

        // sufficient statistics are the per-target expected counts summed
        // over the whole group
        let mut expected_counts = vec![0.0; n_targets];
        let n_members = stats.members().len();
        for visit in stats.visits() {
            for t in 1..visit.len() {
                for g in 0..n_members {
                    for (ti, count) in expected_counts.iter_mut().enumerate() {
                        *count += visit.xi(t, g, ti);
                    }
                }
            }
        }

        let normalization: f64 = expected_counts.iter().sum();
        if !(normalization > 0.0) || !normalization.is_finite() {
            warn!(
                "state {}: transition update failed: zero expected counts (keeping old values)",
                self.state_id
            );
            return Ok(());
        }

        for (ti, &t) in self.targets.iter().enumerate() {
            self.log_probs[t] = prob_to_log(expected_counts[ti] / normalization);
        }

        // propagate identical log-probabilities to group peers, mapped
        // through each peer's own target list
        for peer in peers.iter_mut() {
            let dt = peer
                .as_any_mut()
                .downcast_mut::<DiscreteTransition>()
                .ok_or_else(|| HmmError::InvalidParameters {
                    family: "discrete".to_string(),
                    reason: "parameter-sharing group member is not a discrete transition"
                        .to_string(),
                })?;
            if dt.targets.len() != n_targets {
                return Err(HmmError::DimensionMismatch {
                    context: "discrete transition group targets".to_string(),
                    expected: n_targets,
                    actual: dt.targets.len(),
                });
            }
            for ti in 0..n_targets {
                dt.log_probs[dt.targets[ti]] = self.log_probs[self.targets[ti]];
            }
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
