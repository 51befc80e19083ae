//! Abstract interfaces every distribution family satisfies.
//!
//! Emission and transition families plug into the engine through these
//! traits. Each instance is parameterised by its position in the model
//! (`state_id`, `slot_id` for emissions; `n_states`, `state_id`, target
//! list for transitions), owns its parameters and any precomputed caches,
//! and participates in Baum–Welch by contributing posterior-weighted
//! sufficient statistics across a parameter-sharing group.
//!
//! Options are a fixed, family-specific name → scalar map. Known names
//! across the reference families: `offset` (added to observations before
//! evaluation), `maxIter` (> 0), `tolerance` (≥ 0), `tblSize` (memo table
//! size for discrete support), `momInit` (method-of-moments
//! initialisation flag), `scale` (> 0, scaled negative binomial only).
//! `set_option` returns false on unknown names without mutating state.

use std::any::Any;

use crate::em::{EmSequences, TransitionPosteriors};
use crate::errors::HmmResult;
use crate::params::Params;
use crate::sequence::SeqIter;

/// An emission distribution attached to one (state, slot) pair.
///
/// `update_params` implements the family's M-step: the called instance
/// gathers sufficient statistics across itself and every `peers` member,
/// estimates new parameters, writes them into itself, then propagates the
/// result so that all group members observe identical parameter state.
pub trait EmissionDistribution: Any {
    /// State this instance is attached to.
    fn state_id(&self) -> usize;

    /// Emission slot this instance evaluates.
    fn slot_id(&self) -> usize;

    /// Dimensionality of the slot (1 for the reference families).
    fn dim(&self) -> usize {
        1
    }

    /// Family validity predicate for a candidate parameter vector.
    fn valid_params(&self, params: &Params) -> bool;

    /// Fresh copy of the current parameters.
    fn get_params(&self) -> Params;

    /// Replace the internal parameter state after validation.
    fn set_params(&mut self, params: &Params) -> HmmResult<()>;

    /// Read a named option, `None` for unknown names.
    fn get_option(&self, name: &str) -> Option<f64>;

    /// Set a named option; false on unknown names or invalid values,
    /// leaving state untouched.
    fn set_option(&mut self, name: &str, value: f64) -> bool;

    /// Log-probability of the emission at the cursor position.
    fn log_probability(&self, iter: &SeqIter<'_>) -> f64;

    /// M-step over the parameter-sharing group (`peers` excludes self).
    fn update_params(
        &mut self,
        sequences: &EmSequences<'_>,
        peers: &mut [&mut dyn EmissionDistribution],
    ) -> HmmResult<()>;

    /// Downcast support for group propagation.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support for group propagation.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A transition distribution attached to one source state.
///
/// Homogeneous families answer `log_probability(target)` from their own
/// parameters; covariate-conditioned families override
/// `log_probability_at` and read the iterator.
pub trait TransitionDistribution: Any {
    /// Total number of states in the model.
    fn n_states(&self) -> usize;

    /// Source state this instance is attached to.
    fn state_id(&self) -> usize;

    /// Destination states with (potentially) non-zero probability.
    fn targets(&self) -> &[usize];

    /// Family validity predicate for a candidate parameter vector.
    fn valid_params(&self, params: &Params) -> bool;

    /// Fresh copy of the current parameters.
    fn get_params(&self) -> Params;

    /// Replace the internal parameter state after validation.
    fn set_params(&mut self, params: &Params) -> HmmResult<()>;

    /// Read a named option, `None` for unknown names.
    fn get_option(&self, name: &str) -> Option<f64>;

    /// Set a named option; false on unknown names or invalid values,
    /// leaving state untouched.
    fn set_option(&mut self, name: &str, value: f64) -> bool;

    /// Log-probability of moving to `target`, independent of position.
    fn log_probability(&self, target: usize) -> f64;

    /// Log-probability of moving to `target` at the cursor position.
    ///
    /// The default ignores the iterator; covariate-conditioned families
    /// override this.
    fn log_probability_at(&self, _iter: &SeqIter<'_>, target: usize) -> f64 {
        self.log_probability(target)
    }

    /// M-step over the parameter-sharing group (`peers` excludes self).
    fn update_params(
        &mut self,
        stats: &TransitionPosteriors,
        peers: &mut [&mut dyn TransitionDistribution],
    ) -> HmmResult<()>;

    /// Downcast support for group propagation.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support for group propagation.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
