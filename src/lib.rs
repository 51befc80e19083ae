//! # HMM Inference
//!
//! Inference and parameter-estimation core of a Hidden Markov Model
//! library with pluggable emission and transition distributions and
//! support for non-homogeneous transitions conditioned on covariates.
//!
//! The crate computes the standard HMM quantities — forward, backward,
//! Viterbi, posterior decoding, stochastic backtrace, and Baum–Welch
//! re-estimation — over observation sequences whose emissions may be
//! multi-dimensional and whose transition probabilities may depend on
//! per-position covariates.
//!
//! ## Key features
//!
//! - **Log-domain dynamic programming**: -inf is a first-class value and
//!   propagates correctly through every recurrence; sparse transition
//!   structures get dedicated inner recurrences.
//! - **Pluggable distributions**: any family implementing the
//!   [`EmissionDistribution`] / [`TransitionDistribution`] traits
//!   participates in inference and EM; a process-wide [`registry`] maps
//!   family names to constructors for external layers.
//! - **Parameter-sharing groups**: distributions tied across states or
//!   slots contribute posterior-weighted sufficient statistics to one
//!   M-step and always hold identical parameters afterwards.
//! - **Reference families**: discrete emissions and transitions, gamma
//!   emissions, and a scaled negative binomial whose dispersion is
//!   estimated by Newton iteration over digamma/trigamma.
//!
//! ## Quick start
//!
//! ```rust
//! use hmm_inference::{
//!     DiscreteEmission, DiscreteTransition, Emissions, Hmm,
//!     HomogeneousTransitions, Sequence,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // two-state model over a binary alphabet
//!     let transitions = HomogeneousTransitions::new(vec![
//!         Box::new(DiscreteTransition::with_probs(2, 0, &[0, 1], &[0.9, 0.1])?),
//!         Box::new(DiscreteTransition::with_probs(2, 1, &[0, 1], &[0.2, 0.8])?),
//!     ])?;
//!     let emissions = Emissions::new(vec![
//!         Box::new(DiscreteEmission::with_probs(0, 0, &[0.5, 0.5])?),
//!         Box::new(DiscreteEmission::with_probs(1, 0, &[0.1, 0.9])?),
//!     ])?;
//!     let hmm = Hmm::new(transitions, emissions, &[1.0, 0.0])?;
//!
//!     let seq = Sequence::from_values(vec![0.0, 1.0, 1.0, 0.0])?;
//!     let mut matrix = vec![0.0; hmm.n_states() * seq.len()];
//!     let loglik = hmm.forward(&mut seq.iter(), &mut matrix)?;
//!     println!("log-likelihood: {loglik:.6}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod distribution;
pub mod em;
pub mod engine;
pub mod errors;
pub mod func_table;
pub mod logsum;
pub mod math_utils;
pub mod params;
pub mod registry;
pub mod rng;
pub mod sequence;

// Reference distribution families
pub mod emissions;
pub mod transitions;

// Re-exports for convenience - main public API
pub use distribution::{EmissionDistribution, TransitionDistribution};
pub use em::{EmSequences, PosteriorVisit, TrainConfig, TrainReport, TransitionPosteriors, XiVisit};
pub use engine::Hmm;
pub use errors::{HmmError, HmmResult};
pub use func_table::{
    Emissions, EmissionTable, HomogeneousTransitions, MultiEmissions, NonHomogeneousTransitions,
    TransitionTable,
};
pub use logsum::LogSum;
pub use params::Params;
pub use sequence::{SeqIter, Sequence};

pub use emissions::{DiscreteEmission, GammaEmission, NegBinomialScaled};
pub use transitions::DiscreteTransition;

pub use registry::{
    create_emission, create_transition, lookup, register, register_builtin_families,
    unregister_all, EmissionFactory, FamilyEntry, TransitionFactory,
};
