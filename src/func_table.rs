//! Function tables: per-state distributions aggregated into callable
//! matrices.
//!
//! Tables own their distribution instances. Homogeneous transition tables
//! additionally cache an N×N matrix of log-transition probabilities,
//! refreshed whenever any parameter changes, and report a sparsity
//! structure the engine uses to pick its inner recurrence.

use crate::distribution::{EmissionDistribution, TransitionDistribution};
use crate::errors::{HmmError, HmmResult};
use crate::math_utils::LOG_ZERO;
use crate::sequence::SeqIter;

/// Engine-facing view of a transition table.
pub trait TransitionTable {
    /// Number of states N.
    fn n_states(&self) -> usize;

    /// Log-probability of the i → j transition at the cursor position.
    fn log_probability(&self, iter: &SeqIter<'_>, i: usize, j: usize) -> f64;

    /// True when at least half the table cells are -inf.
    fn is_sparse(&self) -> bool {
        false
    }

    /// Per-target lists of valid source states, when the table can
    /// enumerate them.
    fn previous_states(&self) -> Option<Vec<Vec<usize>>> {
        None
    }

    /// Per-source lists of valid destination states, when the table can
    /// enumerate them.
    fn next_states(&self) -> Option<Vec<Vec<usize>>> {
        None
    }

    /// Recompute any cached probabilities from the current parameters.
    fn refresh(&mut self) {}

    /// The distribution attached to source state `i`.
    fn function(&self, i: usize) -> &dyn TransitionDistribution;

    /// Disjoint mutable access to the distributions of the given states.
    ///
    /// Returned in ascending state order regardless of the order of
    /// `states`.
    fn members_mut(&mut self, states: &[usize]) -> Vec<&mut dyn TransitionDistribution>;
}

/// Engine-facing view of an emission table.
pub trait EmissionTable {
    /// Number of states N.
    fn n_states(&self) -> usize;

    /// Number of emission slots per state.
    fn n_slots(&self) -> usize;

    /// Joint log-probability of the emission(s) at the cursor position
    /// under state `i`.
    fn log_probability(&self, iter: &SeqIter<'_>, i: usize) -> f64;

    /// The distribution attached to (state, slot).
    fn function(&self, state: usize, slot: usize) -> &dyn EmissionDistribution;

    /// Disjoint mutable access to the distributions of the given
    /// (state, slot) pairs, in table order.
    fn members_mut(&mut self, keys: &[(usize, usize)]) -> Vec<&mut dyn EmissionDistribution>;
}

/// Transition table whose probabilities do not depend on position.
///
/// The N×N log matrix is materialised once and reread by every DP cell.
pub struct HomogeneousTransitions {
    n_states: usize,
    funcs: Vec<Box<dyn TransitionDistribution>>,
    matrix: Vec<f64>, // row-major N×N
}

impl HomogeneousTransitions {
    /// Build the table from one distribution per state.
    pub fn new(funcs: Vec<Box<dyn TransitionDistribution>>) -> HmmResult<Self> {
        let n_states = funcs.len();
        for (i, f) in funcs.iter().enumerate() {
            if f.n_states() != n_states || f.state_id() != i {
                return Err(HmmError::DimensionMismatch {
                    context: "homogeneous transition table".to_string(),
                    expected: n_states,
                    actual: f.n_states(),
                });
            }
        }
        let mut table = Self {
            n_states,
            funcs,
            matrix: vec![LOG_ZERO; n_states * n_states],
        };
        table.refresh_matrix();
        Ok(table)
    }

    fn refresh_matrix(&mut self) {
        for i in 0..self.n_states {
            for j in 0..self.n_states {
                self.matrix[i * self.n_states + j] = self.funcs[i].log_probability(j);
            }
        }
    }

    /// Cached log-probability of i → j.
    #[inline]
    pub fn cell(&self, i: usize, j: usize) -> f64 {
        self.matrix[i * self.n_states + j]
    }
}

impl TransitionTable for HomogeneousTransitions {
    fn n_states(&self) -> usize {
        self.n_states
    }

    #[inline]
    fn log_probability(&self, _iter: &SeqIter<'_>, i: usize, j: usize) -> f64 {
        self.matrix[i * self.n_states + j]
    }

    fn is_sparse(&self) -> bool {
        let invalid = self.matrix.iter().filter(|&&v| v == LOG_ZERO).count();
        invalid >= self.n_states * self.n_states / 2
    }

    fn previous_states(&self) -> Option<Vec<Vec<usize>>> {
        let mut previous = Vec::with_capacity(self.n_states);
        for j in 0..self.n_states {
            let mut sources = Vec::new();
            for i in 0..self.n_states {
                if self.cell(i, j) != LOG_ZERO {
                    sources.push(i);
                }
            }
            previous.push(sources);
        }
        Some(previous)
    }

    fn next_states(&self) -> Option<Vec<Vec<usize>>> {
        let mut next = Vec::with_capacity(self.n_states);
        for i in 0..self.n_states {
            let mut destinations = Vec::new();
            for j in 0..self.n_states {
                if self.cell(i, j) != LOG_ZERO {
                    destinations.push(j);
                }
            }
            next.push(destinations);
        }
        Some(next)
    }

    fn refresh(&mut self) {
        self.refresh_matrix();
    }

    fn function(&self, i: usize) -> &dyn TransitionDistribution {
        self.funcs[i].as_ref()
    }

    fn members_mut(&mut self, states: &[usize]) -> Vec<&mut dyn TransitionDistribution> {
        self.funcs
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| states.contains(i))
            .map(|(_, f)| f.as_mut() as &mut dyn TransitionDistribution)
            .collect()
    }
}

/// Transition table whose probabilities depend on covariates at the
/// cursor position; nothing is cached.
pub struct NonHomogeneousTransitions {
    n_states: usize,
    funcs: Vec<Box<dyn TransitionDistribution>>,
}

impl NonHomogeneousTransitions {
    /// Build the table from one distribution per state.
    pub fn new(funcs: Vec<Box<dyn TransitionDistribution>>) -> HmmResult<Self> {
        let n_states = funcs.len();
        for (i, f) in funcs.iter().enumerate() {
            if f.n_states() != n_states || f.state_id() != i {
                return Err(HmmError::DimensionMismatch {
                    context: "non-homogeneous transition table".to_string(),
                    expected: n_states,
                    actual: f.n_states(),
                });
            }
        }
        Ok(Self { n_states, funcs })
    }
}

impl TransitionTable for NonHomogeneousTransitions {
    fn n_states(&self) -> usize {
        self.n_states
    }

    #[inline]
    fn log_probability(&self, iter: &SeqIter<'_>, i: usize, j: usize) -> f64 {
        self.funcs[i].log_probability_at(iter, j)
    }

    fn function(&self, i: usize) -> &dyn TransitionDistribution {
        self.funcs[i].as_ref()
    }

    fn members_mut(&mut self, states: &[usize]) -> Vec<&mut dyn TransitionDistribution> {
        self.funcs
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| states.contains(i))
            .map(|(_, f)| f.as_mut() as &mut dyn TransitionDistribution)
            .collect()
    }
}

/// Emission table with a single slot per state.
pub struct Emissions {
    n_states: usize,
    funcs: Vec<Box<dyn EmissionDistribution>>,
}

impl Emissions {
    /// Build the table from one distribution per state.
    pub fn new(funcs: Vec<Box<dyn EmissionDistribution>>) -> HmmResult<Self> {
        let n_states = funcs.len();
        for (i, f) in funcs.iter().enumerate() {
            if f.state_id() != i {
                return Err(HmmError::DimensionMismatch {
                    context: "emission table".to_string(),
                    expected: i,
                    actual: f.state_id(),
                });
            }
        }
        Ok(Self { n_states, funcs })
    }
}

impl EmissionTable for Emissions {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn n_slots(&self) -> usize {
        1
    }

    #[inline]
    fn log_probability(&self, iter: &SeqIter<'_>, i: usize) -> f64 {
        self.funcs[i].log_probability(iter)
    }

    fn function(&self, state: usize, slot: usize) -> &dyn EmissionDistribution {
        debug_assert_eq!(slot, 0);
        self.funcs[state].as_ref()
    }

    fn members_mut(&mut self, keys: &[(usize, usize)]) -> Vec<&mut dyn EmissionDistribution> {
        self.funcs
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| keys.contains(&(*i, 0)))
            .map(|(_, f)| f.as_mut() as &mut dyn EmissionDistribution)
            .collect()
    }
}

/// Emission table with multiple slots per state; the joint
/// log-probability is the sum of the per-slot log-probabilities.
pub struct MultiEmissions {
    n_states: usize,
    n_slots: usize,
    funcs: Vec<Vec<Box<dyn EmissionDistribution>>>,
}

impl MultiEmissions {
    /// Build the table from one distribution per (state, slot).
    pub fn new(funcs: Vec<Vec<Box<dyn EmissionDistribution>>>) -> HmmResult<Self> {
        let n_states = funcs.len();
        let n_slots = funcs.first().map_or(0, Vec::len);
        for row in &funcs {
            if row.len() != n_slots {
                return Err(HmmError::DimensionMismatch {
                    context: "multi-emission table".to_string(),
                    expected: n_slots,
                    actual: row.len(),
                });
            }
        }
        Ok(Self {
            n_states,
            n_slots,
            funcs,
        })
    }
}

impl EmissionTable for MultiEmissions {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn n_slots(&self) -> usize {
        self.n_slots
    }

    fn log_probability(&self, iter: &SeqIter<'_>, i: usize) -> f64 {
        let mut log_prob = 0.0;
        for slot in 0..self.n_slots {
            log_prob += self.funcs[i][slot].log_probability(iter);
        }
        log_prob
    }

    fn function(&self, state: usize, slot: usize) -> &dyn EmissionDistribution {
        self.funcs[state][slot].as_ref()
    }

    fn members_mut(&mut self, keys: &[(usize, usize)]) -> Vec<&mut dyn EmissionDistribution> {
        let mut selected = Vec::with_capacity(keys.len());
        for (state, row) in self.funcs.iter_mut().enumerate() {
            for (slot, f) in row.iter_mut().enumerate() {
                if keys.contains(&(state, slot)) {
                    selected.push(f.as_mut() as &mut dyn EmissionDistribution);
                }
            }
        }
        selected
    }
}
