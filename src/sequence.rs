//! Observation sequences and the position cursor over them.
//!
//! A [`Sequence`] stores L positions of multi-slot emissions (each slot
//! with its own dimensionality) and optional per-position covariates in
//! contiguous position-major buffers. A [`SeqIter`] is a borrowed cursor
//! with constant-time neighbour access; the dynamic-programming engine and
//! the distribution families only ever see the cursor.

use crate::errors::{validate_buffer_len, HmmError, HmmResult};

/// Immutable observation sequence: emissions plus optional covariates.
#[derive(Debug, Clone)]
pub struct Sequence {
    length: usize,
    emission_offsets: Vec<usize>,
    emission_step: usize,
    emissions: Vec<f64>,
    covar_offsets: Vec<usize>,
    covar_step: usize,
    covars: Vec<f64>,
}

impl Sequence {
    /// Build a sequence from flat position-major buffers.
    ///
    /// `emissions` holds `length * sum(emission_dims)` values: all slots of
    /// position 0, then all slots of position 1, and so on. `covars` works
    /// the same way over `covar_dims` and may be empty together with
    /// `covar_dims` when the model has no covariates.
    pub fn new(
        length: usize,
        emission_dims: &[usize],
        emissions: Vec<f64>,
        covar_dims: &[usize],
        covars: Vec<f64>,
    ) -> HmmResult<Self> {
        if length == 0 {
            return Err(HmmError::DimensionMismatch {
                context: "sequence length".to_string(),
                expected: 1,
                actual: 0,
            });
        }
        let emission_step: usize = emission_dims.iter().sum();
        let covar_step: usize = covar_dims.iter().sum();

        validate_buffer_len(&emissions, length * emission_step, "sequence emissions")?;
        validate_buffer_len(&covars, length * covar_step, "sequence covariates")?;

        let mut emission_offsets = Vec::with_capacity(emission_dims.len());
        let mut acc = 0;
        for &d in emission_dims {
            emission_offsets.push(acc);
            acc += d;
        }

        let mut covar_offsets = Vec::with_capacity(covar_dims.len());
        acc = 0;
        for &d in covar_dims {
            covar_offsets.push(acc);
            acc += d;
        }

        Ok(Self {
            length,
            emission_offsets,
            emission_step,
            emissions,
            covar_offsets,
            covar_step,
            covars,
        })
    }

    /// Single-slot, one-dimensional emission sequence without covariates.
    pub fn from_values(values: Vec<f64>) -> HmmResult<Self> {
        let length = values.len();
        Self::new(length, &[1], values, &[], Vec::new())
    }

    /// Sequence length L.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True when the sequence has no positions.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of emission slots.
    pub fn emission_slots(&self) -> usize {
        self.emission_offsets.len()
    }

    /// Number of covariate slots.
    pub fn covar_slots(&self) -> usize {
        self.covar_offsets.len()
    }

    /// Cursor positioned at index 0.
    pub fn iter(&self) -> SeqIter<'_> {
        SeqIter { seq: self, pos: 0 }
    }
}

/// Position cursor over a [`Sequence`].
///
/// After `reset_first` the cursor is at index 0; after `reset_last` at
/// L-1. `next`/`prev` move one step and report whether movement occurred.
/// Out-of-range slot or element access is a programming error and panics.
#[derive(Debug, Clone)]
pub struct SeqIter<'a> {
    seq: &'a Sequence,
    pos: usize,
}

impl<'a> SeqIter<'a> {
    /// Move the cursor to index 0.
    pub fn reset_first(&mut self) {
        self.pos = 0;
    }

    /// Move the cursor to index L-1.
    pub fn reset_last(&mut self) {
        self.pos = self.seq.length - 1;
    }

    /// Advance one position; returns false (without moving) at the end.
    pub fn next(&mut self) -> bool {
        if self.pos + 1 >= self.seq.length {
            return false;
        }
        self.pos += 1;
        true
    }

    /// Step back one position; returns false (without moving) at the start.
    pub fn prev(&mut self) -> bool {
        if self.pos == 0 {
            return false;
        }
        self.pos -= 1;
        true
    }

    /// Current position index.
    pub fn index(&self) -> usize {
        self.pos
    }

    /// Sequence length L.
    pub fn len(&self) -> usize {
        self.seq.length
    }

    /// True when the underlying sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.seq.length == 0
    }

    /// First element of `slot` at the current position.
    #[inline]
    pub fn emission(&self, slot: usize) -> f64 {
        self.seq.emissions[self.pos * self.seq.emission_step + self.seq.emission_offsets[slot]]
    }

    /// Element `i` of `slot` at the current position.
    #[inline]
    pub fn emission_i(&self, slot: usize, i: usize) -> f64 {
        self.seq.emissions[self.pos * self.seq.emission_step + self.seq.emission_offsets[slot] + i]
    }

    /// First element of covariate `slot` at the current position.
    #[inline]
    pub fn covar(&self, slot: usize) -> f64 {
        self.seq.covars[self.pos * self.seq.covar_step + self.seq.covar_offsets[slot]]
    }

    /// Element `i` of covariate `slot` at the current position.
    #[inline]
    pub fn covar_i(&self, slot: usize, i: usize) -> f64 {
        self.seq.covars[self.pos * self.seq.covar_step + self.seq.covar_offsets[slot] + i]
    }

    /// Element `i` of covariate `slot` at a position `offset` steps away
    /// from the cursor, without moving it.
    #[inline]
    pub fn covar_ext(&self, slot: usize, i: usize, offset: isize) -> f64 {
        let pos = self.pos as isize + offset;
        debug_assert!(pos >= 0 && (pos as usize) < self.seq.length);
        self.seq.covars
            [pos as usize * self.seq.covar_step + self.seq.covar_offsets[slot] + i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slot_sequence() -> Sequence {
        // 3 positions, slot 0 has dim 1, slot 1 has dim 2
        // position-major: [e0, e1a, e1b] per position
        Sequence::new(
            3,
            &[1, 2],
            vec![1.0, 10.0, 11.0, 2.0, 20.0, 21.0, 3.0, 30.0, 31.0],
            &[1],
            vec![0.5, 0.6, 0.7],
        )
        .unwrap()
    }

    #[test]
    fn test_cursor_movement() {
        let seq = two_slot_sequence();
        let mut it = seq.iter();
        assert_eq!(it.index(), 0);
        assert!(it.next());
        assert!(it.next());
        assert!(!it.next());
        assert_eq!(it.index(), 2);
        assert!(it.prev());
        assert!(it.prev());
        assert!(!it.prev());
        assert_eq!(it.index(), 0);

        it.reset_last();
        assert_eq!(it.index(), 2);
        it.reset_first();
        assert_eq!(it.index(), 0);
    }

    #[test]
    fn test_slot_access() {
        let seq = two_slot_sequence();
        let mut it = seq.iter();
        assert_eq!(it.emission(0), 1.0);
        assert_eq!(it.emission(1), 10.0);
        assert_eq!(it.emission_i(1, 1), 11.0);
        assert_eq!(it.covar(0), 0.5);

        it.next();
        assert_eq!(it.emission(0), 2.0);
        assert_eq!(it.emission_i(1, 0), 20.0);
        assert_eq!(it.covar(0), 0.6);
    }

    #[test]
    fn test_covar_ext_relative_read() {
        let seq = two_slot_sequence();
        let mut it = seq.iter();
        it.next(); // position 1
        assert_eq!(it.covar_ext(0, 0, -1), 0.5);
        assert_eq!(it.covar_ext(0, 0, 0), 0.6);
        assert_eq!(it.covar_ext(0, 0, 1), 0.7);
        // cursor unmoved
        assert_eq!(it.index(), 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = Sequence::new(2, &[1], vec![1.0, 2.0, 3.0], &[], Vec::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(Sequence::from_values(Vec::new()).is_err());
        assert!(Sequence::new(0, &[1], Vec::new(), &[], Vec::new()).is_err());
    }

    #[test]
    fn test_from_values() {
        let seq = Sequence::from_values(vec![4.0, 5.0]).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.emission_slots(), 1);
        assert_eq!(seq.covar_slots(), 0);
        assert_eq!(seq.iter().emission(0), 4.0);
    }
}
