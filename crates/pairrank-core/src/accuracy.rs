//! Pairwise decisions and tie-aware accuracy.
//!
//! Rank estimates arrive in batch layout: index `2k` is item 1 of pair `k`,
//! index `2k + 1` is item 2. Each pair collapses to a decision in
//! `{0, 0.5, 1}`; only unmasked, non-tied pairs count toward accuracy.

use crate::{RankerError, Result, TIE_LABEL};

/// Discretize one pair of rank estimates.
///
/// `0.5` when the estimates are equal, `1` when the first is higher,
/// `0` otherwise.
pub fn pairwise_decision(first: f32, second: f32) -> f32 {
    if first == second {
        TIE_LABEL
    } else if first > second {
        1.0
    } else {
        0.0
    }
}

/// Reduce a flat, interleaved estimate sequence to one decision per pair.
///
/// # Errors
///
/// Returns [`RankerError::InvalidBatch`] when the estimate count is odd.
pub fn pairwise_decisions(estimates: &[f32]) -> Result<Vec<f32>> {
    if estimates.len() % 2 != 0 {
        return Err(RankerError::InvalidBatch(format!(
            "rank estimates must pair up, got {} values",
            estimates.len()
        )));
    }
    Ok(estimates
        .chunks_exact(2)
        .map(|pair| pairwise_decision(pair[0], pair[1]))
        .collect())
}

/// Running accuracy over one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyTally {
    /// Eligible pairs whose decision equals the target.
    pub correct: usize,
    /// Eligible pairs (mask true, target not a tie).
    pub total: usize,
    /// Every pair offered to the tally.
    pub seen: usize,
    pub masked: usize,
    pub tied: usize,
}

impl AccuracyTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch of decisions into the tally.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::InvalidBatch`] if the three slices differ in
    /// length.
    pub fn update(&mut self, decisions: &[f32], targets: &[f32], mask: &[bool]) -> Result<()> {
        if decisions.len() != targets.len() || targets.len() != mask.len() {
            return Err(RankerError::InvalidBatch(format!(
                "{} decisions, {} targets, {} mask bits",
                decisions.len(),
                targets.len(),
                mask.len()
            )));
        }
        for ((&decision, &target), &valid) in decisions.iter().zip(targets).zip(mask) {
            self.seen += 1;
            if !valid {
                self.masked += 1;
                continue;
            }
            if target == TIE_LABEL {
                self.tied += 1;
                continue;
            }
            self.total += 1;
            if decision == target {
                self.correct += 1;
            }
        }
        Ok(())
    }

    /// `correct / total`.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::NoEligiblePairs`] when no pair was eligible.
    pub fn accuracy(&self) -> Result<f64> {
        if self.total == 0 {
            return Err(RankerError::NoEligiblePairs {
                seen: self.seen,
                masked: self.masked,
                tied: self.tied,
            });
        }
        Ok(self.correct as f64 / self.total as f64)
    }
}

impl std::fmt::Display for AccuracyTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "correct={}/{} seen={} masked={} tied={}",
            self.correct, self.total, self.seen, self.masked, self.tied
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_estimates_tie() {
        for v in [-3.5f32, 0.0, 1e-9, 42.0] {
            assert_eq!(pairwise_decision(v, v), 0.5);
        }
    }

    #[test]
    fn test_decision_follows_order() {
        assert_eq!(pairwise_decision(0.2, 0.1), 1.0);
        assert_eq!(pairwise_decision(-1.0, 3.0), 0.0);
        assert_eq!(pairwise_decision(1e-6, 0.0), 1.0);
        assert_eq!(pairwise_decision(0.0, 1e-6), 0.0);
    }

    #[test]
    fn test_decisions_pair_by_adjacency() {
        let d = pairwise_decisions(&[2.0, 1.0, 0.0, 5.0, 3.0, 3.0]).unwrap();
        assert_eq!(d, vec![1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_odd_estimates_rejected() {
        assert!(pairwise_decisions(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_ties_excluded_from_denominator() {
        let mut tally = AccuracyTally::new();
        tally
            .update(
                &[1.0, 0.0, 1.0, 0.5],
                &[0.5, 0.5, 1.0, 0.0],
                &[true, true, true, true],
            )
            .unwrap();
        assert_eq!(tally.total, 2);
        assert_eq!(tally.tied, 2);
        assert_eq!(tally.correct, 1);
        assert!((tally.accuracy().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_masked_pairs_never_count() {
        let mut tally = AccuracyTally::new();
        tally
            .update(&[1.0, 0.0, 1.0], &[1.0, 1.0, 0.0], &[false, false, true])
            .unwrap();
        assert_eq!(tally.masked, 2);
        assert_eq!(tally.total, 1);
        assert_eq!(tally.correct, 0);
        assert_eq!(tally.accuracy().unwrap(), 0.0);
    }

    #[test]
    fn test_tally_accumulates_across_batches() {
        let mut tally = AccuracyTally::new();
        tally.update(&[1.0], &[1.0], &[true]).unwrap();
        tally.update(&[0.0, 1.0], &[0.0, 0.0], &[true, true]).unwrap();
        assert_eq!((tally.correct, tally.total, tally.seen), (2, 3, 3));
    }

    #[test]
    fn test_no_eligible_pairs_is_error() {
        let mut tally = AccuracyTally::new();
        tally.update(&[1.0, 0.5], &[0.5, 1.0], &[true, false]).unwrap();
        let err = tally.accuracy().unwrap_err();
        assert!(matches!(
            err,
            RankerError::NoEligiblePairs {
                seen: 2,
                masked: 1,
                tied: 1
            }
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut tally = AccuracyTally::new();
        assert!(tally.update(&[1.0], &[1.0, 0.0], &[true, true]).is_err());
    }
}
