//! Monte-Carlo completion-time forecasting.
//!
//! For a subtree: every todo strong-descendant leaf with an estimate is
//! paired against calibration samples (completed or abandoned nodes with an
//! estimate, scored by their actual/estimate ratio). Each trial draws one
//! ratio per leaf by weighted resampling and sums estimate x ratio; the
//! sorted trial totals yield the reported percentiles.
//!
//! Calibration weights are computed per leaf in log space: a ~1-year
//! half-life recency decay on the distance between start times, plus a
//! sqrt(2) boost per shared ancestor, so work similar in time and place
//! dominates the resample.

use std::collections::BTreeSet;

use rand::Rng;

use crate::core::NodeId;

use super::resample::AliasTable;

/// Percentiles reported, in order.
pub const PERCENTILES: [u8; 7] = [0, 10, 33, 50, 67, 90, 100];

const LN2: f64 = std::f64::consts::LN_2;

#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// Plain sum of leaf estimates, in hours.
    pub leaf_estimate_sum: f64,
    /// Trial-total order statistics for `PERCENTILES`, in hours.
    pub percentiles: [f64; 7],
}

#[derive(Debug, Clone)]
pub struct LeafInput {
    /// Estimate in hours, > 0.
    pub estimate: f64,
    pub start_time: u64,
    pub ancestors: BTreeSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct CandidateInput {
    /// actual tracked time / estimated time, dimensionless.
    pub ratio: f64,
    pub start_time: u64,
    pub ancestors: BTreeSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ForecastInputs {
    pub leaves: Vec<LeafInput>,
    pub candidates: Vec<CandidateInput>,
    pub trials: usize,
    pub half_life_ms: f64,
}

pub fn forecast<R: Rng + ?Sized>(inputs: &ForecastInputs, rng: &mut R) -> Forecast {
    let leaf_sum: f64 = inputs.leaves.iter().map(|leaf| leaf.estimate).sum();

    // No calibration data (or nothing to forecast): every percentile is the
    // plain estimate sum.
    if inputs.leaves.is_empty() || inputs.candidates.is_empty() || inputs.trials == 0 {
        return Forecast {
            leaf_estimate_sum: leaf_sum,
            percentiles: [leaf_sum; 7],
        };
    }

    let trials = inputs.trials;
    let mut totals = vec![0.0f64; trials];
    let mut log_weights = vec![0.0f64; inputs.candidates.len()];

    for leaf in &inputs.leaves {
        for (slot, candidate) in log_weights.iter_mut().zip(&inputs.candidates) {
            let dt = leaf.start_time.abs_diff(candidate.start_time) as f64;
            let shared = leaf
                .ancestors
                .intersection(&candidate.ancestors)
                .count() as f64;
            *slot = -LN2 * dt / inputs.half_life_ms + (LN2 / 2.0) * shared;
        }
        // Shift by the max before exponentiating so extreme spans cannot
        // underflow every weight at once.
        let max = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max).exp()).collect();

        let Some(table) = AliasTable::new(&weights) else {
            // All-zero weights after underflow; fall back to the estimate.
            for total in &mut totals {
                *total += leaf.estimate;
            }
            continue;
        };
        for total in totals.iter_mut() {
            let pick = table.sample(rng);
            *total += leaf.estimate * inputs.candidates[pick].ratio;
        }
    }

    totals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    // Rounded-index selection, matching the estimates users have seen
    // historically: [0, n/10, n/3, n/2, 2n/3, 9n/10, n-1].
    let n = trials;
    let index = |numerator: f64, denominator: f64| -> usize {
        let i = (n as f64 * numerator / denominator).round() as usize;
        i.min(n - 1)
    };
    let percentiles = [
        totals[0],
        totals[index(1.0, 10.0)],
        totals[index(1.0, 3.0)],
        totals[index(1.0, 2.0)],
        totals[index(2.0, 3.0)],
        totals[index(9.0, 10.0)],
        totals[n - 1],
    ];

    Forecast {
        leaf_estimate_sum: leaf_sum,
        percentiles,
    }
}
