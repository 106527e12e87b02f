// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Single-bucket hill climbing.
//!
//! Hands out the balance one bucket at a time to the partition whose next
//! curve segment is steepest in the useful direction. Unlike the allocators
//! in [`crate::lookahead`], this never looks past the next segment, but it
//! always hands out the whole balance: when no partition gains anything the
//! bucket goes to partition 0. It is what clusters use to split the cache on
//! their weighted speedup curves.

use crate::curve::MissCurve;
use crate::curve::Trend;
use crate::lookahead::check_partition_args;
use crate::lookahead::min_alloc;
use anyhow::Result;
use log::trace;

fn segment_slopes(curve: &MissCurve, trend: Trend) -> Vec<f64> {
    let (xs, ys) = (curve.xs(), curve.ys());
    let mut slopes = vec![0.0];
    for i in 0..xs.len().saturating_sub(1) {
        let dx = xs[i + 1] as f64 - xs[i] as f64;
        let dy = match trend {
            Trend::NonIncreasing => ys[i] - ys[i + 1],
            Trend::NonDecreasing => ys[i + 1] - ys[i],
        };
        slopes.push(match dx > 0.0 {
            true => dy / dx,
            false => 0.0,
        });
    }
    slopes
}

/// Index of the first segment that ends past `alloc`.
fn next_segment(curve: &MissCurve, alloc: u32) -> usize {
    curve.xs().iter().take_while(|&&x| alloc >= x).count()
}

/// Split `balance` across `curves`, climbing in the direction of `trend`:
/// [`Trend::NonIncreasing`] for miss curves, [`Trend::NonDecreasing`] for
/// IPC and weighted speedup curves. The allocations always sum to
/// `balance`; ties go to the lowest partition index.
pub fn hill_climb(
    balance: u32,
    min_allocs: &[u32],
    curves: &[&MissCurve],
    trend: Trend,
) -> Result<Vec<u32>> {
    check_partition_args(balance, min_allocs, curves)?;

    let slopes: Vec<Vec<f64>> = curves.iter().map(|c| segment_slopes(c, trend)).collect();
    let mut allocs: Vec<u32> = (0..curves.len()).map(|p| min_alloc(min_allocs, p)).collect();
    let mut indices: Vec<usize> = curves
        .iter()
        .zip(&allocs)
        .map(|(c, &a)| next_segment(c, a))
        .collect();
    let mut balance = balance - allocs.iter().sum::<u32>();

    while balance > 0 {
        let mut best_utility = 0.0;
        let mut best_part = 0;
        for p in 0..curves.len() {
            // Past the end of a curve there is nothing left to gain.
            let utility = slopes[p].get(indices[p]).copied().unwrap_or(0.0);
            if utility > best_utility {
                best_part = p;
                best_utility = utility;
            }
        }

        allocs[best_part] += 1;
        balance -= 1;
        indices[best_part] = next_segment(curves[best_part], allocs[best_part]);
        trace!(
            "Hill climb: bucket -> {} (utility {:.4}), balance {}",
            best_part,
            best_utility,
            balance
        );
    }

    Ok(allocs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_curves() {
        let a = MissCurve::new(vec![100.0, 60.0, 40.0, 30.0, 25.0]);
        let b = MissCurve::new(vec![100.0, 90.0, 50.0, 45.0, 44.0]);
        // Gains a: 40, 20, 10, 5; b: 10, 40, 5, 1. Hill climbing only sees
        // b's first segment until a flattens out.
        let allocs = hill_climb(4, &[], &[&a, &b], Trend::NonIncreasing).unwrap();
        assert_eq!(allocs, vec![3, 1]);

        // From (1, 1): b gains 40, then a 20.
        let allocs = hill_climb(4, &[1], &[&a, &b], Trend::NonIncreasing).unwrap();
        assert_eq!(allocs, vec![2, 2]);
    }

    #[test]
    fn test_weighted_speedup_curves() {
        let a = MissCurve::new(vec![0.0, 1.0, 1.5, 1.75, 1.8]);
        let b = MissCurve::new(vec![0.0, 1.0, 1.9, 2.0, 2.05]);
        // b gains 0.9, then a 0.5 beats b 0.1.
        let allocs = hill_climb(4, &[1], &[&a, &b], Trend::NonDecreasing).unwrap();
        assert_eq!(allocs, vec![2, 2]);

        let allocs = hill_climb(5, &[1], &[&a, &b], Trend::NonDecreasing).unwrap();
        assert_eq!(allocs, vec![3, 2]);
    }

    #[test]
    fn test_conserves_balance_without_utility() {
        let flat = MissCurve::new(vec![3.0; 5]);
        let allocs = hill_climb(6, &[1], &[&flat, &flat, &flat], Trend::NonDecreasing).unwrap();
        assert_eq!(allocs, vec![4, 1, 1]);
        assert_eq!(allocs.iter().sum::<u32>(), 6);
    }

    #[test]
    fn test_ties_go_to_lowest_partition() {
        let c = MissCurve::new(vec![0.0, 1.0, 2.0, 3.0]);
        // Equal slopes keep going to partition 0 until its curve ends.
        let allocs = hill_climb(4, &[], &[&c, &c], Trend::NonDecreasing).unwrap();
        assert_eq!(allocs, vec![3, 1]);
    }

    #[test]
    fn test_invalid_arguments() {
        let c = MissCurve::new(vec![0.0, 1.0, 2.0]);
        assert!(hill_climb(1, &[1, 1], &[&c, &c], Trend::NonDecreasing).is_err());
        assert!(hill_climb(1, &[], &[], Trend::NonDecreasing).is_err());
    }
}
