// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Predicting shared-partition miss curves
//!
//! When two applications share a partition of `s` ways, how many ways does
//! each effectively end up with? Measuring that for every pair is far too
//! expensive, so it is predicted from the two private miss curves.
//!
//! The combined curve assumes each application claims capacity in
//! proportion to its current miss rate: every extra way is split between
//! the two fractional "virtual way" counters by the ratio of their miss
//! values at the current position. The system curve instead is the best the
//! two applications could do with a hard split of the same budget, found
//! with the allocator. The area between the two curves measures how much
//! sharing costs, and is what clustering uses as the distance between two
//! applications (or groups of applications).

use crate::curve::MissCurve;
use crate::lookahead::partition;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

/// Floor for miss values so that two zero curves still split evenly.
const MIN_MISSES: f64 = 1e-10;

/// A combined curve along with, for every point `s`, the positions on the
/// two input curves it was read from. The two positions add up to `s`.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedCurve {
    pub curve: MissCurve,
    pub buckets: Vec<(u32, u32)>,
}

fn check_pair(a: &MissCurve, b: &MissCurve) -> Result<usize> {
    if a.domain() != b.domain() {
        bail!(
            "Cannot combine curves with different domains ({} vs {})",
            a.domain(),
            b.domain()
        );
    }
    if a.is_empty() {
        bail!("Cannot combine empty curves");
    }
    Ok(a.domain())
}

/// Miss curve of `a` and `b` sharing a partition.
pub fn combined_miss_curve(a: &MissCurve, b: &MissCurve) -> Result<MissCurve> {
    Ok(combined_miss_curve_detailed(a, b)?.curve)
}

/// Like [`combined_miss_curve`], keeping where each point came from.
pub fn combined_miss_curve_detailed(a: &MissCurve, b: &MissCurve) -> Result<CombinedCurve> {
    let domain = check_pair(a, b)?;

    let mut yvals = Vec::with_capacity(domain);
    let mut buckets = Vec::with_capacity(domain);
    yvals.push(a.ys()[0] + b.ys()[0]);
    buckets.push((0, 0));

    let (mut ia, mut ib) = (0.0f64, 0.0f64);
    for s in 1..domain {
        let mut va = a.y_interp(ia)?;
        let mut vb = b.y_interp(ib)?;
        if va + vb == 0.0 {
            va = MIN_MISSES;
            vb = MIN_MISSES;
        }
        ia += va / (va + vb);
        ib += vb / (va + vb);

        yvals.push(a.y_interp(ia)? + b.y_interp(ib)?);
        let ra = (ia.round() as u32).min(s as u32);
        buckets.push((ra, s as u32 - ra));
    }

    Ok(CombinedCurve {
        curve: MissCurve::new(yvals),
        buckets,
    })
}

/// Miss curve of the best hard split of every budget between `a` and `b`.
pub fn system_miss_curve(a: &MissCurve, b: &MissCurve) -> Result<MissCurve> {
    let domain = check_pair(a, b)?;

    let mut yvals = Vec::with_capacity(domain);
    yvals.push(a.ys()[0] + b.ys()[0]);
    for budget in 1..domain {
        let allocs = partition(budget as u32, &[0, 0], &[a, b], false)
            .with_context(|| format!("Failed to split budget {}", budget))?;
        yvals.push(a.y(allocs[0] as usize)? + b.y(allocs[1] as usize)?);
    }

    Ok(MissCurve::new(yvals))
}

/// Cost of sharing: the area between the combined and system curves,
/// averaged over time intervals. `p[i]` and `q[i]` are the curves of the
/// two sides during interval `i`.
pub fn miss_curve_area_distance(p: &[MissCurve], q: &[MissCurve]) -> Result<f64> {
    if p.is_empty() {
        bail!("No intervals to compare");
    }
    if p.len() != q.len() {
        bail!(
            "Interval counts differ ({} vs {})",
            p.len(),
            q.len()
        );
    }

    let mut total = 0.0;
    for (a, b) in p.iter().zip(q) {
        let combined = combined_miss_curve(a, b)?;
        let system = system_miss_curve(a, b)?;
        total += combined
            .ys()
            .iter()
            .zip(system.ys())
            .map(|(c, s)| (c - s).abs())
            .sum::<f64>();
    }

    Ok(total / p.len() as f64)
}
