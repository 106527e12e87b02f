// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Partition plans
//!
//! Turns a clustering into concrete way assignments:
//!
//! 1. For every cluster and every partition size, predict the cluster's
//!    weighted speedup: the sum over member applications of their IPC at
//!    the ways they effectively occupy (from the clustering provenance),
//!    relative to their IPC at a fixed baseline allocation.
//!
//! 2. Split the cache across clusters by hill climbing on those curves. The
//!    summed prediction is also what ranks the candidate cluster counts.
//!
//! 3. Hand out physical ways from a pool, lowest ways first, in cluster
//!    order. Each cluster's ways form a stack whose top is the way handed
//!    out last.
//!
//! 4. Some Intel parts misbehave when ways 10 and 11 sit in different
//!    classes of service, so the stacks are patched up to keep the pair
//!    together (the pair is configurable).
//!
//! 5. Every application gets its cluster's ways. Application `i` runs on
//!    core `i` and uses class of service `i`.

use crate::config::KpartConfig;
use crate::curve::MissCurve;
use crate::curve::Trend;
use crate::hcluster::ClusterResult;
use crate::hill_climb::hill_climb;
use crate::waymask::WayMask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// Weighted speedup curve of every cluster of `result`.
pub fn ws_curves(
    result: &ClusterResult,
    ipc_curves: &[MissCurve],
    baseline: usize,
) -> Result<Vec<MissCurve>> {
    let mut curves = Vec::with_capacity(result.cluster_buckets.len());
    for (cluster, positions) in result.cluster_buckets.iter().enumerate() {
        let mut ws = Vec::with_capacity(positions.len());
        for sources in positions.iter() {
            let mut total = 0.0;
            for src in sources.iter() {
                let ipc = match ipc_curves.get(src.app) {
                    Some(ipc) => ipc,
                    None => bail!(
                        "Cluster {} refers to application {} without an IPC curve",
                        cluster,
                        src.app
                    ),
                };
                let base = ipc.y(baseline)?;
                if !(base > 0.0) {
                    bail!(
                        "Application {} has a non-positive baseline IPC ({})",
                        src.app,
                        base
                    );
                }
                total += ipc.y(src.ways as usize)? / base;
            }
            ws.push(total);
        }
        curves.push(MissCurve::new(ws));
    }
    Ok(curves)
}

/// Sum of every cluster's weighted speedup at its allocation.
pub fn predicted_ws(ws_curves: &[MissCurve], allocations: &[u32]) -> Result<f64> {
    if ws_curves.len() != allocations.len() {
        bail!(
            "{} allocations for {} clusters",
            allocations.len(),
            ws_curves.len()
        );
    }
    let mut total = 0.0;
    for (curve, &alloc) in ws_curves.iter().zip(allocations) {
        total += curve.y(alloc as usize)?;
    }
    Ok(total)
}

/// How the cache would be split for one candidate cluster count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KEvaluation {
    pub k: usize,
    pub allocations: Vec<u32>,
    pub predicted_ws: f64,
}

pub fn evaluate(
    result: &ClusterResult,
    ipc_curves: &[MissCurve],
    cfg: &KpartConfig,
) -> Result<KEvaluation> {
    let ws = ws_curves(result, ipc_curves, cfg.ipc_baseline_bucket)?;
    let refs: Vec<&MissCurve> = ws.iter().collect();
    let allocations = hill_climb(cfg.cache_ways, &[cfg.min_alloc], &refs, Trend::NonDecreasing)
        .with_context(|| format!("Failed to split the cache across {} clusters", result.k))?;
    let predicted_ws = predicted_ws(&ws, &allocations)?;

    debug!(
        "K={} allocations={:?} predicted WS={:.3}",
        result.k, allocations, predicted_ws
    );
    Ok(KEvaluation {
        k: result.k,
        allocations,
        predicted_ws,
    })
}

/// Pick the clustering with the highest predicted weighted speedup among
/// those the configuration allows. Returns the index of the winner in
/// `results` along with every evaluation. On a tie the result listed first
/// wins.
pub fn select_k(
    results: &[ClusterResult],
    ipc_curves: &[MissCurve],
    cfg: &KpartConfig,
) -> Result<(usize, Vec<KEvaluation>)> {
    let max_k = cfg.max_k.unwrap_or(usize::MAX);
    let mut best: Option<(usize, f64)> = None;
    let mut evals = vec![];

    for (idx, result) in results.iter().enumerate() {
        if result.k < cfg.min_k
            || result.k > max_k
            || result.k as u64 * cfg.min_alloc as u64 > cfg.cache_ways as u64
        {
            continue;
        }

        let eval = evaluate(result, ipc_curves, cfg)?;
        if best.map_or(true, |(_, ws)| eval.predicted_ws > ws) {
            best = Some((idx, eval.predicted_ws));
        }
        evals.push(eval);
    }

    match best {
        Some((idx, ws)) => {
            info!("Selected K={} (predicted WS {:.3})", results[idx].k, ws);
            Ok((idx, evals))
        }
        None => bail!(
            "No clustering with {}..={} clusters fits {} ways",
            cfg.min_k,
            max_k,
            cfg.cache_ways
        ),
    }
}

/// Hand out ways `0..cache_ways` in cluster order. Cluster stacks hold
/// their ways bottom to top.
pub fn expand_allocations(allocations: &[u32], cache_ways: u32) -> Result<Vec<Vec<u32>>> {
    let mut pool: Vec<u32> = (0..cache_ways).rev().collect();
    let mut parts = Vec::with_capacity(allocations.len());
    for (c, &alloc) in allocations.iter().enumerate() {
        let mut part = Vec::with_capacity(alloc as usize);
        for _ in 0..alloc {
            match pool.pop() {
                Some(way) => part.push(way),
                None => bail!(
                    "Allocations {:?} exceed the {} available ways (cluster {})",
                    allocations,
                    cache_ways,
                    c
                ),
            }
        }
        parts.push(part);
    }
    Ok(parts)
}

/// What [`fix_way_erratum`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErratumFix {
    /// The pair already shares a partition, or is not fully allocated.
    NotNeeded,
    /// `way` joined `partition`, which gave up `displaced` in exchange.
    Moved {
        way: u32,
        partition: usize,
        displaced: u32,
    },
    /// Both ways sat alone in their partitions; `donor` took the pair and
    /// gave its top two ways in exchange.
    Donated { donor: usize },
    /// No partition could donate two ways.
    Unresolved,
}

/// Rebuild `parts[keep]` without the first way other than `kept` counted
/// from the top, which is returned. The remaining ways end up in reverse
/// order, as if popped off one stack and pushed onto another.
fn take_from_top(parts: &mut [Vec<u32>], keep: usize, kept: u32) -> Option<u32> {
    let displaced = parts[keep].iter().rev().copied().find(|&w| w != kept)?;
    let old = std::mem::take(&mut parts[keep]);
    let mut found = false;
    for &way in old.iter().rev() {
        if way == displaced && !found {
            found = true;
        } else {
            parts[keep].push(way);
        }
    }
    Some(displaced)
}

/// Move `way` out of `parts[from]` into `parts[keep]` (which holds
/// `kept`), sending one of `parts[keep]`'s ways the other way.
fn swap_into(parts: &mut [Vec<u32>], keep: usize, kept: u32, from: usize, way: u32) -> ErratumFix {
    let displaced = match take_from_top(parts, keep, kept) {
        Some(displaced) => displaced,
        None => return ErratumFix::Unresolved,
    };
    parts[keep].push(way);

    let old = std::mem::take(&mut parts[from]);
    parts[from].extend(old.iter().rev().filter(|&&w| w != way));
    parts[from].push(displaced);

    ErratumFix::Moved {
        way,
        partition: keep,
        displaced,
    }
}

/// Make sure the two ways of `pair` end up in the same partition. Partition
/// sizes and the overall set of ways are preserved.
pub fn fix_way_erratum(parts: &mut [Vec<u32>], pair: (u32, u32)) -> ErratumFix {
    let (w0, w1) = pair;
    let find = |way: u32| parts.iter().position(|p| p.contains(&way));
    let (p0, p1) = match (find(w0), find(w1)) {
        (Some(p0), Some(p1)) if p0 != p1 => (p0, p1),
        _ => return ErratumFix::NotNeeded,
    };

    if parts[p0].len() > 1 {
        return swap_into(parts, p0, w0, p1, w1);
    }
    if parts[p1].len() > 1 {
        return swap_into(parts, p1, w1, p0, w0);
    }

    let donor = (0..parts.len()).find(|&d| d != p0 && d != p1 && parts[d].len() >= 2);
    let donor = match donor {
        Some(donor) => donor,
        None => {
            warn!(
                "Ways {} and {} stay in different partitions, no partition can swap",
                w0, w1
            );
            return ErratumFix::Unresolved;
        }
    };

    let (swap1, swap2) = match (parts[donor].pop(), parts[donor].pop()) {
        (Some(s1), Some(s2)) => (s1, s2),
        _ => return ErratumFix::Unresolved,
    };
    parts[donor].push(w0);
    parts[donor].push(w1);
    parts[p0].pop();
    parts[p0].push(swap1);
    parts[p1].pop();
    parts[p1].push(swap2);

    ErratumFix::Donated { donor }
}

/// Way assignment of every cluster, application, class of service and
/// core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub cache_ways: u32,
    /// Ways of every cluster, bottom to top.
    pub cluster_ways: Vec<Vec<u32>>,
    /// Cluster of every application.
    pub app_cluster: Vec<usize>,
    /// Ways of every class of service.
    pub cos_ways: Vec<Vec<u32>>,
    /// Class of service of every core.
    pub core_cos: Vec<usize>,
}

impl PartitionPlan {
    /// Build a plan where application `i` runs on core `i` with class of
    /// service `i`, using the ways of its cluster.
    pub fn from_partitions(
        cluster_ways: Vec<Vec<u32>>,
        app_cluster: Vec<usize>,
        cache_ways: u32,
    ) -> Result<PartitionPlan> {
        let mut seen = BTreeSet::new();
        for (c, ways) in cluster_ways.iter().enumerate() {
            for &way in ways {
                if way >= cache_ways {
                    bail!("Cluster {} uses way {} of a {}-way cache", c, way, cache_ways);
                }
                if !seen.insert(way) {
                    bail!("Way {} is assigned to more than one cluster", way);
                }
            }
        }

        let mut cos_ways = Vec::with_capacity(app_cluster.len());
        for (app, &c) in app_cluster.iter().enumerate() {
            match cluster_ways.get(c) {
                Some(ways) => cos_ways.push(ways.clone()),
                None => bail!("Application {} is in unknown cluster {}", app, c),
            }
        }

        Ok(PartitionPlan {
            cache_ways,
            core_cos: (0..app_cluster.len()).collect(),
            cluster_ways,
            app_cluster,
            cos_ways,
        })
    }

    /// Every class of service may use the whole cache.
    pub fn share_all(num_cores: usize, cache_ways: u32) -> PartitionPlan {
        let all: Vec<u32> = (0..cache_ways).collect();
        PartitionPlan {
            cache_ways,
            cluster_ways: vec![all.clone()],
            app_cluster: vec![0; num_cores],
            cos_ways: vec![all; num_cores],
            core_cos: (0..num_cores).collect(),
        }
    }

    pub fn num_clusters(&self) -> usize {
        self.cluster_ways.len()
    }

    pub fn cos_mask(&self, cos: usize) -> Result<WayMask> {
        match self.cos_ways.get(cos) {
            Some(ways) => WayMask::from_ways(ways, self.cache_ways as usize),
            None => bail!("Plan has no class of service {}", cos),
        }
    }

    /// Ways of `cos` from the top of its stack down, comma separated.
    pub fn ways_string(&self, cos: usize) -> String {
        match self.cos_ways.get(cos) {
            Some(ways) => ways
                .iter()
                .rev()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join(","),
            None => String::new(),
        }
    }
}

/// Expand per-cluster allocations into a plan for applications grouped by
/// `app_cluster`.
pub fn plan_from_allocations(
    allocations: &[u32],
    app_cluster: &[usize],
    cfg: &KpartConfig,
) -> Result<PartitionPlan> {
    if app_cluster.len() > cfg.num_cores {
        bail!(
            "{} applications do not fit on {} cores",
            app_cluster.len(),
            cfg.num_cores
        );
    }

    let mut parts = expand_allocations(allocations, cfg.cache_ways)?;
    if let Some(pair) = cfg.erratum_ways {
        let fix = fix_way_erratum(&mut parts, pair);
        if fix != ErratumFix::NotNeeded {
            info!("Way erratum: {:?}", fix);
        }
    }

    PartitionPlan::from_partitions(parts, app_cluster.to_vec(), cfg.cache_ways)
}

/// Plan for the clustering in `result`.
pub fn synthesize_plan(
    result: &ClusterResult,
    ipc_curves: &[MissCurve],
    cfg: &KpartConfig,
) -> Result<PartitionPlan> {
    let eval = evaluate(result, ipc_curves, cfg)?;
    plan_from_allocations(&eval.allocations, &result.item_to_cluster, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcluster::cluster;

    #[test]
    fn test_expand_allocations() {
        let parts = expand_allocations(&[3, 2, 1], 6).unwrap();
        assert_eq!(parts, vec![vec![0, 1, 2], vec![3, 4], vec![5]]);

        let parts = expand_allocations(&[2], 6).unwrap();
        assert_eq!(parts, vec![vec![0, 1]]);

        assert!(expand_allocations(&[4, 3], 6).is_err());
    }

    #[test]
    fn test_erratum_larger_partition_keeps_pair() {
        let mut parts = expand_allocations(&[11, 1], 12).unwrap();
        let fix = fix_way_erratum(&mut parts, (10, 11));
        assert_eq!(
            fix,
            ErratumFix::Moved {
                way: 11,
                partition: 0,
                displaced: 9
            }
        );
        assert_eq!(parts[0], vec![10, 8, 7, 6, 5, 4, 3, 2, 1, 0, 11]);
        assert_eq!(parts[1], vec![9]);

        // Applying the fix again changes nothing.
        let before = parts.clone();
        assert_eq!(fix_way_erratum(&mut parts, (10, 11)), ErratumFix::NotNeeded);
        assert_eq!(parts, before);
    }

    #[test]
    fn test_erratum_split_pair() {
        // Way 10 closes cluster 0, way 11 opens cluster 1.
        let mut parts = vec![vec![7, 8, 9, 10], vec![11, 0, 1]];
        let fix = fix_way_erratum(&mut parts, (10, 11));
        assert_eq!(
            fix,
            ErratumFix::Moved {
                way: 11,
                partition: 0,
                displaced: 9
            }
        );
        assert_eq!(parts[0], vec![10, 8, 7, 11]);
        assert_eq!(parts[1], vec![1, 0, 9]);
    }

    #[test]
    fn test_erratum_symmetric_case() {
        let mut parts = vec![vec![10], vec![3, 11]];
        let fix = fix_way_erratum(&mut parts, (10, 11));
        assert_eq!(
            fix,
            ErratumFix::Moved {
                way: 10,
                partition: 1,
                displaced: 3
            }
        );
        assert_eq!(parts, vec![vec![3], vec![11, 10]]);
    }

    #[test]
    fn test_erratum_donor() {
        let mut parts = expand_allocations(&[10, 1, 1], 12).unwrap();
        let fix = fix_way_erratum(&mut parts, (10, 11));
        assert_eq!(fix, ErratumFix::Donated { donor: 0 });
        assert_eq!(parts[0], vec![0, 1, 2, 3, 4, 5, 6, 7, 10, 11]);
        assert_eq!(parts[1], vec![9]);
        assert_eq!(parts[2], vec![8]);
        assert_eq!(fix_way_erratum(&mut parts, (10, 11)), ErratumFix::NotNeeded);
    }

    #[test]
    fn test_erratum_unresolved_and_not_needed() {
        let mut parts = vec![vec![0], vec![10], vec![11]];
        assert_eq!(fix_way_erratum(&mut parts, (10, 11)), ErratumFix::Unresolved);
        assert_eq!(parts, vec![vec![0], vec![10], vec![11]]);

        // Way 11 is not allocated at all.
        let mut parts = expand_allocations(&[3, 8], 12).unwrap();
        let before = parts.clone();
        assert_eq!(fix_way_erratum(&mut parts, (10, 11)), ErratumFix::NotNeeded);
        assert_eq!(parts, before);
    }

    #[test]
    fn test_erratum_preserves_ways() {
        for allocs in [[1u32, 10, 1], [9, 2, 1], [10, 1, 1], [5, 6, 1]] {
            let mut parts = expand_allocations(&allocs, 12).unwrap();
            fix_way_erratum(&mut parts, (10, 11));
            let sizes: Vec<u32> = parts.iter().map(|p| p.len() as u32).collect();
            assert_eq!(sizes, allocs.to_vec());
            let mut all: Vec<u32> = parts.iter().flatten().copied().collect();
            all.sort();
            assert_eq!(all, (0..12).collect::<Vec<u32>>());
            let holder = |w: u32| parts.iter().position(|p| p.contains(&w));
            assert_eq!(holder(10), holder(11));
        }
    }

    #[test]
    fn test_ws_curves() {
        let mrcs = vec![
            vec![MissCurve::new(vec![30.0, 20.0, 15.0, 12.0, 11.0])],
            vec![MissCurve::new(vec![10.0, 9.0, 8.5, 8.0, 7.5])],
        ];
        let ipcs = vec![
            MissCurve::new(vec![0.5, 0.8, 1.0, 1.1, 1.2]),
            MissCurve::new(vec![1.0, 1.5, 2.0, 2.0, 2.0]),
        ];
        let result = cluster(&mrcs, 2).unwrap();
        let ws = ws_curves(&result, &ipcs, 2).unwrap();
        // Singleton clusters come out newest first: app 1, then app 0.
        assert_eq!(result.item_to_cluster, vec![1, 0]);
        assert_eq!(ws[0].ys(), &[0.5, 0.75, 1.0, 1.0, 1.0]);
        assert_eq!(ws[1].ys(), &[0.5, 0.8, 1.0, 1.1, 1.2]);

        let cfg = KpartConfig {
            cache_ways: 4,
            erratum_ways: None,
            ..Default::default()
        };
        let eval = evaluate(&result, &ipcs, &cfg).unwrap();
        assert_eq!(eval.allocations.iter().sum::<u32>(), 4);
        let expect = predicted_ws(&ws, &eval.allocations).unwrap();
        assert!((eval.predicted_ws - expect).abs() < 1e-12);

        let bad = vec![MissCurve::new(vec![1.0, 1.0, 0.0, 1.0, 1.0]); 2];
        assert!(ws_curves(&result, &bad, 2).is_err());
        assert!(ws_curves(&result, &ipcs[..1], 2).is_err());
    }

    #[test]
    fn test_plan_from_allocations() {
        let cfg = KpartConfig::default();
        let plan = plan_from_allocations(&[9, 3], &[0, 1, 0], &cfg).unwrap();
        assert_eq!(plan.num_clusters(), 2);
        assert_eq!(plan.cos_ways[0], plan.cos_ways[2]);
        assert_eq!(plan.cos_ways[1], vec![9, 10, 11]);
        assert_eq!(plan.core_cos, vec![0, 1, 2]);
        assert_eq!(plan.ways_string(1), "11,10,9");
        assert_eq!(plan.cos_mask(1).unwrap().as_cbm(), 0xe00);
        assert!(plan.cos_mask(3).is_err());

        let too_many = vec![0; 9];
        assert!(plan_from_allocations(&[12], &too_many, &cfg).is_err());
        assert!(plan_from_allocations(&[9, 3], &[0, 2], &cfg).is_err());
    }

    #[test]
    fn test_from_partitions_rejects_overlap() {
        assert!(PartitionPlan::from_partitions(vec![vec![0, 1], vec![1, 2]], vec![0, 1], 12).is_err());
        assert!(PartitionPlan::from_partitions(vec![vec![12]], vec![0], 12).is_err());
    }

    #[test]
    fn test_share_all() {
        let plan = PartitionPlan::share_all(4, 12);
        assert_eq!(plan.cos_ways.len(), 4);
        assert_eq!(plan.core_cos, vec![0, 1, 2, 3]);
        for cos in 0..4 {
            assert_eq!(plan.cos_mask(cos).unwrap().as_cbm(), 0xfff);
        }
    }
}
