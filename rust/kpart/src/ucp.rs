// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utility-based cache partitioning (UCP) without clustering. Every
//! application gets a partition of its own, sized by repeatedly handing the
//! next chunk of ways to whoever gains the most per way from it. Useful as a
//! baseline to compare clustered plans against.

use crate::config::KpartConfig;
use crate::curve::MissCurve;
use crate::plan::plan_from_allocations;
use crate::plan::PartitionPlan;
use anyhow::bail;
use anyhow::Result;
use log::debug;

/// Grow every application's allocation from one way, always picking the
/// application and chunk size with the highest per-way utility. Ties go to
/// the lowest application index, then to the smallest chunk.
fn ucp_allocations<F>(curves: &[MissCurve], cfg: &KpartConfig, utility: F) -> Result<Vec<u32>>
where
    F: Fn(&MissCurve, usize, usize) -> Result<f64>,
{
    if curves.is_empty() {
        bail!("No applications to partition for");
    }
    if curves.len() > cfg.cache_ways as usize {
        bail!(
            "{} applications cannot each get a way of a {}-way cache",
            curves.len(),
            cfg.cache_ways
        );
    }
    for (app, curve) in curves.iter().enumerate() {
        if curve.domain() != cfg.cache_ways as usize + 1 {
            bail!(
                "Curve of application {} has domain {}, expected {}",
                app,
                curve.domain(),
                cfg.cache_ways + 1
            );
        }
    }

    let mut allocs = vec![1u32; curves.len()];
    let mut remaining = cfg.cache_ways as usize - curves.len();
    while remaining > 0 {
        let mut best: Option<(usize, usize, f64)> = None;
        for (app, curve) in curves.iter().enumerate() {
            let cur = allocs[app] as usize;
            for p in 1..=remaining {
                if cur + p >= curve.domain() {
                    break;
                }
                let mu = utility(curve, cur, p)?;
                if best.map_or(true, |(_, _, best_mu)| mu > best_mu) {
                    best = Some((app, p, mu));
                }
            }
        }

        match best {
            Some((app, p, mu)) => {
                debug!("UCP: {} ways to app {} (utility {:.4})", p, app, mu);
                allocs[app] += p as u32;
                remaining -= p;
            }
            None => break,
        }
    }

    Ok(allocs)
}

fn one_cluster_per_app(allocs: &[u32], cfg: &KpartConfig) -> Result<PartitionPlan> {
    let app_cluster: Vec<usize> = (0..allocs.len()).collect();
    plan_from_allocations(allocs, &app_cluster, cfg)
}

/// UCP on miss curves: utility is the miss reduction per way.
pub fn ucp_mrcs(mrcs: &[MissCurve], cfg: &KpartConfig) -> Result<PartitionPlan> {
    let allocs = ucp_allocations(mrcs, cfg, |curve, cur, p| {
        Ok(-(curve.y(cur + p)? - curve.y(cur)?) / p as f64)
    })?;
    one_cluster_per_app(&allocs, cfg)
}

/// UCP on IPC curves: utility is the speedup per way, relative to the IPC
/// at the baseline allocation.
pub fn ucp_ipcs(ipcs: &[MissCurve], cfg: &KpartConfig) -> Result<PartitionPlan> {
    let baseline = cfg.ipc_baseline_bucket;
    for (app, curve) in ipcs.iter().enumerate() {
        if !(curve.y(baseline)? > 0.0) {
            bail!("Application {} has a non-positive baseline IPC", app);
        }
    }

    let allocs = ucp_allocations(ipcs, cfg, |curve, cur, p| {
        Ok((curve.y(cur + p)? - curve.y(cur)?) / (p as f64 * curve.y(baseline)?))
    })?;
    one_cluster_per_app(&allocs, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> KpartConfig {
        KpartConfig {
            cache_ways: 4,
            erratum_ways: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_ucp_mrcs() {
        let a = MissCurve::new(vec![100.0, 60.0, 40.0, 30.0, 25.0]);
        let b = MissCurve::new(vec![50.0, 45.0, 44.0, 43.0, 42.0]);
        let plan = ucp_mrcs(&[a, b], &small_cfg()).unwrap();
        assert_eq!(plan.cos_ways, vec![vec![0, 1, 2], vec![3]]);
        assert_eq!(plan.app_cluster, vec![0, 1]);
    }

    #[test]
    fn test_ucp_sees_past_cliffs() {
        // One more way buys `a` nothing, two buy it everything.
        let a = MissCurve::new(vec![10.0, 10.0, 10.0, 0.0, 0.0]);
        let b = MissCurve::new(vec![10.0, 9.0, 8.0, 7.0, 6.0]);
        let plan = ucp_mrcs(&[a, b], &small_cfg()).unwrap();
        assert_eq!(plan.cos_ways[0].len(), 3);
        assert_eq!(plan.cos_ways[1].len(), 1);
    }

    #[test]
    fn test_ucp_ipcs() {
        let a = MissCurve::new(vec![0.5, 1.0, 1.5, 1.6, 1.7]);
        let b = MissCurve::new(vec![1.0; 5]);
        let plan = ucp_ipcs(&[a.clone(), b], &small_cfg()).unwrap();
        assert_eq!(plan.cos_ways, vec![vec![0, 1, 2], vec![3]]);

        let zero = MissCurve::new(vec![0.0; 5]);
        assert!(ucp_ipcs(&[a, zero], &small_cfg()).is_err());
    }

    #[test]
    fn test_ucp_applies_erratum_fix() {
        // `a` wants every way it can get, leaving way 11 alone for `b`.
        let a = MissCurve::new((0..13).map(|i| 100.0 - 8.0 * i as f64).collect());
        let b = MissCurve::new(vec![5.0; 13]);
        let plan = ucp_mrcs(&[a, b], &KpartConfig::default()).unwrap();
        assert_eq!(plan.cos_ways[0].len(), 11);
        assert!(plan.cos_ways[0].contains(&10));
        assert!(plan.cos_ways[0].contains(&11));
        assert_eq!(plan.cos_ways[1], vec![9]);
    }

    #[test]
    fn test_ucp_invalid() {
        let c = small_cfg();
        assert!(ucp_mrcs(&[], &c).is_err());
        let flat = MissCurve::new(vec![1.0; 5]);
        assert!(ucp_mrcs(&vec![flat.clone(); 5], &c).is_err());
        assert!(ucp_mrcs(&[MissCurve::new(vec![1.0; 3])], &c).is_err());
    }
}
