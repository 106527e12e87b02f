// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Partitioning rounds
//!
//! One round takes the current curve estimates of every co-running
//! application and produces a plan: smooth the curves, cluster the
//! applications for every possible K, pick the K with the best predicted
//! weighted speedup, and lay out the ways. [`Kpart`] keeps the plan in
//! force across rounds; a round that fails leaves it untouched.

use crate::config::KpartConfig;
use crate::curve::MissCurve;
use crate::curve::Trend;
use crate::hcluster::cluster;
use crate::hcluster::cluster_auto;
use crate::hcluster::ClusterResult;
use crate::plan::evaluate;
use crate::plan::plan_from_allocations;
use crate::plan::select_k;
use crate::plan::KEvaluation;
use crate::plan::PartitionPlan;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

/// Everything a round decided.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub k: usize,
    /// Predictions for every candidate K that was considered.
    pub evaluations: Vec<KEvaluation>,
    pub clustering: ClusterResult,
    pub plan: PartitionPlan,
}

impl RoundReport {
    pub fn predicted_ws(&self) -> Option<f64> {
        self.evaluations
            .iter()
            .find(|e| e.k == self.k)
            .map(|e| e.predicted_ws)
    }
}

#[derive(Debug)]
pub struct Kpart {
    cfg: KpartConfig,
    plan: Option<PartitionPlan>,
    rounds: u64,
    failed_rounds: u64,
}

impl Kpart {
    pub fn new(cfg: KpartConfig) -> Result<Kpart> {
        cfg.validate()?;
        Ok(Kpart {
            cfg,
            plan: None,
            rounds: 0,
            failed_rounds: 0,
        })
    }

    pub fn config(&self) -> &KpartConfig {
        &self.cfg
    }

    /// The plan currently in force, if any round has succeeded yet.
    pub fn plan(&self) -> Option<&PartitionPlan> {
        self.plan.as_ref()
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn failed_rounds(&self) -> u64 {
        self.failed_rounds
    }

    fn check_curves(&self, mrcs: &[Vec<MissCurve>], ipcs: &[MissCurve]) -> Result<()> {
        if mrcs.is_empty() {
            bail!("No applications to partition for");
        }
        if mrcs.len() != ipcs.len() {
            bail!(
                "{} applications with MRCs but {} with IPC curves",
                mrcs.len(),
                ipcs.len()
            );
        }
        if mrcs.len() > self.cfg.num_cores {
            bail!(
                "{} applications do not fit on {} cores",
                mrcs.len(),
                self.cfg.num_cores
            );
        }

        let domain = self.cfg.cache_ways as usize + 1;
        for (app, (app_mrcs, ipc)) in mrcs.iter().zip(ipcs).enumerate() {
            if let Some(bad) = app_mrcs.iter().find(|c| c.domain() != domain) {
                bail!(
                    "MRC of application {} has domain {}, expected {}",
                    app,
                    bad.domain(),
                    domain
                );
            }
            if ipc.domain() != domain {
                bail!(
                    "IPC curve of application {} has domain {}, expected {}",
                    app,
                    ipc.domain(),
                    domain
                );
            }
        }
        Ok(())
    }

    /// Compute a plan for applications with MRCs `mrcs` (one per interval)
    /// and IPC curves `ipcs`. Does not touch the plan in force.
    pub fn partition_round(
        &self,
        mrcs: &[Vec<MissCurve>],
        ipcs: &[MissCurve],
    ) -> Result<RoundReport> {
        self.check_curves(mrcs, ipcs)?;

        let mrcs: Vec<Vec<MissCurve>> = mrcs
            .iter()
            .map(|app| app.iter().map(|c| c.smoothen(Trend::NonIncreasing)).collect())
            .collect();
        let ipcs: Vec<MissCurve> = ipcs
            .iter()
            .map(|c| c.smoothen(Trend::NonDecreasing))
            .collect();

        let (clustering, evaluations) = match self.cfg.fixed_k {
            Some(k) => {
                let k = k.min(mrcs.len());
                debug!("Clustering into a fixed {} clusters", k);
                let clustering = cluster(&mrcs, k)?;
                let eval = evaluate(&clustering, &ipcs, &self.cfg)?;
                (clustering, vec![eval])
            }
            None => {
                let mut results = cluster_auto(&mrcs)?;
                let (best, evaluations) = select_k(&results, &ipcs, &self.cfg)?;
                (results.swap_remove(best), evaluations)
            }
        };

        let eval = match evaluations.iter().find(|e| e.k == clustering.k) {
            Some(eval) => eval,
            None => bail!("No evaluation for K={}", clustering.k),
        };
        let plan = plan_from_allocations(&eval.allocations, &clustering.item_to_cluster, &self.cfg)
            .with_context(|| format!("Failed to lay out ways for K={}", clustering.k))?;

        info!(
            "K={} clusters={:?} allocations={:?} predicted WS={:.3}",
            clustering.k, clustering.item_to_cluster, eval.allocations, eval.predicted_ws
        );
        Ok(RoundReport {
            k: clustering.k,
            evaluations,
            clustering,
            plan,
        })
    }

    /// Make the outcome of a round the plan in force, unless the round
    /// failed. Returns the plan in force afterwards.
    pub fn commit(&mut self, plan: Result<PartitionPlan>) -> Option<&PartitionPlan> {
        self.rounds += 1;
        match plan {
            Ok(plan) => self.plan = Some(plan),
            Err(e) => {
                self.failed_rounds += 1;
                match self.plan {
                    Some(_) => warn!("Round failed, keeping the previous plan: {:#}", e),
                    None => warn!("Round failed, no plan in force: {:#}", e),
                }
            }
        }
        self.plan.as_ref()
    }

    /// [`Kpart::partition_round`] followed by [`Kpart::commit`].
    pub fn run_round(
        &mut self,
        mrcs: &[Vec<MissCurve>],
        ipcs: &[MissCurve],
    ) -> Option<&PartitionPlan> {
        let plan = self.partition_round(mrcs, ipcs).map(|report| report.plan);
        self.commit(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> KpartConfig {
        KpartConfig {
            num_cores: 4,
            cache_ways: 6,
            erratum_ways: None,
            ..Default::default()
        }
    }

    fn friendly() -> MissCurve {
        MissCurve::new(vec![64.0, 32.0, 16.0, 8.0, 4.0, 2.0, 1.0])
    }

    fn ipc() -> MissCurve {
        MissCurve::new(vec![0.5, 0.8, 1.0, 1.1, 1.15, 1.2, 1.2])
    }

    #[test]
    fn test_run_round_keeps_previous_plan() {
        let mut kpart = Kpart::new(cfg()).unwrap();
        let mrcs = vec![vec![friendly()], vec![friendly()]];
        let ipcs = vec![ipc(), ipc()];

        // Nothing in force yet and the round fails.
        assert!(kpart.run_round(&mrcs, &ipcs[..1]).is_none());

        let plan = kpart.run_round(&mrcs, &ipcs).unwrap().clone();
        assert_eq!(plan.cos_ways.len(), 2);

        // A bad round leaves the plan alone.
        let short = vec![vec![MissCurve::new(vec![1.0, 0.5])], vec![friendly()]];
        assert_eq!(kpart.run_round(&short, &ipcs), Some(&plan));
        assert_eq!(kpart.rounds(), 3);
        assert_eq!(kpart.failed_rounds(), 2);
    }

    #[test]
    fn test_fixed_k() {
        let mut c = cfg();
        c.fixed_k = Some(1);
        let kpart = Kpart::new(c).unwrap();
        let mrcs = vec![vec![friendly()], vec![friendly()], vec![friendly()]];
        let report = kpart.partition_round(&mrcs, &vec![ipc(); 3]).unwrap();
        assert_eq!(report.k, 1);
        assert_eq!(report.evaluations.len(), 1);
        assert_eq!(report.plan.cluster_ways, vec![vec![0, 1, 2, 3, 4, 5]]);
        assert_eq!(report.plan.cos_ways.len(), 3);

        // More clusters than applications is clamped.
        let mut c = cfg();
        c.fixed_k = Some(4);
        let kpart = Kpart::new(c).unwrap();
        let report = kpart.partition_round(&mrcs[..2], &vec![ipc(); 2]).unwrap();
        assert_eq!(report.k, 2);
    }

    #[test]
    fn test_auto_k_report() {
        let kpart = Kpart::new(cfg()).unwrap();
        let mrcs = vec![vec![friendly()], vec![friendly()], vec![friendly()]];
        let report = kpart.partition_round(&mrcs, &vec![ipc(); 3]).unwrap();
        let ks: Vec<usize> = report.evaluations.iter().map(|e| e.k).collect();
        assert_eq!(ks, vec![3, 2, 1]);
        let best = report.predicted_ws().unwrap();
        for e in report.evaluations.iter() {
            assert!(e.predicted_ws <= best);
        }
        let used: usize = report.plan.cluster_ways.iter().map(|w| w.len()).sum();
        assert_eq!(used, 6);
    }

    #[test]
    fn test_invalid_rounds() {
        let kpart = Kpart::new(cfg()).unwrap();
        assert!(kpart.partition_round(&[], &[]).is_err());
        let five = vec![vec![friendly()]; 5];
        assert!(kpart.partition_round(&five, &vec![ipc(); 5]).is_err());
        let bad_ipc = MissCurve::new(vec![1.0; 3]);
        assert!(kpart.partition_round(&[vec![friendly()]], &[bad_ipc]).is_err());
        assert!(Kpart::new(KpartConfig {
            cache_ways: 0,
            ..Default::default()
        })
        .is_err());
    }
}
