// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Hierarchical clustering of applications
//!
//! Applications are grouped bottom-up: every application starts as its own
//! cluster and the two clusters that would lose the least by sharing a
//! partition (see [`crate::whirlpool::miss_curve_area_distance`]) are merged
//! until the requested number of clusters remains.
//!
//! The merge tree lives in an index arena. Nodes `0..n` are the
//! applications; the node created by the `i`th merge has ID `n + i` and
//! holds the combined curves of its children plus, for every way count of
//! the combined curve, how many ways each child got. Walking those down to
//! the leaves tells, for each cluster and each cluster size, how many ways
//! every member application effectively occupies, which is what the plan
//! synthesizer needs to predict per-application IPC inside a shared
//! partition.
//!
//! Each application is described by one curve per profiling interval. All
//! curves must share the same domain.

use crate::curve::MissCurve;
use crate::whirlpool::combined_miss_curve_detailed;
use crate::whirlpool::miss_curve_area_distance;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::collections::HashMap;

/// `app` occupies `ways` ways of its cluster's partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSource {
    pub app: usize,
    pub ways: u32,
}

/// One merge of the dendrogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Linkage {
    pub child1: usize,
    pub child2: usize,
    pub distance: f64,
    /// Applications under the merged node.
    pub num_items: usize,
}

/// The clustering of all applications into `k` clusters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub k: usize,
    /// Cluster ID of every application.
    pub item_to_cluster: Vec<usize>,
    /// Combined curves of every cluster, one per interval.
    pub cluster_curves: Vec<Vec<MissCurve>>,
    /// `cluster_buckets[c][s]`: how a partition of `s` ways given to
    /// cluster `c` is occupied by its member applications.
    pub cluster_buckets: Vec<Vec<Vec<BucketSource>>>,
}

impl ClusterResult {
    /// Applications in `cluster`, ascending.
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.item_to_cluster
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == cluster)
            .map(|(app, _)| app)
            .collect()
    }
}

#[derive(Clone, Debug)]
struct ClusterNode {
    children: Option<(usize, usize)>,
    curves: Vec<MissCurve>,
    /// Positions on the two children's curves, per combined position.
    buckets: Vec<(u32, u32)>,
    num_items: usize,
}

#[derive(Debug)]
pub struct HCluster {
    nodes: Vec<ClusterNode>,
    active: BTreeSet<usize>,
    distances: HashMap<(usize, usize), f64>,
    linkage: Vec<Linkage>,
    num_items: usize,
    domain: usize,
}

impl HCluster {
    /// Start with every application in its own cluster. `curves[app]` holds
    /// the application's curve for every interval.
    pub fn new(curves: &[Vec<MissCurve>]) -> Result<HCluster> {
        let first = match curves.first() {
            Some(first) => first,
            None => bail!("Cannot cluster an empty set of applications"),
        };
        let intervals = first.len();
        if intervals == 0 {
            bail!("Application 0 has no curves");
        }
        let domain = first[0].domain();
        if domain == 0 {
            bail!("Application 0 has an empty curve");
        }

        for (app, app_curves) in curves.iter().enumerate() {
            if app_curves.len() != intervals {
                bail!(
                    "Application {} has {} intervals, expected {}",
                    app,
                    app_curves.len(),
                    intervals
                );
            }
            if let Some(c) = app_curves.iter().find(|c| c.domain() != domain) {
                bail!(
                    "Application {} has a curve with domain {}, expected {}",
                    app,
                    c.domain(),
                    domain
                );
            }
        }

        let nodes = curves
            .iter()
            .map(|app_curves| ClusterNode {
                children: None,
                curves: app_curves.clone(),
                buckets: vec![],
                num_items: 1,
            })
            .collect();

        Ok(HCluster {
            nodes,
            active: (0..curves.len()).collect(),
            distances: HashMap::new(),
            linkage: vec![],
            num_items: curves.len(),
            domain,
        })
    }

    pub fn num_clusters(&self) -> usize {
        self.active.len()
    }

    pub fn linkage(&self) -> &[Linkage] {
        &self.linkage
    }

    fn distance(&mut self, src: usize, dst: usize) -> Result<f64> {
        if let Some(d) = self.distances.get(&(src, dst)) {
            return Ok(*d);
        }
        let d = miss_curve_area_distance(&self.nodes[src].curves, &self.nodes[dst].curves)?;
        self.distances.insert((src, dst), d);
        Ok(d)
    }

    /// Merge the two closest clusters. Returns `None` once everything is
    /// in a single cluster. On equal distances the pair found first in
    /// ascending `(src, dst)` order wins.
    pub fn merge_closest(&mut self) -> Result<Option<Linkage>> {
        if self.active.len() < 2 {
            return Ok(None);
        }

        let active: Vec<usize> = self.active.iter().copied().collect();
        let mut best: Option<(usize, usize, f64)> = None;
        for (i, &src) in active.iter().enumerate() {
            for &dst in active[i + 1..].iter() {
                let d = self.distance(src, dst)?;
                match best {
                    Some((_, _, best_d)) if d >= best_d => {}
                    _ => best = Some((src, dst, d)),
                }
            }
        }
        let (src, dst, distance) = match best {
            Some(best) => best,
            None => return Ok(None),
        };

        let mut curves = Vec::with_capacity(self.nodes[src].curves.len());
        let mut buckets = vec![];
        for (a, b) in self.nodes[src].curves.iter().zip(&self.nodes[dst].curves) {
            let combined = combined_miss_curve_detailed(a, b)?;
            curves.push(combined.curve);
            // Provenance of the most recent interval.
            buckets = combined.buckets;
        }

        let id = self.nodes.len();
        let num_items = self.nodes[src].num_items + self.nodes[dst].num_items;
        self.nodes.push(ClusterNode {
            children: Some((src, dst)),
            curves,
            buckets,
            num_items,
        });
        self.active.remove(&src);
        self.active.remove(&dst);
        self.active.insert(id);

        let link = Linkage {
            child1: src,
            child2: dst,
            distance,
            num_items,
        };
        debug!(
            "Merged {} and {} into {} (distance {:.4}), {} clusters left",
            src,
            dst,
            id,
            distance,
            self.active.len()
        );
        self.linkage.push(link.clone());
        Ok(Some(link))
    }

    fn collect_items(&self, node: usize, cluster: usize, out: &mut [usize]) {
        match self.nodes[node].children {
            Some((left, right)) => {
                self.collect_items(left, cluster, out);
                self.collect_items(right, cluster, out);
            }
            None => out[node] = cluster,
        }
    }

    fn collect_buckets(&self, node: usize, position: u32, out: &mut Vec<BucketSource>) {
        let n = &self.nodes[node];
        match n.children {
            Some((left, right)) => {
                let (lpos, rpos) = n.buckets[position as usize];
                self.collect_buckets(left, lpos, out);
                self.collect_buckets(right, rpos, out);
            }
            None => out.push(BucketSource {
                app: node,
                ways: position,
            }),
        }
    }

    /// The current clusters. Cluster IDs are handed out walking the active
    /// nodes from the most recent one down.
    pub fn snapshot(&self) -> ClusterResult {
        let mut item_to_cluster = vec![0; self.num_items];
        let mut cluster_curves = vec![];
        let mut cluster_buckets = vec![];

        for (cluster, &node) in self.active.iter().rev().enumerate() {
            self.collect_items(node, cluster, &mut item_to_cluster);
            cluster_curves.push(self.nodes[node].curves.clone());

            let mut per_position = Vec::with_capacity(self.domain);
            for position in 0..self.domain as u32 {
                let mut sources = vec![];
                self.collect_buckets(node, position, &mut sources);
                per_position.push(sources);
            }
            cluster_buckets.push(per_position);
        }

        ClusterResult {
            k: self.active.len(),
            item_to_cluster,
            cluster_curves,
            cluster_buckets,
        }
    }
}

/// Cluster `curves` into exactly `k` clusters.
pub fn cluster(curves: &[Vec<MissCurve>], k: usize) -> Result<ClusterResult> {
    if k == 0 || k > curves.len() {
        bail!(
            "Cannot form {} clusters out of {} applications",
            k,
            curves.len()
        );
    }

    let mut hc = HCluster::new(curves)?;
    while hc.num_clusters() > k {
        hc.merge_closest()?;
    }
    Ok(hc.snapshot())
}

/// Clusterings for every K from the number of applications down to 1,
/// computed in a single agglomeration pass.
pub fn cluster_auto(curves: &[Vec<MissCurve>]) -> Result<Vec<ClusterResult>> {
    let mut hc = HCluster::new(curves)?;
    let mut results = vec![hc.snapshot()];
    while hc.merge_closest()?.is_some() {
        results.push(hc.snapshot());
    }
    Ok(results)
}
