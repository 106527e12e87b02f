// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Dynamic last-level cache partitioning
//!
//! Applications sharing a last-level cache thrash each other. Hardware way
//! partitioning (Intel CAT) can isolate them, but giving every application
//! a private partition leaves most partitions too small to be useful. This
//! crate groups applications that get along into clusters, gives every
//! cluster a partition, and picks the number of clusters that maximizes
//! the predicted weighted speedup.
//!
//! The pieces, bottom up:
//!
//! - [`MissCurve`]: a metric (misses, IPC, ...) sampled per way count.
//!
//! - [`lookahead`] and [`hill_climb`]: split a number of ways across a set
//!   of curves.
//!
//! - [`whirlpool`]: predict the curve of two applications sharing a
//!   partition and how much sharing costs them.
//!
//! - [`hcluster`]: agglomerative clustering of applications by that cost.
//!
//! - [`plan`]: turn a clustering into concrete way assignments.
//!
//! - [`Kpart`]: one partitioning round from curves to plan, keeping the
//!   previous plan in force when a round fails.
//!
//! Curves come from [`profile`], plans go out through a
//! [`CacheAllocation`] backend. [`ucp`] is a per-application baseline.

mod config;
pub use config::KpartConfig;

mod curve;
pub use curve::MissCurve;
pub use curve::Trend;

pub mod lookahead;
pub use lookahead::partition;
pub use lookahead::Strategy;

pub mod hill_climb;
pub use hill_climb::hill_climb;

pub mod whirlpool;

pub mod hcluster;
pub use hcluster::cluster;
pub use hcluster::cluster_auto;
pub use hcluster::ClusterResult;
pub use hcluster::HCluster;

pub mod plan;
pub use plan::synthesize_plan;
pub use plan::PartitionPlan;

pub mod profile;
pub use profile::AppProfile;
pub use profile::CounterSample;
pub use profile::Metric;

pub mod ucp;

mod waymask;
pub use waymask::WayMask;
pub use waymask::MAX_WAYS;

pub mod cat;
pub use cat::apply_plan;
pub use cat::CacheAllocation;
pub use cat::DryRunCat;

mod round;
pub use round::Kpart;
pub use round::RoundReport;
