// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Profile ingestion
//!
//! While profiling, an application is run in turn with a number of
//! different partition sizes. For every sampled size the harness reports
//! the raw counter deltas of one sampling interval as a [`CounterSample`].
//! This module turns those samples into dense curves indexed by way count
//! and keeps a short history of estimates per application, whose average
//! is what the partitioning round works with.

use crate::config::KpartConfig;
use crate::curve::MissCurve;
use crate::curve::Trend;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use serde::Deserialize;
use serde::Serialize;
use std::collections::VecDeque;

/// Counter deltas of one sampling interval, taken while the application
/// was confined to `ways` ways.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub ways: u32,
    pub instructions: u64,
    pub cycles: u64,
    pub mem_traffic_bytes: u64,
    #[serde(default)]
    pub llc_occupancy_bytes: u64,
}

/// Metrics derived from one [`CounterSample`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub ways: u32,
    pub ipc: f64,
    pub mpki: f64,
    pub occupancy: f64,
}

impl CounterSample {
    /// A stalled counter (no instructions or no cycles retired) makes the
    /// whole sample unusable.
    pub fn point(&self, cache_line_size: u64) -> Result<SamplePoint> {
        if self.instructions == 0 || self.cycles == 0 {
            bail!(
                "Counters stalled at {} ways (instructions={} cycles={})",
                self.ways,
                self.instructions,
                self.cycles
            );
        }
        if cache_line_size == 0 {
            bail!("Cache line size must be positive");
        }

        let misses = self.mem_traffic_bytes as f64 / cache_line_size as f64;
        Ok(SamplePoint {
            ways: self.ways,
            ipc: self.instructions as f64 / self.cycles as f64,
            mpki: misses * 1000.0 / self.instructions as f64,
            occupancy: self.llc_occupancy_bytes as f64,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    Mpki,
    Ipc,
    Occupancy,
}

impl Metric {
    /// Direction the metric moves in as an application gets more ways.
    pub fn trend(&self) -> Trend {
        match self {
            Metric::Mpki => Trend::NonIncreasing,
            Metric::Ipc | Metric::Occupancy => Trend::NonDecreasing,
        }
    }

    fn value(&self, point: &SamplePoint) -> f64 {
        match self {
            Metric::Mpki => point.mpki,
            Metric::Ipc => point.ipc,
            Metric::Occupancy => point.occupancy,
        }
    }
}

/// Build a curve over `0..=cfg.cache_ways` from one round of samples,
/// listed in the order they were taken.
///
/// The first sample of a round runs on a cold partition, so with
/// `cfg.discard_warmup` it is overwritten by the second one. Way counts
/// that were sampled more than once keep the latest sample. Unsampled way
/// counts are linearly interpolated, and held flat outside the sampled
/// range. Finally the curve is smoothed in the metric's direction.
pub fn build_curve(
    samples: &[CounterSample],
    metric: Metric,
    cfg: &KpartConfig,
) -> Result<MissCurve> {
    if samples.is_empty() {
        bail!("No samples to build a {:?} curve from", metric);
    }

    let mut points = Vec::with_capacity(samples.len());
    for sample in samples.iter() {
        if sample.ways > cfg.cache_ways {
            bail!(
                "Sample at {} ways on a {}-way cache",
                sample.ways,
                cfg.cache_ways
            );
        }
        points.push(sample.point(cfg.cache_line_size)?);
    }
    if cfg.discard_warmup && points.len() >= 2 {
        points[0] = points[1];
    }

    // Stable, so later samples stay behind earlier ones of the same size.
    points.sort_by_key(|p| p.ways);
    let mut xs: Vec<u32> = vec![];
    let mut ys: Vec<f64> = vec![];
    for p in points.iter() {
        let value = metric.value(p);
        match xs.last() {
            Some(&last) if last == p.ways => {
                if let Some(y) = ys.last_mut() {
                    *y = value;
                }
            }
            _ => {
                xs.push(p.ways);
                ys.push(value);
            }
        }
    }

    let sparse = MissCurve::with_x(xs, ys)?;
    let mut dense = sparse.interpolate()?.ys().to_vec();
    let last = dense.last().copied().unwrap_or(0.0);
    dense.resize(cfg.cache_ways as usize + 1, last);

    let curve = MissCurve::new(dense).smoothen(metric.trend());
    debug!("{:?} curve: {}", metric, curve);
    Ok(curve)
}

/// The newest estimates of one curve.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CurveHistory {
    capacity: usize,
    estimates: VecDeque<MissCurve>,
}

impl CurveHistory {
    /// Average the newest estimate with up to `hist_window` previous ones.
    pub fn new(hist_window: usize) -> CurveHistory {
        CurveHistory {
            capacity: hist_window + 1,
            estimates: VecDeque::with_capacity(hist_window + 1),
        }
    }

    /// Whether `curve` can join the kept estimates.
    pub fn check(&self, curve: &MissCurve) -> Result<()> {
        if let Some(latest) = self.estimates.back() {
            if latest.domain() != curve.domain() {
                bail!(
                    "Estimate domain changed from {} to {}",
                    latest.domain(),
                    curve.domain()
                );
            }
        }
        Ok(())
    }

    pub fn push(&mut self, curve: MissCurve) -> Result<()> {
        self.check(&curve)?;
        if self.estimates.len() == self.capacity {
            self.estimates.pop_front();
        }
        self.estimates.push_back(curve);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }

    pub fn latest(&self) -> Option<&MissCurve> {
        self.estimates.back()
    }

    /// Pointwise average of the kept estimates.
    pub fn average(&self) -> Result<MissCurve> {
        let first = match self.estimates.front() {
            Some(first) => first,
            None => bail!("No estimates recorded yet"),
        };

        let mut sum = vec![0.0; first.domain()];
        for estimate in self.estimates.iter() {
            for (s, y) in sum.iter_mut().zip(estimate.ys()) {
                *s += y;
            }
        }
        let n = self.estimates.len() as f64;
        Ok(MissCurve::new(sum.into_iter().map(|s| s / n).collect()))
    }
}

/// Curve histories of one application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppProfile {
    pub name: String,
    pub mrc: CurveHistory,
    pub ipc: CurveHistory,
}

impl AppProfile {
    pub fn new(name: &str, cfg: &KpartConfig) -> AppProfile {
        AppProfile {
            name: name.to_string(),
            mrc: CurveHistory::new(cfg.hist_window),
            ipc: CurveHistory::new(cfg.hist_window),
        }
    }

    /// Add the estimates of one profiling round. If any sample is unusable
    /// the round is dropped and the histories stay as they were.
    pub fn record(&mut self, samples: &[CounterSample], cfg: &KpartConfig) -> Result<()> {
        let mrc = build_curve(samples, Metric::Mpki, cfg)
            .with_context(|| format!("Failed to build MRC of {}", self.name))?;
        let ipc = build_curve(samples, Metric::Ipc, cfg)
            .with_context(|| format!("Failed to build IPC curve of {}", self.name))?;

        self.mrc
            .check(&mrc)
            .with_context(|| format!("Failed to record MRC of {}", self.name))?;
        self.ipc
            .check(&ipc)
            .with_context(|| format!("Failed to record IPC curve of {}", self.name))?;

        // Both checked, so the histories grow together.
        self.mrc.push(mrc)?;
        self.ipc.push(ipc)?;
        Ok(())
    }

    pub fn mrc_curve(&self) -> Result<MissCurve> {
        self.mrc
            .average()
            .with_context(|| format!("No MRC for {}", self.name))
    }

    pub fn ipc_curve(&self) -> Result<MissCurve> {
        self.ipc
            .average()
            .with_context(|| format!("No IPC curve for {}", self.name))
    }
}
