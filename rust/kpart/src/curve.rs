// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Miss curves
//!
//! A [`MissCurve`] is a sampled function from an allocation size (cache ways,
//! or any other bucket unit) to a metric that varies monotonically with it:
//! misses per kilo-instruction and occupancy shrink or grow with more ways,
//! IPC grows. The same type is used for every such metric; which way the
//! curve is expected to move is a property of the caller, enforced with
//! [`MissCurve::smoothen`].
//!
//! Curves are built once per profiling round and never mutated afterwards.
//! Every transform returns a new curve.
//!
//! A dense curve for a cache with `W` ways has `W + 1` points with x values
//! `0..=W`, so index `i` reads "the metric when given `i` ways".
//!
//!```
//!     use kpart::MissCurve;
//!     let mrc = MissCurve::new(vec![100.0, 60.0, 40.0, 35.0]);
//!     assert_eq!(mrc.domain(), 4);
//!     assert_eq!(mrc.y_interp(1.5).unwrap(), 50.0);
//!```

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Direction a curve must move in as its allocation grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    /// Miss rate style curves: more ways never hurt.
    NonIncreasing,
    /// IPC and occupancy style curves.
    NonDecreasing,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MissCurve {
    x: Vec<u32>,
    y: Vec<f64>,
}

impl MissCurve {
    /// Build a curve whose x values are its indices.
    pub fn new(y: Vec<f64>) -> MissCurve {
        MissCurve {
            x: (0..y.len() as u32).collect(),
            y,
        }
    }

    /// Build a curve with explicit, non-decreasing x values.
    pub fn with_x(x: Vec<u32>, y: Vec<f64>) -> Result<MissCurve> {
        if x.len() != y.len() {
            bail!(
                "Curve has {} x values but {} y values",
                x.len(),
                y.len()
            );
        }
        if let Some(w) = x.windows(2).find(|w| w[1] < w[0]) {
            bail!("Curve x values must not decrease ({} after {})", w[1], w[0]);
        }
        Ok(MissCurve { x, y })
    }

    /// A dense curve over `0..=buckets` with every y at zero.
    pub fn zeroed(buckets: u32) -> MissCurve {
        MissCurve::new(vec![0.0; buckets as usize + 1])
    }

    fn check_bucket(&self, bucket: usize) -> Result<()> {
        if bucket >= self.x.len() {
            bail!(
                "Invalid bucket {} passed, curve domain is {}",
                bucket,
                self.x.len()
            );
        }

        Ok(())
    }

    /// Number of sample points.
    pub fn domain(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self, bucket: usize) -> Result<u32> {
        self.check_bucket(bucket)?;
        Ok(self.x[bucket])
    }

    pub fn y(&self, bucket: usize) -> Result<f64> {
        self.check_bucket(bucket)?;
        Ok(self.y[bucket])
    }

    pub fn xs(&self) -> &[u32] {
        &self.x
    }

    pub fn ys(&self) -> &[f64] {
        &self.y
    }

    /// The largest x value, 0 for an empty curve.
    pub fn max_x(&self) -> u32 {
        self.x.last().copied().unwrap_or(0)
    }

    /// The metric with nothing allocated, 0 for an empty curve.
    pub fn num_accesses(&self) -> f64 {
        self.y.first().copied().unwrap_or(0.0)
    }

    /// Linearly interpolate between the samples around a fractional bucket.
    /// The last bucket is returned as is.
    pub fn y_interp(&self, bucket: f64) -> Result<f64> {
        if !(bucket >= 0.0) {
            bail!("Invalid fractional bucket {}", bucket);
        }

        let q = bucket.floor() as usize;
        let r = bucket - bucket.floor();
        self.check_bucket(q)?;
        if q + 1 == self.y.len() {
            return Ok(self.y[q]);
        }

        Ok(self.y[q] * (1.0 - r) + self.y[q + 1] * r)
    }

    /// The y value at the last sample whose x does not exceed `x`. The scan
    /// starts at `hint`, which callers walking a curve in order can use to
    /// skip the prefix they already visited.
    pub fn at(&self, x: u32, hint: usize) -> f64 {
        let mut b = hint.min(self.x.len());
        while b < self.x.len() && self.x[b] <= x {
            b += 1;
        }

        match self.y.get(b.saturating_sub(1)) {
            Some(y) => *y,
            None => 0.0,
        }
    }

    /// Lower convex hull of the curve. The returned curve keeps only the
    /// hull vertices and is therefore sparse in x.
    pub fn convexify(&self) -> MissCurve {
        let mut hull: Vec<usize> = Vec::with_capacity(self.x.len());

        for i in 0..self.x.len() {
            while hull.len() >= 2 {
                let i0 = hull[hull.len() - 2];
                let i1 = hull[hull.len() - 1];
                let (x0, y0) = (self.x[i0] as f64, self.y[i0]);
                let (x1, y1) = (self.x[i1] as f64, self.y[i1]);
                let (x2, y2) = (self.x[i] as f64, self.y[i]);

                // i1 is on or above the chord from i0 to i.
                if ((y2 - y1) * (x2 - x0)).abs() >= ((y2 - y0) * (x2 - x1)).abs() {
                    hull.pop();
                } else {
                    break;
                }
            }
            hull.push(i);
        }

        MissCurve {
            x: hull.iter().map(|&i| self.x[i]).collect(),
            y: hull.iter().map(|&i| self.y[i]).collect(),
        }
    }

    /// Fill in every integer x in `0..=max_x` by linear interpolation
    /// between consecutive samples. Points before the first sample repeat
    /// its value.
    pub fn interpolate(&self) -> Result<MissCurve> {
        if self.is_empty() {
            bail!("Cannot interpolate an empty curve");
        }

        let mut dense = MissCurve::zeroed(self.max_x());
        for x in 0..=self.x[0] as usize {
            dense.y[x] = self.y[0];
        }

        for i in 1..self.x.len() {
            let (x0, y0) = (self.x[i - 1], self.y[i - 1]);
            let (x1, y1) = (self.x[i], self.y[i]);
            if x1 == x0 {
                dense.y[x1 as usize] = y1;
                continue;
            }
            for x in x0..=x1 {
                let alpha = (x - x0) as f64 / (x1 - x0) as f64;
                dense.y[x as usize] = y0 + alpha * (y1 - y0);
            }
        }

        Ok(dense)
    }

    /// Undo sampling: both axes are multiplied by `1 / rate`.
    pub fn scale(&self, rate: f64) -> Result<MissCurve> {
        if !(rate > 0.0) || !rate.is_finite() {
            bail!("Invalid sampling rate {}", rate);
        }
        if rate == 1.0 {
            return Ok(self.clone());
        }

        let factor = 1.0 / rate;
        MissCurve::with_x(
            self.x.iter().map(|&x| (x as f64 * factor) as u32).collect(),
            self.y.iter().map(|&y| y * factor).collect(),
        )
    }

    /// Stretch the curve along x by `scale`, which must be at least 1.
    pub fn add_margin_of_safety(&self, scale: f64) -> Result<MissCurve> {
        if !(scale >= 1.0) || !scale.is_finite() {
            bail!("Margin of safety must be at least 1.0, got {}", scale);
        }

        MissCurve::with_x(
            self.x.iter().map(|&x| (x as f64 * scale) as u32).collect(),
            self.y.clone(),
        )
    }

    pub fn times(&self, factor: f64) -> MissCurve {
        MissCurve {
            x: self.x.clone(),
            y: self.y.iter().map(|&y| y * factor).collect(),
        }
    }

    pub fn plus(&self, addend: f64) -> MissCurve {
        MissCurve {
            x: self.x.clone(),
            y: self.y.iter().map(|&y| y + addend).collect(),
        }
    }

    fn check_same_shape(&self, other: &MissCurve) -> Result<()> {
        if self.domain() != other.domain() {
            bail!(
                "Curve domains differ ({} vs {})",
                self.domain(),
                other.domain()
            );
        }
        if let Some(i) = (0..self.x.len()).find(|&i| self.x[i] != other.x[i]) {
            bail!(
                "Curve x values differ at bucket {} ({} vs {})",
                i,
                self.x[i],
                other.x[i]
            );
        }

        Ok(())
    }

    pub fn times_curve(&self, other: &MissCurve) -> Result<MissCurve> {
        self.check_same_shape(other)?;
        Ok(MissCurve {
            x: self.x.clone(),
            y: self.y.iter().zip(&other.y).map(|(a, b)| a * b).collect(),
        })
    }

    pub fn plus_curve(&self, other: &MissCurve) -> Result<MissCurve> {
        self.check_same_shape(other)?;
        Ok(MissCurve {
            x: self.x.clone(),
            y: self.y.iter().zip(&other.y).map(|(a, b)| a + b).collect(),
        })
    }

    /// Clip every point against its predecessor so the curve moves in one
    /// direction only. Measurement noise routinely produces small bumps.
    pub fn smoothen(&self, trend: Trend) -> MissCurve {
        let mut y = self.y.clone();
        for i in 1..y.len() {
            y[i] = match trend {
                Trend::NonIncreasing => y[i].min(y[i - 1]),
                Trend::NonDecreasing => y[i].max(y[i - 1]),
            };
        }

        MissCurve {
            x: self.x.clone(),
            y,
        }
    }

    /// Whether the curve already moves in the given direction.
    pub fn is_monotone(&self, trend: Trend) -> bool {
        self.y.windows(2).all(|w| match trend {
            Trend::NonIncreasing => w[1] <= w[0],
            Trend::NonDecreasing => w[1] >= w[0],
        })
    }
}

impl fmt::Display for MissCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (x, y)) in self.x.iter().zip(&self.y).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "({}, {:.3})", x, y)?;
        }
        Ok(())
    }
}
