// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cache allocation backends
//!
//! Hardware cache allocation is configured in two steps: every class of
//! service (COS) gets a capacity bitmask of the ways it may fill, and every
//! core is associated with a COS. [`CacheAllocation`] is that interface;
//! the partitioning engine only ever talks to it through [`apply_plan`] and
//! [`share_all_ways`].

use crate::plan::PartitionPlan;
use crate::waymask::WayMask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;

/// A cache allocation controller.
pub trait CacheAllocation {
    fn num_cores(&self) -> usize;
    fn num_cos(&self) -> usize;
    fn num_ways(&self) -> usize;
    /// Whether masks may have holes. Most Intel parts only take a single
    /// run of ways.
    fn sparse_masks(&self) -> bool;
    fn cos_ways(&self, cos: usize) -> Result<WayMask>;
    fn set_cos_ways(&mut self, cos: usize, mask: &WayMask) -> Result<()>;
    fn core_cos(&self, core: usize) -> Result<usize>;
    fn set_core_cos(&mut self, core: usize, cos: usize) -> Result<()>;
}

/// Number of registers [`apply_plan`] actually wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub masks_written: usize,
    pub cores_remapped: usize,
}

/// Program `plan` into `cat`. Registers already holding the wanted value
/// are left alone, so applying the same plan twice writes nothing the
/// second time. Every mask is checked before the first write, so a plan
/// the controller cannot take leaves it untouched.
pub fn apply_plan(cat: &mut dyn CacheAllocation, plan: &PartitionPlan) -> Result<ApplyStats> {
    if plan.cache_ways as usize != cat.num_ways() {
        bail!(
            "Plan is for a {}-way cache, controller has {} ways",
            plan.cache_ways,
            cat.num_ways()
        );
    }
    if plan.cos_ways.len() > cat.num_cos() {
        bail!(
            "Plan needs {} classes of service, controller has {}",
            plan.cos_ways.len(),
            cat.num_cos()
        );
    }
    if plan.core_cos.len() > cat.num_cores() {
        bail!(
            "Plan maps {} cores, controller has {}",
            plan.core_cos.len(),
            cat.num_cores()
        );
    }

    let mut masks = vec![];
    for cos in 0..plan.cos_ways.len() {
        let mask = plan.cos_mask(cos)?;
        if mask.is_empty() {
            bail!("Class of service {} would get no ways", cos);
        }
        if !mask.is_contiguous() {
            if !cat.sparse_masks() {
                bail!(
                    "Class of service {} needs non-contiguous ways 0x{}, controller only takes contiguous masks",
                    cos,
                    mask
                );
            }
            debug!("COS {} mask 0x{} is not contiguous", cos, mask);
        }
        masks.push(mask);
    }

    let mut stats = ApplyStats::default();
    for (cos, mask) in masks.iter().enumerate() {
        if cat.cos_ways(cos)? != *mask {
            cat.set_cos_ways(cos, mask)
                .with_context(|| format!("Failed to set ways of COS {}", cos))?;
            stats.masks_written += 1;
        }
    }

    for (core, &cos) in plan.core_cos.iter().enumerate() {
        if cat.core_cos(core)? != cos {
            cat.set_core_cos(core, cos)
                .with_context(|| format!("Failed to map core {} to COS {}", core, cos))?;
            stats.cores_remapped += 1;
        }
    }

    debug!("Applied plan: {:?}", stats);
    Ok(stats)
}

/// Let every core fill the whole cache: core `i` goes to COS `i`, and every
/// such COS gets all ways.
pub fn share_all_ways(cat: &mut dyn CacheAllocation) -> Result<ApplyStats> {
    let num_cos = cat.num_cores().min(cat.num_cos());
    let plan = PartitionPlan::share_all(num_cos, cat.num_ways() as u32);
    apply_plan(cat, &plan)
}

/// An in-memory controller that only logs what it is asked to do. Starts
/// out in the reset state: every mask full, every core in COS 0. Accepts
/// sparse masks unless told otherwise.
#[derive(Clone, Debug)]
pub struct DryRunCat {
    masks: Vec<WayMask>,
    core_cos: Vec<usize>,
    sparse_masks: bool,
}

impl DryRunCat {
    pub fn new(num_cores: usize, num_cos: usize, num_ways: usize) -> Result<DryRunCat> {
        if num_cos == 0 {
            bail!("A controller needs at least one class of service");
        }
        let full = WayMask::full(num_ways)?;
        Ok(DryRunCat {
            masks: vec![full; num_cos],
            core_cos: vec![0; num_cores],
            sparse_masks: true,
        })
    }

    /// Behave like a part that rejects masks with holes.
    pub fn contiguous_only(mut self) -> DryRunCat {
        self.sparse_masks = false;
        self
    }

    fn check_cos(&self, cos: usize) -> Result<()> {
        if cos >= self.masks.len() {
            bail!("Invalid COS {}, controller has {}", cos, self.masks.len());
        }
        Ok(())
    }

    fn check_core(&self, core: usize) -> Result<()> {
        if core >= self.core_cos.len() {
            bail!("Invalid core {}, controller has {}", core, self.core_cos.len());
        }
        Ok(())
    }
}

impl CacheAllocation for DryRunCat {
    fn num_cores(&self) -> usize {
        self.core_cos.len()
    }

    fn num_cos(&self) -> usize {
        self.masks.len()
    }

    fn num_ways(&self) -> usize {
        self.masks[0].len()
    }

    fn sparse_masks(&self) -> bool {
        self.sparse_masks
    }

    fn cos_ways(&self, cos: usize) -> Result<WayMask> {
        self.check_cos(cos)?;
        Ok(self.masks[cos].clone())
    }

    fn set_cos_ways(&mut self, cos: usize, mask: &WayMask) -> Result<()> {
        self.check_cos(cos)?;
        if mask.len() != self.num_ways() {
            bail!(
                "Mask covers {} ways, cache has {}",
                mask.len(),
                self.num_ways()
            );
        }
        info!("COS {} -> ways 0x{} ({} ways)", cos, mask, mask.weight());
        self.masks[cos] = mask.clone();
        Ok(())
    }

    fn core_cos(&self, core: usize) -> Result<usize> {
        self.check_core(core)?;
        Ok(self.core_cos[core])
    }

    fn set_core_cos(&mut self, core: usize, cos: usize) -> Result<()> {
        self.check_core(core)?;
        self.check_cos(cos)?;
        info!("Core {} -> COS {}", core, cos);
        self.core_cos[core] = cos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PartitionPlan {
        PartitionPlan::from_partitions(
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7, 8, 9, 10, 11]],
            vec![0, 1, 1],
            12,
        )
        .unwrap()
    }

    #[test]
    fn test_apply_plan() {
        let mut cat = DryRunCat::new(8, 8, 12).unwrap();
        let stats = apply_plan(&mut cat, &plan()).unwrap();
        assert_eq!(stats.masks_written, 3);
        // Core 0 already sits in COS 0.
        assert_eq!(stats.cores_remapped, 2);

        assert_eq!(cat.cos_ways(0).unwrap().as_cbm(), 0x00f);
        assert_eq!(cat.cos_ways(1).unwrap().as_cbm(), 0xff0);
        assert_eq!(cat.cos_ways(2).unwrap().as_cbm(), 0xff0);
        assert_eq!(cat.cos_ways(3).unwrap().as_cbm(), 0xfff);
        assert_eq!(cat.core_cos(2).unwrap(), 2);
        assert_eq!(cat.core_cos(5).unwrap(), 0);

        assert_eq!(apply_plan(&mut cat, &plan()).unwrap(), ApplyStats::default());
    }

    #[test]
    fn test_share_all_ways() {
        let mut cat = DryRunCat::new(4, 8, 12).unwrap();
        apply_plan(&mut cat, &plan()).unwrap();
        share_all_ways(&mut cat).unwrap();
        for core in 0..4 {
            assert_eq!(cat.core_cos(core).unwrap(), core);
            assert_eq!(cat.cos_ways(core).unwrap().weight(), 12);
        }
    }

    #[test]
    fn test_apply_mismatch() {
        let mut cat = DryRunCat::new(8, 2, 12).unwrap();
        assert!(apply_plan(&mut cat, &plan()).is_err());

        let mut cat = DryRunCat::new(2, 8, 12).unwrap();
        assert!(apply_plan(&mut cat, &plan()).is_err());

        let mut cat = DryRunCat::new(8, 8, 16).unwrap();
        assert!(apply_plan(&mut cat, &plan()).is_err());

        let empty = PartitionPlan::from_partitions(vec![vec![]], vec![0], 12).unwrap();
        let mut cat = DryRunCat::new(8, 8, 12).unwrap();
        assert!(apply_plan(&mut cat, &empty).is_err());
    }

    #[test]
    fn test_dry_run_bounds() {
        let mut cat = DryRunCat::new(2, 2, 12).unwrap();
        assert!(cat.cos_ways(2).is_err());
        assert!(cat.set_core_cos(0, 2).is_err());
        assert!(cat.set_core_cos(2, 0).is_err());
        assert!(cat.set_cos_ways(0, &WayMask::full(8).unwrap()).is_err());
        assert!(DryRunCat::new(2, 0, 12).is_err());
        assert!(DryRunCat::new(2, 2, 0).is_err());
    }

    #[test]
    fn test_sparse_masks() {
        // Ways 10 and 11 moved in next to 7 and 8.
        let sparse = PartitionPlan::from_partitions(
            vec![vec![0, 1, 2, 3, 4, 5, 6, 9], vec![10, 8, 7, 11]],
            vec![0, 1],
            12,
        )
        .unwrap();

        let mut cat = DryRunCat::new(4, 4, 12).unwrap().contiguous_only();
        apply_plan(&mut cat, &plan()).unwrap();
        assert!(apply_plan(&mut cat, &sparse).is_err());
        // Nothing of the rejected plan was written.
        assert_eq!(cat.cos_ways(0).unwrap().as_cbm(), 0x00f);
        assert_eq!(cat.cos_ways(1).unwrap().as_cbm(), 0xff0);
        assert_eq!(cat.core_cos(2).unwrap(), 2);

        let mut cat = DryRunCat::new(4, 4, 12).unwrap();
        let stats = apply_plan(&mut cat, &sparse).unwrap();
        assert_eq!(stats.masks_written, 2);
        assert_eq!(cat.cos_ways(0).unwrap().as_cbm(), 0x27f);
        assert_eq!(cat.cos_ways(1).unwrap().as_cbm(), 0xd80);
    }
}
