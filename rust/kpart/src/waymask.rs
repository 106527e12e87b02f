// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cache way masks
//!
//! A capacity bitmask (CBM) selecting which ways of the last-level cache a
//! class of service may fill. Bit `i` stands for way `i`.
//!
//!```
//!     use kpart::WayMask;
//!     let mask = WayMask::from_ways(&[0, 1, 2, 3, 8], 12).unwrap();
//!     assert_eq!(mask.weight(), 5);
//!     assert_eq!(format!("{}", mask), "10f");
//!     assert!(!mask.is_contiguous());
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Hardware CBM registers are at most 64 bits wide.
pub const MAX_WAYS: usize = 64;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct WayMask {
    mask: BitVec<u64, Lsb0>,
}

impl WayMask {
    /// Build an empty mask for a cache with `nr_ways` ways.
    pub fn new(nr_ways: usize) -> Result<WayMask> {
        if nr_ways == 0 || nr_ways > MAX_WAYS {
            bail!("Invalid cache way count {}, must be 1..={}", nr_ways, MAX_WAYS);
        }
        Ok(WayMask {
            mask: bitvec![u64, Lsb0; 0; nr_ways],
        })
    }

    /// Build a mask with every way set.
    pub fn full(nr_ways: usize) -> Result<WayMask> {
        let mut mask = WayMask::new(nr_ways)?;
        mask.mask.fill(true);
        Ok(mask)
    }

    pub fn from_ways(ways: &[u32], nr_ways: usize) -> Result<WayMask> {
        let mut mask = WayMask::new(nr_ways)?;
        for &way in ways {
            let way = way as usize;
            if way >= nr_ways {
                bail!("Invalid way {} passed, cache has {} ways", way, nr_ways);
            }
            mask.mask.set(way, true);
        }
        Ok(mask)
    }

    /// The raw register value.
    pub fn as_cbm(&self) -> u64 {
        self.mask.as_raw_slice().first().copied().unwrap_or(0)
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Number of ways in the cache.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Whether the set ways form a single run. Intel CAT rejects masks with
    /// holes.
    pub fn is_contiguous(&self) -> bool {
        match (self.mask.first_one(), self.mask.last_one()) {
            (Some(first), Some(last)) => last - first + 1 == self.weight(),
            _ => true,
        }
    }
}

impl fmt::Display for WayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.as_cbm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ways() {
        let mask = WayMask::from_ways(&[10, 11, 3], 12).unwrap();
        assert_eq!(mask.as_cbm(), 0xc08);
        assert_eq!(mask.weight(), 3);
        assert_eq!(mask.len(), 12);
        assert_eq!(format!("{}", mask), "c08");
        assert!(WayMask::from_ways(&[12], 12).is_err());
        assert!(WayMask::from_ways(&[], 0).is_err());
        assert!(WayMask::from_ways(&[], 65).is_err());
    }

    #[test]
    fn test_full_and_empty() {
        assert_eq!(WayMask::full(12).unwrap().as_cbm(), 0xfff);
        assert_eq!(WayMask::full(64).unwrap().as_cbm(), u64::MAX);
        assert!(WayMask::new(12).unwrap().is_empty());
        assert!(!WayMask::full(1).unwrap().is_empty());
    }

    #[test]
    fn test_contiguous() {
        assert!(WayMask::from_ways(&[2, 3, 4], 12).unwrap().is_contiguous());
        assert!(!WayMask::from_ways(&[2, 4], 12).unwrap().is_contiguous());
        // Way layout the 10/11 pairing fix can produce.
        assert!(!WayMask::from_ways(&[10, 8, 7, 11], 12).unwrap().is_contiguous());
        assert!(WayMask::new(12).unwrap().is_contiguous());
    }
}
