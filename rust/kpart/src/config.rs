// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::waymask::MAX_WAYS;

/// Platform and policy parameters of a partitioning round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpartConfig {
    /// Cores, and therefore co-running applications and classes of service.
    pub num_cores: usize,
    /// Ways of the last-level cache.
    pub cache_ways: u32,
    pub cache_line_size: u64,
    /// Previous profiling estimates averaged with the newest one.
    pub hist_window: usize,
    /// IPC curve index weighted speedup is measured against.
    pub ipc_baseline_bucket: usize,
    /// Minimum ways of every cluster.
    pub min_alloc: u32,
    /// Two ways that must not end up in different partitions. Some Intel
    /// parts misbehave when they do.
    pub erratum_ways: Option<(u32, u32)>,
    /// Smallest number of clusters the automatic search considers.
    pub min_k: usize,
    /// Largest number of clusters the automatic search considers.
    pub max_k: Option<usize>,
    /// Skip the automatic search and always form this many clusters.
    pub fixed_k: Option<usize>,
    /// The first sample of a profiling round runs on a cold partition.
    pub discard_warmup: bool,
}

impl Default for KpartConfig {
    fn default() -> Self {
        KpartConfig {
            num_cores: 8,
            cache_ways: 12,
            cache_line_size: 64,
            hist_window: 3,
            ipc_baseline_bucket: 2,
            min_alloc: 1,
            erratum_ways: Some((10, 11)),
            min_k: 1,
            max_k: None,
            fixed_k: None,
            discard_warmup: true,
        }
    }
}

impl KpartConfig {
    /// Parse a JSON config, either inline or from `f:<path>`/`file:<path>`.
    pub fn parse(input: &str) -> Result<Self> {
        let config: KpartConfig = match input.split_once(':') {
            Some(("f", path)) | Some(("file", path)) => {
                let mut f = fs::OpenOptions::new()
                    .read(true)
                    .open(path)
                    .with_context(|| format!("Failed to open config file {}", path))?;
                let mut content = String::new();
                f.read_to_string(&mut content)?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", path))?
            }
            _ => serde_json::from_str(input).context("Failed to parse config")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_cores == 0 {
            bail!("num_cores must be positive");
        }
        if self.cache_ways == 0 || self.cache_ways as usize > MAX_WAYS {
            bail!(
                "cache_ways must be in 1..={}, got {}",
                MAX_WAYS,
                self.cache_ways
            );
        }
        if self.cache_line_size == 0 {
            bail!("cache_line_size must be positive");
        }
        if self.ipc_baseline_bucket > self.cache_ways as usize {
            bail!(
                "ipc_baseline_bucket {} is outside a {}-way cache",
                self.ipc_baseline_bucket,
                self.cache_ways
            );
        }
        if let Some((a, b)) = self.erratum_ways {
            if a == b || a >= self.cache_ways || b >= self.cache_ways {
                bail!(
                    "erratum_ways ({}, {}) must be two distinct ways below {}",
                    a,
                    b,
                    self.cache_ways
                );
            }
        }
        if self.min_alloc == 0 {
            bail!("min_alloc must be positive");
        }
        if self.min_k == 0 {
            bail!("min_k must be positive");
        }
        if let Some(max_k) = self.max_k {
            if max_k < self.min_k {
                bail!("max_k {} is below min_k {}", max_k, self.min_k);
            }
        }
        if self.fixed_k == Some(0) {
            bail!("fixed_k must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let cfg = KpartConfig::default();
        assert_eq!(cfg.cache_ways, 12);
        assert_eq!(cfg.num_cores, 8);
        assert_eq!(cfg.erratum_ways, Some((10, 11)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_inline() {
        let cfg = KpartConfig::parse(r#"{"cache_ways": 20, "num_cores": 4}"#).unwrap();
        assert_eq!(cfg.cache_ways, 20);
        assert_eq!(cfg.num_cores, 4);
        assert_eq!(cfg.hist_window, 3);

        let cfg = KpartConfig::parse(r#"{"erratum_ways": null}"#).unwrap();
        assert_eq!(cfg.erratum_ways, None);
    }

    #[test]
    fn test_parse_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache_ways": 11, "erratum_ways": [9, 10]}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        for prefix in ["f:", "file:"] {
            let cfg = KpartConfig::parse(&format!("{}{}", prefix, path)).unwrap();
            assert_eq!(cfg.cache_ways, 11);
            assert_eq!(cfg.erratum_ways, Some((9, 10)));
        }

        assert!(KpartConfig::parse("f:/nonexistent/kpart.json").is_err());
    }

    #[test]
    fn test_invalid() {
        assert!(KpartConfig::parse("not json").is_err());
        assert!(KpartConfig::parse(r#"{"cache_ways": 0}"#).is_err());
        assert!(KpartConfig::parse(r#"{"cache_ways": 65}"#).is_err());
        // The default erratum ways do not exist on an 8-way cache.
        assert!(KpartConfig::parse(r#"{"cache_ways": 8}"#).is_err());
        assert!(KpartConfig::parse(r#"{"cache_ways": 8, "erratum_ways": null}"#).is_ok());
        assert!(KpartConfig::parse(r#"{"min_k": 3, "max_k": 2}"#).is_err());
        assert!(KpartConfig::parse(r#"{"ipc_baseline_bucket": 13}"#).is_err());
        assert!(KpartConfig::parse(r#"{"fixed_k": 0}"#).is_err());
        assert!(KpartConfig::parse(r#"{"min_alloc": 0}"#).is_err());
    }
}
