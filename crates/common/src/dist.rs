//! Rank context for multi-process runs.
//!
//! Each process runs an identical copy of the training loop. The launcher
//! (e.g. `torchrun`-style wrappers or a cluster scheduler) exports `RANK`,
//! `WORLD_SIZE` and `LOCAL_RANK`; a single-process run has none of them
//! and behaves as rank 0 of 1.

use anyhow::Context;

/// Position of this process in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistContext {
    pub rank: usize,
    pub world_size: usize,
    /// Device ordinal on this host.
    pub local_rank: usize,
}

impl Default for DistContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistContext {
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    pub fn new(rank: usize, world_size: usize, local_rank: usize) -> anyhow::Result<Self> {
        if world_size == 0 || rank >= world_size {
            anyhow::bail!("invalid rank {rank} for world size {world_size}");
        }
        Ok(Self {
            rank,
            world_size,
            local_rank,
        })
    }

    /// Read `RANK` / `WORLD_SIZE` / `LOCAL_RANK` from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let read = |key: &str| -> anyhow::Result<Option<usize>> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<usize>()
                        .with_context(|| format!("{key}={v} is not an integer"))
                })
                .transpose()
        };
        let rank = read("RANK")?.unwrap_or(0);
        let world_size = read("WORLD_SIZE")?.unwrap_or(1);
        let local_rank = read("LOCAL_RANK")?.unwrap_or(rank);
        Self::new(rank, world_size, local_rank)
    }

    /// Rank 0 owns logging, metrics and checkpoint writes.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_env_is_single_process() {
        let ctx = DistContext::from_lookup(lookup(&[])).unwrap();
        assert_eq!(ctx, DistContext::single());
        assert!(ctx.is_main());
    }

    #[test]
    fn reads_launcher_variables() {
        let ctx = DistContext::from_lookup(lookup(&[
            ("RANK", "3"),
            ("WORLD_SIZE", "8"),
            ("LOCAL_RANK", "1"),
        ]))
        .unwrap();
        assert_eq!(ctx.rank, 3);
        assert_eq!(ctx.world_size, 8);
        assert_eq!(ctx.local_rank, 1);
        assert!(!ctx.is_main());
    }

    #[test]
    fn rank_out_of_range_is_rejected() {
        assert!(DistContext::from_lookup(lookup(&[("RANK", "4"), ("WORLD_SIZE", "4")])).is_err());
        assert!(DistContext::from_lookup(lookup(&[("RANK", "x")])).is_err());
    }
}
