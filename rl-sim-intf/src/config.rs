// Copyright (c) Ringlock Contributors.
use anyhow::bail;
use std::fmt;
use std::str::FromStr;

use super::Args;
use rl_util::page_align;

/// Ceiling on the threads * queues product so a typo can't ask one worker
/// for millions of rings.
pub const MAX_RINGS_PER_WORKER: u32 = 1000;

pub const MIN_QUEUE_DEPTH: u32 = 16;
pub const MAX_QUEUE_DEPTH: u32 = 4096;
pub const MIN_BUFFER_SIZE: u64 = 4096;

/// How many rings one worker creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingMode {
    /// A literal per-worker count.
    Direct,
    /// One ring per simulated application thread.
    PerThread,
    /// One ring per simulated NIC queue.
    PerQueue,
    /// One ring per (thread, queue) pair.
    ThreadsTimesQueues,
}

impl RingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::PerThread => "threads",
            Self::PerQueue => "queues",
            Self::ThreadsTimesQueues => "threads-queues",
        }
    }
}

impl fmt::Display for RingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RingMode {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input {
            "direct" => Self::Direct,
            "threads" => Self::PerThread,
            "queues" => Self::PerQueue,
            "threads-queues" => Self::ThreadsTimesQueues,
            v => bail!("unknown ring mode {:?}", v),
        })
    }
}

/// Fully resolved simulation parameters. Built once from `Args` in the
/// parent and copied into each worker across fork; immutable afterwards.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub workers: u32,
    pub mode: RingMode,
    pub rings: u32,
    pub threads: u32,
    pub nic_queues: u32,
    pub queue_depth: u32,
    pub nr_buffers: u32,
    pub buffer_size: u64,
    pub nr_fixed_fds: u32,
    pub lock_memory: bool,
    pub per_buffer: bool,
    pub guard_pages: bool,
    pub memlock_limit: Option<u64>,
    pub safety_factor: f64,
    pub progress_every: u32,
    pub fail_fast: u32,
    pub interactive: bool,
}

impl SimConfig {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        Ok(Self {
            workers: args.workers.max(1),
            mode: args.mode.parse()?,
            rings: args.rings.max(1),
            threads: args.threads.max(1),
            nic_queues: args.nic_queues.max(1),
            queue_depth: args.queue_depth.max(MIN_QUEUE_DEPTH).min(MAX_QUEUE_DEPTH),
            nr_buffers: args.buffers,
            buffer_size: args.buffer_size.max(MIN_BUFFER_SIZE),
            nr_fixed_fds: args.fixed_fds,
            lock_memory: !args.no_mlock,
            per_buffer: args.per_buffer,
            guard_pages: args.guard,
            memlock_limit: args.memlock_limit,
            safety_factor: args.safety_factor.max(1.0),
            progress_every: args.progress.max(1),
            fail_fast: args.fail_fast,
            interactive: args.interactive,
        })
    }

    /// The ring-count model. Pure; the recommendation tables and the
    /// workers must resolve the same count from the same config.
    pub fn rings_per_worker(&self) -> u32 {
        match self.mode {
            RingMode::Direct => self.rings.max(1),
            RingMode::PerThread => self.threads.max(1),
            RingMode::PerQueue => self.nic_queues.max(1),
            RingMode::ThreadsTimesQueues => {
                let prod = self.threads.max(1) as u64 * self.nic_queues.max(1) as u64;
                prod.min(MAX_RINGS_PER_WORKER as u64).max(1) as u32
            }
        }
    }

    /// Per-buffer mapping length; registration pins whole pages.
    pub fn buf_len(&self) -> u64 {
        page_align(self.buffer_size)
    }

    /// Rough kernel-side footprint of one ring: SQ indices, CQEs at the
    /// default 2x CQ sizing, the SQE array and ring headers.
    pub fn ring_overhead(&self) -> u64 {
        let depth = self.queue_depth as u64;
        depth * 4 + depth * 2 * 16 + depth * 64 + 4096 * 3
    }

    /// Bytes one ring pins once its buffers are registered.
    pub fn pinned_per_ring(&self) -> u64 {
        self.nr_buffers as u64 * self.buf_len() + self.ring_overhead()
    }

    /// Planning estimate only; the kernel may merge adjacent mappings
    /// unless guard pages keep them apart.
    pub fn vmas_per_ring_estimate(&self) -> u64 {
        let buffer_vmas = if self.per_buffer {
            self.nr_buffers as u64
        } else {
            1
        };
        let guard_vmas = if self.guard_pages {
            self.nr_buffers as u64
        } else {
            0
        };
        4 + buffer_vmas + guard_vmas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(mode: RingMode, rings: u32, threads: u32, nic_queues: u32) -> SimConfig {
        let mut cfg = SimConfig::from_args(&Args::default()).unwrap();
        cfg.mode = mode;
        cfg.rings = rings;
        cfg.threads = threads;
        cfg.nic_queues = nic_queues;
        cfg
    }

    #[test]
    fn test_ring_mode_parse() {
        for pair in &[
            (RingMode::Direct, "direct"),
            (RingMode::PerThread, "threads"),
            (RingMode::PerQueue, "queues"),
            (RingMode::ThreadsTimesQueues, "threads-queues"),
        ] {
            assert_eq!(pair.0, pair.1.parse::<RingMode>().unwrap());
            assert_eq!(pair.0.as_str(), pair.1);
        }
        assert!("nope".parse::<RingMode>().is_err());
    }

    #[test]
    fn test_rings_per_worker_modes() {
        assert_eq!(config_with(RingMode::Direct, 20, 8, 4).rings_per_worker(), 20);
        assert_eq!(config_with(RingMode::PerThread, 20, 8, 4).rings_per_worker(), 8);
        assert_eq!(config_with(RingMode::PerQueue, 20, 8, 4).rings_per_worker(), 4);
        assert_eq!(
            config_with(RingMode::ThreadsTimesQueues, 20, 8, 4).rings_per_worker(),
            32
        );
    }

    #[test]
    fn test_rings_per_worker_clamps() {
        // Zeroed inputs always resolve to at least one ring.
        for mode in &[
            RingMode::Direct,
            RingMode::PerThread,
            RingMode::PerQueue,
            RingMode::ThreadsTimesQueues,
        ] {
            assert_eq!(config_with(*mode, 0, 0, 0).rings_per_worker(), 1);
        }
        // The product mode saturates at the per-worker ceiling.
        assert_eq!(
            config_with(RingMode::ThreadsTimesQueues, 1, 100, 100).rings_per_worker(),
            MAX_RINGS_PER_WORKER
        );
    }

    #[test]
    fn test_rings_per_worker_deterministic() {
        let cfg = config_with(RingMode::ThreadsTimesQueues, 1, 7, 13);
        assert_eq!(cfg.rings_per_worker(), cfg.rings_per_worker());
    }

    #[test]
    fn test_from_args_clamps() {
        let mut args = Args::default();
        args.workers = 0;
        args.queue_depth = 1;
        args.buffer_size = 1;
        args.safety_factor = 0.1;
        let cfg = SimConfig::from_args(&args).unwrap();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.queue_depth, MIN_QUEUE_DEPTH);
        assert_eq!(cfg.buffer_size, MIN_BUFFER_SIZE);
        assert_eq!(cfg.safety_factor, 1.0);

        args.queue_depth = 1 << 20;
        assert_eq!(
            SimConfig::from_args(&args).unwrap().queue_depth,
            MAX_QUEUE_DEPTH
        );

        args.mode = "bogus".to_string();
        assert!(SimConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_pinned_estimates() {
        let mut cfg = SimConfig::from_args(&Args::default()).unwrap();
        cfg.queue_depth = 512;
        cfg.nr_buffers = 128;
        cfg.buffer_size = 16384;
        let overhead = 512 * 4 + 512 * 2 * 16 + 512 * 64 + 4096 * 3;
        assert_eq!(cfg.ring_overhead(), overhead);
        assert_eq!(cfg.pinned_per_ring(), 128 * cfg.buf_len() + overhead);

        // Zero buffers leave only the ring overhead pinned.
        cfg.nr_buffers = 0;
        assert_eq!(cfg.pinned_per_ring(), overhead);
    }

    #[test]
    fn test_vma_estimates() {
        let mut cfg = SimConfig::from_args(&Args::default()).unwrap();
        cfg.nr_buffers = 10;

        cfg.per_buffer = false;
        cfg.guard_pages = false;
        assert_eq!(cfg.vmas_per_ring_estimate(), 5);

        cfg.per_buffer = true;
        assert_eq!(cfg.vmas_per_ring_estimate(), 14);

        cfg.guard_pages = true;
        assert_eq!(cfg.vmas_per_ring_estimate(), 24);
    }
}
