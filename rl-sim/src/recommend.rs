// Copyright (c) Ringlock Contributors.
//
// Limit projections computed from configuration alone; no kernel state is
// consulted so the tables printed before and after a run are identical.
use rl_sim_intf::SimConfig;
use rl_util::{double_underline, format_size, to_gb, to_mb};

const RING_TARGETS: &[u32] = &[1, 2, 4, 8, 16, 32];
const WORKER_TARGETS: &[u32] = &[1, 2, 4, 6, 8, 12, 16, 24];

/// Baseline mappings a real service already carries before any rings.
const BASE_VMAS: u64 = 65536;
const MAP_COUNT_MARGIN: f64 = 1.25;

const MEMLOCK_TIERS: &[(u64, &str)] = &[
    (16 << 20, "16M"),
    (32 << 20, "32M"),
    (64 << 20, "64M"),
    (128 << 20, "128M"),
    (256 << 20, "256M"),
    (512 << 20, "512M"),
    (1 << 30, "1G"),
    (2 << 30, "2G"),
    (4 << 30, "4G"),
    (8 << 30, "8G"),
];

const MAP_COUNT_TIERS: &[u64] = &[65536, 131072, 262144, 524288, 1048576, 2097152, 4194304];
const MAP_COUNT_CEILING: u64 = 8388608;

/// Round a byte requirement up to the next human-readable limit tier.
pub fn memlock_tier(bytes: u64) -> String {
    for &(limit, name) in MEMLOCK_TIERS {
        if bytes <= limit {
            return name.to_string();
        }
    }
    let gib = 1u64 << 30;
    format!("{}G+", (bytes + gib - 1) / gib)
}

pub fn map_count_tier(need: u64) -> u64 {
    for &tier in MAP_COUNT_TIERS {
        if need <= tier {
            return tier;
        }
    }
    MAP_COUNT_CEILING
}

fn map_count_need(cfg: &SimConfig, rings: u64) -> u64 {
    BASE_VMAS + rings * cfg.vmas_per_ring_estimate()
}

fn recommended_map_count(cfg: &SimConfig, rings: u64) -> u64 {
    map_count_tier((map_count_need(cfg, rings) as f64 * MAP_COUNT_MARGIN) as u64)
}

fn recommended_memlock(cfg: &SimConfig, pinned_per_worker: u64) -> String {
    memlock_tier((pinned_per_worker as f64 * cfg.safety_factor) as u64)
}

pub fn render_tables(cfg: &SimConfig) -> String {
    let pinned_ring = cfg.pinned_per_ring();
    let rings_base = cfg.rings_per_worker() as u64;
    let mut out = String::new();

    out += "\n";
    out += &double_underline("RECOMMENDED LIMITS");
    out += &format!(
        "per-ring pinned estimate: {} ({} buffers x {} + {} ring overhead)\n",
        format_size(pinned_ring),
        cfg.nr_buffers,
        format_size(cfg.buf_len()),
        format_size(cfg.ring_overhead()),
    );

    out += &format!(
        "\nA) Scaling rings per worker (workers fixed at {})\n",
        cfg.workers
    );
    out += &format!(
        "{:>14}  {:>17}  {:>15}  {:>13}  {:>16}\n",
        "rings/worker", "pinned/worker", "host pinned", "LimitMEMLOCK", "vm.max_map_count"
    );
    out += &format!(
        "{:>14}  {:>17}  {:>15}  {:>13}  {:>16}\n",
        "------------", "-------------", "-----------", "------------", "----------------"
    );
    for &rings in RING_TARGETS {
        let pinned_worker = rings as u64 * pinned_ring;
        let pinned_host = cfg.workers as u64 * pinned_worker;
        out += &format!(
            "{:>14}  {:>13.1} MiB  {:>11.2} GiB  {:>13}  {:>16}\n",
            rings,
            to_mb(pinned_worker),
            to_gb(pinned_host),
            recommended_memlock(cfg, pinned_worker),
            recommended_map_count(cfg, rings as u64),
        );
    }

    out += &format!(
        "\nB) Scaling worker count (rings/worker fixed at {})\n",
        rings_base
    );
    out += &format!(
        "{:>9}  {:>15}  {:>13}  {:>16}\n",
        "workers", "host pinned", "LimitMEMLOCK", "vm.max_map_count"
    );
    out += &format!(
        "{:>9}  {:>15}  {:>13}  {:>16}\n",
        "-------", "-----------", "------------", "----------------"
    );
    let pinned_worker = rings_base * pinned_ring;
    let memlock = recommended_memlock(cfg, pinned_worker);
    let map_count = recommended_map_count(cfg, rings_base);
    for &workers in WORKER_TARGETS {
        let pinned_host = workers as u64 * pinned_worker;
        out += &format!(
            "{:>9}  {:>11.2} GiB  {:>13}  {:>16}\n",
            workers,
            to_gb(pinned_host),
            memlock,
            map_count,
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rl_sim_intf::Args;

    fn dfl_cfg() -> SimConfig {
        SimConfig::from_args(&Args::default()).unwrap()
    }

    #[test]
    fn test_memlock_tier_ladder() {
        assert_eq!(memlock_tier(0), "16M");
        assert_eq!(memlock_tier(16 << 20), "16M");
        assert_eq!(memlock_tier((16 << 20) + 1), "32M");
        assert_eq!(memlock_tier(1 << 30), "1G");
        assert_eq!(memlock_tier(8 << 30), "8G");
        assert_eq!(memlock_tier((8u64 << 30) + 1), "9G+");
        assert_eq!(memlock_tier(17u64 << 30), "17G+");
    }

    #[test]
    fn test_map_count_tier_ladder() {
        assert_eq!(map_count_tier(1), 65536);
        assert_eq!(map_count_tier(65536), 65536);
        assert_eq!(map_count_tier(65537), 131072);
        assert_eq!(map_count_tier(4194304), 4194304);
        assert_eq!(map_count_tier(10_000_000), MAP_COUNT_CEILING);
    }

    #[test]
    fn test_tables_idempotent() {
        let cfg = dfl_cfg();
        assert_eq!(render_tables(&cfg), render_tables(&cfg));

        let mut other = dfl_cfg();
        other.nr_buffers = 256;
        assert_ne!(render_tables(&cfg), render_tables(&other));
    }

    #[test]
    fn test_projection_monotonic() {
        let cfg = dfl_cfg();
        let mut last_pinned = 0;
        let mut last_need = 0;
        for &rings in RING_TARGETS {
            let pinned = rings as u64 * cfg.pinned_per_ring();
            let need = map_count_need(&cfg, rings as u64);
            assert!(pinned >= last_pinned);
            assert!(need >= last_need);
            last_pinned = pinned;
            last_need = need;
        }
    }

    #[test]
    fn test_tables_contents() {
        let out = render_tables(&dfl_cfg());
        assert!(out.contains("RECOMMENDED LIMITS"));
        assert!(out.contains("A) Scaling rings per worker"));
        assert!(out.contains("B) Scaling worker count"));
        assert!(out.contains("vm.max_map_count"));
    }
}
