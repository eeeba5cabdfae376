// Copyright (c) Ringlock Contributors.
//
// Best-effort snapshot of the calling process's memory accounting. Fields
// that can't be read stay zero; diagnostics must never fail the run.
use scan_fmt::scan_fmt;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;

use rl_sim_intf::MemSnapshot;

const STATUS_PATH: &str = "/proc/self/status";
const MAPS_PATH: &str = "/proc/self/maps";

fn memlock_rlimit_kb() -> (i64, i64) {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut lim) } != 0 {
        return (0, 0);
    }
    let to_kb = |v: libc::rlim_t| -> i64 {
        if v == libc::RLIM_INFINITY {
            -1
        } else {
            (v / 1024) as i64
        }
    };
    (to_kb(lim.rlim_cur), to_kb(lim.rlim_max))
}

/// Reads VmLck/VmPin/VmRSS from /proc/self/status, counts the mappings in
/// /proc/self/maps and picks up RLIMIT_MEMLOCK. VmPin is absent on many
/// kernels and reports as zero there.
pub fn read_self() -> MemSnapshot {
    let mut snap = MemSnapshot::default();

    let (cur, max) = memlock_rlimit_kb();
    snap.rlim_cur_kb = cur;
    snap.rlim_max_kb = max;

    if let Ok(f) = fs::OpenOptions::new().read(true).open(STATUS_PATH) {
        for line in BufReader::new(f).lines().filter_map(Result::ok) {
            let field = match line.split(':').next() {
                Some(v) => v,
                None => continue,
            };
            let parsed = scan_fmt!(&line, "{} {d} kB", String, i64);
            if let Ok((_, val)) = parsed {
                match field {
                    "VmLck" => snap.locked_kb = val,
                    "VmPin" => snap.pinned_kb = val,
                    "VmRSS" => snap.rss_kb = val,
                    _ => {}
                }
            }
        }
    }

    if let Ok(f) = fs::OpenOptions::new().read(true).open(MAPS_PATH) {
        snap.vmas = BufReader::new(f).lines().filter_map(Result::ok).count() as i64;
    }

    snap
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_read_self() {
        let snap = super::read_self();
        // Any live process has mappings and resident pages.
        assert!(snap.vmas > 0);
        assert!(snap.rss_kb > 0);
        assert!(snap.locked_kb >= 0);
        // Limits are either the -1 sentinel or a real KB value.
        assert!(snap.rlim_cur_kb >= -1);
        assert!(snap.rlim_max_kb >= -1);
    }
}
