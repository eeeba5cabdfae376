// Copyright (c) Ringlock Contributors.
//
// Parent side: drain fixed-size status records off the shared pipe,
// keep the last-known state per worker and render it either as a live
// redrawn table or as appended log rows.
use log::warn;
use nix::unistd::read;
use std::io::Write;
use std::os::unix::io::RawFd;

use rl_sim_intf::{MemSnapshot, MsgKind, SimConfig, WorkerMsg, MSG_SIZE};
use rl_util::{double_underline, to_gb};

#[derive(Debug, Clone, Default)]
pub struct WorkerRow {
    pub rings_requested: u32,
    pub created: u32,
    pub failed: u32,
    pub mem: MemSnapshot,
    pub setrlimit_rc: i32,
    pub setrlimit_errno: i32,
    pub first_failure: String,
    pub finished: bool,
}

/// Fold one valid message into its worker's row. Returns true when this
/// message finished the worker.
fn apply(rows: &mut [WorkerRow], msg: &WorkerMsg) -> bool {
    let row = match rows.get_mut(msg.worker as usize) {
        Some(row) => row,
        None => return false,
    };

    row.rings_requested = msg.rings_requested;
    row.created = msg.created;
    row.failed = msg.failed;
    row.mem = msg.mem;
    row.setrlimit_rc = msg.setrlimit_rc;
    row.setrlimit_errno = msg.setrlimit_errno;
    if row.first_failure.is_empty() && !msg.first_failure.is_empty() {
        row.first_failure = msg.first_failure.clone();
    }

    if msg.kind == MsgKind::Final && !row.finished {
        row.finished = true;
        return true;
    }
    false
}

fn setrlimit_cell(rc: i32, errno: i32) -> String {
    if rc == 0 {
        "ok".to_string()
    } else {
        format!("err:{}", errno)
    }
}

fn limit_cell(kb: i64) -> String {
    if kb < 0 {
        "unlimited".to_string()
    } else {
        kb.to_string()
    }
}

fn table_header() -> String {
    format!(
        "{:>4} {:>10} {:>8} {:>7} {:>10} {:>10} {:>10} {:>7} {:>14} {:>14} {:>9}\n\
         {:>4} {:>10} {:>8} {:>7} {:>10} {:>10} {:>10} {:>7} {:>14} {:>14} {:>9}\n",
        "wrk",
        "rings_req",
        "created",
        "failed",
        "VmLck MiB",
        "VmPin MiB",
        "VmRSS MiB",
        "VMAs",
        "memlock_curKB",
        "memlock_maxKB",
        "setrlim",
        "---",
        "---------",
        "-------",
        "------",
        "---------",
        "---------",
        "---------",
        "----",
        "-------------",
        "-------------",
        "-------",
    )
}

fn table_row(worker: usize, row: &WorkerRow) -> String {
    let mut out = format!(
        "{:>4} {:>10} {:>8} {:>7} {:>10.1} {:>10.1} {:>10.1} {:>7} {:>14} {:>14} {:>9}\n",
        worker,
        row.rings_requested,
        row.created,
        row.failed,
        row.mem.locked_kb as f64 / 1024.0,
        row.mem.pinned_kb as f64 / 1024.0,
        row.mem.rss_kb as f64 / 1024.0,
        row.mem.vmas,
        limit_cell(row.mem.rlim_cur_kb),
        limit_cell(row.mem.rlim_max_kb),
        setrlimit_cell(row.setrlimit_rc, row.setrlimit_errno),
    );
    if !row.first_failure.is_empty() {
        out += &format!("     first failure: {}\n", row.first_failure);
    }
    out
}

fn table(rows: &[WorkerRow]) -> String {
    let mut out = table_header();
    for (worker, row) in rows.iter().enumerate() {
        out += &table_row(worker, row);
    }
    out
}

fn log_header() -> String {
    table_header()
        .lines()
        .enumerate()
        .map(|(nr, line)| format!("{:>4} {}\n", if nr == 0 { "kind" } else { "----" }, line))
        .collect()
}

fn log_row(msg: &WorkerMsg) -> String {
    let kind = match msg.kind {
        MsgKind::Progress => "P",
        MsgKind::Final => "F",
    };
    let row = WorkerRow {
        rings_requested: msg.rings_requested,
        created: msg.created,
        failed: msg.failed,
        mem: msg.mem,
        setrlimit_rc: msg.setrlimit_rc,
        setrlimit_errno: msg.setrlimit_errno,
        first_failure: msg.first_failure.clone(),
        finished: msg.kind == MsgKind::Final,
    };
    format!("{:>4} {}", kind, table_row(msg.worker as usize, &row))
}

/// Read until every worker delivered its final record or all writers are
/// gone. Short or malformed reads are dropped without comment; the next
/// record realigns on its own because every write is exactly MSG_SIZE.
pub fn aggregate(status_fd: RawFd, cfg: &SimConfig) -> Vec<WorkerRow> {
    let total = cfg.workers as usize;
    let mut rows = vec![WorkerRow::default(); total];
    let mut finals = 0usize;
    let mut printed_header = false;
    let mut buf = [0u8; MSG_SIZE];

    while finals < total {
        let len = match read(status_fd, &mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(e) => {
                warn!("status pipe read failed ({})", &e);
                break;
            }
        };
        if len != MSG_SIZE {
            continue;
        }
        let msg = match WorkerMsg::decode(&buf) {
            Some(msg) => msg,
            None => continue,
        };

        if apply(&mut rows, &msg) {
            finals += 1;
        }

        if cfg.interactive {
            print!("\x1b[H\x1b[J");
            print!(
                "{}",
                double_underline(&format!(
                    "LIVE PROGRESS ({}/{} workers finished)",
                    finals, total
                ))
            );
            print!("{}", table(&rows));
        } else {
            if !printed_header {
                print!("{}", log_header());
                printed_header = true;
            }
            print!("{}", log_row(&msg));
        }
        let _ = std::io::stdout().flush();
    }

    rows
}

/// Final per-worker table plus cross-worker totals. Returns the total
/// failure count, which decides the process exit status.
pub fn print_final(rows: &[WorkerRow], cfg: &SimConfig) -> u64 {
    let mut total_created: u64 = 0;
    let mut total_failed: u64 = 0;
    let mut sum_locked_kb: i64 = 0;
    let mut sum_pinned_kb: i64 = 0;
    let mut sum_rss_kb: i64 = 0;
    let mut max_vmas: i64 = 0;

    for row in rows {
        total_created += row.created as u64;
        total_failed += row.failed as u64;
        sum_locked_kb += row.mem.locked_kb;
        sum_pinned_kb += row.mem.pinned_kb;
        sum_rss_kb += row.mem.rss_kb;
        max_vmas = max_vmas.max(row.mem.vmas);
    }

    println!();
    print!("{}", double_underline("FINAL RESULTS (PER WORKER)"));
    print!("{}", table(rows));

    let est_pinned = total_created * cfg.pinned_per_ring();

    println!();
    print!("{}", double_underline("SUMMARY"));
    println!("rings created={} failed={}", total_created, total_failed);
    println!(
        "estimated pinned total (all workers): {:.2} GiB",
        to_gb(est_pinned)
    );
    println!(
        "kernel VmLck sum (all workers):       {:.2} GiB",
        to_gb(sum_locked_kb * 1024)
    );
    if sum_pinned_kb > 0 {
        println!(
            "kernel VmPin sum (all workers):       {:.2} GiB",
            to_gb(sum_pinned_kb * 1024)
        );
    }
    println!(
        "kernel VmRSS sum (all workers):       {:.2} GiB",
        to_gb(sum_rss_kb * 1024)
    );
    println!("max VMAs in a single worker:          {}", max_vmas);

    total_failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(worker: u16, kind: MsgKind, created: u32, failed: u32, failure: &str) -> WorkerMsg {
        WorkerMsg {
            kind,
            worker,
            rings_requested: 10,
            ring_index: if kind == MsgKind::Final { -1 } else { 0 },
            created,
            failed,
            mem: MemSnapshot {
                locked_kb: 2048,
                pinned_kb: 0,
                rss_kb: 4096,
                vmas: 100,
                rlim_cur_kb: 65536,
                rlim_max_kb: -1,
            },
            setrlimit_rc: 0,
            setrlimit_errno: 0,
            first_errno: 0,
            first_failure: failure.to_string(),
        }
    }

    #[test]
    fn test_apply_updates_row() {
        let mut rows = vec![WorkerRow::default(); 2];

        assert!(!apply(&mut rows, &msg(1, MsgKind::Progress, 3, 1, "mlock failed")));
        assert_eq!(rows[1].created, 3);
        assert_eq!(rows[1].failed, 1);
        assert_eq!(rows[1].first_failure, "mlock failed");
        assert!(!rows[1].finished);
        assert_eq!(rows[0].created, 0);

        // First failure text is sticky.
        assert!(apply(&mut rows, &msg(1, MsgKind::Final, 5, 2, "later failure")));
        assert_eq!(rows[1].created, 5);
        assert_eq!(rows[1].first_failure, "mlock failed");
        assert!(rows[1].finished);

        // A duplicate final doesn't count twice.
        assert!(!apply(&mut rows, &msg(1, MsgKind::Final, 5, 2, "")));
    }

    #[test]
    fn test_apply_ignores_unknown_worker() {
        let mut rows = vec![WorkerRow::default(); 1];
        assert!(!apply(&mut rows, &msg(7, MsgKind::Final, 1, 0, "")));
        assert_eq!(rows[0].created, 0);
    }

    #[test]
    fn test_table_render() {
        let mut rows = vec![WorkerRow::default(); 1];
        apply(&mut rows, &msg(0, MsgKind::Final, 9, 1, "register_buffers failed"));
        let out = table(&rows);
        assert!(out.contains("rings_req"));
        assert!(out.contains("first failure: register_buffers failed"));
        assert!(out.contains("unlimited"));
    }

    #[test]
    fn test_limit_cell_sentinel() {
        assert_eq!(limit_cell(-1), "unlimited");
        assert_eq!(limit_cell(65536), "65536");
        assert_eq!(setrlimit_cell(0, 0), "ok");
        assert_eq!(setrlimit_cell(-1, 1), "err:1");
    }
}
