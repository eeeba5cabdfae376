// Copyright (c) Ringlock Contributors.
use log::{debug, error, info};
use nix::sys::wait::wait;
use nix::unistd::{close, fork, pipe, ForkResult};
use std::process::exit;

use rl_sim_intf::{Args, SimConfig};
use rl_util::*;

mod instance;
mod procstat;
mod recommend;
mod report;
mod worker;

fn main() {
    //
    // Parse arguments and set up logging.
    //
    let args_file = Args::init_args_and_logging().expect("failed to process args file");
    let args = &args_file.data;

    debug!("arguments: {:#?}", args);

    let cfg = match SimConfig::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid configuration ({:#})", &e);
            exit(2);
        }
    };

    info!(
        "Host: memory={} cpus={} vm.max_map_count={}",
        format_size(*TOTAL_SYSTEM_MEMORY),
        *NR_SYSTEM_CPUS,
        read_max_map_count()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| "?".to_string()),
    );
    info!(
        "Workers={} mode={} rings/worker={} depth={} buffers={}x{} fixed_fds={}",
        cfg.workers,
        cfg.mode,
        cfg.rings_per_worker(),
        cfg.queue_depth,
        cfg.nr_buffers,
        format_size(cfg.buffer_size),
        cfg.nr_fixed_fds,
    );
    info!(
        "mlock={} layout={} guard_pages={}",
        if cfg.lock_memory { "on" } else { "off" },
        if cfg.per_buffer { "per-buffer" } else { "pooled" },
        if cfg.guard_pages { "on" } else { "off" },
    );
    if let Some(limit) = cfg.memlock_limit {
        info!(
            "Each worker will request RLIMIT_MEMLOCK={} ({})",
            limit,
            format_size(limit)
        );
    }

    print!("{}", recommend::render_tables(&cfg));

    if cfg.interactive {
        println!("\nInteractive mode clears the terminal while running.");
    }
    println!();

    //
    // One pipe shared by all workers; the parent keeps the read end.
    // Failing to set up the channel or a worker is the only thing that
    // aborts the whole run.
    //
    let (status_rfd, status_wfd) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            error!("Failed to create status pipe ({})", &e);
            exit(2);
        }
    };

    let mut nr_children = 0;
    for id in 0..cfg.workers {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = close(status_rfd);
                let rc = worker::run(&cfg, id as u16, status_wfd);
                let _ = close(status_wfd);
                unsafe { libc::_exit(rc) };
            }
            Ok(ForkResult::Parent { .. }) => nr_children += 1,
            Err(e) => {
                error!("Failed to fork worker {} ({})", id, &e);
                exit(2);
            }
        }
    }
    let _ = close(status_wfd);

    let rows = report::aggregate(status_rfd, &cfg);
    let _ = close(status_rfd);

    for _ in 0..nr_children {
        let _ = wait();
    }

    let total_failed = report::print_final(&rows, &cfg);

    print!("{}", recommend::render_tables(&cfg));
    println!();

    exit(if total_failed > 0 { 1 } else { 0 });
}
