// Copyright (c) Ringlock Contributors.
//
// Child side of the simulation: apply the memlock override if requested,
// create rings strictly one at a time and stream status records back to
// the parent over the inherited pipe fd.
use log::debug;
use nix::unistd::write;
use std::io;
use std::os::unix::io::RawFd;

use crate::instance::RingInstance;
use crate::procstat;
use rl_sim_intf::{MsgKind, SimConfig, WorkerMsg};

/// Raising a hard limit needs CAP_SYS_RESOURCE, so this commonly fails
/// with EPERM; the outcome is recorded and the worker proceeds with
/// whatever limit is actually in effect.
fn apply_memlock_override(bytes: u64) -> (i32, i32) {
    let lim = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &lim) };
    if rc == 0 {
        (0, 0)
    } else {
        (rc, io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

fn send(status_fd: RawFd, msg: &WorkerMsg) {
    let buf = msg.encode();
    let _ = write(status_fd, &buf);
}

pub fn run(cfg: &SimConfig, worker: u16, status_fd: RawFd) -> i32 {
    let (setrlimit_rc, setrlimit_errno) = match cfg.memlock_limit {
        Some(bytes) => apply_memlock_override(bytes),
        None => (0, 0),
    };
    if setrlimit_rc != 0 {
        debug!(
            "worker {}: setrlimit(RLIMIT_MEMLOCK) failed (errno {}), keeping the inherited limit",
            worker, setrlimit_errno
        );
    }

    let rings = cfg.rings_per_worker();
    let mut instances: Vec<RingInstance> = Vec::with_capacity(rings as usize);
    let mut created: u32 = 0;
    let mut failed: u32 = 0;
    let mut first_errno: i32 = 0;
    let mut first_failure = String::new();

    let compose = |kind, ring_index, created, failed, first_errno, first_failure: &str| WorkerMsg {
        kind,
        worker,
        rings_requested: rings,
        ring_index,
        created,
        failed,
        mem: procstat::read_self(),
        setrlimit_rc,
        setrlimit_errno,
        first_errno,
        first_failure: first_failure.to_string(),
    };

    for index in 0..rings {
        match RingInstance::create(cfg, index) {
            Ok(inst) => {
                created += 1;
                debug!("worker {}: ring {} ready", worker, inst.ring_id);
                instances.push(inst);
            }
            Err(fail) => {
                failed += 1;
                debug!("worker {}: ring {} failed: {}", worker, index, fail.reason);
                if first_failure.is_empty() {
                    first_errno = fail.errno;
                    first_failure = fail.reason;
                }
                // Once failures dominate, further attempts only burn time.
                if cfg.fail_fast > 0 && failed >= cfg.fail_fast && failed > created {
                    break;
                }
            }
        }

        if (index + 1) % cfg.progress_every == 0 {
            send(
                status_fd,
                &compose(
                    MsgKind::Progress,
                    index as i32,
                    created,
                    failed,
                    first_errno,
                    &first_failure,
                ),
            );
        }
    }

    send(
        status_fd,
        &compose(
            MsgKind::Final,
            -1,
            created,
            failed,
            first_errno,
            &first_failure,
        ),
    );

    // Symmetric teardown of everything that was created.
    drop(instances);

    if failed > 0 {
        1
    } else {
        0
    }
}
