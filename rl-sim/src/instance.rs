// Copyright (c) Ringlock Contributors.
//
// One ring instance is an io_uring context plus the user-side resources
// registered with it. Every acquirable resource is an owned handle whose
// Drop releases it, so tearing down a partially constructed instance is
// just dropping it; declaration order below encodes the release order
// (fixed fds, buffers with their guards, then the ring itself).
use io_uring::IoUring;
use log::debug;
use std::alloc::{alloc, dealloc, Layout};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use rl_sim_intf::SimConfig;
use rl_util::PAGE_SIZE;

/// Written into every buffer page so the pages are actually committed
/// before mlock/registration, not just reserved.
const FILL_BYTE: u8 = 0xAA;

/// Captured at the first failing construction step.
#[derive(Debug, Clone)]
pub struct RingFailure {
    pub errno: i32,
    pub reason: String,
}

impl RingFailure {
    fn from_io(err: &io::Error, reason: String) -> Self {
        Self {
            errno: err.raw_os_error().unwrap_or(0),
            reason,
        }
    }

    fn last_os(what: String) -> Self {
        let err = io::Error::last_os_error();
        let reason = format!("{}: {}", what, err);
        Self::from_io(&err, reason)
    }
}

/// One page-aligned allocation backing all of a ring's buffers.
struct AlignedPool {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
    locked: bool,
}

impl AlignedPool {
    fn new(size: usize) -> Result<Self, RingFailure> {
        let layout = Layout::from_size_align(size, *PAGE_SIZE).map_err(|_| RingFailure {
            errno: libc::EINVAL,
            reason: format!("invalid buffer pool layout for {} bytes", size),
        })?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(RingFailure {
                errno: libc::ENOMEM,
                reason: format!("buffer pool alloc of {} bytes failed", size),
            });
        }
        unsafe { ptr::write_bytes(ptr, FILL_BYTE, size) };
        Ok(Self {
            ptr,
            size,
            layout,
            locked: false,
        })
    }

    fn lock(&mut self) -> Result<(), RingFailure> {
        if unsafe { libc::mlock(self.ptr as *const libc::c_void, self.size) } != 0 {
            return Err(RingFailure::last_os(format!(
                "mlock(pool {} bytes) failed",
                self.size
            )));
        }
        self.locked = true;
        Ok(())
    }
}

impl Drop for AlignedPool {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.ptr as *const libc::c_void, self.size);
            }
            dealloc(self.ptr, self.layout);
        }
    }
}

/// One anonymous mapping for per-buffer mode.
struct MappedBuf {
    ptr: *mut u8,
    len: usize,
    locked: bool,
}

impl MappedBuf {
    fn new(len: usize, index: u32) -> Result<Self, RingFailure> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RingFailure::last_os(format!(
                "mmap buffer {} ({} bytes) failed",
                index, len
            )));
        }
        let ptr = ptr as *mut u8;
        unsafe { ptr::write_bytes(ptr, FILL_BYTE, len) };
        Ok(Self {
            ptr,
            len,
            locked: false,
        })
    }

    fn lock(&mut self, index: u32) -> Result<(), RingFailure> {
        if unsafe { libc::mlock(self.ptr as *const libc::c_void, self.len) } != 0 {
            return Err(RingFailure::last_os(format!(
                "mlock buffer {} ({} bytes) failed",
                index, self.len
            )));
        }
        self.locked = true;
        Ok(())
    }
}

impl Drop for MappedBuf {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.ptr as *const libc::c_void, self.len);
            }
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// PROT_NONE page mapped right after a buffer so the kernel can't merge
/// adjacent buffer VMAs and under-report map-count pressure.
struct GuardRegion {
    ptr: *mut u8,
    len: usize,
}

impl GuardRegion {
    fn new() -> Option<Self> {
        let len = *PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // Fewer guard VMAs, not a failed ring.
            None
        } else {
            Some(Self {
                ptr: ptr as *mut u8,
                len,
            })
        }
    }
}

impl Drop for GuardRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Guards declared before buffers: they release first.
enum BufferSet {
    Empty,
    Pooled(AlignedPool),
    PerBuffer {
        guards: Vec<GuardRegion>,
        bufs: Vec<MappedBuf>,
    },
}

fn build_buffers(cfg: &SimConfig) -> Result<(BufferSet, Vec<libc::iovec>), RingFailure> {
    let nr = cfg.nr_buffers as usize;
    let buf_len = cfg.buf_len() as usize;

    if nr == 0 {
        return Ok((BufferSet::Empty, Vec::new()));
    }

    if !cfg.per_buffer {
        let mut pool = AlignedPool::new(nr * buf_len)?;
        if cfg.lock_memory {
            pool.lock()?;
        }
        let iovecs = (0..nr)
            .map(|i| libc::iovec {
                iov_base: unsafe { pool.ptr.add(i * buf_len) } as *mut libc::c_void,
                iov_len: buf_len,
            })
            .collect();
        Ok((BufferSet::Pooled(pool), iovecs))
    } else {
        let mut bufs = Vec::with_capacity(nr);
        let mut guards = Vec::new();
        for i in 0..nr {
            let mut buf = MappedBuf::new(buf_len, i as u32)?;
            if cfg.lock_memory {
                buf.lock(i as u32)?;
            }
            bufs.push(buf);
            if cfg.guard_pages {
                if let Some(guard) = GuardRegion::new() {
                    guards.push(guard);
                }
            }
        }
        let iovecs = bufs
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.ptr as *mut libc::c_void,
                iov_len: buf.len,
            })
            .collect();
        Ok((BufferSet::PerBuffer { guards, bufs }, iovecs))
    }
}

/// Placeholder sockets for the fixed-file table. Entries can be -1
/// (sparse slots); real fds close on drop.
struct FixedFds(Vec<RawFd>);

impl FixedFds {
    fn open(nr: u32) -> Self {
        let mut fds = Vec::with_capacity(nr as usize);
        for _ in 0..nr {
            let fd = unsafe {
                libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0)
            };
            fds.push(fd);
        }
        Self(fds)
    }

    fn none() -> Self {
        Self(Vec::new())
    }
}

impl Drop for FixedFds {
    fn drop(&mut self) {
        for fd in self.0.drain(..) {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

pub struct RingInstance {
    pub ring_id: u32,
    buffers_registered: bool,
    fds_registered: bool,
    fixed_fds: FixedFds,
    iovecs: Vec<libc::iovec>,
    buffers: BufferSet,
    ring: IoUring,
}

impl RingInstance {
    pub fn create(cfg: &SimConfig, ring_id: u32) -> Result<Self, RingFailure> {
        let ring = IoUring::new(cfg.queue_depth).map_err(|e| {
            let reason = format!("io_uring setup (depth {}) failed: {}", cfg.queue_depth, e);
            RingFailure::from_io(&e, reason)
        })?;

        let (buffers, iovecs) = build_buffers(cfg)?;

        let mut inst = Self {
            ring_id,
            buffers_registered: false,
            fds_registered: false,
            fixed_fds: FixedFds::none(),
            iovecs,
            buffers,
            ring,
        };

        // The canonical exhaustion point: registration charges the pinned
        // pages against RLIMIT_MEMLOCK.
        if !inst.iovecs.is_empty() {
            let ret = unsafe { inst.ring.submitter().register_buffers(&inst.iovecs) };
            if let Err(e) = ret {
                let mut reason = format!("register_buffers failed: {}", e);
                if e.raw_os_error() == Some(libc::ENOMEM) {
                    reason.push_str(" (RLIMIT_MEMLOCK too low for the pinned pages)");
                }
                return Err(RingFailure::from_io(&e, reason));
            }
            inst.buffers_registered = true;
        }

        // Best effort; an instance without its fixed-file table still counts.
        if cfg.nr_fixed_fds > 0 {
            inst.fixed_fds = FixedFds::open(cfg.nr_fixed_fds);
            match inst.ring.submitter().register_files(&inst.fixed_fds.0) {
                Ok(()) => inst.fds_registered = true,
                Err(e) => debug!(
                    "ring {}: register_files failed, continuing without fixed fds ({})",
                    ring_id, e
                ),
            }
        }

        Ok(inst)
    }
}

impl Drop for RingInstance {
    fn drop(&mut self) {
        // Unregister the file table, close the fds, unregister buffers;
        // the remaining field drops then release guards, buffer memory
        // (munlock before unmap/free) and finally the ring context.
        if self.fds_registered {
            let _ = self.ring.submitter().unregister_files();
            self.fds_registered = false;
        }
        drop(std::mem::replace(&mut self.fixed_fds, FixedFds::none()));
        if self.buffers_registered {
            let _ = self.ring.submitter().unregister_buffers();
            self.buffers_registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rl_sim_intf::Args;
    use rl_util::page_align;

    fn test_cfg(nr_buffers: u32, buffer_size: u64, per_buffer: bool, guard: bool) -> SimConfig {
        let mut cfg = SimConfig::from_args(&Args::default()).unwrap();
        cfg.nr_buffers = nr_buffers;
        cfg.buffer_size = buffer_size;
        cfg.per_buffer = per_buffer;
        cfg.guard_pages = guard;
        // Keep tests independent of the environment's RLIMIT_MEMLOCK.
        cfg.lock_memory = false;
        cfg
    }

    #[test]
    fn test_pooled_iovec_layout() {
        let cfg = test_cfg(8, 5000, false, false);
        let buf_len = page_align(5000) as usize;
        let (set, iovecs) = build_buffers(&cfg).unwrap();

        assert_eq!(iovecs.len(), 8);
        for (i, iov) in iovecs.iter().enumerate() {
            assert_eq!(iov.iov_len, buf_len);
            let expected = iovecs[0].iov_base as usize + i * buf_len;
            assert_eq!(iov.iov_base as usize, expected);
        }
        match set {
            BufferSet::Pooled(ref pool) => assert_eq!(pool.size, 8 * buf_len),
            _ => panic!("expected pooled buffer set"),
        }
    }

    #[test]
    fn test_per_buffer_with_guards() {
        let cfg = test_cfg(4, 4096, true, true);
        let (set, iovecs) = build_buffers(&cfg).unwrap();

        assert_eq!(iovecs.len(), 4);
        match set {
            BufferSet::PerBuffer {
                ref guards,
                ref bufs,
            } => {
                assert_eq!(bufs.len(), 4);
                assert_eq!(guards.len(), 4);
                // Each buffer is its own mapping; contents were committed.
                for buf in bufs {
                    assert_eq!(unsafe { *buf.ptr }, FILL_BYTE);
                }
            }
            _ => panic!("expected per-buffer set"),
        }
        // Dropping the set unmaps everything; nothing to assert beyond
        // not crashing.
    }

    #[test]
    fn test_zero_buffers_degenerate() {
        let cfg = test_cfg(0, 4096, false, false);
        let (set, iovecs) = build_buffers(&cfg).unwrap();
        assert!(iovecs.is_empty());
        match set {
            BufferSet::Empty => {}
            _ => panic!("expected empty buffer set"),
        }
    }

    #[test]
    fn test_double_drop_safety() {
        // Dropping unlocked and never-registered resources in any partial
        // state must be clean.
        let cfg = test_cfg(2, 4096, true, false);
        let (set, _iovecs) = build_buffers(&cfg).unwrap();
        drop(set);

        let pool = AlignedPool::new(4096).unwrap();
        drop(pool);

        drop(FixedFds::open(3));
        drop(FixedFds::none());
    }
}
