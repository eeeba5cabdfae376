// Copyright (c) Ringlock Contributors.
//
// Status records a worker streams to the parent over the shared pipe. The
// layout is explicit little-endian rather than a #[repr(C)] transmute so the
// reader never depends on compiler layout, and one record is far below
// PIPE_BUF so concurrent writers stay atomic.
use std::convert::TryInto;

pub const MSG_MAGIC: u32 = 0x524c_4b31; // "RLK1"
pub const FAILURE_TEXT_MAX: usize = 160;

/// magic + counters + memory snapshot + setrlimit outcome + bounded
/// failure text. Offsets are fixed; see `encode`.
pub const MSG_SIZE: usize = 88 + FAILURE_TEXT_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Progress = 1,
    Final = 2,
}

/// Memory accounting for one process as the kernel sees it. Limit values
/// use -1 for RLIM_INFINITY so "unlimited" never enters size arithmetic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSnapshot {
    pub locked_kb: i64,
    pub pinned_kb: i64,
    pub rss_kb: i64,
    pub vmas: i64,
    pub rlim_cur_kb: i64,
    pub rlim_max_kb: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMsg {
    pub kind: MsgKind,
    pub worker: u16,
    pub rings_requested: u32,
    /// Index of the ring just attempted; -1 in final messages.
    pub ring_index: i32,
    pub created: u32,
    pub failed: u32,
    pub mem: MemSnapshot,
    pub setrlimit_rc: i32,
    pub setrlimit_errno: i32,
    pub first_errno: i32,
    pub first_failure: String,
}

fn put(buf: &mut [u8], off: &mut usize, bytes: &[u8]) {
    buf[*off..*off + bytes.len()].copy_from_slice(bytes);
    *off += bytes.len();
}

fn get_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

fn get_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn get_i32(data: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn get_i64(data: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

impl WorkerMsg {
    pub fn encode(&self) -> [u8; MSG_SIZE] {
        let mut buf = [0u8; MSG_SIZE];
        let mut off = 0;

        put(&mut buf, &mut off, &MSG_MAGIC.to_le_bytes());
        put(&mut buf, &mut off, &(self.kind as u16).to_le_bytes());
        put(&mut buf, &mut off, &self.worker.to_le_bytes());
        put(&mut buf, &mut off, &self.rings_requested.to_le_bytes());
        put(&mut buf, &mut off, &self.ring_index.to_le_bytes());
        put(&mut buf, &mut off, &self.created.to_le_bytes());
        put(&mut buf, &mut off, &self.failed.to_le_bytes());

        put(&mut buf, &mut off, &self.mem.locked_kb.to_le_bytes());
        put(&mut buf, &mut off, &self.mem.pinned_kb.to_le_bytes());
        put(&mut buf, &mut off, &self.mem.rss_kb.to_le_bytes());
        put(&mut buf, &mut off, &self.mem.vmas.to_le_bytes());
        put(&mut buf, &mut off, &self.mem.rlim_cur_kb.to_le_bytes());
        put(&mut buf, &mut off, &self.mem.rlim_max_kb.to_le_bytes());

        put(&mut buf, &mut off, &self.setrlimit_rc.to_le_bytes());
        put(&mut buf, &mut off, &self.setrlimit_errno.to_le_bytes());
        put(&mut buf, &mut off, &self.first_errno.to_le_bytes());

        let text = self.first_failure.as_bytes();
        let text_len = text.len().min(FAILURE_TEXT_MAX);
        put(&mut buf, &mut off, &(text_len as u16).to_le_bytes());
        put(&mut buf, &mut off, &0u16.to_le_bytes());
        buf[off..off + text_len].copy_from_slice(&text[..text_len]);

        buf
    }

    /// Returns None for anything that isn't a complete, well-formed record;
    /// the caller drops it and keeps reading.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != MSG_SIZE || get_u32(data, 0) != MSG_MAGIC {
            return None;
        }
        let kind = match get_u16(data, 4) {
            1 => MsgKind::Progress,
            2 => MsgKind::Final,
            _ => return None,
        };
        let text_len = get_u16(data, 84) as usize;
        if text_len > FAILURE_TEXT_MAX {
            return None;
        }

        Some(Self {
            kind,
            worker: get_u16(data, 6),
            rings_requested: get_u32(data, 8),
            ring_index: get_i32(data, 12),
            created: get_u32(data, 16),
            failed: get_u32(data, 20),
            mem: MemSnapshot {
                locked_kb: get_i64(data, 24),
                pinned_kb: get_i64(data, 32),
                rss_kb: get_i64(data, 40),
                vmas: get_i64(data, 48),
                rlim_cur_kb: get_i64(data, 56),
                rlim_max_kb: get_i64(data, 64),
            },
            setrlimit_rc: get_i32(data, 72),
            setrlimit_errno: get_i32(data, 76),
            first_errno: get_i32(data, 80),
            first_failure: String::from_utf8_lossy(&data[88..88 + text_len]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkerMsg {
        WorkerMsg {
            kind: MsgKind::Progress,
            worker: 3,
            rings_requested: 20,
            ring_index: 7,
            created: 6,
            failed: 2,
            mem: MemSnapshot {
                locked_kb: 131072,
                pinned_kb: 0,
                rss_kb: 140000,
                vmas: 421,
                rlim_cur_kb: 65536,
                rlim_max_kb: -1,
            },
            setrlimit_rc: -1,
            setrlimit_errno: 1,
            first_errno: 12,
            first_failure: "mlock(pool 8388608 bytes) failed: Cannot allocate memory".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let decoded = WorkerMsg::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);

        let mut fin = sample();
        fin.kind = MsgKind::Final;
        fin.ring_index = -1;
        fin.first_failure = String::new();
        assert_eq!(fin, WorkerMsg::decode(&fin.encode()).unwrap());
    }

    #[test]
    fn test_reject_malformed() {
        let buf = sample().encode();

        // Truncated.
        assert!(WorkerMsg::decode(&buf[..MSG_SIZE - 1]).is_none());
        assert!(WorkerMsg::decode(&[]).is_none());

        // Bad magic.
        let mut bad = buf;
        bad[0] ^= 0xff;
        assert!(WorkerMsg::decode(&bad).is_none());

        // Bad kind.
        let mut bad = buf;
        bad[4] = 9;
        assert!(WorkerMsg::decode(&bad).is_none());

        // Text length beyond the bounded region.
        let mut bad = buf;
        bad[84..86].copy_from_slice(&(FAILURE_TEXT_MAX as u16 + 1).to_le_bytes());
        assert!(WorkerMsg::decode(&bad).is_none());

        // A good record still decodes after garbage was rejected.
        assert!(WorkerMsg::decode(&buf).is_some());
    }

    #[test]
    fn test_failure_text_bounded() {
        let mut msg = sample();
        msg.first_failure = "x".repeat(FAILURE_TEXT_MAX * 2);
        let decoded = WorkerMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.first_failure.len(), FAILURE_TEXT_MAX);
    }
}
