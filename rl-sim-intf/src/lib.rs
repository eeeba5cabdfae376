// Copyright (c) Ringlock Contributors.
pub mod args;
pub mod config;
pub mod message;

pub use args::Args;
pub use config::{RingMode, SimConfig, MAX_RINGS_PER_WORKER};
pub use message::{MemSnapshot, MsgKind, WorkerMsg, FAILURE_TEXT_MAX, MSG_SIZE};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
