//! Shared types for the skald script execution service.
//!
//! This crate is the dependency root of the workspace: every other
//! skald crate pulls its identifiers, status codes, and tuning
//! constants from here.
//!
//! # Modules
//!
//! - [`id`]: routing identifiers ([`ConvId`], [`NodeId`], [`PairKey`])
//! - [`status`]: wire status codes ([`Status`])

pub mod id;
pub mod status;

pub use id::{ConvId, NodeId, PairKey};
pub use status::Status;

/// Default per-script wall-clock budget, in milliseconds.
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 1000;

/// Default watchdog scan interval, in milliseconds.
pub const DEFAULT_WATCHDOG_SLEEP_MS: u64 = 500;

/// Default request staleness window, in milliseconds.
pub const DEFAULT_MAX_DIFF_TIME_MS: u64 = 1_000_000;

/// Default worker thread count (one engine per worker).
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default upper bound for a single transport frame, in bytes.
pub const DEFAULT_READ_BUFFER: usize = 10_000;

/// Default backlog bound for the worker pool.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
