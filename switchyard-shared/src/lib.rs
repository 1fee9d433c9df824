//! # Switchyard Shared Library
//!
//! Redis-backed coordination primitives shared by every Switchyard service:
//! memoizing expensive reads, broadcasting domain events, and carrying causal
//! context across process boundaries. The job queue lives in
//! `switchyard-worker` and builds on these.
//!
//! ## Module Organization
//!
//! - `redis`: Connection provider, event stream bus and receivers
//! - `cache`: Two-tier single-flight cache with tag invalidation
//! - `codec`: Tagged serialization envelope
//! - `context`: Execution context propagation
//! - `report`: Error-tracking sink and best-effort background tasks
//! - `retry`: Reconnect backoff for long-running loops
//! - `config`: Environment configuration
//! - `telemetry`: Tracing subscriber setup

pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod redis;
pub mod report;
pub mod retry;
pub mod telemetry;

/// Current version of the Switchyard shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
