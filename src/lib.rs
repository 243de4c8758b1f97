//! Ratewarden - Multi-tier Rate Limiting and Abuse Protection
//!
//! This crate implements the rate limiting engine of a forum backend: per-IP,
//! per-user, per-endpoint and global-endpoint quotas enforced with fixed
//! window, sliding window or token bucket counting, a DDoS guard with hard
//! blocks, and static allow/deny lists. Counters live in a shared TTL store
//! so several serving processes enforce the same quotas.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
