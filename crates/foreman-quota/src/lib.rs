//! Per-backend usage accounting with exhaustion detection.
//!
//! The scheduler consults the [`QuotaTracker`] before every backend call and
//! records usage (or an authoritative quota error from the backend) after it.
//! Local counting is a heuristic: the tracker never sees the true upstream
//! quota, so a quota error reported by the backend itself always overrides
//! the counters and blocks the backend for a fixed cool-down.
//!
//! # Main types
//!
//! - [`QuotaTracker`] — Counts requests/tokens per backend and decides
//!   whether a backend is currently blocked.
//! - [`Usage`] — The per-backend counters and exhaustion state.

/// Usage records and the tracker.
pub mod tracker;

pub use tracker::{QuotaTracker, Usage};
