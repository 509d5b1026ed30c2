use chrono::{DateTime, Duration, Utc};
use foreman_core::ForemanResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Usage counters for one backend within the current accounting window.
///
/// `retry_after` is only meaningful while `is_exhausted` is set; once "now"
/// passes it the backend is no longer considered exhausted even before the
/// next check clears the flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Requests recorded in the current window.
    pub requests: u64,
    /// Tokens recorded in the current window.
    pub tokens: u64,
    /// When the current counting window began.
    pub window_start: DateTime<Utc>,
    /// Timestamp of the most recent recorded call, if any.
    #[serde(default)]
    pub last_request: Option<DateTime<Utc>>,
    /// Whether the backend is currently blocked.
    #[serde(default)]
    pub is_exhausted: bool,
    /// When a blocked backend may be retried.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Usage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            requests: 0,
            tokens: 0,
            window_start: now,
            last_request: None,
            is_exhausted: false,
            retry_after: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    usage: HashMap<String, Usage>,
    limits: HashMap<String, u64>,
}

/// Per-backend usage accounting, persisted independently of tasks.
///
/// Operations are linearizable per tracker (one mutex over all records).
/// Counting is an approximation; [`record_error`](QuotaTracker::record_error)
/// carries the authoritative signal from the backend and blocks dispatch
/// regardless of the local counters.
pub struct QuotaTracker {
    inner: Mutex<Inner>,
    path: PathBuf,
    window: Duration,
}

impl QuotaTracker {
    /// Create a tracker persisting to `path`, with a one-hour window.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: path.into(),
            window: Duration::hours(1),
        }
    }

    /// Override the accounting window size.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Configure the request threshold after which `backend` is considered
    /// exhausted for the rest of the window. Without a configured limit a
    /// backend is never exhausted by count alone.
    pub fn set_limit(&self, backend: &str, requests_per_window: u64) {
        self.inner
            .lock()
            .limits
            .insert(backend.to_string(), requests_per_window);
    }

    /// Whether `backend` is currently blocked. A backend with no recorded
    /// usage is never exhausted. An expired `retry_after` clears the flag
    /// and starts a fresh window.
    pub fn is_exhausted(&self, backend: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let Some(usage) = inner.usage.get_mut(backend) else {
            return false;
        };
        if !usage.is_exhausted {
            return false;
        }
        match usage.retry_after {
            Some(retry_after) if now < retry_after => true,
            _ => {
                usage.is_exhausted = false;
                usage.retry_after = None;
                usage.requests = 0;
                usage.tokens = 0;
                usage.window_start = now;
                false
            }
        }
    }

    /// Record one successful request and its token usage. Crossing the
    /// configured limit marks the backend exhausted until the window ends.
    pub fn record(&self, backend: &str, tokens: u64) {
        let now = Utc::now();
        let window = self.window;
        let mut inner = self.inner.lock();
        let limit = inner.limits.get(backend).copied();
        let usage = inner
            .usage
            .entry(backend.to_string())
            .or_insert_with(|| Usage::new(now));

        // A stale window resets the counters before the new call lands.
        if now - usage.window_start >= window && !usage.is_exhausted {
            usage.requests = 0;
            usage.tokens = 0;
            usage.window_start = now;
        }

        usage.requests += 1;
        usage.tokens += tokens;
        usage.last_request = Some(now);

        if let Some(limit) = limit {
            if usage.requests >= limit {
                usage.is_exhausted = true;
                usage.retry_after = Some(now + window);
            }
        }
    }

    /// Mark `backend` exhausted for `block` regardless of the counters.
    /// Used when the backend itself reports a quota or rate-limit error,
    /// which is authoritative over local counting.
    pub fn record_error(&self, backend: &str, block: Duration) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let usage = inner
            .usage
            .entry(backend.to_string())
            .or_insert_with(|| Usage::new(now));
        usage.is_exhausted = true;
        usage.retry_after = Some(now + block);
        usage.last_request = Some(now);
    }

    /// Snapshot of every tracked backend's usage record.
    pub fn list_usage(&self) -> HashMap<String, Usage> {
        self.inner.lock().usage.clone()
    }

    /// Persist the usage records to the tracker's file as pretty JSON.
    pub fn save(&self) -> ForemanResult<()> {
        let json = {
            let inner = self.inner.lock();
            serde_json::to_string_pretty(&inner.usage)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Restore usage records from the tracker's file. A missing file is not
    /// an error; the tracker simply starts empty.
    pub fn load(&self) -> ForemanResult<()> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let usage: HashMap<String, Usage> = serde_json::from_str(&json)?;
        self.inner.lock().usage = usage;
        Ok(())
    }
}
