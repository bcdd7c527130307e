//! Sliding-window rate limiter for credential-guessing surfaces.
//!
//! One process-wide map of `key → attempt timestamps`. Keys in use: the
//! login username, and `pair:<client_device_id>` on pairing confirmation.
//! State is in-memory only and resets on restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ApiError;

const WINDOW: Duration = Duration::from_secs(60);
const LIMIT: usize = 5;

pub struct RateLimiter {
    window: Duration,
    limit: usize,
    /// Map of key -> attempt timestamps within the last window.
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(WINDOW, LIMIT)
    }

    pub fn with_limits(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt for `key`. Fails once `limit` attempts have been
    /// seen within the window; pruning happens on every call so the map
    /// never holds stale timestamps for an active key.
    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());

        let timestamps = attempts.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.limit {
            return Err(ApiError::RateLimited);
        }
        timestamps.push(now);
        Ok(())
    }
}
