//! Operator alert sink
//!
//! Suspicious events (attempted balance races, repeated auth failures) are
//! reported here rather than logged inline, so noisy repeats can be
//! deduplicated by a stable key before they reach the operator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, warn};

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

pub struct AlertSink {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl AlertSink {
    pub fn new(window: Duration) -> Self {
        AlertSink {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Emits an alert unconditionally.
    pub fn report(&self, message: &str, urgent: bool) {
        emit(message, urgent);
    }

    /// Emits an alert unless the same key was reported within the dedup
    /// window. Returns whether the alert was actually emitted.
    pub fn report_deduped(&self, key: &str, message: &str, urgent: bool) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.to_string(), now);
        drop(seen);

        emit(message, urgent);
        true
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        AlertSink::new(DEFAULT_DEDUP_WINDOW)
    }
}

fn emit(message: &str, urgent: bool) {
    if urgent {
        error!(alert = message, "operator alert");
    } else {
        warn!(alert = message, "operator alert");
    }
}
