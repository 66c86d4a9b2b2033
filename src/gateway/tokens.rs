//! One-shot websocket connection tokens.
//!
//! `POST /ws/start` issues a token bound to an authed address or to a guest
//! identity; the gateway consumes it exactly once within the expiry window.
//! Replayed, unknown and expired tokens are all indistinguishable to the
//! caller.

use crate::error::{LedgerError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct PendingToken {
    /// `None` for guest sessions.
    address: Option<String>,
    issued_at: Instant,
}

pub struct TokenRegistry {
    pending: Mutex<HashMap<String, PendingToken>>,
    expiry: Duration,
}

impl TokenRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Issue a fresh token. Expired leftovers are swept here rather than by
    /// a timer, since issuance is the only way the map grows.
    pub fn issue(&self, address: Option<String>) -> String {
        let token = Uuid::new_v4().to_string();
        let mut pending = self.pending.lock();
        pending.retain(|_, entry| entry.issued_at.elapsed() <= self.expiry);
        pending.insert(
            token.clone(),
            PendingToken {
                address,
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// Consume a token, returning the bound address (`None` for guests).
    /// A token can be redeemed at most once.
    pub fn redeem(&self, token: &str) -> Result<Option<String>> {
        let entry = self
            .pending
            .lock()
            .remove(token)
            .ok_or(LedgerError::InvalidToken)?;
        if entry.issued_at.elapsed() > self.expiry {
            return Err(LedgerError::InvalidToken);
        }
        Ok(entry.address)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
