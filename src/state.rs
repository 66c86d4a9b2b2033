//! Process-wide mutable node state
//!
//! The live work value and the mining/transactions switches. The atomics
//! are authoritative while the node runs; every write goes through to the
//! `state` table so values survive a restart. First startup against an
//! empty table seeds work to `max_work` and both switches to disabled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rusqlite::Connection;
use tracing::info;

use crate::config::MiningConfig;
use crate::database;
use crate::error::Result;

const WORK_KEY: &str = "work";
const MINING_KEY: &str = "mining_enabled";
const TRANSACTIONS_KEY: &str = "transactions_enabled";

pub struct NodeState {
    work: AtomicU64,
    mining_enabled: AtomicBool,
    transactions_enabled: AtomicBool,
    min_work: u64,
    max_work: u64,
}

impl NodeState {
    /// Loads persisted state, seeding any absent key with its initial
    /// value. A stored work value outside the configured bounds is pulled
    /// back in range, covering config changes between runs.
    pub fn load(conn: &Connection, mining: &MiningConfig) -> Result<Self> {
        let work = match database::state_get(conn, WORK_KEY)?.and_then(|v| v.parse::<u64>().ok()) {
            Some(stored) => stored.clamp(mining.min_work, mining.max_work),
            None => {
                database::state_put(conn, WORK_KEY, &mining.max_work.to_string())?;
                mining.max_work
            }
        };
        let mining_enabled = load_switch(conn, MINING_KEY)?;
        let transactions_enabled = load_switch(conn, TRANSACTIONS_KEY)?;

        info!(
            work,
            mining_enabled, transactions_enabled, "node state loaded"
        );

        Ok(NodeState {
            work: AtomicU64::new(work),
            mining_enabled: AtomicBool::new(mining_enabled),
            transactions_enabled: AtomicBool::new(transactions_enabled),
            min_work: mining.min_work,
            max_work: mining.max_work,
        })
    }

    pub fn work(&self) -> u64 {
        self.work.load(Ordering::SeqCst)
    }

    /// Clamps `value` to the configured bounds, applies it and writes it
    /// through to storage. Returns the value actually applied. Both
    /// writers, the post-accept bump and the controller tick, go through
    /// here.
    pub fn set_work(&self, conn: &Connection, value: u64) -> Result<u64> {
        let clamped = value.clamp(self.min_work, self.max_work);
        self.work.store(clamped, Ordering::SeqCst);
        database::state_put(conn, WORK_KEY, &clamped.to_string())?;
        Ok(clamped)
    }

    pub fn mining_enabled(&self) -> bool {
        self.mining_enabled.load(Ordering::Relaxed)
    }

    pub fn set_mining_enabled(&self, conn: &Connection, enabled: bool) -> Result<()> {
        self.mining_enabled.store(enabled, Ordering::Relaxed);
        database::state_put(conn, MINING_KEY, switch_str(enabled))?;
        info!(enabled, "mining switch changed");
        Ok(())
    }

    pub fn transactions_enabled(&self) -> bool {
        self.transactions_enabled.load(Ordering::Relaxed)
    }

    pub fn set_transactions_enabled(&self, conn: &Connection, enabled: bool) -> Result<()> {
        self.transactions_enabled.store(enabled, Ordering::Relaxed);
        database::state_put(conn, TRANSACTIONS_KEY, switch_str(enabled))?;
        info!(enabled, "transactions switch changed");
        Ok(())
    }

    pub fn min_work(&self) -> u64 {
        self.min_work
    }

    pub fn max_work(&self) -> u64 {
        self.max_work
    }
}

fn load_switch(conn: &Connection, key: &str) -> Result<bool> {
    match database::state_get(conn, key)? {
        Some(value) => Ok(value == "true"),
        None => {
            database::state_put(conn, key, "false")?;
            Ok(false)
        }
    }
}

fn switch_str(enabled: bool) -> &'static str {
    if enabled {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn mining_config() -> MiningConfig {
        MiningConfig::default()
    }

    #[test]
    fn first_load_seeds_defaults() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.conn();
        let state = NodeState::load(&conn, &mining_config()).unwrap();

        assert_eq!(state.work(), 100_000);
        assert!(!state.mining_enabled());
        assert!(!state.transactions_enabled());

        // seeds are persisted, not just in-memory defaults
        assert_eq!(
            database::state_get(&conn, "work").unwrap().as_deref(),
            Some("100000")
        );
        assert_eq!(
            database::state_get(&conn, "mining_enabled")
                .unwrap()
                .as_deref(),
            Some("false")
        );
    }

    #[test]
    fn reload_sees_written_values() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.conn();
        let state = NodeState::load(&conn, &mining_config()).unwrap();

        state.set_work(&conn, 4_200).unwrap();
        state.set_mining_enabled(&conn, true).unwrap();

        let reloaded = NodeState::load(&conn, &mining_config()).unwrap();
        assert_eq!(reloaded.work(), 4_200);
        assert!(reloaded.mining_enabled());
        assert!(!reloaded.transactions_enabled());
    }

    #[test]
    fn set_work_clamps_to_bounds() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.conn();
        let state = NodeState::load(&conn, &mining_config()).unwrap();

        assert_eq!(state.set_work(&conn, 5).unwrap(), 100);
        assert_eq!(state.work(), 100);
        assert_eq!(state.set_work(&conn, 10_000_000).unwrap(), 100_000);
        assert_eq!(state.work(), 100_000);
    }

    #[test]
    fn stored_work_outside_bounds_is_clamped_on_load() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.conn();
        database::state_put(&conn, "work", "7").unwrap();
        let state = NodeState::load(&conn, &mining_config()).unwrap();
        assert_eq!(state.work(), 100);
    }
}
