//! Work (difficulty) management.
//!
//! Two writers share the work scalar: the miner bumps it after every
//! accepted block, and [`DifficultyController`] periodically nudges it
//! toward the value that would produce blocks at the configured interval.
//! Both writers perform the read-modify-write while holding the database
//! connection lock, which keeps the scalar free of lost updates.

use crate::config::MiningConfig;
use crate::database::{self, Database};
use crate::error::Result;
use crate::state::NodeState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Work applied after an accepted block: a multiplicative bump, rounded to
/// the nearest integer. Clamping happens at the store.
pub fn accept_bump(work: u64, growth_factor: f64) -> u64 {
    (work as f64 * growth_factor).round() as u64
}

/// One retarget step. `target` is the work value that would have produced a
/// block every `seconds_per_block` given the observed gap; the result moves
/// a `work_factor` fraction of the way there.
pub fn retarget(work: u64, elapsed_secs: f64, seconds_per_block: u64, work_factor: f64) -> u64 {
    let work = work as f64;
    let target = work * (elapsed_secs / seconds_per_block as f64);
    (work + (target - work) * work_factor).round() as u64
}

/// Background task decaying work toward the target block interval.
pub struct DifficultyController {
    db: Arc<Database>,
    state: Arc<NodeState>,
    config: MiningConfig,
}

impl DifficultyController {
    pub fn new(db: Arc<Database>, state: Arc<NodeState>, config: &MiningConfig) -> Self {
        Self {
            db,
            state,
            config: config.clone(),
        }
    }

    /// Runs until the shutdown signal fires. Each tick is synchronous and
    /// short, so cancellation only ever lands between ticks.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.work_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick() {
                        warn!(error = %err, "work retarget tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("difficulty controller stopped");
                    return;
                }
            }
        }
    }

    fn tick(&self) -> Result<()> {
        let conn = self.db.conn();
        let tip = match database::latest_block(&conn)? {
            Some(tip) => tip,
            None => return Ok(()),
        };
        let elapsed_secs = (Utc::now() - tip.time).num_milliseconds().max(0) as f64 / 1000.0;
        let current = self.state.work();
        let next = retarget(
            current,
            elapsed_secs,
            self.config.seconds_per_block,
            self.config.work_factor,
        );
        if next != current {
            let applied = self.state.set_work(&conn, next)?;
            debug!(
                work = applied,
                elapsed_secs = elapsed_secs,
                "work retargeted"
            );
        }
        Ok(())
    }
}
