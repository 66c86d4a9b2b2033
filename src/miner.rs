//! Proof-of-work block submission.
//!
//! A submission is validated, hashed against the current tip, tested with a
//! single inequality against the live work value, and on acceptance applied
//! as one ledger transaction: reward credit, reward transaction record,
//! unpaid-name decrement and the new block row. The whole path runs under
//! the database connection lock, so concurrent submissions of the same
//! attempt serialize and the second one lands on the duplicate check.

use crate::config::{MiningConfig, RewardTier};
use crate::crypto;
use crate::database::{self, Database, LedgerTx, NewBlock, NewTransaction};
use crate::error::{LedgerError, Result};
use crate::gateway::events::{EventBroadcaster, GatewayEvent};
use crate::ledger::AddressLedger;
use crate::processor::TransactionProcessor;
use crate::state::NodeState;
use crate::types::{Account, Block, Provenance};
use crate::work;
use std::sync::Arc;
use tracing::{debug, info};

/// Hash of the synthetic genesis block.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Credential the genesis solver address is derived from.
pub const GENESIS_CREDENTIAL: &str = "genesis";

/// Result of a well-formed submission. Duplicate and incorrect solutions
/// are expected outcomes a mining client handles routinely, so they are
/// not errors; only validation failures surface as [`LedgerError`].
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted {
        block: Block,
        solver: Account,
        /// Work in effect after the post-accept bump.
        work: u64,
    },
    Duplicate,
    Incorrect,
}

/// Base reward for the block mined on top of `tip_height`, read from the
/// breakpoint schedule (sorted ascending by height at config load).
pub fn base_reward(schedule: &[RewardTier], tip_height: u64) -> u64 {
    let mut reward = 0;
    for tier in schedule {
        if tip_height >= tier.height {
            reward = tier.reward;
        }
    }
    reward
}

pub struct BlockMiner {
    db: Arc<Database>,
    ledger: Arc<AddressLedger>,
    state: Arc<NodeState>,
    processor: Arc<TransactionProcessor>,
    events: EventBroadcaster,
    config: MiningConfig,
    address_prefix: String,
}

impl BlockMiner {
    pub fn new(
        db: Arc<Database>,
        ledger: Arc<AddressLedger>,
        state: Arc<NodeState>,
        processor: Arc<TransactionProcessor>,
        events: EventBroadcaster,
        config: &MiningConfig,
        address_prefix: &str,
    ) -> Self {
        Self {
            db,
            ledger,
            state,
            processor,
            events,
            config: config.clone(),
            address_prefix: address_prefix.to_string(),
        }
    }

    /// Create the genesis block on an empty store. Work seeding and switch
    /// initialization happen in [`NodeState::load`].
    pub fn bootstrap(&self) -> Result<()> {
        let conn = self.db.conn();
        if database::latest_block(&conn)?.is_some() {
            return Ok(());
        }
        let solver = crypto::make_v2_address(GENESIS_CREDENTIAL, &self.address_prefix);
        let provenance = Provenance::default();
        let genesis = NewBlock {
            height: 0,
            hash: GENESIS_HASH,
            address: &solver,
            nonce: b"0",
            value: 0,
            difficulty: self.config.min_work,
            x: None,
            y: None,
            z: None,
            provenance: &provenance,
        };
        database::insert_block(&conn, &genesis)?;
        info!(solver = %solver, "created genesis block");
        Ok(())
    }

    /// Validate and apply one submission attempt.
    pub fn submit(
        &self,
        solver: Option<&str>,
        nonce: Option<&[u8]>,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        provenance: &Provenance,
    ) -> Result<SubmitOutcome> {
        if !self.state.mining_enabled() {
            return Err(LedgerError::MiningDisabled);
        }

        let solver = solver.ok_or_else(|| LedgerError::MissingParameter("address".to_string()))?;
        if !crypto::is_valid_address(solver, &self.address_prefix, true) {
            return Err(LedgerError::InvalidParameter("address".to_string()));
        }

        let nonce = nonce.ok_or_else(|| LedgerError::MissingParameter("nonce".to_string()))?;
        if nonce.is_empty() || nonce.len() > self.config.nonce_max_size {
            return Err(LedgerError::InvalidParameter("nonce".to_string()));
        }

        let x = require_coord("x", x)?;
        let y = require_coord("y", y)?;
        let z = require_coord("z", z)?;

        // Everything below holds the connection lock: the duplicate check,
        // the inequality test and the accept effects see one consistent tip.
        let conn = self.db.conn();
        let tip = match database::latest_block(&conn)? {
            Some(tip) => tip,
            None => return Err(LedgerError::MiningDisabled),
        };

        let candidate = crypto::solution_hash(solver, &tip.hash, nonce);
        if database::block_hash_exists(&conn, &candidate)?
            || database::attempt_exists(&conn, solver, nonce, Some(x), Some(y), Some(z))?
        {
            debug!(solver = %solver, "duplicate solution");
            return Ok(SubmitOutcome::Duplicate);
        }

        let current_work = self.state.work();
        if crypto::solution_value(&candidate) >= current_work {
            return Ok(SubmitOutcome::Incorrect);
        }

        let height = tip.height + 1;
        let unpaid = database::count_unpaid_names(&conn)?;
        let value = base_reward(&self.config.reward_schedule, tip.height) + unpaid;

        let mut tx = LedgerTx::begin(&conn)?;
        let solver_account = self.ledger.credit_reward(&tx, solver, value)?;
        let reward = NewTransaction {
            from: None,
            to: solver,
            value,
            name: None,
            metadata: None,
            sent_metaname: None,
            sent_name: None,
            provenance,
        };
        self.processor.create_transaction(&mut tx, &reward)?;
        database::decrement_unpaid_names(tx.sql())?;
        let block = database::insert_block(
            tx.sql(),
            &NewBlock {
                height,
                hash: &candidate,
                address: solver,
                nonce,
                value,
                difficulty: current_work,
                x: Some(x),
                y: Some(y),
                z: Some(z),
                provenance,
            },
        )?;
        let events = self.events.clone();
        let accepted = block.clone();
        tx.on_commit(move || {
            events.publish(GatewayEvent::Block(accepted));
        });
        tx.commit()?;

        // Fixed multiplicative bump, once per accepted block. Still under
        // the connection lock, so the controller cannot interleave.
        let bumped = work::accept_bump(current_work, self.config.growth_factor);
        let new_work = self.state.set_work(&conn, bumped)?;
        info!(
            height,
            solver = %solver,
            value,
            work = new_work,
            "block accepted"
        );

        Ok(SubmitOutcome::Accepted {
            block,
            solver: solver_account,
            work: new_work,
        })
    }
}

fn require_coord(name: &str, value: Option<f64>) -> Result<i64> {
    let value = value.ok_or_else(|| LedgerError::MissingParameter(name.to_string()))?;
    if !value.is_finite() {
        return Err(LedgerError::InvalidParameter(name.to_string()));
    }
    Ok(value.trunc() as i64)
}
