//! Transaction intake pipeline.
//!
//! Every balance movement funnels through [`TransactionProcessor::submit`]:
//! a bounded admission queue, an optimistic balance pre-check, then the
//! serialized transfer under the sender's address guard. Post-commit
//! bookkeeping (type counters and event publication) is staged on the
//! ledger transaction so nothing observable escapes a rollback.

use crate::alerts::AlertSink;
use crate::config::ProcessorConfig;
use crate::crypto;
use crate::database::{self, Database, LedgerTx, NewTransaction};
use crate::error::{LedgerError, Result};
use crate::gateway::events::{EventBroadcaster, GatewayEvent};
use crate::ledger::{AddressLedger, TransferPayload};
use crate::state::NodeState;
use crate::types::{Provenance, Transaction, TransactionType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Longest metadata accepted on a transaction, in bytes.
pub const METADATA_MAX_LENGTH: usize = 255;

/// Running counts of committed transactions by type, plus rollbacks.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    mined: AtomicU64,
    name_purchase: AtomicU64,
    name_a_record: AtomicU64,
    name_transfer: AtomicU64,
    transfer: AtomicU64,
    unknown: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorStatsSnapshot {
    pub mined: u64,
    pub name_purchase: u64,
    pub name_a_record: u64,
    pub name_transfer: u64,
    pub transfer: u64,
    pub unknown: u64,
    pub rollbacks: u64,
}

impl ProcessorStats {
    fn record(&self, kind: TransactionType) {
        let counter = match kind {
            TransactionType::Mined => &self.mined,
            TransactionType::NamePurchase => &self.name_purchase,
            TransactionType::NameARecord => &self.name_a_record,
            TransactionType::NameTransfer => &self.name_transfer,
            TransactionType::Transfer => &self.transfer,
            TransactionType::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            mined: self.mined.load(Ordering::Relaxed),
            name_purchase: self.name_purchase.load(Ordering::Relaxed),
            name_a_record: self.name_a_record.load(Ordering::Relaxed),
            name_transfer: self.name_transfer.load(Ordering::Relaxed),
            transfer: self.transfer.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

pub struct TransactionProcessor {
    db: Arc<Database>,
    ledger: Arc<AddressLedger>,
    state: Arc<NodeState>,
    alerts: Arc<AlertSink>,
    events: EventBroadcaster,
    queue: Arc<Semaphore>,
    queue_timeout: Duration,
    address_prefix: String,
    stats: Arc<ProcessorStats>,
}

impl TransactionProcessor {
    pub fn new(
        db: Arc<Database>,
        ledger: Arc<AddressLedger>,
        state: Arc<NodeState>,
        alerts: Arc<AlertSink>,
        events: EventBroadcaster,
        config: &ProcessorConfig,
        address_prefix: &str,
    ) -> Self {
        Self {
            db,
            ledger,
            state,
            alerts,
            events,
            queue: Arc::new(Semaphore::new(config.max_concurrency)),
            queue_timeout: Duration::from_secs(config.queue_timeout_secs),
            address_prefix: address_prefix.to_string(),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Move `amount` from `sender` to `recipient`.
    ///
    /// The sender must already be authenticated by the caller; the recipient
    /// account is created on first receipt. Returns the committed record.
    pub async fn submit(
        &self,
        sender: &str,
        recipient: &str,
        amount: u64,
        metadata: Option<&str>,
        provenance: &Provenance,
    ) -> Result<Transaction> {
        if !self.state.transactions_enabled() {
            return Err(LedgerError::TransactionsDisabled);
        }
        if amount < 1 {
            return Err(LedgerError::InvalidParameter("amount".to_string()));
        }
        let recipient = recipient.trim().to_lowercase();
        if !crypto::is_valid_address(&recipient, &self.address_prefix, true) {
            return Err(LedgerError::InvalidParameter("to".to_string()));
        }
        if let Some(meta) = metadata {
            if meta.len() > METADATA_MAX_LENGTH {
                return Err(LedgerError::InvalidParameter("metadata".to_string()));
            }
        }

        // Turn obviously-broke senders away before they consume queue
        // capacity. The balance is checked again under the address guard.
        let account = self
            .db
            .get_account(sender)?
            .ok_or_else(|| LedgerError::AddressNotFound(sender.to_string()))?;
        if account.balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }

        let _permit = match tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.queue).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(LedgerError::QueueOverloaded),
        };

        let _guard = self.ledger.lock_address(sender).await;

        // No awaits below this point: the connection lock is held to commit.
        let conn = self.db.conn();
        let mut tx = LedgerTx::begin(&conn)?;
        let payload = TransferPayload {
            metadata,
            ..TransferPayload::default()
        };
        let record = match self
            .ledger
            .transfer(&tx, sender, &recipient, amount, &payload, provenance)
        {
            Ok(record) => record,
            Err(LedgerError::InsufficientFunds) => {
                // The pre-check passed, so the balance moved while this
                // request was queued.
                self.alerts.report_deduped(
                    &format!("race-{}-{}-{}", sender, recipient, amount),
                    &format!(
                        "race condition attempted in {} transaction from {} to {}",
                        amount, sender, recipient
                    ),
                    true,
                );
                return Err(LedgerError::InsufficientFunds);
            }
            Err(err) => return Err(err),
        };
        self.stage_post_commit(&mut tx, &record);
        tx.commit()?;
        Ok(record)
    }

    /// Insert a transaction row directly, staging the same post-commit
    /// bookkeeping as [`TransactionProcessor::submit`]. Used by the miner
    /// for reward records, which have no sender and may carry value zero.
    pub(crate) fn create_transaction(
        &self,
        tx: &mut LedgerTx,
        new: &NewTransaction<'_>,
    ) -> Result<Transaction> {
        let record = database::insert_transaction(tx.sql(), new)?;
        self.stage_post_commit(tx, &record);
        Ok(record)
    }

    fn stage_post_commit(&self, tx: &mut LedgerTx, record: &Transaction) {
        let kind = record.transaction_type();
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let committed = record.clone();
        tx.on_commit(move || {
            stats.record(kind);
            events.publish(GatewayEvent::Transaction(committed));
        });

        let stats = Arc::clone(&self.stats);
        let id = record.id;
        tx.on_rollback(move || {
            stats.record_rollback();
            warn!(transaction = id, "transaction rolled back after insert");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiningConfig;
    use tempfile::TempDir;

    struct Stack {
        _dir: TempDir,
        db: Arc<Database>,
        state: Arc<NodeState>,
        events: EventBroadcaster,
        processor: TransactionProcessor,
    }

    fn stack() -> Stack {
        stack_with(&ProcessorConfig::default())
    }

    fn stack_with(config: &ProcessorConfig) -> Stack {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let db = Arc::new(Database::open(path.to_str().unwrap()).unwrap());
        let alerts = Arc::new(AlertSink::default());
        let ledger = Arc::new(AddressLedger::new(Arc::clone(&alerts), "l"));
        let state = Arc::new(NodeState::load(&db.conn(), &MiningConfig::default()).unwrap());
        let events = EventBroadcaster::new();
        let processor = TransactionProcessor::new(
            Arc::clone(&db),
            ledger,
            Arc::clone(&state),
            alerts,
            events.clone(),
            config,
            "l",
        );
        Stack {
            _dir: dir,
            db,
            state,
            events,
            processor,
        }
    }

    fn fund(db: &Database, address: &str, amount: u64) {
        let conn = db.conn();
        database::insert_account(&conn, address, amount, amount, None).unwrap();
    }

    #[tokio::test]
    async fn submit_moves_funds_and_publishes() {
        let s = stack();
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");
        fund(&s.db, &sender, 100);

        let mut rx = s.events.subscribe();
        let record = s
            .processor
            .submit(&sender, &recipient, 40, Some("note"), &Provenance::default())
            .await
            .unwrap();

        assert_eq!(record.from.as_deref(), Some(sender.as_str()));
        assert_eq!(record.to, recipient);
        assert_eq!(record.value, 40);
        assert_eq!(record.transaction_type(), TransactionType::Transfer);

        let sender_row = s.db.get_account(&sender).unwrap().unwrap();
        assert_eq!(sender_row.balance, 60);
        assert_eq!(sender_row.totalout, 40);
        let recipient_row = s.db.get_account(&recipient).unwrap().unwrap();
        assert_eq!(recipient_row.balance, 40);
        assert_eq!(recipient_row.totalin, 40);
        assert_eq!(recipient_row.totalout, 0);

        // Post-commit hooks already ran by the time submit returned.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_name(), "transaction");
        assert_eq!(s.processor.stats().transfer, 1);
        assert_eq!(s.processor.stats().rollbacks, 0);
    }

    #[tokio::test]
    async fn submit_refused_while_transactions_disabled() {
        let s = stack();
        let sender = crypto::make_v2_address("alpha", "l");
        fund(&s.db, &sender, 100);

        let err = s
            .processor
            .submit(&sender, &sender, 10, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::TransactionsDisabled);
    }

    #[tokio::test]
    async fn submit_validates_parameters() {
        let s = stack();
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");
        fund(&s.db, &sender, 100);

        let err = s
            .processor
            .submit(&sender, &recipient, 0, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidParameter("amount".to_string()));

        let err = s
            .processor
            .submit(&sender, "not an address", 5, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidParameter("to".to_string()));

        let oversized = "m".repeat(METADATA_MAX_LENGTH + 1);
        let err = s
            .processor
            .submit(&sender, &recipient, 5, Some(&oversized), &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidParameter("metadata".to_string()));
    }

    #[tokio::test]
    async fn submit_normalizes_recipient_case_and_whitespace() {
        let s = stack();
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");
        fund(&s.db, &sender, 100);

        let shouted = format!("  {}  ", recipient.to_uppercase());
        let record = s
            .processor
            .submit(&sender, &shouted, 5, None, &Provenance::default())
            .await
            .unwrap();
        assert_eq!(record.to, recipient);
        assert!(s.db.get_account(&recipient).unwrap().is_some());
    }

    #[tokio::test]
    async fn submit_rejects_shortfall_without_writing() {
        let s = stack();
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");
        fund(&s.db, &sender, 10);

        let err = s
            .processor
            .submit(&sender, &recipient, 50, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds);
        assert_eq!(s.db.count_transactions().unwrap(), 0);
        assert!(s.db.get_account(&recipient).unwrap().is_none());
    }

    #[tokio::test]
    async fn submit_fails_fast_when_the_queue_is_saturated() {
        let s = stack_with(&ProcessorConfig {
            max_concurrency: 1,
            queue_timeout_secs: 0,
        });
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");
        fund(&s.db, &sender, 100);

        // Hold the only permit so the zero-second admission wait expires
        let permit = Arc::clone(&s.processor.queue)
            .acquire_owned()
            .await
            .unwrap();
        let err = s
            .processor
            .submit(&sender, &recipient, 5, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::QueueOverloaded);
        assert_eq!(
            err.http_status(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(s.db.count_transactions().unwrap(), 0);

        drop(permit);
        let record = s
            .processor
            .submit(&sender, &recipient, 5, None, &Provenance::default())
            .await
            .unwrap();
        assert_eq!(record.value, 5);
        assert_eq!(s.db.count_transactions().unwrap(), 1);
    }

    #[tokio::test]
    async fn submit_unknown_sender_is_not_found() {
        let s = stack();
        s.state
            .set_transactions_enabled(&s.db.conn(), true)
            .unwrap();
        let sender = crypto::make_v2_address("alpha", "l");
        let recipient = crypto::make_v2_address("beta", "l");

        let err = s
            .processor
            .submit(&sender, &recipient, 5, None, &Provenance::default())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AddressNotFound(sender));
    }

    #[tokio::test]
    async fn create_transaction_counts_mined_rewards() {
        let s = stack();
        let solver = crypto::make_v2_address("miner", "l");
        let mut rx = s.events.subscribe();

        {
            let conn = s.db.conn();
            let mut tx = LedgerTx::begin(&conn).unwrap();
            let new = NewTransaction {
                from: None,
                to: &solver,
                value: 25,
                name: None,
                metadata: None,
                sent_metaname: None,
                sent_name: None,
                provenance: &Provenance::default(),
            };
            let record = s.processor.create_transaction(&mut tx, &new).unwrap();
            assert_eq!(record.transaction_type(), TransactionType::Mined);
            tx.commit().unwrap();
        }

        assert_eq!(s.processor.stats().mined, 1);
        assert_eq!(rx.try_recv().unwrap().event_name(), "transaction");
    }

    #[tokio::test]
    async fn dropped_transaction_counts_rollback_and_stays_silent() {
        let s = stack();
        let solver = crypto::make_v2_address("miner", "l");
        let mut rx = s.events.subscribe();

        {
            let conn = s.db.conn();
            let mut tx = LedgerTx::begin(&conn).unwrap();
            let new = NewTransaction {
                from: None,
                to: &solver,
                value: 25,
                name: None,
                metadata: None,
                sent_metaname: None,
                sent_name: None,
                provenance: &Provenance::default(),
            };
            s.processor.create_transaction(&mut tx, &new).unwrap();
            // Dropped without commit
        }

        assert_eq!(s.processor.stats().rollbacks, 1);
        assert_eq!(s.processor.stats().mined, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(s.db.count_transactions().unwrap(), 0);
    }
}
