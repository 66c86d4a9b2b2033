//! Account ledger for Lodestone
//!
//! Balance movements between accounts. Every transfer runs while holding
//! the sender's per-address guard inside an open storage transaction, so
//! two concurrent spends from one account can never both pass the balance
//! check. Accounts are created lazily, on first incoming transfer or first
//! successful authentication, and never deleted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::alerts::AlertSink;
use crate::crypto::{credential_hash, make_v2_address};
use crate::database::{self, LedgerTx, NewTransaction};
use crate::error::{LedgerError, Result};
use crate::types::{Account, Provenance, Transaction};

// Idle guard entries are swept once the registry grows past this.
const GUARD_SWEEP_THRESHOLD: usize = 1024;

/// Optional payload riding on a transfer.
#[derive(Debug, Default)]
pub struct TransferPayload<'a> {
    pub name: Option<&'a str>,
    pub metadata: Option<&'a str>,
    pub sent_metaname: Option<&'a str>,
    pub sent_name: Option<&'a str>,
}

pub struct AddressLedger {
    guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    alerts: Arc<AlertSink>,
    prefix: String,
}

impl AddressLedger {
    pub fn new(alerts: Arc<AlertSink>, prefix: &str) -> Self {
        AddressLedger {
            guards: Mutex::new(HashMap::new()),
            alerts,
            prefix: prefix.to_string(),
        }
    }

    /// Acquires the guard serializing spends from `address`. The guard must
    /// be held across the whole storage transaction that moves the funds.
    pub async fn lock_address(&self, address: &str) -> OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.guards.lock();
            if guards.len() > GUARD_SWEEP_THRESHOLD {
                guards.retain(|_, g| Arc::strong_count(g) > 1);
            }
            guards
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        guard.lock_owned().await
    }

    /// Moves `amount` from `from` to `to` inside the caller's open storage
    /// transaction, creating the recipient if needed, and records exactly
    /// one transaction row. The caller holds the sender's guard; the
    /// balance is re-verified here so a racing spend that slipped past an
    /// optimistic check still fails cleanly.
    pub fn transfer(
        &self,
        tx: &LedgerTx,
        from: &str,
        to: &str,
        amount: u64,
        payload: &TransferPayload<'_>,
        provenance: &Provenance,
    ) -> Result<Transaction> {
        let conn = tx.sql();

        let sender = database::get_account(conn, from)?
            .ok_or_else(|| LedgerError::AddressNotFound(from.to_string()))?;
        if sender.balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }

        database::apply_debit(conn, from, amount)?;

        match database::get_account(conn, to)? {
            Some(_) => database::apply_credit(conn, to, amount)?,
            None => {
                database::insert_account(conn, to, amount, amount, None)?;
            }
        }

        database::insert_transaction(
            conn,
            &NewTransaction {
                from: Some(from),
                to,
                value: amount,
                name: payload.name,
                metadata: payload.metadata,
                sent_metaname: payload.sent_metaname,
                sent_name: payload.sent_name,
                provenance,
            },
        )
    }

    /// Unconditionally credits `amount` to `address`, creating the account
    /// if needed. Only the block miner calls this; rewards do not touch
    /// `totalout` accounting anywhere.
    pub fn credit_reward(&self, tx: &LedgerTx, address: &str, amount: u64) -> Result<Account> {
        let conn = tx.sql();
        match database::get_account(conn, address)? {
            Some(mut account) => {
                database::apply_credit(conn, address, amount)?;
                account.balance += amount;
                account.totalin += amount;
                Ok(account)
            }
            None => database::insert_account(conn, address, amount, amount, None),
        }
    }

    /// Authenticates a private key, deriving its address. An unseen
    /// address is created on the spot; an existing address without a
    /// stored credential hash is claimed by the first successful login.
    /// Locked accounts and mismatched credentials fail, and every failure
    /// is reported to the alert sink.
    pub fn authenticate(&self, conn: &Connection, privatekey: &str) -> Result<Account> {
        let address = make_v2_address(privatekey, &self.prefix);
        let hash = credential_hash(&address, privatekey);
        debug!(%address, "auth attempt");

        match database::get_account(conn, &address)? {
            None => database::insert_account(conn, &address, 0, 0, Some(&hash)),
            Some(account) => match account.credential.as_deref() {
                Some(stored) => {
                    if !account.locked && stored == hash {
                        Ok(account)
                    } else {
                        let reason = if account.locked {
                            "locked"
                        } else {
                            "credential mismatch"
                        };
                        self.alerts.report(
                            &format!("auth failed on address {} ({})", address, reason),
                            false,
                        );
                        Err(LedgerError::AuthFailed)
                    }
                }
                None => {
                    database::set_credential(conn, &address, &hash)?;
                    Ok(Account {
                        credential: Some(hash),
                        ..account
                    })
                }
            },
        }
    }
}
