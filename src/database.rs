//! SQLite persistence layer for Lodestone
//!
//! All storage goes through a single `Connection` behind a mutex. Row
//! operations are free functions over `&Connection` so they compose inside
//! an open [`LedgerTx`]; the `Database` methods are lock-and-read wrappers
//! for single-shot callers.

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{LedgerError, Result};
use crate::types::{Account, Block, Name, Provenance, Transaction};

const TRANSACTION_COLUMNS: &str =
    r#"id, "from", "to", value, time, name, metadata, sent_metaname, sent_name, origin, useragent"#;
const BLOCK_COLUMNS: &str =
    "height, hash, address, nonce, value, time, difficulty, x, y, z, origin, useragent";
const ACCOUNT_COLUMNS: &str =
    "id, address, balance, totalin, totalout, firstseen, credential, locked, alert";
const NAME_COLUMNS: &str = "id, name, owner, original_owner, registered, updated, a, unpaid";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database at `path` and ensures the schema
    /// exists. `:memory:` is accepted for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Database(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                balance INTEGER NOT NULL DEFAULT 0,
                totalin INTEGER NOT NULL DEFAULT 0,
                totalout INTEGER NOT NULL DEFAULT 0,
                firstseen TEXT NOT NULL,
                credential TEXT,
                locked INTEGER NOT NULL DEFAULT 0,
                alert TEXT
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                "from" TEXT,
                "to" TEXT NOT NULL,
                value INTEGER NOT NULL,
                time TEXT NOT NULL,
                name TEXT,
                metadata TEXT,
                sent_metaname TEXT,
                sent_name TEXT,
                origin TEXT,
                useragent TEXT
            );
            CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                nonce BLOB NOT NULL,
                value INTEGER NOT NULL,
                time TEXT NOT NULL,
                difficulty INTEGER NOT NULL,
                x INTEGER,
                y INTEGER,
                z INTEGER,
                origin TEXT,
                useragent TEXT
            );
            CREATE TABLE IF NOT EXISTS names (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                original_owner TEXT,
                registered TEXT NOT NULL,
                updated TEXT,
                a TEXT,
                unpaid INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions ("from");
            CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions ("to");
            CREATE INDEX IF NOT EXISTS idx_blocks_attempt ON blocks (address, nonce);
            CREATE INDEX IF NOT EXISTS idx_names_owner ON names (owner);
            "#,
        )
        .map_err(|e| LedgerError::Database(format!("failed to create schema: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Locks the connection for a multi-statement flow. Callers must not
    /// re-enter `Database` methods while holding the guard.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn get_account(&self, address: &str) -> Result<Option<Account>> {
        get_account(&self.conn.lock(), address)
    }

    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        get_transaction(&self.conn.lock(), id)
    }

    pub fn list_transactions(
        &self,
        limit: i64,
        offset: i64,
        newest_first: bool,
    ) -> Result<Vec<Transaction>> {
        list_transactions(&self.conn.lock(), limit, offset, newest_first)
    }

    pub fn count_transactions(&self) -> Result<u64> {
        count_transactions(&self.conn.lock())
    }

    pub fn transactions_for_address(
        &self,
        address: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>> {
        transactions_for_address(&self.conn.lock(), address, limit, offset)
    }

    pub fn count_transactions_for_address(&self, address: &str) -> Result<u64> {
        count_transactions_for_address(&self.conn.lock(), address)
    }

    pub fn get_block(&self, height: u64) -> Result<Option<Block>> {
        get_block(&self.conn.lock(), height)
    }

    pub fn latest_block(&self) -> Result<Option<Block>> {
        latest_block(&self.conn.lock())
    }

    pub fn list_blocks(&self, limit: i64, offset: i64, newest_first: bool) -> Result<Vec<Block>> {
        list_blocks(&self.conn.lock(), limit, offset, newest_first)
    }

    pub fn count_blocks(&self) -> Result<u64> {
        count_blocks(&self.conn.lock())
    }

    pub fn count_names_owned(&self, address: &str) -> Result<u64> {
        count_names_owned(&self.conn.lock(), address)
    }

    pub fn total_supply(&self) -> Result<u64> {
        total_supply(&self.conn.lock())
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// A storage transaction carrying staged side effects. Hooks registered
/// with [`on_commit`](LedgerTx::on_commit) run only after the underlying
/// SQLite transaction commits; dropping the wrapper without committing
/// rolls the transaction back and runs the rollback hooks instead. Event
/// publication and counter bumps are staged this way so nothing observable
/// leaks from a transaction that never committed.
pub struct LedgerTx<'conn> {
    tx: Option<rusqlite::Transaction<'conn>>,
    commit_hooks: Vec<Hook>,
    rollback_hooks: Vec<Hook>,
}

impl<'conn> LedgerTx<'conn> {
    pub fn begin(conn: &'conn Connection) -> Result<Self> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| LedgerError::Database(format!("failed to begin transaction: {}", e)))?;
        Ok(LedgerTx {
            tx: Some(tx),
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
        })
    }

    /// The open SQLite transaction, for row operations. Derefs to
    /// `&Connection`, so every free function in this module works on it.
    pub fn sql(&self) -> &rusqlite::Transaction<'conn> {
        // Present from begin() until commit(); drop() is the only taker.
        self.tx.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn on_commit<F: FnOnce() + Send + 'static>(&mut self, hook: F) {
        self.commit_hooks.push(Box::new(hook));
    }

    pub fn on_rollback<F: FnOnce() + Send + 'static>(&mut self, hook: F) {
        self.rollback_hooks.push(Box::new(hook));
    }

    pub fn commit(mut self) -> Result<()> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        match tx.commit() {
            Ok(()) => {
                self.rollback_hooks.clear();
                for hook in self.commit_hooks.drain(..) {
                    hook();
                }
                Ok(())
            }
            Err(e) => {
                self.commit_hooks.clear();
                for hook in self.rollback_hooks.drain(..) {
                    hook();
                }
                Err(LedgerError::Database(format!("commit failed: {}", e)))
            }
        }
    }
}

impl Drop for LedgerTx<'_> {
    fn drop(&mut self) {
        // An uncommitted inner transaction rolls back when dropped.
        if self.tx.take().is_some() {
            for hook in self.rollback_hooks.drain(..) {
                hook();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts

fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        address: row.get(1)?,
        balance: row.get(2)?,
        totalin: row.get(3)?,
        totalout: row.get(4)?,
        firstseen: row.get(5)?,
        credential: row.get(6)?,
        locked: row.get(7)?,
        alert: row.get(8)?,
    })
}

pub fn get_account(conn: &Connection, address: &str) -> Result<Option<Account>> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM addresses WHERE address = ?1");
    let account = conn
        .query_row(&sql, params![address], row_to_account)
        .optional()?;
    Ok(account)
}

/// Creates an account row. `balance`/`totalin` start equal for accounts
/// created by an incoming transfer; both are zero for auth-created rows.
pub fn insert_account(
    conn: &Connection,
    address: &str,
    balance: u64,
    totalin: u64,
    credential: Option<&str>,
) -> Result<Account> {
    let firstseen = Utc::now();
    conn.execute(
        "INSERT INTO addresses (address, balance, totalin, totalout, firstseen, credential)
         VALUES (?1, ?2, ?3, 0, ?4, ?5)",
        params![address, balance, totalin, firstseen, credential],
    )?;
    Ok(Account {
        id: conn.last_insert_rowid(),
        address: address.to_string(),
        balance,
        totalin,
        totalout: 0,
        firstseen,
        credential: credential.map(str::to_string),
        locked: false,
        alert: None,
    })
}

pub fn apply_debit(conn: &Connection, address: &str, amount: u64) -> Result<()> {
    conn.execute(
        "UPDATE addresses SET balance = balance - ?1, totalout = totalout + ?1 WHERE address = ?2",
        params![amount, address],
    )?;
    Ok(())
}

pub fn apply_credit(conn: &Connection, address: &str, amount: u64) -> Result<()> {
    conn.execute(
        "UPDATE addresses SET balance = balance + ?1, totalin = totalin + ?1 WHERE address = ?2",
        params![amount, address],
    )?;
    Ok(())
}

pub fn set_credential(conn: &Connection, address: &str, credential: &str) -> Result<()> {
    conn.execute(
        "UPDATE addresses SET credential = ?1 WHERE address = ?2",
        params![credential, address],
    )?;
    Ok(())
}

/// Operator controls, also used to stage locked accounts in tests.
pub fn set_account_flags(
    conn: &Connection,
    address: &str,
    locked: bool,
    alert: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE addresses SET locked = ?1, alert = ?2 WHERE address = ?3",
        params![locked, alert, address],
    )?;
    Ok(())
}

pub fn total_supply(conn: &Connection) -> Result<u64> {
    let supply = conn.query_row(
        "SELECT COALESCE(SUM(balance), 0) FROM addresses",
        [],
        |row| row.get(0),
    )?;
    Ok(supply)
}

// ---------------------------------------------------------------------------
// Transactions

/// Column values for a transaction row about to be inserted.
pub struct NewTransaction<'a> {
    pub from: Option<&'a str>,
    pub to: &'a str,
    pub value: u64,
    pub name: Option<&'a str>,
    pub metadata: Option<&'a str>,
    pub sent_metaname: Option<&'a str>,
    pub sent_name: Option<&'a str>,
    pub provenance: &'a Provenance,
}

fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        value: row.get(3)?,
        time: row.get(4)?,
        name: row.get(5)?,
        metadata: row.get(6)?,
        sent_metaname: row.get(7)?,
        sent_name: row.get(8)?,
        origin: row.get(9)?,
        useragent: row.get(10)?,
    })
}

pub fn insert_transaction(conn: &Connection, new: &NewTransaction) -> Result<Transaction> {
    let time = Utc::now();
    conn.execute(
        r#"INSERT INTO transactions ("from", "to", value, time, name, metadata, sent_metaname, sent_name, origin, useragent)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
        params![
            new.from,
            new.to,
            new.value,
            time,
            new.name,
            new.metadata,
            new.sent_metaname,
            new.sent_name,
            new.provenance.origin,
            new.provenance.useragent,
        ],
    )?;
    Ok(Transaction {
        id: conn.last_insert_rowid(),
        from: new.from.map(str::to_string),
        to: new.to.to_string(),
        value: new.value,
        time,
        name: new.name.map(str::to_string),
        metadata: new.metadata.map(str::to_string),
        sent_metaname: new.sent_metaname.map(str::to_string),
        sent_name: new.sent_name.map(str::to_string),
        origin: new.provenance.origin.clone(),
        useragent: new.provenance.useragent.clone(),
    })
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
    let tx = conn
        .query_row(&sql, params![id], row_to_transaction)
        .optional()?;
    Ok(tx)
}

pub fn list_transactions(
    conn: &Connection,
    limit: i64,
    offset: i64,
    newest_first: bool,
) -> Result<Vec<Transaction>> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions ORDER BY id {order} LIMIT ?1 OFFSET ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit, offset], row_to_transaction)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_transactions(conn: &Connection) -> Result<u64> {
    let count = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

pub fn transactions_for_address(
    conn: &Connection,
    address: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Transaction>> {
    let sql = format!(
        r#"SELECT {TRANSACTION_COLUMNS} FROM transactions
           WHERE "from" = ?1 OR "to" = ?1
           ORDER BY id DESC LIMIT ?2 OFFSET ?3"#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![address, limit, offset], row_to_transaction)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_transactions_for_address(conn: &Connection, address: &str) -> Result<u64> {
    let count = conn.query_row(
        r#"SELECT COUNT(*) FROM transactions WHERE "from" = ?1 OR "to" = ?1"#,
        params![address],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Blocks

/// Column values for a block row about to be inserted.
pub struct NewBlock<'a> {
    pub height: u64,
    pub hash: &'a str,
    pub address: &'a str,
    pub nonce: &'a [u8],
    pub value: u64,
    pub difficulty: u64,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
    pub provenance: &'a Provenance,
}

fn row_to_block(row: &Row) -> rusqlite::Result<Block> {
    Ok(Block {
        height: row.get(0)?,
        hash: row.get(1)?,
        address: row.get(2)?,
        nonce: row.get(3)?,
        value: row.get(4)?,
        time: row.get(5)?,
        difficulty: row.get(6)?,
        x: row.get(7)?,
        y: row.get(8)?,
        z: row.get(9)?,
        origin: row.get(10)?,
        useragent: row.get(11)?,
    })
}

pub fn insert_block(conn: &Connection, new: &NewBlock) -> Result<Block> {
    let time = Utc::now();
    conn.execute(
        "INSERT INTO blocks (height, hash, address, nonce, value, time, difficulty, x, y, z, origin, useragent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            new.height,
            new.hash,
            new.address,
            new.nonce,
            new.value,
            time,
            new.difficulty,
            new.x,
            new.y,
            new.z,
            new.provenance.origin,
            new.provenance.useragent,
        ],
    )?;
    Ok(Block {
        height: new.height,
        hash: new.hash.to_string(),
        address: new.address.to_string(),
        nonce: new.nonce.to_vec(),
        value: new.value,
        time,
        difficulty: new.difficulty,
        x: new.x,
        y: new.y,
        z: new.z,
        origin: new.provenance.origin.clone(),
        useragent: new.provenance.useragent.clone(),
    })
}

pub fn get_block(conn: &Connection, height: u64) -> Result<Option<Block>> {
    let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE height = ?1");
    let block = conn
        .query_row(&sql, params![height], row_to_block)
        .optional()?;
    Ok(block)
}

pub fn latest_block(conn: &Connection) -> Result<Option<Block>> {
    let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY height DESC LIMIT 1");
    let block = conn.query_row(&sql, [], row_to_block).optional()?;
    Ok(block)
}

pub fn list_blocks(
    conn: &Connection,
    limit: i64,
    offset: i64,
    newest_first: bool,
) -> Result<Vec<Block>> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let sql =
        format!("SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY height {order} LIMIT ?1 OFFSET ?2");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit, offset], row_to_block)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_blocks(conn: &Connection) -> Result<u64> {
    let count = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
    Ok(count)
}

pub fn block_hash_exists(conn: &Connection, hash: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM blocks WHERE hash = ?1)",
        params![hash],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// True when an identical submission tuple was already accepted. Stale
/// miners resubmitting old work after the chain advanced hit this.
pub fn attempt_exists(
    conn: &Connection,
    address: &str,
    nonce: &[u8],
    x: Option<i64>,
    y: Option<i64>,
    z: Option<i64>,
) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM blocks
         WHERE address = ?1 AND nonce = ?2 AND x IS ?3 AND y IS ?4 AND z IS ?5)",
        params![address, nonce, x, y, z],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

// ---------------------------------------------------------------------------
// Names

fn row_to_name(row: &Row) -> rusqlite::Result<Name> {
    Ok(Name {
        id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        original_owner: row.get(3)?,
        registered: row.get(4)?,
        updated: row.get(5)?,
        a: row.get(6)?,
        unpaid: row.get(7)?,
    })
}

pub fn insert_name(conn: &Connection, name: &str, owner: &str, unpaid: u64) -> Result<Name> {
    let registered = Utc::now();
    conn.execute(
        "INSERT INTO names (name, owner, original_owner, registered, unpaid)
         VALUES (?1, ?2, ?2, ?3, ?4)",
        params![name, owner, registered, unpaid],
    )?;
    Ok(Name {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        owner: owner.to_string(),
        original_owner: Some(owner.to_string()),
        registered,
        updated: None,
        a: None,
        unpaid,
    })
}

pub fn get_name(conn: &Connection, name: &str) -> Result<Option<Name>> {
    let sql = format!("SELECT {NAME_COLUMNS} FROM names WHERE name = ?1");
    let name = conn.query_row(&sql, params![name], row_to_name).optional()?;
    Ok(name)
}

pub fn count_names_owned(conn: &Connection, address: &str) -> Result<u64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM names WHERE owner = ?1",
        params![address],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_unpaid_names(conn: &Connection) -> Result<u64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM names WHERE unpaid > 0",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Decrements every unpaid name by one, never below zero. Returns the
/// number of names that were still owed when the call was made.
pub fn decrement_unpaid_names(conn: &Connection) -> Result<usize> {
    let changed = conn.execute("UPDATE names SET unpaid = unpaid - 1 WHERE unpaid > 0", [])?;
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Node state

pub fn state_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn state_put(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}
