//! Core ledger records for Lodestone
//!
//! Row types for accounts, transactions, blocks and names, plus their
//! public JSON shapes. The JSON mappers are the only way records leave the
//! node, so internal columns (credential hashes, lock flags, operator
//! alerts, request provenance) stay out of them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::SHORT_HASH_LENGTH;

/// Recipient marker for name purchase transactions.
pub const NAME_MARKER: &str = "name";
/// Recipient marker for name record update transactions.
pub const RECORD_MARKER: &str = "a";

pub fn time_json(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A ledger account. Created lazily on first incoming transfer or first
/// successful authentication, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub address: String,
    pub balance: u64,
    /// Lifetime credit counter, append-only.
    pub totalin: u64,
    /// Lifetime debit counter, append-only. Rewards bypass it.
    pub totalout: u64,
    pub firstseen: DateTime<Utc>,
    /// SHA-256 of address + private key, set on first claim.
    pub credential: Option<String>,
    pub locked: bool,
    /// Operator note attached to the account, shown to its owner only.
    pub alert: Option<String>,
}

impl Account {
    /// Public JSON shape. `credential`, `locked` and `alert` never appear.
    pub fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "balance": self.balance,
            "totalin": self.totalin,
            "totalout": self.totalout,
            "firstseen": time_json(&self.firstseen),
        })
    }

    /// Public JSON plus the count of names the account owns.
    pub fn to_json_with_names(&self, names: u64) -> Value {
        let mut value = self.to_json();
        value["names"] = json!(names);
        value
    }
}

/// Classification of a transaction by payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Mined,
    NamePurchase,
    NameARecord,
    NameTransfer,
    Transfer,
    Unknown,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Mined => "mined",
            TransactionType::NamePurchase => "name_purchase",
            TransactionType::NameARecord => "name_a_record",
            TransactionType::NameTransfer => "name_transfer",
            TransactionType::Transfer => "transfer",
            TransactionType::Unknown => "unknown",
        }
    }
}

/// A single ledger movement. Reward transactions have `from = None`; name
/// operations carry the name and use the marker recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub from: Option<String>,
    pub to: String,
    pub value: u64,
    pub time: DateTime<Utc>,
    pub name: Option<String>,
    pub metadata: Option<String>,
    pub sent_metaname: Option<String>,
    pub sent_name: Option<String>,
    /// Request provenance, stored but never serialized to clients.
    pub origin: Option<String>,
    pub useragent: Option<String>,
}

impl Transaction {
    pub fn transaction_type(&self) -> TransactionType {
        match (&self.from, &self.name) {
            (None, _) => TransactionType::Mined,
            (Some(_), Some(_)) if self.to == NAME_MARKER => TransactionType::NamePurchase,
            (Some(_), Some(_)) if self.to == RECORD_MARKER => TransactionType::NameARecord,
            (Some(_), Some(_)) => TransactionType::NameTransfer,
            // A marker recipient without a name attached matches no known
            // operation shape.
            (Some(_), None) if self.to == NAME_MARKER || self.to == RECORD_MARKER => {
                TransactionType::Unknown
            }
            (Some(_), None) => TransactionType::Transfer,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "from": self.from,
            "to": self.to,
            "value": self.value,
            "time": time_json(&self.time),
            "name": self.name,
            "metadata": self.metadata,
            "sent_metaname": self.sent_metaname,
            "sent_name": self.sent_name,
            "type": self.transaction_type().as_str(),
        })
    }
}

/// An accepted proof-of-work submission. `difficulty` records the live work
/// value at the moment of acceptance; coordinates are absent only on the
/// genesis block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    /// Address credited with the reward.
    pub address: String,
    pub nonce: Vec<u8>,
    pub value: u64,
    pub time: DateTime<Utc>,
    pub difficulty: u64,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
    pub origin: Option<String>,
    pub useragent: Option<String>,
}

impl Block {
    pub fn short_hash(&self) -> &str {
        self.hash.get(..SHORT_HASH_LENGTH).unwrap_or(&self.hash)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "height": self.height,
            "address": self.address,
            "hash": self.hash,
            "short_hash": self.short_hash(),
            "value": self.value,
            "time": time_json(&self.time),
            "difficulty": self.difficulty,
            "x": self.x,
            "y": self.y,
            "z": self.z,
        })
    }
}

/// A registered name. `unpaid` counts down by one on every accepted block;
/// while positive, the name contributes one coin to each block reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Name {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub original_owner: Option<String>,
    pub registered: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    /// Data record attached to the name, if any.
    pub a: Option<String>,
    pub unpaid: u64,
}

impl Name {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "owner": self.owner,
            "original_owner": self.original_owner,
            "registered": time_json(&self.registered),
            "updated": self.updated.as_ref().map(time_json),
            "a": self.a,
            "unpaid": self.unpaid,
        })
    }
}

/// Request provenance captured from HTTP headers and stored alongside the
/// records a request creates.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub origin: Option<String>,
    pub useragent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_tx() -> Transaction {
        Transaction {
            id: 1,
            from: Some("l8juvewcui".to_string()),
            to: "lqxl3dzg5p".to_string(),
            value: 10,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            name: None,
            metadata: None,
            sent_metaname: None,
            sent_name: None,
            origin: None,
            useragent: None,
        }
    }

    #[test]
    fn classifies_plain_transfer() {
        assert_eq!(base_tx().transaction_type(), TransactionType::Transfer);
    }

    #[test]
    fn classifies_reward_as_mined() {
        let mut tx = base_tx();
        tx.from = None;
        assert_eq!(tx.transaction_type(), TransactionType::Mined);
    }

    #[test]
    fn classifies_name_operations() {
        let mut purchase = base_tx();
        purchase.to = NAME_MARKER.to_string();
        purchase.name = Some("example".to_string());
        assert_eq!(purchase.transaction_type(), TransactionType::NamePurchase);

        let mut record = base_tx();
        record.to = RECORD_MARKER.to_string();
        record.name = Some("example".to_string());
        assert_eq!(record.transaction_type(), TransactionType::NameARecord);

        let mut transfer = base_tx();
        transfer.name = Some("example".to_string());
        assert_eq!(transfer.transaction_type(), TransactionType::NameTransfer);
    }

    #[test]
    fn marker_recipient_without_name_is_unknown() {
        let mut tx = base_tx();
        tx.to = NAME_MARKER.to_string();
        assert_eq!(tx.transaction_type(), TransactionType::Unknown);
    }

    #[test]
    fn transaction_json_hides_provenance() {
        let mut tx = base_tx();
        tx.origin = Some("https://example.com".to_string());
        tx.useragent = Some("TestAgent/1.0".to_string());
        let json = tx.to_json();
        assert_eq!(json["type"], "transfer");
        assert_eq!(json["from"], "l8juvewcui");
        assert!(json.get("origin").is_none());
        assert!(json.get("useragent").is_none());
    }

    #[test]
    fn account_json_hides_internal_fields() {
        let account = Account {
            id: 3,
            address: "l8juvewcui".to_string(),
            balance: 500,
            totalin: 600,
            totalout: 100,
            firstseen: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            credential: Some("aabbcc".to_string()),
            locked: true,
            alert: Some("flagged".to_string()),
        };
        let json = account.to_json();
        assert_eq!(json["address"], "l8juvewcui");
        assert_eq!(json["balance"], 500);
        assert!(json.get("id").is_none());
        assert!(json.get("credential").is_none());
        assert!(json.get("locked").is_none());
        assert!(json.get("alert").is_none());

        let with_names = account.to_json_with_names(2);
        assert_eq!(with_names["names"], 2);
    }

    #[test]
    fn block_short_hash_is_twelve_chars() {
        let block = Block {
            height: 2,
            hash: "00480dc35dc111d9953e5182df7d7f404a62d2b0d71ed51a873a81d89e78fbd8"
                .to_string(),
            address: "l8juvewcui".to_string(),
            nonce: b"abc".to_vec(),
            value: 25,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            difficulty: 100_000,
            x: Some(1),
            y: Some(-2),
            z: Some(3),
            origin: None,
            useragent: None,
        };
        assert_eq!(block.short_hash(), "00480dc35dc1");
        let json = block.to_json();
        assert_eq!(json["short_hash"], "00480dc35dc1");
        assert_eq!(json["time"], "2024-05-01T12:00:00.000Z");
        assert_eq!(json["x"], 1);
    }
}
