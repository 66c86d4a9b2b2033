//! Integration tests for transfer behavior under concurrency and at balance
//! boundaries, driven through a fully wired node.

use lodestone::config::Config;
use lodestone::crypto::make_v2_address;
use lodestone::database;
use lodestone::error::LedgerError;
use lodestone::node::Node;
use lodestone::types::Provenance;
use std::sync::Arc;
use tempfile::TempDir;

fn ledger_node() -> (TempDir, Arc<Node>) {
    let dir = TempDir::new().expect("tempdir");
    let mut config = Config::default();
    config.database.path = dir
        .path()
        .join("ledger.db")
        .to_str()
        .expect("utf8 path")
        .to_string();
    let node = Arc::new(Node::init(config).expect("node init"));
    node.state
        .set_transactions_enabled(&node.db.conn(), true)
        .expect("enable transactions");
    (dir, node)
}

fn fund(node: &Node, privatekey: &str, balance: u64) -> String {
    let conn = node.db.conn();
    let account = node.ledger.authenticate(&conn, privatekey).expect("auth");
    if balance > 0 {
        database::apply_credit(&conn, &account.address, balance).expect("fund");
    }
    account.address
}

#[tokio::test]
async fn concurrent_spends_never_overdraw() {
    let (_dir, node) = ledger_node();
    let sender = fund(&node, "hoard", 100);

    // Ten racing 30-unit spends from a 100-unit balance: exactly three can
    // clear, however they interleave.
    let mut handles = Vec::new();
    for i in 0..10 {
        let node = Arc::clone(&node);
        let sender = sender.clone();
        let recipient = make_v2_address(&format!("payee-{}", i), "l");
        handles.push(tokio::spawn(async move {
            node.processor
                .submit(&sender, &recipient, 30, None, &Provenance::default())
                .await
        }));
    }

    let mut accepted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(_) => accepted += 1,
            Err(LedgerError::InsufficientFunds) => refused += 1,
            Err(other) => panic!("unexpected failure: {:?}", other),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(refused, 7);

    let account = node.db.get_account(&sender).expect("query").expect("row");
    assert_eq!(account.balance, 10);
    assert_eq!(account.totalout, 90);
    assert_eq!(node.db.count_transactions().expect("count"), 3);
    assert_eq!(
        node.db.total_supply().expect("supply"),
        100,
        "transfers move value, never mint it"
    );
}

#[tokio::test]
async fn boundary_amounts_and_metadata_length() {
    let (_dir, node) = ledger_node();
    let sender = fund(&node, "edge", 100);
    let recipient = make_v2_address("edge-payee", "l");

    let err = node
        .processor
        .submit(&sender, &recipient, 0, None, &Provenance::default())
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::InvalidParameter("amount".to_string()));

    let long = "m".repeat(255);
    node.processor
        .submit(&sender, &recipient, 100, Some(&long), &Provenance::default())
        .await
        .expect("spend the whole balance with max metadata");

    let too_long = "m".repeat(256);
    let err = node
        .processor
        .submit(&sender, &recipient, 1, Some(&too_long), &Provenance::default())
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::InvalidParameter("metadata".to_string()));

    let err = node
        .processor
        .submit(&sender, &recipient, 1, None, &Provenance::default())
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::InsufficientFunds, "balance is exhausted");

    let account = node.db.get_account(&sender).expect("query").expect("row");
    assert_eq!(account.balance, 0);
}

#[tokio::test]
async fn recipients_are_normalized_and_created_lazily() {
    let (_dir, node) = ledger_node();
    let sender = fund(&node, "tidy", 50);
    let recipient = make_v2_address("fresh-payee", "l");
    let sloppy = format!("  {}  ", recipient.to_uppercase());

    assert!(node.db.get_account(&recipient).expect("query").is_none());

    let record = node
        .processor
        .submit(&sender, &sloppy, 20, None, &Provenance::default())
        .await
        .expect("transfer");
    assert_eq!(record.to, recipient, "stored form is trimmed and lowercased");

    let created = node
        .db
        .get_account(&recipient)
        .expect("query")
        .expect("created on first credit");
    assert_eq!(created.balance, 20);
    assert_eq!(created.totalin, 20);
    assert_eq!(created.totalout, 0);
    assert!(created.credential.is_none(), "unclaimed until first login");

    // The row can be claimed later by whoever holds the matching key
    let claimed = {
        let conn = node.db.conn();
        node.ledger.authenticate(&conn, "fresh-payee").expect("claim")
    };
    assert_eq!(claimed.address, recipient);
    assert_eq!(claimed.balance, 20);
    assert!(claimed.credential.is_some());
}
