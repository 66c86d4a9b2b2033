//! Websocket session protocol.
//!
//! A connection arrives with a one-shot token already issued by
//! `POST /ws/start`. After redeeming it the session receives a hello frame
//! and then serves a JSON request/response protocol, interleaved with
//! subscribed ledger events and periodic keepalives. Guests can read;
//! mutating operations require the token to have been bound to an address.

use crate::database;
use crate::error::{LedgerError, Result};
use crate::gateway::events::{GatewayEvent, SubscriptionLevel};
use crate::node::Node;
use crate::types::{time_json, Provenance};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Drive one websocket connection to completion.
pub async fn run_session(
    node: Arc<Node>,
    mut socket: WebSocket,
    token: String,
    provenance: Provenance,
) {
    let address = match node.tokens.redeem(&token) {
        Ok(address) => address,
        Err(err) => {
            // The upgrade already happened, so the rejection goes over the
            // socket itself.
            let frame = json!({
                "ok": false,
                "type": "error",
                "error": err.error_code(),
                "message": err.to_string(),
            });
            let _ = socket.send(Message::Text(frame.to_string())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        address = %address.as_deref().unwrap_or("guest"),
        "websocket session opened"
    );

    let mut session = Session::new(Arc::clone(&node), address, provenance);
    let hello = session.hello_frame();
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let mut events = node.events.subscribe();
    let mut shutdown = node.shutdown.subscribe();
    let period = Duration::from_secs(node.config.gateway.keepalive_secs);
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = session.handle_request(&text).await;
                        if sink.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if session.wants(&event) {
                            let frame = event.to_frame();
                            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                let frame = json!({
                    "type": "keepalive",
                    "server_time": time_json(&Utc::now()),
                });
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!(
        address = %session.address.as_deref().unwrap_or("guest"),
        "websocket session closed"
    );
}

struct Session {
    node: Arc<Node>,
    /// `None` for guest sessions.
    address: Option<String>,
    levels: HashSet<SubscriptionLevel>,
    provenance: Provenance,
}

impl Session {
    fn new(node: Arc<Node>, address: Option<String>, provenance: Provenance) -> Self {
        Self {
            node,
            address,
            levels: SubscriptionLevel::defaults().into_iter().collect(),
            provenance,
        }
    }

    fn hello_frame(&self) -> Value {
        let last_block = {
            let conn = self.node.db.conn();
            database::latest_block(&conn)
                .ok()
                .flatten()
                .map(|block| block.to_json())
        };
        json!({
            "ok": true,
            "type": "hello",
            "server_time": time_json(&Utc::now()),
            "work": self.node.state.work(),
            "last_block": last_block,
        })
    }

    /// Whether the session's subscriptions deliver this event. A session
    /// receives an event at most once per publish, however many of its
    /// levels match.
    fn wants(&self, event: &GatewayEvent) -> bool {
        self.levels
            .iter()
            .any(|level| level.matches(event, self.address.as_deref()))
    }

    async fn handle_request(&mut self, text: &str) -> Value {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(_) => {
                return json!({
                    "ok": false,
                    "type": "error",
                    "error": "syntax_error",
                    "message": "Syntax error",
                });
            }
        };
        let id = parsed.get("id").cloned().unwrap_or(Value::Null);
        let msg_type = match parsed.get("type").and_then(Value::as_str) {
            Some(msg_type) => msg_type.to_string(),
            None => {
                let err = LedgerError::MissingParameter("type".to_string());
                return respond_error(&id, None, &err);
            }
        };
        match self.dispatch(&msg_type, &parsed).await {
            Ok(payload) => respond(&id, &msg_type, payload),
            Err(err) => respond_error(&id, Some(&msg_type), &err),
        }
    }

    async fn dispatch(&mut self, msg_type: &str, msg: &Value) -> Result<Value> {
        match msg_type {
            "work" => Ok(json!({ "work": self.node.state.work() })),
            "me" => self.me(),
            "address" => self.lookup_address(msg),
            "subscribe" => self.subscribe(msg),
            "unsubscribe" => self.unsubscribe(msg),
            "get_subscription_level" => Ok(json!({ "subscription_level": self.level_list() })),
            "make_transaction" => self.make_transaction(msg).await,
            _ => Err(LedgerError::InvalidParameter("type".to_string())),
        }
    }

    fn me(&self) -> Result<Value> {
        match &self.address {
            None => Ok(json!({ "isGuest": true })),
            Some(address) => {
                let account = self
                    .node
                    .db
                    .get_account(address)?
                    .ok_or_else(|| LedgerError::AddressNotFound(address.clone()))?;
                Ok(json!({ "isGuest": false, "address": account.to_json() }))
            }
        }
    }

    fn lookup_address(&self, msg: &Value) -> Result<Value> {
        let address = msg
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::MissingParameter("address".to_string()))?;
        let fetch_names = msg
            .get("fetchNames")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let account = self
            .node
            .db
            .get_account(address)?
            .ok_or_else(|| LedgerError::AddressNotFound(address.to_string()))?;
        let body = if fetch_names {
            let names = self.node.db.count_names_owned(address)?;
            account.to_json_with_names(names)
        } else {
            account.to_json()
        };
        Ok(json!({ "address": body }))
    }

    fn subscribe(&mut self, msg: &Value) -> Result<Value> {
        let level = parse_level(msg)?;
        self.levels.insert(level);
        Ok(json!({ "subscription_level": self.level_list() }))
    }

    fn unsubscribe(&mut self, msg: &Value) -> Result<Value> {
        let level = parse_level(msg)?;
        self.levels.remove(&level);
        Ok(json!({ "subscription_level": self.level_list() }))
    }

    async fn make_transaction(&self, msg: &Value) -> Result<Value> {
        let sender = self.address.as_deref().ok_or(LedgerError::AuthFailed)?;
        let to = msg
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::MissingParameter("to".to_string()))?;
        let amount = match msg.get("amount") {
            None | Some(Value::Null) => {
                return Err(LedgerError::MissingParameter("amount".to_string()));
            }
            Some(raw) => raw
                .as_u64()
                .ok_or_else(|| LedgerError::InvalidParameter("amount".to_string()))?,
        };
        let metadata = msg.get("metadata").and_then(Value::as_str);
        let record = self
            .node
            .processor
            .submit(sender, to, amount, metadata, &self.provenance)
            .await?;
        Ok(json!({ "transaction": record.to_json() }))
    }

    fn level_list(&self) -> Vec<&'static str> {
        let mut levels: Vec<&'static str> = self.levels.iter().map(|l| l.as_str()).collect();
        levels.sort_unstable();
        levels
    }
}

fn parse_level(msg: &Value) -> Result<SubscriptionLevel> {
    let raw = msg
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::MissingParameter("event".to_string()))?;
    SubscriptionLevel::parse(raw).ok_or_else(|| LedgerError::InvalidParameter("event".to_string()))
}

fn respond(id: &Value, responding_to: &str, payload: Value) -> Value {
    let mut frame = json!({
        "ok": true,
        "id": id,
        "type": "response",
        "responding_to": responding_to,
    });
    if let (Value::Object(frame_map), Value::Object(payload_map)) = (&mut frame, payload) {
        for (key, value) in payload_map {
            frame_map.insert(key, value);
        }
    }
    frame
}

fn respond_error(id: &Value, responding_to: Option<&str>, err: &LedgerError) -> Value {
    let mut frame = json!({
        "ok": false,
        "id": id,
        "type": "response",
        "error": err.error_code(),
        "message": err.to_string(),
    });
    if let Some(responding_to) = responding_to {
        frame["responding_to"] = Value::String(responding_to.to_string());
    }
    if let Some(parameter) = err.parameter() {
        frame["parameter"] = Value::String(parameter.to_string());
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto;
    use crate::miner::GENESIS_HASH;
    use crate::types::Block;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_node() -> (TempDir, Arc<Node>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.path = dir
            .path()
            .join("ledger.db")
            .to_str()
            .unwrap()
            .to_string();
        let node = Arc::new(Node::init(config).unwrap());
        (dir, node)
    }

    fn guest_session(node: &Arc<Node>) -> Session {
        Session::new(Arc::clone(node), None, Provenance::default())
    }

    fn authed_session(node: &Arc<Node>, address: &str) -> Session {
        Session::new(Arc::clone(node), Some(address.to_string()), Provenance::default())
    }

    #[tokio::test]
    async fn hello_frame_reports_work_and_chain_tip() {
        let (_dir, node) = test_node();
        let session = guest_session(&node);

        let hello = session.hello_frame();
        assert_eq!(hello["ok"], true);
        assert_eq!(hello["type"], "hello");
        assert!(hello["server_time"].is_string());
        assert_eq!(hello["work"], node.state.work());
        assert_eq!(hello["last_block"]["height"], 0);
        assert_eq!(hello["last_block"]["hash"], GENESIS_HASH);
    }

    #[tokio::test]
    async fn work_op_reports_live_work() {
        let (_dir, node) = test_node();
        let mut session = guest_session(&node);
        let reply = session
            .handle_request(r#"{"id": 1, "type": "work"}"#)
            .await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["responding_to"], "work");
        assert_eq!(reply["work"], node.state.work());
    }

    #[tokio::test]
    async fn malformed_json_gets_a_syntax_error_frame() {
        let (_dir, node) = test_node();
        let mut session = guest_session(&node);
        let reply = session.handle_request("not json {{").await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "syntax_error");
    }

    #[tokio::test]
    async fn missing_and_unknown_types_are_parameter_errors() {
        let (_dir, node) = test_node();
        let mut session = guest_session(&node);

        let reply = session.handle_request(r#"{"id": 7}"#).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"], "missing_parameter");
        assert_eq!(reply["parameter"], "type");

        let reply = session
            .handle_request(r#"{"id": 8, "type": "frobnicate"}"#)
            .await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "invalid_parameter");
        assert_eq!(reply["parameter"], "type");
        assert_eq!(reply["responding_to"], "frobnicate");
    }

    #[tokio::test]
    async fn me_distinguishes_guests_from_authed_sessions() {
        let (_dir, node) = test_node();
        let mut guest = guest_session(&node);
        let reply = guest.handle_request(r#"{"id": 1, "type": "me"}"#).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["isGuest"], true);

        let address = {
            let conn = node.db.conn();
            node.ledger.authenticate(&conn, "secret").unwrap().address
        };
        let mut authed = authed_session(&node, &address);
        let reply = authed.handle_request(r#"{"id": 2, "type": "me"}"#).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["isGuest"], false);
        assert_eq!(reply["address"]["address"], address);
    }

    #[tokio::test]
    async fn address_lookup_hides_private_fields_and_counts_names() {
        let (_dir, node) = test_node();
        let address = {
            let conn = node.db.conn();
            let account = node.ledger.authenticate(&conn, "secret").unwrap();
            database::insert_name(&conn, "shop", &account.address, 0).unwrap();
            account.address
        };

        let mut session = guest_session(&node);
        let request = format!(r#"{{"id": 1, "type": "address", "address": "{}"}}"#, address);
        let reply = session.handle_request(&request).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["address"]["address"], address);
        assert!(reply["address"].get("credential").is_none());
        assert!(reply["address"].get("names").is_none());

        let request = format!(
            r#"{{"id": 2, "type": "address", "address": "{}", "fetchNames": true}}"#,
            address
        );
        let reply = session.handle_request(&request).await;
        assert_eq!(reply["address"]["names"], 1);

        let reply = session
            .handle_request(r#"{"id": 3, "type": "address", "address": "lmissing000"}"#)
            .await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "address_not_found");
    }

    #[tokio::test]
    async fn subscription_set_starts_at_defaults_and_mutates() {
        let (_dir, node) = test_node();
        let mut session = guest_session(&node);

        let reply = session
            .handle_request(r#"{"id": 1, "type": "get_subscription_level"}"#)
            .await;
        assert_eq!(
            reply["subscription_level"],
            json!(["blocks", "ownTransactions"])
        );

        let reply = session
            .handle_request(r#"{"id": 2, "type": "subscribe", "event": "transactions"}"#)
            .await;
        assert_eq!(
            reply["subscription_level"],
            json!(["blocks", "ownTransactions", "transactions"])
        );

        let reply = session
            .handle_request(r#"{"id": 3, "type": "unsubscribe", "event": "blocks"}"#)
            .await;
        assert_eq!(
            reply["subscription_level"],
            json!(["ownTransactions", "transactions"])
        );

        let reply = session
            .handle_request(r#"{"id": 4, "type": "subscribe", "event": "everything"}"#)
            .await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "invalid_parameter");
        assert_eq!(reply["parameter"], "event");
    }

    #[tokio::test]
    async fn make_transaction_requires_an_authed_session() {
        let (_dir, node) = test_node();
        let mut session = guest_session(&node);
        let reply = session
            .handle_request(r#"{"id": 1, "type": "make_transaction", "to": "x", "amount": 5}"#)
            .await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "auth_failed");
    }

    #[tokio::test]
    async fn make_transaction_moves_funds_for_authed_sessions() {
        let (_dir, node) = test_node();
        let sender = {
            let conn = node.db.conn();
            let account = node.ledger.authenticate(&conn, "secret").unwrap();
            database::apply_credit(&conn, &account.address, 100).unwrap();
            account.address
        };
        node.state
            .set_transactions_enabled(&node.db.conn(), true)
            .unwrap();
        let recipient = crypto::make_v2_address("other", "l");

        let mut session = authed_session(&node, &sender);
        let request = format!(
            r#"{{"id": 1, "type": "make_transaction", "to": "{}", "amount": 30}}"#,
            recipient
        );
        let reply = session.handle_request(&request).await;
        assert_eq!(reply["ok"], true, "reply was {}", reply);
        assert_eq!(reply["transaction"]["from"], sender);
        assert_eq!(reply["transaction"]["to"], recipient);
        assert_eq!(reply["transaction"]["value"], 30);
        assert_eq!(node.db.get_account(&sender).unwrap().unwrap().balance, 70);
    }

    #[tokio::test]
    async fn own_levels_filter_by_session_address() {
        let (_dir, node) = test_node();
        let mine = crypto::make_v2_address("mine", "l");
        let session = authed_session(&node, &mine);

        let block = GatewayEvent::Block(Block {
            height: 3,
            hash: "11".repeat(32),
            address: mine.clone(),
            nonce: b"n".to_vec(),
            value: 25,
            time: Utc::now(),
            difficulty: 500,
            x: None,
            y: None,
            z: None,
            origin: None,
            useragent: None,
        });
        // Default levels include blocks, so any block is wanted
        assert!(session.wants(&block));

        let mut quiet = authed_session(&node, &mine);
        quiet.levels.clear();
        quiet.levels.insert(SubscriptionLevel::OwnBlocks);
        assert!(quiet.wants(&block));

        let mut other = guest_session(&node);
        other.levels.clear();
        other.levels.insert(SubscriptionLevel::OwnBlocks);
        assert!(!other.wants(&block), "guests never match own levels");
    }
}
