//! Realtime event fan-out.
//!
//! A single broadcast channel carries every post-commit ledger event. Each
//! websocket session holds its own receiver and filters frames against its
//! subscription levels, so publishing never blocks and never touches the
//! database lock.

use crate::types::{Block, Name, Transaction};
use tokio::sync::broadcast;

/// Events buffered per receiver before a slow session starts losing frames.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A committed ledger change, fanned out to subscribed sessions.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Transaction(Transaction),
    Block(Block),
    Name(Name),
}

impl GatewayEvent {
    /// Wire name of the event, used in frames and level matching.
    pub fn event_name(&self) -> &'static str {
        match self {
            GatewayEvent::Transaction(_) => "transaction",
            GatewayEvent::Block(_) => "block",
            GatewayEvent::Name(_) => "name",
        }
    }

    /// Whether the event directly involves the given address, for the
    /// `own*` subscription levels.
    pub fn involves(&self, address: &str) -> bool {
        match self {
            GatewayEvent::Transaction(transaction) => {
                transaction.from.as_deref() == Some(address) || transaction.to == address
            }
            GatewayEvent::Block(block) => block.address == address,
            GatewayEvent::Name(name) => name.owner == address,
        }
    }

    /// Full event frame as delivered to a subscribed session.
    pub fn to_frame(&self) -> serde_json::Value {
        let event = self.event_name();
        let payload = match self {
            GatewayEvent::Transaction(transaction) => transaction.to_json(),
            GatewayEvent::Block(block) => block.to_json(),
            GatewayEvent::Name(name) => name.to_json(),
        };
        serde_json::json!({
            "type": "event",
            "event": event,
            event: payload,
        })
    }
}

/// What a session has asked to receive. `Own*` levels only deliver events
/// involving the session's authed address, so they are silent for guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionLevel {
    Transactions,
    OwnTransactions,
    Names,
    OwnNames,
    Blocks,
    OwnBlocks,
}

impl SubscriptionLevel {
    pub const ALL: [SubscriptionLevel; 6] = [
        SubscriptionLevel::Transactions,
        SubscriptionLevel::OwnTransactions,
        SubscriptionLevel::Names,
        SubscriptionLevel::OwnNames,
        SubscriptionLevel::Blocks,
        SubscriptionLevel::OwnBlocks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionLevel::Transactions => "transactions",
            SubscriptionLevel::OwnTransactions => "ownTransactions",
            SubscriptionLevel::Names => "names",
            SubscriptionLevel::OwnNames => "ownNames",
            SubscriptionLevel::Blocks => "blocks",
            SubscriptionLevel::OwnBlocks => "ownBlocks",
        }
    }

    pub fn parse(value: &str) -> Option<SubscriptionLevel> {
        match value {
            "transactions" => Some(SubscriptionLevel::Transactions),
            "ownTransactions" => Some(SubscriptionLevel::OwnTransactions),
            "names" => Some(SubscriptionLevel::Names),
            "ownNames" => Some(SubscriptionLevel::OwnNames),
            "blocks" => Some(SubscriptionLevel::Blocks),
            "ownBlocks" => Some(SubscriptionLevel::OwnBlocks),
            _ => None,
        }
    }

    /// Levels every new session starts with.
    pub fn defaults() -> Vec<SubscriptionLevel> {
        vec![SubscriptionLevel::OwnTransactions, SubscriptionLevel::Blocks]
    }

    /// Whether a session holding this level should receive the event.
    /// `address` is the session's authed address, if any.
    pub fn matches(&self, event: &GatewayEvent, address: Option<&str>) -> bool {
        match (self, event) {
            (SubscriptionLevel::Transactions, GatewayEvent::Transaction(_)) => true,
            (SubscriptionLevel::Blocks, GatewayEvent::Block(_)) => true,
            (SubscriptionLevel::Names, GatewayEvent::Name(_)) => true,
            (SubscriptionLevel::OwnTransactions, GatewayEvent::Transaction(_))
            | (SubscriptionLevel::OwnBlocks, GatewayEvent::Block(_))
            | (SubscriptionLevel::OwnNames, GatewayEvent::Name(_)) => {
                address.map_or(false, |addr| event.involves(addr))
            }
            _ => false,
        }
    }
}

/// Fan-out hub shared by the processor, the miner and every session.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to every live session. Never blocks; with no
    /// sessions connected the event is dropped.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
