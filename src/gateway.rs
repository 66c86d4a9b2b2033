//! Realtime gateway: event fan-out, one-shot connection tokens, and the
//! websocket session protocol built on them.

pub mod events;
pub mod session;
pub mod tokens;

pub use events::{EventBroadcaster, GatewayEvent, SubscriptionLevel};
pub use session::run_session;
pub use tokens::TokenRegistry;
