//! Lodestone - a centrally-banked virtual currency node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Ledger Core
//! - [`ledger`] - Address accounts, balance transfers and authentication
//! - [`processor`] - Queued transaction pipeline with race detection
//! - [`database`] - SQLite storage layer and commit/rollback hooks
//! - [`types`] - Record types shared across the crate
//!
//! ## Mining
//! - [`miner`] - Proof-of-work submission and block creation
//! - [`work`] - Adaptive difficulty retargeting
//! - [`crypto`] - Address derivation and solution hashing
//!
//! ## Realtime Gateway
//! - [`gateway`] - Event broadcast, connection tokens and websocket sessions
//!
//! ## Node & Surface
//! - [`node`] - Subsystem wiring, startup and shutdown
//! - [`api`] - HTTP routes and the JSON envelope
//! - [`state`] - Persisted runtime switches and the live work value
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types and wire codes
//! - [`alerts`] - Operator alerting with deduplication

#![forbid(unsafe_code)]

// ============================================================================
// Ledger Core
// ============================================================================
pub mod database;
pub mod ledger;
pub mod processor;
pub mod types;

// ============================================================================
// Mining
// ============================================================================
pub mod crypto;
pub mod miner;
pub mod work;

// ============================================================================
// Realtime Gateway
// ============================================================================
pub mod gateway;

// ============================================================================
// Node & Surface
// ============================================================================
pub mod api;
pub mod node;
pub mod state;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod alerts;
pub mod config;
pub mod error;
