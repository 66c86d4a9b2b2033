//! Node assembly: opens storage, wires the subsystems together and runs the
//! HTTP listener plus the background retarget loop until shutdown.

use crate::alerts::AlertSink;
use crate::api;
use crate::config::Config;
use crate::database::Database;
use crate::error::Result;
use crate::gateway::{EventBroadcaster, TokenRegistry};
use crate::ledger::AddressLedger;
use crate::miner::BlockMiner;
use crate::processor::TransactionProcessor;
use crate::state::NodeState;
use crate::work::DifficultyController;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcast-backed shutdown latch. Subsystems subscribe and `select!` the
/// receiver alongside their main loop; triggering wakes every subscriber.
pub struct Shutdown {
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Shutdown { notify }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.notify.send(());
    }

    /// Blocks until SIGINT or SIGTERM arrives, then trips the latch.
    pub async fn wait_for_signal(&self) {
        let interrupt = signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!("interrupt received, shutting down"),
            _ = terminate => info!("terminate received, shutting down"),
        }

        self.trigger();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

pub struct Node {
    pub config: Config,
    pub db: Arc<Database>,
    pub state: Arc<NodeState>,
    pub alerts: Arc<AlertSink>,
    pub ledger: Arc<AddressLedger>,
    pub events: EventBroadcaster,
    pub processor: Arc<TransactionProcessor>,
    pub miner: BlockMiner,
    pub tokens: TokenRegistry,
    pub shutdown: Shutdown,
}

impl Node {
    /// Opens storage and wires every subsystem, creating the genesis block
    /// on a fresh database. No background tasks are spawned here; that
    /// happens in [`start`](Node::start).
    pub fn init(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database.path)?);
        let state = Arc::new(NodeState::load(&db.conn(), &config.mining)?);
        let alerts = Arc::new(AlertSink::default());
        let ledger = Arc::new(AddressLedger::new(
            Arc::clone(&alerts),
            &config.currency.address_prefix,
        ));
        let events = EventBroadcaster::new();
        let processor = Arc::new(TransactionProcessor::new(
            Arc::clone(&db),
            Arc::clone(&ledger),
            Arc::clone(&state),
            Arc::clone(&alerts),
            events.clone(),
            &config.processor,
            &config.currency.address_prefix,
        ));
        let miner = BlockMiner::new(
            Arc::clone(&db),
            Arc::clone(&ledger),
            Arc::clone(&state),
            Arc::clone(&processor),
            events.clone(),
            &config.mining,
            &config.currency.address_prefix,
        );
        miner.bootstrap()?;
        let tokens = TokenRegistry::new(Duration::from_secs(config.gateway.token_expiry_secs));

        info!(
            work = state.work(),
            mining = state.mining_enabled(),
            transactions = state.transactions_enabled(),
            "node initialized"
        );

        Ok(Node {
            config,
            db,
            state,
            alerts,
            ledger,
            events,
            processor,
            miner,
            tokens,
            shutdown: Shutdown::new(),
        })
    }

    /// Runs the node until a shutdown signal arrives: spawns the difficulty
    /// retarget loop, installs the signal handler and serves the API.
    pub async fn start(self: Arc<Self>) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let retarget = DifficultyController::new(
            Arc::clone(&self.db),
            Arc::clone(&self.state),
            &self.config.mining,
        );
        tokio::spawn(retarget.run(self.shutdown.subscribe()));

        let signal_node = Arc::clone(&self);
        tokio::spawn(async move { signal_node.shutdown.wait_for_signal().await });

        let bind = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        info!(address = %bind, public_url = %self.config.server.public_url, "api listening");

        let app = api::build_router(Arc::clone(&self));
        let mut stopping = self.shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopping.recv().await;
            })
            .await?;

        info!("node stopped");
        Ok(())
    }
}
