//! HTTP surface for the Lodestone ledger.
//!
//! Thin route layer over the node subsystems: every handler validates its
//! parameters, calls into the ledger, processor or miner, and wraps the
//! result in the `{"ok": ...}` envelope the mining and wallet clients
//! expect. The websocket gateway is attached here as well.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{self, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::LedgerError;
use crate::gateway;
use crate::miner::SubmitOutcome;
use crate::node::Node;
use crate::types::Provenance;

/// Listing endpoints cap the page size regardless of what the client asks
/// for.
const MAX_PAGE_LIMIT: i64 = 1000;
const DEFAULT_PAGE_LIMIT: i64 = 50;

// ============================================================================
// Error envelope
// ============================================================================

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "ok": false,
            "error": self.error_code(),
            "message": self.to_string(),
        });
        if let Some(parameter) = self.parameter() {
            body["parameter"] = Value::String(parameter.to_string());
        }
        (self.http_status(), Json(body)).into_response()
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(default)]
struct MakeTransactionBody {
    privatekey: Option<String>,
    to: Option<String>,
    amount: Option<Value>,
    metadata: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WsStartBody {
    privatekey: Option<String>,
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_LIMIT
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AddressQuery {
    #[serde(rename = "fetchNames")]
    fetch_names: Option<String>,
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn sanitize(page: &PageQuery) -> (i64, i64) {
    (page.limit.clamp(1, MAX_PAGE_LIMIT), page.offset.max(0))
}

fn provenance_from(headers: &HeaderMap) -> Provenance {
    Provenance {
        origin: headers
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        useragent: headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

/// Miners send the nonce either as a string or as an array of byte values.
fn nonce_param(body: &Value) -> Result<Option<Vec<u8>>, LedgerError> {
    match body.get("nonce") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Ok(Some(raw.as_bytes().to_vec())),
        Some(Value::Array(items)) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                let byte = item
                    .as_u64()
                    .filter(|b| *b <= 255)
                    .ok_or_else(|| LedgerError::InvalidParameter("nonce".to_string()))?;
                bytes.push(byte as u8);
            }
            Ok(Some(bytes))
        }
        Some(_) => Err(LedgerError::InvalidParameter("nonce".to_string())),
    }
}

fn coord_param(body: &Value, name: &str) -> Result<Option<f64>, LedgerError> {
    match body.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => raw
            .as_f64()
            .map(Some)
            .ok_or_else(|| LedgerError::InvalidParameter(name.to_string())),
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Logs method, path, status and duration for every request.
async fn logging_middleware(req: axum::extract::Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        // Transactions
        .route("/transactions", get(list_transactions).post(make_transaction))
        .route("/transactions/latest", get(latest_transactions))
        .route("/transactions/:id", get(get_transaction))
        // Addresses
        .route("/addresses/:address", get(get_address))
        .route(
            "/addresses/:address/transactions",
            get(address_transactions),
        )
        // Blocks and mining
        .route("/blocks", get(list_blocks))
        .route("/blocks/last", get(last_block))
        .route("/blocks/:height", get(get_block))
        .route("/submit", post(submit_block))
        // Miscellaneous
        .route("/supply", get(get_supply))
        .route("/work", get(get_work))
        // Websocket gateway
        .route("/ws/start", post(ws_start))
        .route("/ws/gateway/:token", get(ws_gateway))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(node)
        .layer(cors)
}

// ============================================================================
// Transaction handlers
// ============================================================================

async fn make_transaction(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    body: Option<Json<MakeTransactionBody>>,
) -> Result<Json<Value>, LedgerError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let privatekey = body
        .privatekey
        .ok_or_else(|| LedgerError::MissingParameter("privatekey".to_string()))?;
    let to = body
        .to
        .ok_or_else(|| LedgerError::MissingParameter("to".to_string()))?;
    let amount = body
        .amount
        .ok_or_else(|| LedgerError::MissingParameter("amount".to_string()))?
        .as_u64()
        .ok_or_else(|| LedgerError::InvalidParameter("amount".to_string()))?;

    let sender = {
        let conn = node.db.conn();
        node.ledger.authenticate(&conn, &privatekey)?
    };
    let provenance = provenance_from(&headers);
    let record = node
        .processor
        .submit(&sender.address, &to, amount, body.metadata.as_deref(), &provenance)
        .await?;

    Ok(Json(json!({ "ok": true, "transaction": record.to_json() })))
}

async fn list_transactions(
    State(node): State<Arc<Node>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, LedgerError> {
    transaction_page(&node, &page, false)
}

async fn latest_transactions(
    State(node): State<Arc<Node>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, LedgerError> {
    transaction_page(&node, &page, true)
}

fn transaction_page(
    node: &Node,
    page: &PageQuery,
    newest_first: bool,
) -> Result<Json<Value>, LedgerError> {
    let (limit, offset) = sanitize(page);
    let total = node.db.count_transactions()?;
    let transactions = node.db.list_transactions(limit, offset, newest_first)?;
    Ok(Json(json!({
        "ok": true,
        "count": transactions.len(),
        "total": total,
        "transactions": transactions.iter().map(|t| t.to_json()).collect::<Vec<_>>(),
    })))
}

async fn get_transaction(
    State(node): State<Arc<Node>>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, LedgerError> {
    let id: i64 = raw
        .parse()
        .map_err(|_| LedgerError::InvalidParameter("id".to_string()))?;
    let record = node
        .db
        .get_transaction(id)?
        .ok_or(LedgerError::TransactionNotFound)?;
    Ok(Json(json!({ "ok": true, "transaction": record.to_json() })))
}

// ============================================================================
// Address handlers
// ============================================================================

async fn get_address(
    State(node): State<Arc<Node>>,
    Path(address): Path<String>,
    Query(query): Query<AddressQuery>,
) -> Result<Json<Value>, LedgerError> {
    let account = node
        .db
        .get_account(&address)?
        .ok_or_else(|| LedgerError::AddressNotFound(address.clone()))?;
    let body = if query.fetch_names.is_some() {
        let names = node.db.count_names_owned(&address)?;
        account.to_json_with_names(names)
    } else {
        account.to_json()
    };
    Ok(Json(json!({ "ok": true, "address": body })))
}

async fn address_transactions(
    State(node): State<Arc<Node>>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, LedgerError> {
    node.db
        .get_account(&address)?
        .ok_or_else(|| LedgerError::AddressNotFound(address.clone()))?;

    let (limit, offset) = sanitize(&page);
    let total = node.db.count_transactions_for_address(&address)?;
    let transactions = node.db.transactions_for_address(&address, limit, offset)?;
    Ok(Json(json!({
        "ok": true,
        "count": transactions.len(),
        "total": total,
        "transactions": transactions.iter().map(|t| t.to_json()).collect::<Vec<_>>(),
    })))
}

// ============================================================================
// Block and mining handlers
// ============================================================================

async fn list_blocks(
    State(node): State<Arc<Node>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, LedgerError> {
    let (limit, offset) = sanitize(&page);
    let total = node.db.count_blocks()?;
    let blocks = node.db.list_blocks(limit, offset, false)?;
    Ok(Json(json!({
        "ok": true,
        "count": blocks.len(),
        "total": total,
        "blocks": blocks.iter().map(|b| b.to_json()).collect::<Vec<_>>(),
    })))
}

async fn last_block(State(node): State<Arc<Node>>) -> Result<Json<Value>, LedgerError> {
    let block = node.db.latest_block()?.ok_or(LedgerError::BlockNotFound)?;
    Ok(Json(json!({ "ok": true, "block": block.to_json() })))
}

async fn get_block(
    State(node): State<Arc<Node>>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, LedgerError> {
    let height: u64 = raw
        .parse()
        .map_err(|_| LedgerError::InvalidParameter("height".to_string()))?;
    let block = node.db.get_block(height)?.ok_or(LedgerError::BlockNotFound)?;
    Ok(Json(json!({ "ok": true, "block": block.to_json() })))
}

/// Solution submission. Validation failures use the error envelope with a
/// real HTTP status; a well-formed submission always answers 200 with
/// `success` saying whether the block was accepted.
async fn submit_block(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, LedgerError> {
    let body = body.map(|Json(body)| body).unwrap_or(Value::Null);
    let solver = match body.get("address") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            raw.as_str()
                .ok_or_else(|| LedgerError::InvalidParameter("address".to_string()))?,
        ),
    };
    let nonce = nonce_param(&body)?;
    let x = coord_param(&body, "x")?;
    let y = coord_param(&body, "y")?;
    let z = coord_param(&body, "z")?;
    let provenance = provenance_from(&headers);

    let outcome = node
        .miner
        .submit(solver, nonce.as_deref(), x, y, z, &provenance)?;

    let response = match outcome {
        SubmitOutcome::Accepted {
            block,
            solver,
            work,
        } => json!({
            "ok": true,
            "success": true,
            "work": work,
            "address": solver.to_json(),
            "block": block.to_json(),
        }),
        SubmitOutcome::Duplicate => json!({
            "ok": true,
            "success": false,
            "error": LedgerError::SolutionDuplicate.error_code(),
        }),
        SubmitOutcome::Incorrect => json!({
            "ok": true,
            "success": false,
            "error": LedgerError::SolutionIncorrect.error_code(),
        }),
    };
    Ok(Json(response))
}

// ============================================================================
// Miscellaneous handlers
// ============================================================================

async fn get_supply(State(node): State<Arc<Node>>) -> Result<Json<Value>, LedgerError> {
    let supply = node.db.total_supply()?;
    Ok(Json(json!({ "ok": true, "money_supply": supply })))
}

async fn get_work(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({ "ok": true, "work": node.state.work() }))
}

// ============================================================================
// Websocket gateway handlers
// ============================================================================

async fn ws_start(
    State(node): State<Arc<Node>>,
    body: Option<Json<WsStartBody>>,
) -> Result<Json<Value>, LedgerError> {
    let privatekey = body.and_then(|Json(body)| body.privatekey);
    let address = match privatekey {
        Some(privatekey) => {
            let conn = node.db.conn();
            Some(node.ledger.authenticate(&conn, &privatekey)?.address)
        }
        None => None,
    };

    let token = node.tokens.issue(address);
    let public_url = &node.config.server.public_url;
    let scheme = if public_url.starts_with("localhost:") {
        "ws"
    } else {
        "wss"
    };
    Ok(Json(json!({
        "ok": true,
        "url": format!("{}://{}/ws/gateway/{}", scheme, public_url, token),
        "expires": node.tokens.expiry().as_secs(),
    })))
}

async fn ws_gateway(
    State(node): State<Arc<Node>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let provenance = provenance_from(&headers);
    upgrade.on_upgrade(move |socket| gateway::run_session(node, socket, token, provenance))
}
