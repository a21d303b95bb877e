//! HTTP API for the DAO chain
//!
//! Thin adapter over the query facade and the chain's write operations:
//! - Block and transaction lookup
//! - Token balances, supply and transfers
//! - Proposals, votes, tallies and treasury payouts
//! - Vote delegation and voting power
//!
//! Errors render as `{"error": "..."}` with a status derived from the
//! ledger error kind. Writes run on the blocking pool: a commit fsyncs the
//! block log and waits its turn at the commit gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::query::{
    BalanceView, DelegationView, QueryFacade, SupplyView, TallyView, TreasuryView, VotingPowerView,
};
use crate::stf::{
    normalize_proposal_id, Block, ChainState, ChainStatus, Funding, LedgerError, LedgerResult, Proposal,
    ProposalDraft, ProposalStatus, ProposalType, Transaction, TxReceipt, Vote, VoteChoice, VotingType,
};

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Shared handler state
pub struct AppState {
    pub chain: ChainState,
    pub query: QueryFacade,
    /// Sender for writes that omit one
    pub default_sender: Option<String>,
}

impl AppState {
    pub fn new(chain: ChainState, default_sender: Option<String>) -> Self {
        Self {
            query: QueryFacade::new(chain.clone()),
            chain,
            default_sender,
        }
    }

    fn sender(&self, explicit: Option<String>) -> Result<String, ApiError> {
        explicit
            .or_else(|| self.default_sender.clone())
            .ok_or_else(|| {
                error_response(LedgerError::InvalidFormat(
                    "no sender given and no default sender configured".into(),
                ))
            })
    }
}

pub fn status_code(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InvalidFormat(_)
        | LedgerError::InvalidAmount(_)
        | LedgerError::InvalidProposal(_)
        | LedgerError::InvalidDelegation(_)
        | LedgerError::InsufficientBalance { .. }
        | LedgerError::InvalidNonce { .. }
        | LedgerError::InvalidBlock(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::DuplicateKey(_)
        | LedgerError::DuplicateTransaction(_)
        | LedgerError::DuplicateVote { .. }
        | LedgerError::ChainForkRejected { .. }
        | LedgerError::ProposalClosed(_) => StatusCode::CONFLICT,
        LedgerError::Unauthorized(_) => StatusCode::FORBIDDEN,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: LedgerError) -> ApiError {
    (status_code(&err), Json(json!({ "error": err.to_string() })))
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid request body: {}", rejection.body_text()) })),
    )
}

/// Run a chain write off the async workers
async fn blocking<T, F>(write: F) -> Result<T, ApiError>
where
    F: FnOnce() -> LedgerResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(write).await {
        Ok(result) => result.map_err(error_response),
        Err(e) => {
            tracing::error!("💥 Write task failed: {}", e);
            Err(error_response(LedgerError::Storage(format!("write task failed: {}", e))))
        }
    }
}

/// Positive integer from a signed request field
fn positive(value: i64, field: &str) -> Result<u64, LedgerError> {
    if value <= 0 {
        return Err(LedgerError::InvalidAmount(format!("{} must be positive, got {}", field, value)));
    }
    Ok(value as u64)
}

// ============ REQUEST / RESPONSE TYPES ============

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateProposalRequest {
    #[serde(default)]
    pub creator: Option<String>,
    pub title: String,
    pub description: String,
    pub proposal_type: ProposalType,
    #[serde(default)]
    pub voting_type: VotingType,
    pub duration: i64,
    pub threshold: i64,
    #[serde(default)]
    pub funding: Option<Funding>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    #[serde(default)]
    pub voter: Option<String>,
    pub proposal_id: String,
    pub choice: VoteChoice,
}

#[derive(Debug, Deserialize)]
pub struct TreasuryTransferRequest {
    #[serde(default)]
    pub executor: Option<String>,
    pub proposal_id: String,
    #[serde(alias = "recipient")]
    pub to: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    #[serde(default)]
    pub delegator: Option<String>,
    pub delegate: String,
    /// Seconds
    pub duration: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeDelegationRequest {
    #[serde(default)]
    pub delegator: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProposalCreated {
    pub id: String,
    #[serde(flatten)]
    pub receipt: TxReceipt,
}

#[derive(Debug, Serialize)]
pub struct VoteCast {
    pub proposal_id: String,
    pub status: ProposalStatus,
    #[serde(flatten)]
    pub receipt: TxReceipt,
}

// ============ HANDLERS ============

async fn get_status(State(state): State<Arc<AppState>>) -> Json<ChainStatus> {
    Json(state.query.status())
}

async fn get_block(State(state): State<Arc<AppState>>, Path(hashorid): Path<String>) -> ApiResult<Block> {
    state.query.block(&hashorid).map(Json).map_err(error_response)
}

/// Append a finalized block produced by an external block producer
async fn post_block(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Block>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(block) = payload.map_err(bad_json)?;
    let (height, hash) = (block.height, block.hash);
    let chain = state.chain.clone();
    blocking(move || chain.append_block(block)).await?;
    Ok(Json(json!({ "height": height, "hash": hash })))
}

async fn get_transaction(State(state): State<Arc<AppState>>, Path(hash): Path<String>) -> ApiResult<Transaction> {
    state.query.transaction(&hash).map(Json).map_err(error_response)
}

async fn list_proposals(State(state): State<Arc<AppState>>) -> Json<Vec<Proposal>> {
    Json(state.query.proposals())
}

async fn get_proposal(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Proposal> {
    state.query.proposal(&id).map(Json).map_err(error_response)
}

async fn get_tally(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<TallyView> {
    state.query.tally(&id).map(Json).map_err(error_response)
}

async fn get_votes(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Vec<Vote>> {
    state.query.votes(&id).map(Json).map_err(error_response)
}

async fn create_proposal(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateProposalRequest>, JsonRejection>,
) -> ApiResult<ProposalCreated> {
    let Json(req) = payload.map_err(bad_json)?;
    let creator = state.sender(req.creator)?;
    if req.duration <= 0 {
        return Err(error_response(LedgerError::InvalidProposal(format!(
            "duration must be positive, got {}",
            req.duration
        ))));
    }
    if !(0..=100).contains(&req.threshold) {
        return Err(error_response(LedgerError::InvalidProposal(format!(
            "threshold {} is not a percentage",
            req.threshold
        ))));
    }
    let draft = ProposalDraft {
        title: req.title,
        description: req.description,
        proposal_type: req.proposal_type,
        voting_type: req.voting_type,
        duration: req.duration as u64,
        threshold: req.threshold as u64,
        funding: req.funding,
    };

    let chain = state.chain.clone();
    let who = creator.clone();
    let receipt = blocking(move || chain.submit_proposal(&who, draft)).await?;
    tracing::info!("📋 Proposal {} created by {}", receipt.tx_hash.short(), creator);
    Ok(Json(ProposalCreated {
        id: receipt.tx_hash.to_hex(),
        receipt,
    }))
}

async fn cast_vote(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> ApiResult<VoteCast> {
    let Json(req) = payload.map_err(bad_json)?;
    let voter = state.sender(req.voter)?;
    let proposal_id = normalize_proposal_id(&req.proposal_id).map_err(error_response)?;

    let chain = state.chain.clone();
    let id = proposal_id.clone();
    let receipt = blocking(move || chain.submit_vote(&voter, &id, req.choice)).await?;
    let status = state.chain.get_proposal(&proposal_id).map_err(error_response)?.status;
    Ok(Json(VoteCast {
        proposal_id,
        status,
        receipt,
    }))
}

async fn get_treasury(State(state): State<Arc<AppState>>) -> Json<TreasuryView> {
    Json(state.query.treasury())
}

async fn treasury_transfer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TreasuryTransferRequest>, JsonRejection>,
) -> ApiResult<TxReceipt> {
    let Json(req) = payload.map_err(bad_json)?;
    let executor = state.sender(req.executor)?;
    let proposal_id = normalize_proposal_id(&req.proposal_id).map_err(error_response)?;
    let amount = positive(req.amount, "amount").map_err(error_response)?;

    let chain = state.chain.clone();
    let (id, to) = (proposal_id.clone(), req.to.clone());
    let receipt = blocking(move || chain.submit_treasury_transfer(&executor, &id, &to, amount)).await?;
    tracing::info!("🏦 Treasury paid {} to {} for proposal {}", amount, req.to, &proposal_id[..8]);
    Ok(Json(receipt))
}

async fn get_balance(State(state): State<Arc<AppState>>, Path(address): Path<String>) -> ApiResult<BalanceView> {
    state.query.balance(&address).map(Json).map_err(error_response)
}

async fn get_supply(State(state): State<Arc<AppState>>) -> Json<SupplyView> {
    Json(state.query.supply())
}

async fn token_transfer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> ApiResult<TxReceipt> {
    let Json(req) = payload.map_err(bad_json)?;
    let from = state.sender(req.from)?;
    let amount = positive(req.amount, "amount").map_err(error_response)?;

    let chain = state.chain.clone();
    let (sender, to) = (from.clone(), req.to.clone());
    let receipt = blocking(move || chain.submit_transfer(&sender, &to, amount)).await?;
    tracing::debug!("💸 {} → {}: {} ({})", from, req.to, amount, receipt.tx_hash.short());
    Ok(Json(receipt))
}

async fn delegate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DelegateRequest>, JsonRejection>,
) -> ApiResult<TxReceipt> {
    let Json(req) = payload.map_err(bad_json)?;
    let delegator = state.sender(req.delegator)?;
    if req.duration <= 0 {
        return Err(error_response(LedgerError::InvalidDelegation(format!(
            "duration must be positive, got {}",
            req.duration
        ))));
    }
    let duration = req.duration as u64;

    let chain = state.chain.clone();
    let (from, to) = (delegator.clone(), req.delegate.clone());
    let receipt = blocking(move || chain.submit_delegation(&from, &to, duration)).await?;
    tracing::info!("🤝 {} delegated to {} for {}s", delegator, req.delegate, duration);
    Ok(Json(receipt))
}

async fn revoke_delegation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RevokeDelegationRequest>, JsonRejection>,
) -> ApiResult<TxReceipt> {
    let Json(req) = payload.map_err(bad_json)?;
    let delegator = state.sender(req.delegator)?;

    let chain = state.chain.clone();
    let receipt = blocking(move || chain.submit_revoke_delegation(&delegator)).await?;
    Ok(Json(receipt))
}

async fn get_delegation(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<DelegationView> {
    state.query.delegation(&address).map(Json).map_err(error_response)
}

async fn list_delegations(State(state): State<Arc<AppState>>) -> Json<Vec<DelegationView>> {
    Json(state.query.delegations())
}

async fn get_voting_power(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<VotingPowerView> {
    state.query.voting_power(&address).map(Json).map_err(error_response)
}

// ============ SERVER ============

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/block", post(post_block))
        .route("/block/:hashorid", get(get_block))
        .route("/tx/:hash", get(get_transaction))
        .route("/dao/proposals", get(list_proposals))
        .route("/dao/proposal", post(create_proposal))
        .route("/dao/proposal/:id", get(get_proposal))
        .route("/dao/proposal/:id/tally", get(get_tally))
        .route("/dao/proposal/:id/votes", get(get_votes))
        .route("/dao/vote", post(cast_vote))
        .route("/dao/treasury", get(get_treasury))
        .route("/dao/treasury/transfer", post(treasury_transfer))
        .route("/dao/token/balance/:address", get(get_balance))
        .route("/dao/token/supply", get(get_supply))
        .route("/dao/token/transfer", post(token_transfer))
        .route("/dao/delegate", post(delegate))
        .route("/dao/revoke-delegation", post(revoke_delegation))
        .route("/dao/delegation/:address", get(get_delegation))
        .route("/dao/delegations", get(list_delegations))
        .route("/dao/voting-power/:address", get(get_voting_power))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` resolves
pub async fn start_http_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    // CORS allows any origin; the API performs no authentication of its own
    tracing::warn!("⚠️ CORS allows ANY origin. Put an authenticating proxy in front of this API.");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 HTTP API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
