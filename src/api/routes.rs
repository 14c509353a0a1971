use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::{BalanceView, LedgerEngine};
use crate::error::LedgerError;
use crate::ledger::{ProfitRecord, ReferralRecord, ReferralTree, TransactionRecord};
use crate::signals::{Signal, SignalInvestment, SignalParams};
use crate::users::{User, UserProfile};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
}

/// Create the API router
pub fn create_router(engine: Arc<LedgerEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route("/balance/:user_key", get(get_balance))
        .route("/deposit/:user_key", post(deposit))
        .route("/transfer_to_trading/:user_key", post(transfer_to_trading))
        .route("/transfer_to_main/:user_key", post(transfer_to_main))
        .route("/unfreeze_balance/:user_key", post(unfreeze_balance))
        .route("/transactions/:user_key", get(list_transactions))
        .route("/profits/:user_key", get(list_profits))
        .route("/signals/create_random", post(create_random_signal))
        .route("/signals/create_custom", post(create_custom_signal))
        .route("/signals/active", get(list_active_signals))
        .route("/signals/join", post(join_signal))
        .route("/signals/investments/:user_key", get(list_investments))
        .route("/users/register", post(register_user))
        .route("/referrals", post(create_referral))
        .route("/referral_tree/:user_key", get(referral_tree))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<BalanceView>, ApiError> {
    Ok(Json(state.engine.get_balance(user_key).await?))
}

async fn deposit(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<BalanceView>, ApiError> {
    Ok(Json(state.engine.deposit(user_key, req.amount).await?))
}

async fn transfer_to_trading(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<BalanceView>, ApiError> {
    Ok(Json(state.engine.transfer_to_trading(user_key, req.amount).await?))
}

async fn transfer_to_main(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
    Json(req): Json<AmountRequest>,
) -> Result<Json<BalanceView>, ApiError> {
    Ok(Json(state.engine.transfer_to_main(user_key, req.amount).await?))
}

/// Move the whole frozen balance back to trading
async fn unfreeze_balance(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<UnfreezeResponse>, ApiError> {
    let (unfrozen, balance) = state.engine.unfreeze_all(user_key).await?;
    Ok(Json(UnfreezeResponse { unfrozen, balance }))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
    Ok(Json(state.engine.list_transactions(user_key).await?))
}

async fn list_profits(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<Vec<ProfitRecord>>, ApiError> {
    Ok(Json(state.engine.list_profits(user_key).await?))
}

async fn create_random_signal(
    State(state): State<AppState>,
    Json(req): Json<RandomSignalRequest>,
) -> Result<(StatusCode, Json<Signal>), ApiError> {
    let signal = state.engine.create_random_signal(req.name).await?;
    Ok((StatusCode::CREATED, Json(signal)))
}

async fn create_custom_signal(
    State(state): State<AppState>,
    Json(params): Json<SignalParams>,
) -> Result<(StatusCode, Json<Signal>), ApiError> {
    let signal = state.engine.create_custom_signal(params).await?;
    Ok((StatusCode::CREATED, Json(signal)))
}

async fn list_active_signals(State(state): State<AppState>) -> Result<Json<SignalsResponse>, ApiError> {
    let signals = state.engine.list_active_signals().await?;
    Ok(Json(SignalsResponse {
        count: signals.len(),
        signals,
    }))
}

async fn join_signal(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<SignalInvestment>, ApiError> {
    let inv = state
        .engine
        .join_signal(req.user_key, req.signal_id, req.amount)
        .await?;
    Ok(Json(inv))
}

async fn list_investments(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<Vec<SignalInvestment>>, ApiError> {
    Ok(Json(state.engine.list_investments(user_key).await?))
}

async fn register_user(
    State(state): State<AppState>,
    Json(profile): Json<UserProfile>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let (user, created) = state.engine.register_user(profile).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(RegisterResponse { user, created })))
}

async fn create_referral(
    State(state): State<AppState>,
    Json(req): Json<ReferralRequest>,
) -> Result<Json<ReferralRecord>, ApiError> {
    Ok(Json(
        state
            .engine
            .create_referral(req.invitee_key, req.inviter_key)
            .await?,
    ))
}

async fn referral_tree(
    State(state): State<AppState>,
    Path(user_key): Path<i64>,
) -> Result<Json<ReferralTree>, ApiError> {
    Ok(Json(state.engine.referral_tree(user_key).await?))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct AmountRequest {
    amount: f64,
}

#[derive(Deserialize)]
struct RandomSignalRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct JoinRequest {
    user_key: i64,
    signal_id: i64,
    amount: f64,
}

#[derive(Deserialize)]
struct ReferralRequest {
    invitee_key: i64,
    inviter_key: i64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct SignalsResponse {
    count: usize,
    signals: Vec<Signal>,
}

#[derive(Serialize)]
struct UnfreezeResponse {
    unfrozen: f64,
    balance: BalanceView,
}

#[derive(Serialize)]
struct RegisterResponse {
    user: User,
    created: bool,
}

// ===== Error Handling =====

#[derive(Debug)]
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InsufficientFunds { .. }
            | LedgerError::InvalidParameter(_)
            | LedgerError::SignalNotJoinable(_)
            | LedgerError::NoFrozenFunds => StatusCode::BAD_REQUEST,
            LedgerError::AlreadyLinked => StatusCode::CONFLICT,
            LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            LedgerError::Store(err) => {
                tracing::error!("Ledger store error: {}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
