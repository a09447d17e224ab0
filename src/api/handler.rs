use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

use super::models::*;
use crate::{
    error::AppResult,
    ledger::{models::CreateOrderOutcome, OrderStore},
    middleware::{parse_order_number, require_content_type, AuthenticatedUser},
    reconciliation::gate::BackpressureGate,
    shutdown::Shutdown,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    /// Shared with the reconciler, read-only here
    pub gate: Arc<BackpressureGate>,
    pub shutdown: Shutdown,
}

/// Register an order number for accrual
/// POST /api/user/orders
pub async fn submit_order(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    headers: HeaderMap,
    body: String,
) -> AppResult<Response> {
    require_content_type(&headers, "text/plain")?;
    let number = parse_order_number(&body)?;

    match state.store.create_order(user_id, &number).await? {
        CreateOrderOutcome::Created(order) => {
            info!("📥 Order {} accepted for user {}", order.number, user_id);
            Ok((StatusCode::ACCEPTED, Json(OrderResponse::from(order))).into_response())
        }
        CreateOrderOutcome::AlreadyOwned => Ok(StatusCode::OK.into_response()),
    }
}

/// GET /api/user/orders
pub async fn list_orders(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> AppResult<Response> {
    let orders = state.store.list_orders(user_id).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let orders: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(orders).into_response())
}

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.store.balance_snapshot(user_id).await?;
    Ok(Json(balance.into()))
}

/// Spend points against a new order number
/// POST /api/user/balance/withdraw
///
/// The body is already validated by the `validate_json` route layer.
pub async fn create_withdrawal(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<WithdrawRequest>,
) -> AppResult<Json<WithdrawalResponse>> {
    let number = parse_order_number(&request.order)?;

    let withdrawal = state
        .store
        .create_withdrawal(user_id, &number, request.sum, &state.shutdown)
        .await?;

    Ok(Json(withdrawal.into()))
}

/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> AppResult<Response> {
    let withdrawals = state.store.list_withdrawals(user_id).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let withdrawals: Vec<WithdrawalResponse> = withdrawals
        .into_iter()
        .map(WithdrawalResponse::from)
        .collect();
    Ok(Json(withdrawals).into_response())
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let paused_for = state
        .gate
        .paused_until()
        .map(|until| until.saturating_duration_since(Instant::now()).as_secs());

    Json(HealthResponse {
        status: if paused_for.is_some() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        timestamp: Utc::now(),
        accrual_paused_for_secs: paused_for,
    })
}
