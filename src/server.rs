// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Provider webhook
//! curl -X POST http://localhost:8080/webhooks/stripe/green-leaf \
//!   -H "X-Signature: sha256=<hex hmac of body>" \
//!   -d '{"id": "evt_1", "type": "payment.succeeded", "data": {"provider_transaction_id": "pi_1", "amount": "50.00"}}'
//!
//! # Create a transaction
//! curl -X POST http://localhost:8080/transactions \
//!   -H "Content-Type: application/json" \
//!   -H "Idempotency-Key: 3f1c..." \
//!   -d '{"tenant_id": "green-leaf", "provider_id": "stripe", "order_id": "o-1", "amount": "100.00"}'
//!
//! # Refund part of it
//! curl -X POST http://localhost:8080/transactions/<id>/refunds \
//!   -H "Content-Type: application/json" \
//!   -d '{"amount": "30.00", "reason": "damaged"}'
//!
//! # Settle a day
//! curl -X POST http://localhost:8080/settlements/stripe/2025-06-01
//! ```

use crate::base::{DisputeId, IdempotencyKey, ProviderId, RefundId, TenantId, TransactionId};
use crate::dispute::{Dispute, DisputeOutcome};
use crate::error::PaymentError;
use crate::refund::{Refund, RefundStatus};
use crate::service::{CreateTransactionRequest, PaymentService};
use crate::settlement::{Settlement, SettlementBatcher};
use crate::transaction::{PaymentTransaction, TransactionView};
use crate::webhook::{IngestOutcome, SIGNATURE_HEADER, WebhookIngestor};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// === Request/Response DTOs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundBody {
    pub amount: Decimal,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeBody {
    pub amount: Decimal,
    pub evidence_due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBody {
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveBody {
    pub outcome: DisputeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub status: IngestOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PaymentService>,
    pub webhooks: Arc<WebhookIngestor>,
    pub settlements: Arc<SettlementBatcher>,
}

// === Error Handling ===

/// Wrapper for converting [`PaymentError`] into HTTP responses.
pub struct AppError(PaymentError);

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            PaymentError::IdempotencyConflict => (StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"),
            PaymentError::InFlight => (StatusCode::CONFLICT, "IN_FLIGHT"),
            PaymentError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            PaymentError::InsufficientRefundable { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_REFUNDABLE")
            }
            PaymentError::DisputeClosed => (StatusCode::CONFLICT, "DISPUTE_CLOSED"),
            PaymentError::StaleTransition { .. } => (StatusCode::CONFLICT, "STALE_TRANSITION"),
            PaymentError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            PaymentError::MonetaryFieldsFrozen => (StatusCode::CONFLICT, "MONETARY_FIELDS_FROZEN"),
            PaymentError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID"),
            PaymentError::AmountMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "AMOUNT_MISMATCH")
            }
            PaymentError::ProviderTimeout => (StatusCode::GATEWAY_TIMEOUT, "PROVIDER_TIMEOUT"),
            PaymentError::ProviderOutcomeUnknown(_) => {
                (StatusCode::GATEWAY_TIMEOUT, "PROVIDER_OUTCOME_UNKNOWN")
            }
            PaymentError::Provider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            PaymentError::TransactionNotFound => (StatusCode::NOT_FOUND, "TRANSACTION_NOT_FOUND"),
            PaymentError::RefundNotFound => (StatusCode::NOT_FOUND, "REFUND_NOT_FOUND"),
            PaymentError::DisputeNotFound => (StatusCode::NOT_FOUND, "DISPUTE_NOT_FOUND"),
            PaymentError::SettlementNotFound => (StatusCode::NOT_FOUND, "SETTLEMENT_NOT_FOUND"),
            PaymentError::AlreadyDisputed => (StatusCode::CONFLICT, "ALREADY_DISPUTED"),
            PaymentError::NotRefundable => (StatusCode::UNPROCESSABLE_ENTITY, "NOT_REFUNDABLE"),
            PaymentError::EvidenceWindowClosed => {
                (StatusCode::UNPROCESSABLE_ENTITY, "EVIDENCE_WINDOW_CLOSED")
            }
            PaymentError::FeeSplitExists => (StatusCode::CONFLICT, "FEE_SPLIT_EXISTS"),
            PaymentError::UnknownProvider => (StatusCode::NOT_FOUND, "UNKNOWN_PROVIDER"),
            PaymentError::UnknownTenant => (StatusCode::NOT_FOUND, "UNKNOWN_TENANT"),
            PaymentError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD"),
            PaymentError::SettlementInProgress => {
                (StatusCode::CONFLICT, "SETTLEMENT_IN_PROGRESS")
            }
            PaymentError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            PaymentError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /webhooks/{provider}/{tenant} - Provider callback.
async fn receive_webhook(
    State(state): State<AppState>,
    Path((provider, tenant)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = state.webhooks.receive(
        &ProviderId::new(provider),
        &TenantId::new(tenant),
        &body,
        signature,
    )?;
    let status = match outcome {
        IngestOutcome::RetryScheduled => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(WebhookAck { status: outcome })))
}

/// POST /transactions - Create (or replay) a transaction.
async fn create_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<TransactionView>), AppError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            PaymentError::MalformedPayload("missing Idempotency-Key header".to_string())
        })?;
    let view = state
        .service
        .create_transaction(&IdempotencyKey::new(key.trim()), &request)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /transactions/{id} - Full ledger row.
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.service.transaction(id)?))
}

/// POST /transactions/{id}/refunds
async fn create_refund(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
    Json(body): Json<RefundBody>,
) -> Result<(StatusCode, Json<Refund>), AppError> {
    let refund = state
        .service
        .create_refund(id, body.amount, body.reason)
        .await?;
    Ok((refund_status(&refund), Json(refund)))
}

/// POST /refunds/{id}/retry
async fn retry_refund(
    State(state): State<AppState>,
    Path(id): Path<RefundId>,
) -> Result<(StatusCode, Json<Refund>), AppError> {
    let refund = state.service.retry_refund(id).await?;
    Ok((refund_status(&refund), Json(refund)))
}

/// `202` while the provider outcome is still unknown.
fn refund_status(refund: &Refund) -> StatusCode {
    match refund.status {
        RefundStatus::Pending => StatusCode::ACCEPTED,
        RefundStatus::Completed => StatusCode::CREATED,
        RefundStatus::Failed => StatusCode::OK,
    }
}

/// POST /transactions/{id}/disputes
async fn open_dispute(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
    Json(body): Json<DisputeBody>,
) -> Result<(StatusCode, Json<Dispute>), AppError> {
    let dispute = state
        .service
        .open_dispute(id, body.amount, body.evidence_due_date)?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

/// POST /disputes/{id}/evidence
async fn submit_evidence(
    State(state): State<AppState>,
    Path(id): Path<DisputeId>,
    Json(body): Json<EvidenceBody>,
) -> Result<Json<Dispute>, AppError> {
    Ok(Json(state.service.submit_evidence(id, body.evidence)?))
}

/// POST /disputes/{id}/resolve
async fn resolve_dispute(
    State(state): State<AppState>,
    Path(id): Path<DisputeId>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Dispute>, AppError> {
    Ok(Json(state.service.resolve_dispute(id, body.outcome)?))
}

/// POST /settlements/{provider}/{date} - Run (or re-run) a settlement.
async fn run_settlement(
    State(state): State<AppState>,
    Path((provider, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Settlement>, AppError> {
    Ok(Json(
        state
            .settlements
            .run_for_period(&ProviderId::new(provider), date)?,
    ))
}

/// GET /settlements/{provider}/{date}
async fn get_settlement(
    State(state): State<AppState>,
    Path((provider, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Settlement>, AppError> {
    state
        .settlements
        .get(&ProviderId::new(provider), date)
        .map(Json)
        .ok_or(AppError(PaymentError::SettlementNotFound))
}

/// POST /settlements/{provider}/{date}/reconcile
async fn reconcile_settlement(
    State(state): State<AppState>,
    Path((provider, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Settlement>, AppError> {
    Ok(Json(
        state
            .settlements
            .mark_reconciled(&ProviderId::new(provider), date)?,
    ))
}

async fn health() -> &'static str {
    "ok"
}

// === Router ===

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}/{tenant}", post(receive_webhook))
        .route("/transactions", post(create_transaction))
        .route("/transactions/{id}", get(get_transaction))
        .route("/transactions/{id}/refunds", post(create_refund))
        .route("/transactions/{id}/disputes", post(open_dispute))
        .route("/refunds/{id}/retry", post(retry_refund))
        .route("/disputes/{id}/evidence", post(submit_evidence))
        .route("/disputes/{id}/resolve", post(resolve_dispute))
        .route(
            "/settlements/{provider}/{date}",
            post(run_settlement).get(get_settlement),
        )
        .route(
            "/settlements/{provider}/{date}/reconcile",
            post(reconcile_settlement),
        )
        .with_state(state)
}
