//! Read-only Axum endpoints for operators: health, a payment's audit trail and
//! the approval requests still waiting on signers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::CustodyError;
use crate::events::PaymentEvent;
use crate::models::{now_ts, ApprovalRequest, ApprovalStatus, PaymentStatus};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PaymentEventsResponse {
    pub payment_id: i64,
    pub status: PaymentStatus,
    pub count: usize,
    pub events: Vec<PaymentEvent>,
}

#[derive(Serialize)]
pub struct PendingApprovalsResponse {
    pub count: usize,
    pub approvals: Vec<ApprovalRequest>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: CustodyError) -> Response {
    let status = match e {
        CustodyError::NotFound(_) => StatusCode::NOT_FOUND,
        CustodyError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!(ErrorResponse {
            error: e.to_string()
        })),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /payments/:id/events`
///
/// The payment's audit trail in the order it was written.
pub async fn payment_events(
    State(state): State<Arc<ApiState>>,
    Path(payment_id): Path<i64>,
) -> Response {
    let payment = match db::get_payment(&state.pool, payment_id).await {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    match db::events_for_payment(&state.pool, payment_id).await {
        Ok(events) => (
            StatusCode::OK,
            Json(serde_json::json!(PaymentEventsResponse {
                payment_id,
                status: payment.status,
                count: events.len(),
                events,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /approvals/pending`
///
/// Pending requests that can still collect signatures.
pub async fn pending_approvals(State(state): State<Arc<ApiState>>) -> Response {
    match db::approvals_with_status(&state.pool, ApprovalStatus::Pending).await {
        Ok(approvals) => {
            let now = now_ts();
            let approvals: Vec<_> = approvals.into_iter().filter(|a| !a.is_expired_at(now)).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!(PendingApprovalsResponse {
                    count: approvals.len(),
                    approvals,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewApproval, NewPayment};
    use crate::models::ApprovalKind;
    use rust_decimal_macros::dec;

    async fn state() -> Arc<ApiState> {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        Arc::new(ApiState { pool })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_payment() -> NewPayment {
        NewPayment {
            amount: dec!(1500),
            currency: "MXN".into(),
            payer_id: "payer".into(),
            payee_id: "payee".into(),
            deposit_account: "646180157000000001".into(),
            payout_account: "payee-acct".into(),
            payee_wallet: None,
            vertical: None,
        }
    }

    #[tokio::test]
    async fn unknown_payment_is_404() {
        let state = state().await;
        let resp = payment_events(State(state), Path(999)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn payment_events_lists_audit_trail() {
        let state = state().await;
        let (payment, _) = db::register_payment(&state.pool, &new_payment(), now_ts() + 3600)
            .await
            .unwrap();

        let resp = payment_events(State(state), Path(payment.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["kind"], "payment_created");
    }

    #[tokio::test]
    async fn pending_approvals_hides_expired_requests() {
        let state = state().await;
        let (payment, _) = db::register_payment(&state.pool, &new_payment(), now_ts() + 3600)
            .await
            .unwrap();

        for expires_at in [now_ts() + 3600, now_ts() - 1] {
            db::insert_approval(
                &state.pool,
                &NewApproval {
                    payment_id: payment.id,
                    kind: ApprovalKind::Release,
                    wallet_address: "0xSAFE".into(),
                    required_signatures: 2,
                    amount: dec!(1500),
                    amount_usd: dec!(1500),
                    recipient: "payee".into(),
                    created_by: "test".into(),
                    expires_at,
                },
            )
            .await
            .unwrap();
        }

        let body = body_json(pending_approvals(State(state)).await).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["approvals"][0]["status"], "pending");
    }
}
