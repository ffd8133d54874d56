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

//! Integration tests for the REST API.
//!
//! Each test starts the real router on an ephemeral port and drives it
//! over HTTP, including concurrent requests sharing an idempotency key.

use async_trait::async_trait;
use chrono::Utc;
use dispensary_payments::config::{ProviderSettings, WebhookSettings};
use dispensary_payments::provider::{
    ChargeRequest, ProviderCharge, ProviderChargeStatus, ProviderRefund, RefundRequest,
};
use dispensary_payments::server::{self, AppState, ErrorResponse, IDEMPOTENCY_KEY_HEADER};
use dispensary_payments::webhook::{SIGNATURE_HEADER, sign};
use dispensary_payments::{
    Directory, FeeSchedule, PaymentError, PaymentProvider, PaymentService, PaymentTransaction,
    ProviderRegistry, Settings, Settlement, SettlementBatcher, SettlementStatus,
    TransactionStatus, TransactionView, WebhookIngestor,
};
use reqwest::{Client, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

const SECRET: &str = "whsec_server";

// === Test Provider ===

struct SlowProvider {
    status: ProviderChargeStatus,
    charges: AtomicU32,
}

#[async_trait]
impl PaymentProvider for SlowProvider {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ProviderCharge, PaymentError> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ProviderCharge {
            provider_transaction_id: format!("pi_{}", request.transaction_id),
            status: self.status,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, PaymentError> {
        Ok(ProviderRefund {
            provider_refund_id: format!("re_{}", request.refund_id),
        })
    }
}

// === Server Setup ===

/// Test server that binds to an ephemeral port.
struct TestServer {
    base_url: String,
    client: Client,
    provider: Arc<SlowProvider>,
}

impl TestServer {
    async fn new(status: ProviderChargeStatus) -> Self {
        let directory = Arc::new(Directory::new());
        directory
            .upsert_tenant("T1".into(), FeeSchedule::new(dec!(2.9), dec!(0.30)))
            .unwrap();
        directory
            .upsert_provider(
                "stripe".into(),
                ProviderSettings {
                    base_url: "http://localhost:9".into(),
                    api_key: "sk_test".into(),
                    webhook_secret: SECRET.into(),
                },
            )
            .unwrap();

        let provider = Arc::new(SlowProvider {
            status,
            charges: AtomicU32::new(0),
        });
        let mut registry = ProviderRegistry::new();
        registry.register("stripe".into(), provider.clone());

        let service = Arc::new(PaymentService::new(
            directory.clone(),
            Arc::new(registry),
            &Settings::default(),
        ));
        let webhooks = Arc::new(WebhookIngestor::new(
            directory,
            service.ledger().clone(),
            service.disputes().clone(),
            &WebhookSettings::default(),
        ));
        let settlements = Arc::new(SettlementBatcher::new(
            service.ledger().clone(),
            service.refunds().clone(),
            service.disputes().clone(),
        ));

        let app = server::router(AppState {
            service,
            webhooks,
            settlements,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to be ready by polling with retries
        let client = Client::new();
        let health_url = format!("{}/health", base_url);
        for _ in 0..50 {
            match client.get(&health_url).send().await {
                Ok(_) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }

        TestServer {
            base_url,
            client,
            provider,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create(&self, key: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/transactions"))
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    async fn webhook(&self, body: &Value, signature: Option<String>) -> reqwest::Response {
        let body = serde_json::to_vec(body).unwrap();
        let mut request = self
            .client
            .post(self.url("/webhooks/stripe/T1"))
            .header("content-type", "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        request.send().await.unwrap()
    }
}

fn order(amount: &str) -> Value {
    json!({
        "tenant_id": "T1",
        "provider_id": "stripe",
        "order_id": "o-1",
        "amount": amount
    })
}

async fn error_code(response: reqwest::Response) -> String {
    response.json::<ErrorResponse>().await.unwrap().code
}

// === Tests ===

#[tokio::test]
async fn create_transaction_then_replay() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;

    let first = server.create("k1", &order("100.00")).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: TransactionView = first.json().await.unwrap();
    assert_eq!(first.status, TransactionStatus::Completed);
    assert_eq!(first.platform_fee, dec!(3.20));
    assert_eq!(first.tenant_net_amount, dec!(96.80));

    let replay = server.create("k1", &order("100.00")).await;
    assert_eq!(replay.status(), StatusCode::CREATED);
    let replay: TransactionView = replay.json().await.unwrap();
    assert_eq!(replay, first);
    assert_eq!(server.provider.charges.load(Ordering::SeqCst), 1);

    let row: PaymentTransaction = server
        .client
        .get(server.url(&format!("/transactions/{}", first.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(row.gross_amount, dec!(100.00));
    assert!(row.processed_at.is_some());
}

#[tokio::test]
async fn key_reuse_and_missing_key_are_rejected() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;
    server.create("k1", &order("100.00")).await;

    let conflict = server.create("k1", &order("99.00")).await;
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    assert_eq!(error_code(conflict).await, "IDEMPOTENCY_CONFLICT");

    let missing = server
        .client
        .post(server.url("/transactions"))
        .json(&order("10.00"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(missing).await, "MALFORMED_PAYLOAD");
}

#[tokio::test]
async fn invalid_amount_and_unknown_transaction() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;

    let invalid = server.create("k1", &order("-5.00")).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(invalid).await, "INVALID_AMOUNT");

    let missing = server
        .client
        .get(server.url(&format!("/transactions/{}", uuid::Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(missing).await, "TRANSACTION_NOT_FOUND");
}

/// Many clients retrying the same request at once get one transaction.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_transaction() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let client = server.client.clone();
        let url = server.url("/transactions");
        handles.push(tokio::spawn(async move {
            let response = client
                .post(&url)
                .header(IDEMPOTENCY_KEY_HEADER, "shared-key")
                .json(&order("42.00"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            response.json::<TransactionView>().await.unwrap()
        }));
    }

    let views: Vec<TransactionView> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert!(views.iter().all(|v| v.id == views[0].id));
    assert_eq!(server.provider.charges.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn webhook_signature_and_duplicates() {
    let server = TestServer::new(ProviderChargeStatus::Pending).await;
    let view: TransactionView = server
        .create("k1", &order("50.00"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(view.status, TransactionStatus::Pending);

    let event = json!({
        "id": "evt_1",
        "type": "payment.succeeded",
        "data": {"transaction_id": view.id, "amount": "50.00"}
    });
    let body = serde_json::to_vec(&event).unwrap();

    let unsigned = server.webhook(&event, None).await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(unsigned).await, "SIGNATURE_INVALID");

    let forged = server
        .webhook(&event, Some(sign("wrong-secret", &body).unwrap()))
        .await;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let signature = sign(SECRET, &body).unwrap();
    let applied = server.webhook(&event, Some(signature.clone())).await;
    assert_eq!(applied.status(), StatusCode::OK);
    assert_eq!(
        applied.json::<Value>().await.unwrap(),
        json!({"status": "applied"})
    );

    let duplicate = server.webhook(&event, Some(signature)).await;
    assert_eq!(duplicate.status(), StatusCode::OK);
    assert_eq!(
        duplicate.json::<Value>().await.unwrap(),
        json!({"status": "duplicate"})
    );

    let row: PaymentTransaction = server
        .client
        .get(server.url(&format!("/transactions/{}", view.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn early_webhook_is_accepted_for_retry() {
    let server = TestServer::new(ProviderChargeStatus::Pending).await;
    let event = json!({
        "id": "evt_early",
        "type": "payment.succeeded",
        "data": {"provider_transaction_id": "pi_not_yet", "amount": "5.00"}
    });
    let body = serde_json::to_vec(&event).unwrap();

    let response = server
        .webhook(&event, Some(sign(SECRET, &body).unwrap()))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"status": "retry_scheduled"})
    );
}

#[tokio::test]
async fn refund_beyond_remaining_balance_is_rejected() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;
    let view: TransactionView = server
        .create("k1", &order("100.00"))
        .await
        .json()
        .await
        .unwrap();
    let refunds = server.url(&format!("/transactions/{}/refunds", view.id));

    let first = server
        .client
        .post(&refunds)
        .json(&json!({"amount": "30.00", "reason": "damaged"}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = server
        .client
        .post(&refunds)
        .json(&json!({"amount": "80.00", "reason": "changed mind"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(second).await, "INSUFFICIENT_REFUNDABLE");
}

#[tokio::test]
async fn settlement_run_fetch_and_reconcile() {
    let server = TestServer::new(ProviderChargeStatus::Succeeded).await;
    server.create("k1", &order("100.00")).await;
    let today = Utc::now().date_naive();
    let path = format!("/settlements/stripe/{today}");

    let missing = server.client.get(server.url(&path)).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(missing).await, "SETTLEMENT_NOT_FOUND");

    let run: Settlement = server
        .client
        .post(server.url(&path))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run.gross_amount, dec!(100.00));
    assert_eq!(run.fee_amount, dec!(3.20));
    assert_eq!(run.net_amount, dec!(96.80));
    assert_eq!(run.status, SettlementStatus::Computed);

    let reconciled: Settlement = server
        .client
        .post(server.url(&format!("{path}/reconcile")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reconciled.id, run.id);
    assert_eq!(reconciled.status, SettlementStatus::Reconciled);

    let fetched: Settlement = server
        .client
        .get(server.url(&path))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched.status, SettlementStatus::Reconciled);
}
