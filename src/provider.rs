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

//! Remote payment providers.
//!
//! The provider is an opaque HTTP service. Calls carry our own identifiers
//! as the provider-side idempotency key, so a retried call after a timeout
//! cannot charge or refund twice.

use crate::base::{OrderId, ProviderId, RefundId, TenantId, TransactionId};
use crate::config::ProviderSettings;
use crate::error::PaymentError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub transaction_id: TransactionId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChargeStatus {
    Pending,
    Authorized,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderCharge {
    pub provider_transaction_id: String,
    pub status: ProviderChargeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub refund_id: RefundId,
    pub transaction_id: TransactionId,
    pub provider_transaction_id: Option<String>,
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderRefund {
    pub provider_refund_id: String,
}

/// A payment provider reached over the network.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ProviderCharge, PaymentError>;

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, PaymentError>;
}

/// Providers by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ProviderId, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &ProviderId) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or(PaymentError::UnknownProvider)
    }
}

/// Exponential backoff with 0-25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt)).min(max_ms);
        let jitter = if delay_ms > 0 {
            fastrand::u64(0..=delay_ms / 4)
        } else {
            0
        };
        Duration::from_millis(delay_ms.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                debug!(attempt, ?delay, error = %err, "retrying provider call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// JSON-over-HTTP provider client.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpProvider {
    pub fn new(
        settings: &ProviderSettings,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            retry,
        })
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        idempotency_key: String,
        body: &B,
    ) -> Result<R, PaymentError> {
        let url = format!("{}{}", self.base_url, path);
        let (url, idempotency_key) = (&url, &idempotency_key);
        retry_with_backoff(&self.retry, || async move {
            let response = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .send()
                .await
                .map_err(map_transport_error)?;

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                warn!(%status, %url, "provider unavailable");
                return Err(PaymentError::ProviderTimeout);
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(PaymentError::Provider(format!("{status}: {text}")));
            }
            // A 2xx means the provider acted; an unreadable body does not undo that.
            response
                .json::<R>()
                .await
                .map_err(|e| {
                    PaymentError::ProviderOutcomeUnknown(format!("response body: {e}"))
                })
        })
        .await
    }
}

/// Only errors raised before anything was sent are definitive. Everything
/// else may have reached the provider.
fn map_transport_error(err: reqwest::Error) -> PaymentError {
    if err.is_timeout() || err.is_connect() {
        PaymentError::ProviderTimeout
    } else if err.is_builder() {
        PaymentError::Provider(err.to_string())
    } else {
        PaymentError::ProviderOutcomeUnknown(err.to_string())
    }
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ProviderCharge, PaymentError> {
        self.post("/charges", request.transaction_id.to_string(), request)
            .await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, PaymentError> {
        self.post("/refunds", request.refund_id.to_string(), request)
            .await
    }
}
