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

//! Webhook ingestion.
//!
//! Providers deliver events at least once. Each delivery goes through:
//!
//! 1. **Signature check.** HMAC-SHA256 of the raw body with the provider's
//!    secret. A bad signature is recorded as `rejected` and never applied.
//! 2. **Deduplication.** The first verified delivery of a
//!    `(provider_id, event_id)` pair inserts the event row; later deliveries
//!    find it and return without touching the ledger.
//! 3. **Application.** The event is mapped onto a ledger transition or a
//!    dispute change, after checking its amount against the transaction.
//!
//! Transient failures schedule a retry with exponential backoff; once
//! `max_attempts` is used up the event is marked `failed` and an alert is
//! logged. Integrity failures go to `manual_review`.
//!
//! Rejected deliveries never occupy a deduplication slot, so a forged event
//! cannot shadow the genuine delivery of the same event id.

use crate::base::{EventId, ProviderId, TenantId, TransactionId, WebhookEventId};
use crate::config::{Directory, WebhookSettings};
use crate::dispute::{DisputeManager, DisputeOutcome, DisputeStatus};
use crate::error::PaymentError;
use crate::ledger::Ledger;
use crate::provider::RetryPolicy;
use crate::telemetry::ALERT_TARGET;
use crate::transaction::TransactionStatus;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex digest>`.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Computes the signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, PaymentError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Config(format!("webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks `signature` (with or without the `sha256=` prefix) in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let digest = signature.trim();
    let digest = digest.strip_prefix("sha256=").unwrap_or(digest);
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processing,
    Processed,
    /// Verified but of a kind this service does not act on.
    Ignored,
    /// Signature missing or wrong.
    Rejected,
    RetryScheduled,
    /// Retries exhausted.
    Failed,
    ManualReview,
}

/// One stored delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub provider_id: ProviderId,
    pub tenant_id: TenantId,
    pub event_id: Option<EventId>,
    pub event_type: Option<String>,
    pub payload: String,
    pub signature_verified: bool,
    pub status: WebhookStatus,
    pub processing_attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Applied or deliberately skipped; either way never applied again.
    pub fn processed(&self) -> bool {
        matches!(self.status, WebhookStatus::Processed | WebhookStatus::Ignored)
    }
}

/// Provider event envelope. Amounts are decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub dispute_id: Option<String>,
    #[serde(default)]
    pub evidence_due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    PaymentAuthorized,
    PaymentSucceeded,
    PaymentFailed,
    DisputeCreated,
    DisputeResolved(DisputeOutcome),
    Unknown,
}

impl EventKind {
    fn parse(event_type: &str) -> Self {
        match event_type {
            "payment.authorized" => EventKind::PaymentAuthorized,
            "payment.succeeded" => EventKind::PaymentSucceeded,
            "payment.failed" => EventKind::PaymentFailed,
            "dispute.created" => EventKind::DisputeCreated,
            "dispute.won" => EventKind::DisputeResolved(DisputeOutcome::Won),
            "dispute.lost" => EventKind::DisputeResolved(DisputeOutcome::Lost),
            _ => EventKind::Unknown,
        }
    }
}

/// What happened to a delivery, as reported back to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied,
    /// Seen before; nothing was changed.
    Duplicate,
    Ignored,
    RetryScheduled,
    ManualReview,
    Failed,
}

enum Applied {
    Changed,
    Skipped,
}

pub struct WebhookIngestor {
    directory: Arc<Directory>,
    ledger: Arc<Ledger>,
    disputes: Arc<DisputeManager>,
    events: DashMap<WebhookEventId, WebhookEvent>,
    /// Deduplication index over verified deliveries.
    index: DashMap<(ProviderId, EventId), WebhookEventId>,
    /// Events waiting for their next attempt, in scheduling order.
    retries: SegQueue<WebhookEventId>,
    max_attempts: u32,
    backoff: RetryPolicy,
}

impl WebhookIngestor {
    pub fn new(
        directory: Arc<Directory>,
        ledger: Arc<Ledger>,
        disputes: Arc<DisputeManager>,
        settings: &WebhookSettings,
    ) -> Self {
        Self {
            directory,
            ledger,
            disputes,
            events: DashMap::new(),
            index: DashMap::new(),
            retries: SegQueue::new(),
            max_attempts: settings.max_attempts.max(1),
            backoff: settings.retry_policy(),
        }
    }

    /// Verifies, deduplicates and applies one delivery.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::UnknownProvider`] - no webhook secret for `provider_id`.
    /// - [`PaymentError::SignatureInvalid`] - delivery stored as `rejected`.
    /// - [`PaymentError::MalformedPayload`] - signed body is not an event envelope.
    #[instrument(skip(self, body, signature), fields(provider = %provider_id, tenant = %tenant_id))]
    pub fn receive(
        &self,
        provider_id: &ProviderId,
        tenant_id: &TenantId,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, PaymentError> {
        let secret = self.directory.webhook_secret(provider_id)?;
        let now = Utc::now();
        let payload: Result<WebhookPayload, _> = serde_json::from_slice(body);

        if !verify_signature(&secret, body, signature) {
            let row = self.new_row(provider_id, tenant_id, body, payload.ok(), false, now);
            error!(
                target: ALERT_TARGET,
                provider = %provider_id,
                tenant = %tenant_id,
                event = ?row.event_id,
                "webhook signature invalid, delivery rejected"
            );
            self.events.insert(row.id, row);
            return Err(PaymentError::SignatureInvalid);
        }

        let payload = payload.map_err(|e| {
            warn!(error = %e, "signed webhook body is not a valid event");
            PaymentError::MalformedPayload(e.to_string())
        })?;

        let id = match self.index.entry((provider_id.clone(), payload.id.clone())) {
            Entry::Occupied(existing) => {
                debug!(event = %payload.id, row = %existing.get(), "duplicate webhook delivery");
                return Ok(IngestOutcome::Duplicate);
            }
            Entry::Vacant(slot) => {
                let row = self.new_row(provider_id, tenant_id, body, Some(payload.clone()), true, now);
                let id = row.id;
                self.events.insert(id, row);
                slot.insert(id);
                id
            }
        };

        Ok(self.attempt(id, &payload))
    }

    fn new_row(
        &self,
        provider_id: &ProviderId,
        tenant_id: &TenantId,
        body: &[u8],
        payload: Option<WebhookPayload>,
        verified: bool,
        now: DateTime<Utc>,
    ) -> WebhookEvent {
        let (event_id, event_type) = match payload {
            Some(p) => (Some(p.id), Some(p.event_type)),
            None => (None, None),
        };
        WebhookEvent {
            id: WebhookEventId::new(),
            provider_id: provider_id.clone(),
            tenant_id: tenant_id.clone(),
            event_id,
            event_type,
            payload: String::from_utf8_lossy(body).into_owned(),
            signature_verified: verified,
            status: if verified {
                WebhookStatus::Processing
            } else {
                WebhookStatus::Rejected
            },
            processing_attempts: 0,
            last_error: None,
            next_attempt_at: None,
            received_at: now,
            processed_at: None,
        }
    }

    /// Runs one processing attempt on an event in `processing` state and
    /// records the result on its row.
    fn attempt(&self, id: WebhookEventId, payload: &WebhookPayload) -> IngestOutcome {
        let Some((provider_id, tenant_id)) = self
            .events
            .get(&id)
            .map(|e| (e.provider_id.clone(), e.tenant_id.clone()))
        else {
            return IngestOutcome::Failed;
        };

        let result = self.apply(&provider_id, &tenant_id, payload);
        let now = Utc::now();

        let Some(mut event) = self.events.get_mut(&id) else {
            return IngestOutcome::Failed;
        };
        event.processing_attempts += 1;
        event.next_attempt_at = None;

        match result {
            Ok(Applied::Changed) => {
                event.status = WebhookStatus::Processed;
                event.processed_at = Some(now);
                event.last_error = None;
                info!(event = %payload.id, kind = %payload.event_type, "webhook applied");
                IngestOutcome::Applied
            }
            Ok(Applied::Skipped) => {
                event.status = WebhookStatus::Ignored;
                event.processed_at = Some(now);
                event.last_error = None;
                debug!(event = %payload.id, kind = %payload.event_type, "webhook ignored");
                IngestOutcome::Ignored
            }
            Err(err) if is_transient(&err) => {
                event.last_error = Some(err.to_string());
                if event.processing_attempts >= self.max_attempts {
                    event.status = WebhookStatus::Failed;
                    error!(
                        target: ALERT_TARGET,
                        event = %payload.id,
                        provider = %provider_id,
                        attempts = event.processing_attempts,
                        error = %err,
                        "webhook retries exhausted"
                    );
                    IngestOutcome::Failed
                } else {
                    let delay = self.backoff.delay(event.processing_attempts - 1);
                    event.status = WebhookStatus::RetryScheduled;
                    event.next_attempt_at = Some(
                        now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX),
                    );
                    self.retries.push(id);
                    warn!(
                        event = %payload.id,
                        attempts = event.processing_attempts,
                        ?delay,
                        error = %err,
                        "webhook processing failed, retry scheduled"
                    );
                    IngestOutcome::RetryScheduled
                }
            }
            Err(err) => {
                event.status = WebhookStatus::ManualReview;
                event.last_error = Some(err.to_string());
                if err.is_integrity_violation() {
                    error!(
                        target: ALERT_TARGET,
                        event = %payload.id,
                        provider = %provider_id,
                        error = %err,
                        "webhook integrity violation, flagged for manual review"
                    );
                } else {
                    warn!(
                        event = %payload.id,
                        provider = %provider_id,
                        error = %err,
                        "webhook flagged for manual review"
                    );
                }
                IngestOutcome::ManualReview
            }
        }
    }

    fn apply(
        &self,
        provider_id: &ProviderId,
        tenant_id: &TenantId,
        payload: &WebhookPayload,
    ) -> Result<Applied, PaymentError> {
        let kind = EventKind::parse(&payload.event_type);
        let data = &payload.data;
        let target = match kind {
            EventKind::PaymentAuthorized => TransactionStatus::Authorized,
            EventKind::PaymentSucceeded => TransactionStatus::Completed,
            EventKind::PaymentFailed => TransactionStatus::Failed,
            EventKind::DisputeCreated => {
                return self.apply_dispute_created(provider_id, tenant_id, data);
            }
            EventKind::DisputeResolved(outcome) => {
                return self.apply_dispute_resolved(provider_id, data, outcome);
            }
            EventKind::Unknown => return Ok(Applied::Skipped),
        };

        let transaction_id = self.resolve_transaction(provider_id, data)?;
        let transaction = self
            .ledger
            .get(transaction_id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if &transaction.tenant_id != tenant_id {
            return Err(PaymentError::MalformedPayload(
                "event refers to another tenant's transaction".into(),
            ));
        }
        let received = data
            .amount
            .ok_or_else(|| PaymentError::MalformedPayload("missing amount".into()))?;
        if received != transaction.gross_amount {
            return Err(PaymentError::AmountMismatch {
                expected: transaction.gross_amount,
                received,
            });
        }

        // `authorized` arriving after `completed` is out of order, not a conflict.
        if target == TransactionStatus::Authorized
            && transaction.status == TransactionStatus::Completed
        {
            return Ok(Applied::Skipped);
        }

        match self
            .ledger
            .advance_to(transaction_id, target, data.provider_transaction_id.clone())?
        {
            Some(_) => Ok(Applied::Changed),
            None => Ok(Applied::Skipped),
        }
    }

    fn resolve_transaction(
        &self,
        provider_id: &ProviderId,
        data: &EventData,
    ) -> Result<TransactionId, PaymentError> {
        if let Some(id) = data.transaction_id {
            return Ok(id);
        }
        let reference = data.provider_transaction_id.as_deref().ok_or_else(|| {
            PaymentError::MalformedPayload("missing transaction reference".into())
        })?;
        self.ledger
            .find_by_provider_reference(provider_id, reference)
            .ok_or(PaymentError::TransactionNotFound)
    }

    fn apply_dispute_created(
        &self,
        provider_id: &ProviderId,
        tenant_id: &TenantId,
        data: &EventData,
    ) -> Result<Applied, PaymentError> {
        let dispute_ref = data
            .dispute_id
            .as_deref()
            .ok_or_else(|| PaymentError::MalformedPayload("missing dispute_id".into()))?;
        let amount = data
            .amount
            .ok_or_else(|| PaymentError::MalformedPayload("missing amount".into()))?;
        let due = data
            .evidence_due_date
            .ok_or_else(|| PaymentError::MalformedPayload("missing evidence_due_date".into()))?;
        let transaction_id = self.resolve_transaction(provider_id, data)?;
        let transaction = self
            .ledger
            .get(transaction_id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if &transaction.tenant_id != tenant_id {
            return Err(PaymentError::MalformedPayload(
                "event refers to another tenant's transaction".into(),
            ));
        }

        self.disputes
            .open_provider_dispute(provider_id, dispute_ref, transaction_id, amount, due)?;
        Ok(Applied::Changed)
    }

    fn apply_dispute_resolved(
        &self,
        provider_id: &ProviderId,
        data: &EventData,
        outcome: DisputeOutcome,
    ) -> Result<Applied, PaymentError> {
        let dispute_ref = data
            .dispute_id
            .as_deref()
            .ok_or_else(|| PaymentError::MalformedPayload("missing dispute_id".into()))?;
        let id = self
            .disputes
            .find_by_provider_reference(provider_id, dispute_ref)
            .ok_or(PaymentError::DisputeNotFound)?;
        let dispute = self.disputes.get(id).ok_or(PaymentError::DisputeNotFound)?;
        if dispute.status == DisputeStatus::from(outcome) {
            return Ok(Applied::Skipped);
        }
        self.disputes.resolve(id, outcome)?;
        Ok(Applied::Changed)
    }

    /// Re-attempts every scheduled event whose backoff has elapsed by `now`.
    /// Returns how many events were attempted.
    pub fn retry_due(&self, now: DateTime<Utc>) -> usize {
        let mut attempted = 0;
        for _ in 0..self.retries.len() {
            let Some(id) = self.retries.pop() else {
                break;
            };
            let claimed = {
                let Some(mut event) = self.events.get_mut(&id) else {
                    continue;
                };
                if event.status != WebhookStatus::RetryScheduled {
                    continue;
                }
                if event.next_attempt_at.is_some_and(|at| at > now) {
                    None
                } else {
                    event.status = WebhookStatus::Processing;
                    Some(event.payload.clone())
                }
            };

            let Some(body) = claimed else {
                self.retries.push(id);
                continue;
            };
            match serde_json::from_str::<WebhookPayload>(&body) {
                Ok(payload) => {
                    self.attempt(id, &payload);
                    attempted += 1;
                }
                Err(e) => {
                    if let Some(mut event) = self.events.get_mut(&id) {
                        event.status = WebhookStatus::ManualReview;
                        event.last_error = Some(e.to_string());
                    }
                }
            }
        }
        attempted
    }

    /// Calls [`WebhookIngestor::retry_due`] every `interval` until `shutdown`.
    pub async fn run_retry_worker(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let attempted = self.retry_due(Utc::now());
                    if attempted > 0 {
                        debug!(attempted, "webhook retries attempted");
                    }
                }
            }
        }
        info!("webhook retry worker stopped");
    }

    pub fn get(&self, provider_id: &ProviderId, event_id: &EventId) -> Option<WebhookEvent> {
        let id = *self.index.get(&(provider_id.clone(), event_id.clone()))?;
        self.events.get(&id).map(|e| e.clone())
    }

    /// Every stored delivery, oldest first.
    pub fn events(&self) -> Vec<WebhookEvent> {
        let mut events: Vec<WebhookEvent> = self.events.iter().map(|e| e.clone()).collect();
        events.sort_by_key(|e| e.received_at);
        events
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }
}

/// Errors that may clear up on their own: a webhook can overtake the
/// request that creates its transaction or dispute.
fn is_transient(err: &PaymentError) -> bool {
    err.is_retryable() || matches!(err, PaymentError::DisputeNotFound)
}
