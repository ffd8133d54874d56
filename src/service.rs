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

//! Payment API used by the checkout subsystem.
//!
//! [`PaymentService::create_transaction`] is the only path that creates
//! ledger rows:
//!
//! ```text
//! claim key ─► fee schedule ─► ledger.create (pending) ─► provider charge ─► complete key
//!     │
//!     ├─ replay ─► stored view
//!     └─ in flight ─► wait (read-only) ─► stored view
//! ```
//!
//! The key is only marked `failed` when nothing was written. Once the
//! ledger row exists the key is completed with its view, whatever the
//! provider said, so a retry can never create a second transaction.

use crate::base::{
    DisputeId, IdempotencyKey, OrderId, ProviderId, RefundId, TenantId, TransactionId,
};
use crate::config::{Directory, Settings};
use crate::dispute::{Dispute, DisputeManager, DisputeOutcome};
use crate::error::PaymentError;
use crate::idempotency::{Claim, ClaimTicket, IdempotencyGuard, RequestHash};
use crate::ledger::{Ledger, NewTransaction};
use crate::provider::{ChargeRequest, PaymentProvider, ProviderChargeStatus, ProviderRegistry};
use crate::refund::{Refund, RefundManager};
use crate::transaction::{PaymentTransaction, TransactionStatus, TransactionType, TransactionView};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

/// Body of a transaction creation request. Its JSON encoding is what the
/// idempotency key is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub tenant_id: TenantId,
    pub provider_id: ProviderId,
    pub order_id: OrderId,
    pub amount: Decimal,
    #[serde(default)]
    pub tax_amount: Decimal,
}

pub struct PaymentService {
    directory: Arc<Directory>,
    ledger: Arc<Ledger>,
    providers: Arc<ProviderRegistry>,
    idempotency: IdempotencyGuard<TransactionView>,
    refunds: Arc<RefundManager>,
    disputes: Arc<DisputeManager>,
    in_flight_wait: Duration,
}

impl PaymentService {
    pub fn new(
        directory: Arc<Directory>,
        providers: Arc<ProviderRegistry>,
        settings: &Settings,
    ) -> Self {
        let ledger = Arc::new(Ledger::with_minor_units(settings.currency_minor_units));
        let refunds = Arc::new(RefundManager::new(ledger.clone(), providers.clone()));
        let disputes = Arc::new(DisputeManager::new(ledger.clone()));
        Self {
            directory,
            ledger,
            providers,
            idempotency: IdempotencyGuard::new(settings.idempotency.ttl),
            refunds,
            disputes,
            in_flight_wait: settings.idempotency.in_flight_wait,
        }
    }

    /// Creates and charges a transaction exactly once per idempotency key.
    ///
    /// A repeated request with the same key and body returns the stored view.
    /// A concurrent one waits (up to `idempotency.in_flight_wait`) for the
    /// first to finish and returns its view.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::IdempotencyConflict`] - key reused with another body.
    /// - [`PaymentError::InFlight`] - first request still running after the wait.
    /// - [`PaymentError::UnknownTenant`] / [`PaymentError::UnknownProvider`].
    /// - [`PaymentError::InvalidAmount`].
    /// - [`PaymentError::Internal`] - the owning task died; the key is still
    ///   resolved before this returns.
    #[instrument(skip(self, request), fields(tenant = %request.tenant_id, order = %request.order_id))]
    pub async fn create_transaction(
        self: &Arc<Self>,
        key: &IdempotencyKey,
        request: &CreateTransactionRequest,
    ) -> Result<TransactionView, PaymentError> {
        let hash = RequestHash::of(request)?;
        match self.idempotency.claim(key, &request.tenant_id, &hash) {
            Ok(Claim::Claimed(ticket)) => {
                // Detached from the caller: claim to complete runs to the end
                // even if the HTTP client disconnects mid-charge.
                let service = Arc::clone(self);
                let request = request.clone();
                tokio::spawn(
                    async move { service.execute(&ticket, &request).await }.in_current_span(),
                )
                .await
                .map_err(|e| PaymentError::Internal(format!("transaction task: {e}")))?
            }
            Ok(Claim::Replay(view)) => {
                debug!(transaction = %view.id, "idempotent replay");
                Ok(view)
            }
            Err(PaymentError::InFlight) => {
                debug!("request in flight, waiting for owner");
                self.idempotency
                    .wait_for_completion(key, &request.tenant_id, &hash, self.in_flight_wait)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(
        &self,
        ticket: &ClaimTicket,
        request: &CreateTransactionRequest,
    ) -> Result<TransactionView, PaymentError> {
        let mut guard = ClaimGuard {
            service: self,
            ticket,
            transaction_id: None,
            resolved: false,
        };
        let created = self
            .directory
            .fee_schedule(&request.tenant_id)
            .and_then(|schedule| {
                let provider = self.providers.get(&request.provider_id)?;
                let transaction = self.ledger.create(
                    ticket,
                    NewTransaction {
                        tenant_id: request.tenant_id.clone(),
                        provider_id: request.provider_id.clone(),
                        order_id: request.order_id.clone(),
                        gross_amount: request.amount,
                        tax_amount: request.tax_amount,
                        kind: TransactionType::Charge,
                    },
                    &schedule,
                )?;
                Ok((provider, transaction))
            });
        let (provider, transaction) = match created {
            Ok(created) => created,
            Err(err) => {
                guard.resolved = true;
                self.idempotency.fail(ticket);
                return Err(err);
            }
        };
        guard.transaction_id = Some(transaction.id);

        self.charge(provider.as_ref(), &transaction).await;

        let view = self
            .ledger
            .get(transaction.id)
            .map(|t| t.view())
            .unwrap_or_else(|| transaction.view());
        guard.resolved = true;
        self.idempotency.complete(ticket, view.clone())?;
        info!(transaction = %view.id, status = %view.status, "transaction request completed");
        Ok(view)
    }

    /// Sends the charge and records what the provider reported. Webhooks
    /// may have moved the row already, so losing a race is not an error.
    async fn charge(&self, provider: &dyn PaymentProvider, transaction: &PaymentTransaction) {
        let request = ChargeRequest {
            transaction_id: transaction.id,
            tenant_id: transaction.tenant_id.clone(),
            order_id: transaction.order_id.clone(),
            amount: transaction.gross_amount,
        };
        let result = match provider.create_charge(&request).await {
            Ok(charge) => {
                let reference = Some(charge.provider_transaction_id.clone());
                match charge.status {
                    ProviderChargeStatus::Pending => self
                        .ledger
                        .record_provider_reference(transaction.id, charge.provider_transaction_id),
                    ProviderChargeStatus::Authorized => self
                        .ledger
                        .advance_to(transaction.id, TransactionStatus::Authorized, reference)
                        .map(|_| ()),
                    ProviderChargeStatus::Succeeded => self
                        .ledger
                        .advance_to(transaction.id, TransactionStatus::Completed, reference)
                        .map(|_| ()),
                    ProviderChargeStatus::Failed => self
                        .ledger
                        .advance_to(transaction.id, TransactionStatus::Failed, reference)
                        .map(|_| ()),
                }
            }
            Err(err) if err.is_outcome_unknown() => {
                // The provider's webhook decides.
                warn!(
                    transaction = %transaction.id,
                    error = %err,
                    "charge outcome unknown, left pending"
                );
                Ok(())
            }
            Err(err) => {
                warn!(transaction = %transaction.id, error = %err, "charge rejected by provider");
                self.ledger
                    .advance_to(transaction.id, TransactionStatus::Failed, None)
                    .map(|_| ())
            }
        };
        if let Err(err) = result {
            debug!(transaction = %transaction.id, error = %err, "charge result not recorded");
        }
    }

    pub async fn create_refund(
        &self,
        transaction_id: TransactionId,
        amount: Decimal,
        reason: String,
    ) -> Result<Refund, PaymentError> {
        self.refunds.create_refund(transaction_id, amount, reason).await
    }

    pub async fn retry_refund(&self, id: RefundId) -> Result<Refund, PaymentError> {
        self.refunds.retry_refund(id).await
    }

    pub fn open_dispute(
        &self,
        transaction_id: TransactionId,
        amount: Decimal,
        evidence_due_date: DateTime<Utc>,
    ) -> Result<Dispute, PaymentError> {
        self.disputes
            .open_dispute(transaction_id, amount, evidence_due_date)
    }

    pub fn submit_evidence(&self, id: DisputeId, evidence: String) -> Result<Dispute, PaymentError> {
        self.disputes.submit_evidence(id, evidence)
    }

    pub fn resolve_dispute(
        &self,
        id: DisputeId,
        outcome: DisputeOutcome,
    ) -> Result<Dispute, PaymentError> {
        self.disputes.resolve(id, outcome)
    }

    pub fn transaction(&self, id: TransactionId) -> Result<PaymentTransaction, PaymentError> {
        self.ledger.get(id).ok_or(PaymentError::TransactionNotFound)
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn refunds(&self) -> &Arc<RefundManager> {
        &self.refunds
    }

    pub fn disputes(&self) -> &Arc<DisputeManager> {
        &self.disputes
    }

    pub fn idempotency(&self) -> &IdempotencyGuard<TransactionView> {
        &self.idempotency
    }

    /// Deletes expired idempotency keys every `interval` until `shutdown`.
    pub async fn run_idempotency_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.idempotency.cleanup_expired(Utc::now());
                }
            }
        }
        info!("idempotency sweeper stopped");
    }
}

/// Resolves a claimed key if [`PaymentService::execute`] unwinds before
/// doing so: completed with the row's view once a row exists, failed
/// otherwise.
struct ClaimGuard<'a> {
    service: &'a PaymentService,
    ticket: &'a ClaimTicket,
    transaction_id: Option<TransactionId>,
    resolved: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        match self.transaction_id.and_then(|id| self.service.ledger.get(id)) {
            Some(transaction) => {
                let view = transaction.view();
                if let Err(err) = self.service.idempotency.complete(self.ticket, view) {
                    debug!(error = %err, "abandoned key already resolved");
                }
            }
            None => self.service.idempotency.fail(self.ticket),
        }
        warn!(key = %self.ticket.key(), "transaction request abandoned, key resolved");
    }
}
