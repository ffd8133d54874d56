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

//! Refunds.
//!
//! A refund first reserves its amount on the transaction row, then calls the
//! provider. Pending and completed refunds both count against the gross
//! amount, so two concurrent refunds can never jointly exceed it. Only a
//! definitive provider decline gives the reservation back.
//!
//! A refund whose outcome is unknown (provider timeout, connection lost after
//! sending, caller gone mid-call) stays `pending` and keeps its reservation.
//! [`RefundManager::retry_refund`] re-sends it under the same refund id.

use crate::base::{ProviderId, RefundId, TransactionId};
use crate::error::PaymentError;
use crate::ledger::Ledger;
use crate::provider::{ProviderRefund, ProviderRegistry, RefundRequest};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub transaction_id: TransactionId,
    pub provider_id: ProviderId,
    pub amount: Decimal,
    pub reason: String,
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct RefundManager {
    ledger: Arc<Ledger>,
    providers: Arc<ProviderRegistry>,
    refunds: DashMap<RefundId, Refund>,
}

impl RefundManager {
    pub fn new(ledger: Arc<Ledger>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            ledger,
            providers,
            refunds: DashMap::new(),
        }
    }

    /// Refunds `amount` of a completed charge.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InsufficientRefundable`] - amount exceeds what is left
    ///   after earlier refunds.
    /// - [`PaymentError::NotRefundable`] - transaction is not a completed charge.
    /// - Provider declines, after the reservation has been released.
    ///
    /// A timeout is not an error here: the refund comes back `pending`.
    #[instrument(skip(self, reason))]
    pub async fn create_refund(
        &self,
        transaction_id: TransactionId,
        amount: Decimal,
        reason: String,
    ) -> Result<Refund, PaymentError> {
        let provider_id = self
            .ledger
            .get(transaction_id)
            .ok_or(PaymentError::TransactionNotFound)?
            .tenant_provider_id;
        let provider = self.providers.get(&provider_id)?;

        let transaction = self.ledger.reserve_refund(transaction_id, amount)?;
        let refund = Refund {
            id: RefundId::new(),
            transaction_id,
            provider_id,
            amount,
            reason,
            status: RefundStatus::Pending,
            provider_refund_id: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.refunds.insert(refund.id, refund.clone());

        let request = RefundRequest {
            refund_id: refund.id,
            transaction_id,
            provider_transaction_id: transaction.provider_transaction_id.clone(),
            amount,
            reason: refund.reason.clone(),
        };
        let result = provider.refund(&request).await;
        self.settle(refund.id, result)
    }

    /// Re-sends a `pending` refund under its original id, so the provider
    /// deduplicates it against the earlier attempt.
    ///
    /// Refunds that already completed or failed are returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::RefundNotFound`] - no refund with this id.
    /// - Provider errors that decline the refund, after the reservation has
    ///   been released.
    #[instrument(skip(self))]
    pub async fn retry_refund(&self, id: RefundId) -> Result<Refund, PaymentError> {
        let refund = self.get(id).ok_or(PaymentError::RefundNotFound)?;
        if refund.status != RefundStatus::Pending {
            return Ok(refund);
        }
        let provider = self.providers.get(&refund.provider_id)?;
        let provider_transaction_id = self
            .ledger
            .get(refund.transaction_id)
            .ok_or(PaymentError::TransactionNotFound)?
            .provider_transaction_id;
        let request = RefundRequest {
            refund_id: refund.id,
            transaction_id: refund.transaction_id,
            provider_transaction_id,
            amount: refund.amount,
            reason: refund.reason.clone(),
        };
        let result = provider.refund(&request).await;
        self.settle(id, result)
    }

    /// Records a provider answer on a `pending` refund.
    ///
    /// Holds the refund entry while touching the ledger, so concurrent
    /// retries settle it once. An unknown outcome keeps the refund pending
    /// with its reservation; only a definitive decline gives it back.
    fn settle(
        &self,
        id: RefundId,
        result: Result<ProviderRefund, PaymentError>,
    ) -> Result<Refund, PaymentError> {
        let mut refund = self
            .refunds
            .get_mut(&id)
            .ok_or(PaymentError::RefundNotFound)?;
        if refund.status != RefundStatus::Pending {
            return Ok(refund.clone());
        }
        match result {
            Ok(response) => {
                self.ledger.confirm_refund(refund.transaction_id, refund.amount);
                refund.status = RefundStatus::Completed;
                refund.provider_refund_id = Some(response.provider_refund_id);
                refund.completed_at = Some(Utc::now());
                info!(refund = %refund.id, amount = %refund.amount, "refund completed");
                Ok(refund.clone())
            }
            Err(err) if err.is_outcome_unknown() => {
                warn!(refund = %refund.id, error = %err, "refund outcome unknown, kept pending");
                Ok(refund.clone())
            }
            Err(err) => {
                self.ledger.release_refund(refund.transaction_id, refund.amount);
                refund.status = RefundStatus::Failed;
                warn!(refund = %refund.id, error = %err, "refund failed at provider");
                Err(err)
            }
        }
    }

    pub fn get(&self, id: RefundId) -> Option<Refund> {
        self.refunds.get(&id).map(|r| r.clone())
    }

    pub fn refunds_for(&self, transaction_id: TransactionId) -> Vec<Refund> {
        let mut refunds: Vec<Refund> = self
            .refunds
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .map(|r| r.clone())
            .collect();
        refunds.sort_by_key(|r| r.created_at);
        refunds
    }

    /// Refunds completed through `provider_id` on `date` (UTC).
    pub fn completed_refunds(&self, provider_id: &ProviderId, date: NaiveDate) -> Vec<Refund> {
        self.refunds
            .iter()
            .filter(|r| {
                r.status == RefundStatus::Completed
                    && &r.provider_id == provider_id
                    && r.completed_at.map(|at| at.date_naive()) == Some(date)
            })
            .map(|r| r.clone())
            .collect()
    }
}
