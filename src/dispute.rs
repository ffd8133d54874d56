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

//! Disputes (chargebacks).
//!
//! ```text
//!   open ──submit_evidence──► evidence_submitted ──resolve──► won | lost
//!     └────────────────────────resolve─────────────────────────┘
//! ```
//!
//! `won` and `lost` are final. A transaction carries at most one dispute
//! that is not yet final. Dispute amounts are bounded by the gross amount
//! independently of refunds.

use crate::base::{DisputeId, ProviderId, TransactionId};
use crate::error::PaymentError;
use crate::ledger::Ledger;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    EvidenceSubmitted,
    Won,
    Lost,
}

impl DisputeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DisputeStatus::Won | DisputeStatus::Lost)
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisputeStatus::Open => "open",
            DisputeStatus::EvidenceSubmitted => "evidence_submitted",
            DisputeStatus::Won => "won",
            DisputeStatus::Lost => "lost",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeOutcome {
    Won,
    Lost,
}

impl From<DisputeOutcome> for DisputeStatus {
    fn from(outcome: DisputeOutcome) -> Self {
        match outcome {
            DisputeOutcome::Won => DisputeStatus::Won,
            DisputeOutcome::Lost => DisputeStatus::Lost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub transaction_id: TransactionId,
    pub provider_id: ProviderId,
    pub amount: Decimal,
    pub status: DisputeStatus,
    pub evidence_due_date: DateTime<Utc>,
    /// Provider's id when the dispute was opened through a webhook.
    pub provider_dispute_id: Option<String>,
    pub evidence: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct DisputeManager {
    ledger: Arc<Ledger>,
    disputes: DashMap<DisputeId, Dispute>,
    provider_refs: DashMap<(ProviderId, String), DisputeId>,
}

impl DisputeManager {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            disputes: DashMap::new(),
            provider_refs: DashMap::new(),
        }
    }

    /// Opens a dispute against a completed charge.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidAmount`] - amount not positive or above gross.
    /// - [`PaymentError::NotRefundable`] - transaction is not a completed charge.
    /// - [`PaymentError::AlreadyDisputed`] - another dispute is still open.
    #[instrument(skip(self))]
    pub fn open_dispute(
        &self,
        transaction_id: TransactionId,
        amount: Decimal,
        evidence_due_date: DateTime<Utc>,
    ) -> Result<Dispute, PaymentError> {
        self.open(transaction_id, amount, evidence_due_date, None)
    }

    /// Opens a dispute reported by the provider, or returns the one already
    /// recorded under `provider_dispute_id`.
    pub fn open_provider_dispute(
        &self,
        provider_id: &ProviderId,
        provider_dispute_id: &str,
        transaction_id: TransactionId,
        amount: Decimal,
        evidence_due_date: DateTime<Utc>,
    ) -> Result<Dispute, PaymentError> {
        match self
            .provider_refs
            .entry((provider_id.clone(), provider_dispute_id.to_string()))
        {
            Entry::Occupied(entry) => self.get(*entry.get()).ok_or(PaymentError::DisputeNotFound),
            Entry::Vacant(entry) => {
                let dispute = self.open(
                    transaction_id,
                    amount,
                    evidence_due_date,
                    Some(provider_dispute_id.to_string()),
                )?;
                entry.insert(dispute.id);
                Ok(dispute)
            }
        }
    }

    fn open(
        &self,
        transaction_id: TransactionId,
        amount: Decimal,
        evidence_due_date: DateTime<Utc>,
        provider_dispute_id: Option<String>,
    ) -> Result<Dispute, PaymentError> {
        let transaction = self
            .ledger
            .get(transaction_id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if amount <= Decimal::ZERO || amount > transaction.gross_amount {
            return Err(PaymentError::InvalidAmount);
        }
        self.ledger.mark_disputed(transaction_id)?;

        let now = Utc::now();
        let dispute = Dispute {
            id: DisputeId::new(),
            transaction_id,
            provider_id: transaction.tenant_provider_id,
            amount,
            status: DisputeStatus::Open,
            evidence_due_date,
            provider_dispute_id,
            evidence: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        self.disputes.insert(dispute.id, dispute.clone());
        info!(dispute = %dispute.id, transaction = %transaction_id, %amount, "dispute opened");
        Ok(dispute)
    }

    /// Attaches evidence; allowed until the due date while the dispute is open.
    pub fn submit_evidence(
        &self,
        id: DisputeId,
        evidence: String,
    ) -> Result<Dispute, PaymentError> {
        let mut dispute = self
            .disputes
            .get_mut(&id)
            .ok_or(PaymentError::DisputeNotFound)?;
        if dispute.status.is_terminal() {
            return Err(PaymentError::DisputeClosed);
        }
        let now = Utc::now();
        if now > dispute.evidence_due_date {
            return Err(PaymentError::EvidenceWindowClosed);
        }
        dispute.status = DisputeStatus::EvidenceSubmitted;
        dispute.evidence = Some(evidence);
        dispute.updated_at = now;
        info!(dispute = %id, "dispute evidence submitted");
        Ok(dispute.clone())
    }

    /// Closes the dispute as `won` or `lost`.
    #[instrument(skip(self))]
    pub fn resolve(&self, id: DisputeId, outcome: DisputeOutcome) -> Result<Dispute, PaymentError> {
        let resolved = {
            let mut dispute = self
                .disputes
                .get_mut(&id)
                .ok_or(PaymentError::DisputeNotFound)?;
            if dispute.status.is_terminal() {
                return Err(PaymentError::DisputeClosed);
            }
            let now = Utc::now();
            dispute.status = outcome.into();
            dispute.resolved_at = Some(now);
            dispute.updated_at = now;
            dispute.clone()
        };
        self.ledger.clear_disputed(resolved.transaction_id);
        info!(dispute = %id, status = %resolved.status, "dispute resolved");
        Ok(resolved)
    }

    pub fn get(&self, id: DisputeId) -> Option<Dispute> {
        self.disputes.get(&id).map(|d| d.clone())
    }

    pub fn find_by_provider_reference(
        &self,
        provider_id: &ProviderId,
        provider_dispute_id: &str,
    ) -> Option<DisputeId> {
        self.provider_refs
            .get(&(provider_id.clone(), provider_dispute_id.to_string()))
            .map(|id| *id)
    }

    /// Disputes through `provider_id` resolved `lost` on `date` (UTC).
    pub fn lost_disputes(&self, provider_id: &ProviderId, date: NaiveDate) -> Vec<Dispute> {
        self.disputes
            .iter()
            .filter(|d| {
                d.status == DisputeStatus::Lost
                    && &d.provider_id == provider_id
                    && d.resolved_at.map(|at| at.date_naive()) == Some(date)
            })
            .map(|d| d.clone())
            .collect()
    }
}
