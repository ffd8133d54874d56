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

//! Transaction ledger.
//!
//! The [`Ledger`] owns every [`PaymentTransaction`] and its [`FeeSplit`].
//!
//! # Concurrency
//!
//! Rows live in [`DashMap`]s. A status change is a compare-and-set executed
//! while holding the row's entry lock: the caller names the status it read
//! (`from`) and the write is rejected with [`PaymentError::StaleTransition`]
//! when another writer got there first. Fee splits are inserted through the
//! vacant-entry API, which makes them unique per transaction.
//!
//! Lock order is always `transactions` before `fee_splits`.

use crate::base::{OrderId, ProviderId, TenantId, TransactionId};
use crate::error::PaymentError;
use crate::fees::{DEFAULT_MINOR_UNITS, FeeSchedule, FeeSplit, round_minor};
use crate::idempotency::ClaimTicket;
use crate::transaction::{PaymentTransaction, TransactionStatus, TransactionType};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

/// How many times [`Ledger::advance_to`] re-reads after losing a race.
const MAX_STALE_RETRIES: usize = 8;

/// Input for [`Ledger::create`].
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tenant_id: TenantId,
    pub provider_id: ProviderId,
    pub order_id: OrderId,
    pub gross_amount: Decimal,
    pub tax_amount: Decimal,
    pub kind: TransactionType,
}

impl NewTransaction {
    pub fn charge(
        tenant_id: TenantId,
        provider_id: ProviderId,
        order_id: OrderId,
        gross_amount: Decimal,
    ) -> Self {
        Self {
            tenant_id,
            provider_id,
            order_id,
            gross_amount,
            tax_amount: Decimal::ZERO,
            kind: TransactionType::Charge,
        }
    }
}

/// Payment transaction store and state machine.
///
/// # Invariants
///
/// - Every transaction has exactly one fee split, created with it.
/// - Status only moves along [`TransactionStatus::can_transition_to`].
/// - Monetary fields are frozen once the status is terminal; afterwards only
///   refund and dispute annotations change.
pub struct Ledger {
    transactions: DashMap<TransactionId, PaymentTransaction>,
    fee_splits: DashMap<TransactionId, FeeSplit>,
    /// `(provider, provider_transaction_id)` lookup for webhooks.
    provider_refs: DashMap<(ProviderId, String), TransactionId>,
    minor_units: u32,
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_minor_units(DEFAULT_MINOR_UNITS)
    }

    pub fn with_minor_units(minor_units: u32) -> Self {
        Ledger {
            transactions: DashMap::new(),
            fee_splits: DashMap::new(),
            provider_refs: DashMap::new(),
            minor_units,
        }
    }

    /// Records a new `pending` transaction and its fee split.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidAmount`] - gross not positive, tax negative, or
    ///   tax larger than what remains after fees.
    /// - [`PaymentError::IdempotencyConflict`] - ticket belongs to another tenant.
    #[instrument(skip(self, ticket, new, schedule), fields(tenant = %new.tenant_id, order = %new.order_id))]
    pub fn create(
        &self,
        ticket: &ClaimTicket,
        new: NewTransaction,
        schedule: &FeeSchedule,
    ) -> Result<PaymentTransaction, PaymentError> {
        if ticket.tenant_id() != &new.tenant_id {
            return Err(PaymentError::IdempotencyConflict);
        }
        if new.gross_amount <= Decimal::ZERO || new.tax_amount < Decimal::ZERO {
            return Err(PaymentError::InvalidAmount);
        }

        let breakdown = schedule.split(new.gross_amount, self.minor_units)?;
        let fee_amount = breakdown.platform_fee();
        let net_amount = net_of(new.gross_amount, fee_amount, new.tax_amount)?;

        let now = Utc::now();
        let transaction = PaymentTransaction {
            id: TransactionId::new(),
            tenant_id: new.tenant_id,
            tenant_provider_id: new.provider_id,
            order_id: new.order_id,
            kind: new.kind,
            gross_amount: new.gross_amount,
            fee_amount,
            tax_amount: new.tax_amount,
            net_amount,
            tenant_net_amount: breakdown.tenant_net,
            platform_fee: fee_amount,
            status: TransactionStatus::Pending,
            provider_transaction_id: None,
            idempotency_key: ticket.key().clone(),
            refund_reserved: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            disputed: false,
            created_at: now,
            updated_at: now,
            processed_at: None,
            failed_at: None,
        };
        transaction.assert_invariants();

        match self.fee_splits.entry(transaction.id) {
            Entry::Occupied(_) => return Err(PaymentError::FeeSplitExists),
            Entry::Vacant(entry) => {
                entry.insert(FeeSplit::new(transaction.id, &breakdown));
            }
        }
        self.transactions.insert(transaction.id, transaction.clone());

        info!(
            transaction = %transaction.id,
            gross = %transaction.gross_amount,
            platform_fee = %transaction.platform_fee,
            "transaction created"
        );
        Ok(transaction)
    }

    /// Moves a transaction from `from` to `to`.
    ///
    /// The current status must equal `from`; otherwise the caller raced with
    /// another writer and must re-read.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidTransition`] - `from -> to` is not an edge of the state machine.
    /// - [`PaymentError::TransactionNotFound`] - unknown transaction.
    /// - [`PaymentError::StaleTransition`] - current status differs from `from`.
    #[instrument(skip(self, provider_transaction_id))]
    pub fn transition(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        provider_transaction_id: Option<String>,
    ) -> Result<PaymentTransaction, PaymentError> {
        if !from.can_transition_to(to) {
            return Err(PaymentError::InvalidTransition { from, to });
        }

        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if transaction.status != from {
            return Err(PaymentError::StaleTransition {
                expected: from,
                actual: transaction.status,
            });
        }

        let now = Utc::now();
        transaction.status = to;
        transaction.updated_at = now;
        match to {
            TransactionStatus::Completed => transaction.processed_at = Some(now),
            TransactionStatus::Failed => transaction.failed_at = Some(now),
            _ => {}
        }
        if let Some(reference) = provider_transaction_id {
            self.provider_refs.insert(
                (transaction.tenant_provider_id.clone(), reference.clone()),
                id,
            );
            transaction.provider_transaction_id = Some(reference);
        }

        if to == TransactionStatus::Completed {
            if let Some(mut split) = self.fee_splits.get_mut(&id) {
                split.platform_fee_collected = true;
            } else {
                warn!(transaction = %id, "completed transaction has no fee split");
            }
        }

        info!(transaction = %id, %from, %to, "transaction transitioned");
        Ok(transaction.clone())
    }

    /// Moves a transaction to `to` from whatever status it currently has,
    /// re-reading after [`PaymentError::StaleTransition`].
    ///
    /// Returns `Ok(None)` when the transaction is already in `to`.
    pub fn advance_to(
        &self,
        id: TransactionId,
        to: TransactionStatus,
        provider_transaction_id: Option<String>,
    ) -> Result<Option<PaymentTransaction>, PaymentError> {
        let mut last_error = PaymentError::TransactionNotFound;
        for _ in 0..MAX_STALE_RETRIES {
            let current = self.get(id).ok_or(PaymentError::TransactionNotFound)?.status;
            if current == to {
                return Ok(None);
            }
            match self.transition(id, current, to, provider_transaction_id.clone()) {
                Ok(transaction) => return Ok(Some(transaction)),
                Err(err @ PaymentError::StaleTransition { .. }) => {
                    debug!(transaction = %id, "stale transition, re-reading");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    /// Remembers the provider's id for a transaction that has not moved yet,
    /// so webhooks quoting only that id can find it.
    pub fn record_provider_reference(
        &self,
        id: TransactionId,
        provider_transaction_id: String,
    ) -> Result<(), PaymentError> {
        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound)?;
        self.provider_refs.insert(
            (transaction.tenant_provider_id.clone(), provider_transaction_id.clone()),
            id,
        );
        transaction.provider_transaction_id = Some(provider_transaction_id);
        transaction.updated_at = Utc::now();
        Ok(())
    }

    /// Replaces fee and tax amounts while the transaction is still open.
    pub fn revise_amounts(
        &self,
        id: TransactionId,
        fee_amount: Decimal,
        tax_amount: Decimal,
    ) -> Result<PaymentTransaction, PaymentError> {
        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if transaction.status.is_terminal() {
            return Err(PaymentError::MonetaryFieldsFrozen);
        }
        if fee_amount < Decimal::ZERO || tax_amount < Decimal::ZERO {
            return Err(PaymentError::InvalidAmount);
        }
        let net_amount = net_of(transaction.gross_amount, fee_amount, tax_amount)?;

        transaction.fee_amount = fee_amount;
        transaction.tax_amount = tax_amount;
        transaction.net_amount = net_amount;
        transaction.updated_at = Utc::now();
        transaction.assert_invariants();
        Ok(transaction.clone())
    }

    /// Reserves `amount` of the refundable balance.
    ///
    /// Check and reservation happen under the row lock, so concurrent refunds
    /// can never jointly exceed the gross amount.
    pub(crate) fn reserve_refund(
        &self,
        id: TransactionId,
        amount: Decimal,
    ) -> Result<PaymentTransaction, PaymentError> {
        if amount <= Decimal::ZERO || round_minor(amount, self.minor_units) != amount {
            return Err(PaymentError::InvalidAmount);
        }
        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if !transaction.is_completed_charge() {
            return Err(PaymentError::NotRefundable);
        }
        let refundable = transaction.refundable();
        if amount > refundable {
            return Err(PaymentError::InsufficientRefundable {
                requested: amount,
                refundable,
            });
        }
        transaction.refund_reserved += amount;
        transaction.updated_at = Utc::now();
        transaction.assert_invariants();
        Ok(transaction.clone())
    }

    /// Confirms a reserved refund amount as refunded.
    pub(crate) fn confirm_refund(&self, id: TransactionId, amount: Decimal) {
        if let Some(mut transaction) = self.transactions.get_mut(&id) {
            transaction.refunded_amount += amount;
            transaction.updated_at = Utc::now();
            transaction.assert_invariants();
        }
    }

    /// Gives back a reservation after a failed refund.
    pub(crate) fn release_refund(&self, id: TransactionId, amount: Decimal) {
        if let Some(mut transaction) = self.transactions.get_mut(&id) {
            transaction.refund_reserved -= amount;
            transaction.updated_at = Utc::now();
            transaction.assert_invariants();
        }
    }

    /// Flags a completed charge as disputed; at most one open dispute at a time.
    pub(crate) fn mark_disputed(
        &self,
        id: TransactionId,
    ) -> Result<PaymentTransaction, PaymentError> {
        let mut transaction = self
            .transactions
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound)?;
        if !transaction.is_completed_charge() {
            return Err(PaymentError::NotRefundable);
        }
        if transaction.disputed {
            return Err(PaymentError::AlreadyDisputed);
        }
        transaction.disputed = true;
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    pub(crate) fn clear_disputed(&self, id: TransactionId) {
        if let Some(mut transaction) = self.transactions.get_mut(&id) {
            transaction.disputed = false;
            transaction.updated_at = Utc::now();
        }
    }

    pub fn get(&self, id: TransactionId) -> Option<PaymentTransaction> {
        self.transactions.get(&id).map(|t| t.clone())
    }

    pub fn fee_split(&self, id: TransactionId) -> Option<FeeSplit> {
        self.fee_splits.get(&id).map(|s| s.clone())
    }

    pub fn find_by_provider_reference(
        &self,
        provider_id: &ProviderId,
        reference: &str,
    ) -> Option<TransactionId> {
        self.provider_refs
            .get(&(provider_id.clone(), reference.to_string()))
            .map(|id| *id)
    }

    /// Completed charges processed by `provider_id` on `date` (UTC).
    pub fn completed_charges(
        &self,
        provider_id: &ProviderId,
        date: NaiveDate,
    ) -> Vec<PaymentTransaction> {
        self.transactions
            .iter()
            .filter(|t| {
                t.is_completed_charge()
                    && &t.tenant_provider_id == provider_id
                    && t.processed_at.map(|at| at.date_naive()) == Some(date)
            })
            .map(|t| t.clone())
            .collect()
    }

    /// Flags fee splits as paid out to the tenant.
    pub(crate) fn mark_tenant_settled(&self, ids: &[TransactionId]) {
        for id in ids {
            if let Some(mut split) = self.fee_splits.get_mut(id) {
                split.tenant_settled = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// `gross - fee - tax`, rejecting overflow and negative results.
fn net_of(gross: Decimal, fee: Decimal, tax: Decimal) -> Result<Decimal, PaymentError> {
    gross
        .checked_sub(fee)
        .and_then(|rest| rest.checked_sub(tax))
        .filter(|net| *net >= Decimal::ZERO)
        .ok_or(PaymentError::InvalidAmount)
}
