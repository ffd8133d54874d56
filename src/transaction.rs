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

//! Payment transactions.
//!
//! Transactions follow a state machine:
//! - [`Pending`] → [`Authorized`] → [`Completed`]
//! - [`Pending`] → [`Completed`] (providers that capture immediately)
//! - [`Pending`] / [`Authorized`] → [`Failed`]
//!
//! Refunds and disputes never move a transaction out of [`Completed`]; they
//! are recorded as annotations on the row.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Authorized`]: TransactionStatus::Authorized
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed

use crate::base::{IdempotencyKey, OrderId, ProviderId, TenantId, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Charge,
    Refund,
    Payout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, to),
            (Pending, Authorized)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Authorized, Completed)
                | (Authorized, Failed)
        )
    }

    /// Monetary fields never change once this returns true.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Refund annotation derived from the refunded amount.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RefundState {
    None,
    Partial,
    Full,
}

/// A ledger row.
///
/// # Invariants
///
/// - `gross_amount = net_amount + fee_amount + tax_amount`
/// - `gross_amount = platform_fee + tenant_net_amount`
/// - `refunded_amount <= refund_reserved <= gross_amount`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTransaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub tenant_provider_id: ProviderId,
    pub order_id: OrderId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub gross_amount: Decimal,
    pub fee_amount: Decimal,
    pub tax_amount: Decimal,
    pub net_amount: Decimal,
    pub tenant_net_amount: Decimal,
    pub platform_fee: Decimal,
    pub status: TransactionStatus,
    pub provider_transaction_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
    /// Pending plus completed refunds; bounds new refunds.
    pub refund_reserved: Decimal,
    /// Completed refunds only.
    pub refunded_amount: Decimal,
    pub disputed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    pub(crate) fn assert_invariants(&self) {
        debug_assert_eq!(
            self.gross_amount,
            self.net_amount + self.fee_amount + self.tax_amount,
            "Invariant violated: gross != net + fee + tax for {}",
            self.id
        );
        debug_assert!(
            self.refunded_amount <= self.refund_reserved
                && self.refund_reserved <= self.gross_amount,
            "Invariant violated: refund accounting out of bounds for {}",
            self.id
        );
    }

    /// Amount still available for new refunds.
    pub fn refundable(&self) -> Decimal {
        self.gross_amount - self.refund_reserved
    }

    pub fn refund_state(&self) -> RefundState {
        if self.refunded_amount.is_zero() {
            RefundState::None
        } else if self.refunded_amount < self.gross_amount {
            RefundState::Partial
        } else {
            RefundState::Full
        }
    }

    pub fn is_completed_charge(&self) -> bool {
        self.kind == TransactionType::Charge && self.status == TransactionStatus::Completed
    }

    pub fn view(&self) -> TransactionView {
        TransactionView {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            order_id: self.order_id.clone(),
            status: self.status,
            gross_amount: self.gross_amount,
            platform_fee: self.platform_fee,
            tenant_net_amount: self.tenant_net_amount,
            created_at: self.created_at,
        }
    }
}

/// Response returned to the checkout subsystem and cached by the idempotency guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionView {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub status: TransactionStatus,
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub tenant_net_amount: Decimal,
    pub created_at: DateTime<Utc>,
}
