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

//! Error types for payment processing.
//!
//! Errors fall into four groups:
//!
//! - **Retryable**: [`PaymentError::InFlight`], [`PaymentError::StaleTransition`],
//!   [`PaymentError::ProviderTimeout`], [`PaymentError::ProviderOutcomeUnknown`]
//!   and [`PaymentError::TransactionNotFound`] (a webhook may arrive before the
//!   transaction it refers to).
//! - **Caller errors**: invalid amounts, refund bounds, closed disputes, conflicts.
//! - **Integrity errors**: [`PaymentError::SignatureInvalid`] and
//!   [`PaymentError::AmountMismatch`]. Never applied, always alerted.
//! - **Infrastructure**: provider and configuration failures.

use crate::transaction::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Payment processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// Same idempotency key reused for a different request
    #[error("idempotency key reused with a different request payload")]
    IdempotencyConflict,

    /// Another request holding the same idempotency key is still running
    #[error("request with this idempotency key is still in flight")]
    InFlight,

    /// Amount is zero, negative, or inconsistent with the other amounts
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error("refund of {requested} exceeds refundable amount {refundable}")]
    InsufficientRefundable {
        requested: Decimal,
        refundable: Decimal,
    },

    /// Dispute already reached `won` or `lost`
    #[error("dispute is closed")]
    DisputeClosed,

    /// Optimistic concurrency check failed; re-read and retry
    #[error("stale transition: expected status {expected}, found {actual}")]
    StaleTransition {
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    /// Transition not permitted by the transaction state machine
    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("monetary fields are frozen once a transaction is completed or failed")]
    MonetaryFieldsFrozen,

    #[error("webhook signature is missing or invalid")]
    SignatureInvalid,

    #[error("webhook amount {received} does not match transaction amount {expected}")]
    AmountMismatch {
        expected: Decimal,
        received: Decimal,
    },

    #[error("payment provider timed out")]
    ProviderTimeout,

    /// Request may have reached the provider but no usable answer came back
    #[error("payment provider outcome unknown: {0}")]
    ProviderOutcomeUnknown(String),

    /// Definitive rejection by the provider
    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("refund not found")]
    RefundNotFound,

    #[error("dispute not found")]
    DisputeNotFound,

    #[error("settlement not found")]
    SettlementNotFound,

    /// Transaction already has an open dispute
    #[error("transaction already under dispute")]
    AlreadyDisputed,

    /// Only completed charges can be refunded or disputed
    #[error("transaction is not a completed charge")]
    NotRefundable,

    #[error("evidence due date has passed")]
    EvidenceWindowClosed,

    /// Guard on the fee split table. Transaction ids are fresh v4 UUIDs, so
    /// this only fires if a row id is ever reused.
    #[error("fee split already recorded for this transaction")]
    FeeSplitExists,

    #[error("unknown payment provider")]
    UnknownProvider,

    #[error("unknown tenant")]
    UnknownTenant,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("settlement run already in progress")]
    SettlementInProgress,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Whether the operation may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::InFlight
                | PaymentError::StaleTransition { .. }
                | PaymentError::ProviderTimeout
                | PaymentError::ProviderOutcomeUnknown(_)
                | PaymentError::TransactionNotFound
        )
    }

    /// Provider call whose effect is unknown. The charge or refund may have
    /// happened, so local state must stay pending rather than fail.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            PaymentError::ProviderTimeout | PaymentError::ProviderOutcomeUnknown(_)
        )
    }

    /// Security and integrity failures that must reach the alerting pipeline.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            PaymentError::SignatureInvalid | PaymentError::AmountMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PaymentError;
    use crate::transaction::TransactionStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            PaymentError::IdempotencyConflict.to_string(),
            "idempotency key reused with a different request payload"
        );
        assert_eq!(
            PaymentError::InsufficientRefundable {
                requested: dec!(80.00),
                refundable: dec!(70.00)
            }
            .to_string(),
            "refund of 80.00 exceeds refundable amount 70.00"
        );
        assert_eq!(
            PaymentError::StaleTransition {
                expected: TransactionStatus::Pending,
                actual: TransactionStatus::Completed,
            }
            .to_string(),
            "stale transition: expected status pending, found completed"
        );
        assert_eq!(PaymentError::DisputeClosed.to_string(), "dispute is closed");
    }

    #[test]
    fn retryable_classification() {
        assert!(PaymentError::InFlight.is_retryable());
        assert!(PaymentError::ProviderTimeout.is_retryable());
        assert!(PaymentError::TransactionNotFound.is_retryable());
        assert!(!PaymentError::IdempotencyConflict.is_retryable());
        assert!(!PaymentError::SignatureInvalid.is_retryable());
    }

    #[test]
    fn outcome_unknown_classification() {
        assert!(PaymentError::ProviderTimeout.is_outcome_unknown());
        assert!(PaymentError::ProviderOutcomeUnknown("connection reset".into()).is_outcome_unknown());
        assert!(PaymentError::ProviderOutcomeUnknown("connection reset".into()).is_retryable());
        assert!(!PaymentError::Provider("card declined".into()).is_outcome_unknown());
    }

    #[test]
    fn integrity_classification() {
        assert!(PaymentError::SignatureInvalid.is_integrity_violation());
        assert!(
            PaymentError::AmountMismatch {
                expected: dec!(50.00),
                received: dec!(5.00)
            }
            .is_integrity_violation()
        );
        assert!(!PaymentError::InvalidAmount.is_integrity_violation());
    }
}
