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

//! # Dispensary Payments
//!
//! Payment core of a multi-tenant retail platform: exactly-once transaction
//! creation, fee splits, signature-verified webhook ingestion, refunds,
//! disputes and settlements.
//!
//! ## Core Components
//!
//! - [`IdempotencyGuard`]: claims a `(key, tenant)` pair once per logical operation
//! - [`fees`]: platform fee / tenant net computation
//! - [`Ledger`]: `PaymentTransaction` state machine and amount invariants
//! - [`WebhookIngestor`]: verifies, deduplicates and applies provider callbacks
//! - [`RefundManager`] and [`DisputeManager`]: refund bounds and dispute lifecycle
//! - [`SettlementBatcher`]: per-provider, per-day settlement records
//! - [`PaymentService`]: the API used by checkout, exposed over HTTP by [`server`]
//!
//! ## Example
//!
//! ```
//! use dispensary_payments::{
//!     Claim, FeeSchedule, IdempotencyGuard, Ledger, NewTransaction, RequestHash,
//!     TransactionStatus,
//! };
//! use rust_decimal_macros::dec;
//! use std::time::Duration;
//!
//! let guard: IdempotencyGuard<()> = IdempotencyGuard::new(Duration::from_secs(3600));
//! let ledger = Ledger::new();
//!
//! let hash = RequestHash::from_bytes(b"order o-1, 100.00");
//! let Claim::Claimed(ticket) = guard.claim(&"k1".into(), &"T1".into(), &hash).unwrap() else {
//!     unreachable!("fresh key");
//! };
//! let tx = ledger
//!     .create(
//!         &ticket,
//!         NewTransaction::charge("T1".into(), "stripe".into(), "o-1".into(), dec!(100.00)),
//!         &FeeSchedule::new(dec!(2.9), dec!(0.30)),
//!     )
//!     .unwrap();
//!
//! assert_eq!(tx.status, TransactionStatus::Pending);
//! assert_eq!(tx.platform_fee, dec!(3.20));
//! assert_eq!(tx.tenant_net_amount, dec!(96.80));
//! ```
//!
//! ## Thread Safety
//!
//! Every store is a set of concurrent maps. The only coordination points are
//! the atomic claim of an idempotency key and the compare-and-set status
//! check of a ledger transition; no process-wide lock is taken.

mod base;
pub mod config;
pub mod dispute;
pub mod error;
pub mod fees;
pub mod idempotency;
pub mod ledger;
pub mod provider;
pub mod refund;
pub mod server;
pub mod service;
pub mod settlement;
pub mod telemetry;
mod transaction;
pub mod webhook;

pub use base::{
    DisputeId, EventId, IdempotencyKey, OrderId, ProviderId, RefundId, SettlementId, TenantId,
    TransactionId, WebhookEventId,
};
pub use config::{Directory, Settings};
pub use dispute::{Dispute, DisputeManager, DisputeOutcome, DisputeStatus};
pub use error::PaymentError;
pub use fees::{FeeBreakdown, FeeSchedule, FeeSplit};
pub use idempotency::{Claim, ClaimTicket, IdempotencyGuard, IdempotencyStatus, RequestHash};
pub use ledger::{Ledger, NewTransaction};
pub use provider::{HttpProvider, PaymentProvider, ProviderRegistry, RetryPolicy};
pub use refund::{Refund, RefundManager, RefundStatus};
pub use service::{CreateTransactionRequest, PaymentService};
pub use settlement::{Settlement, SettlementBatcher, SettlementStatus};
pub use transaction::{
    PaymentTransaction, RefundState, TransactionStatus, TransactionType, TransactionView,
};
pub use webhook::{IngestOutcome, WebhookEvent, WebhookIngestor, WebhookStatus};
