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

//! Property-based tests for the payment core.
//!
//! These tests verify invariants that should hold for any amounts, fee
//! schedules and delivery orders.

use async_trait::async_trait;
use chrono::Utc;
use dispensary_payments::config::{ProviderSettings, WebhookSettings};
use dispensary_payments::provider::{
    ChargeRequest, ProviderCharge, ProviderChargeStatus, ProviderRefund, RefundRequest,
};
use dispensary_payments::webhook::sign;
use dispensary_payments::{
    Claim, Directory, DisputeManager, FeeSchedule, IdempotencyGuard, IngestOutcome, Ledger,
    NewTransaction, PaymentError, PaymentProvider, ProviderRegistry, RefundManager,
    RequestHash, SettlementBatcher, TransactionId, TransactionStatus, WebhookIngestor,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "whsec_prop";

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive amount (0.01 to 100000.00).
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Generate a fee schedule between 0% + 0.00 and 10% + 5.00.
fn arb_schedule() -> impl Strategy<Value = FeeSchedule> {
    (0i64..=1_000i64, 0i64..=500i64)
        .prop_map(|(bps, cents)| FeeSchedule::new(Decimal::new(bps, 2), Decimal::new(cents, 2)))
}

// =============================================================================
// Helpers
// =============================================================================

struct ApprovingProvider;

#[async_trait]
impl PaymentProvider for ApprovingProvider {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ProviderCharge, PaymentError> {
        Ok(ProviderCharge {
            provider_transaction_id: format!("pi_{}", request.transaction_id),
            status: ProviderChargeStatus::Succeeded,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, PaymentError> {
        Ok(ProviderRefund {
            provider_refund_id: format!("re_{}", request.refund_id),
        })
    }
}

/// Records a pending charge through a fresh idempotency claim.
fn create_pending(ledger: &Ledger, key: &str, gross: Decimal) -> TransactionId {
    let guard: IdempotencyGuard<()> = IdempotencyGuard::new(Duration::from_secs(60));
    let hash = RequestHash::from_bytes(key.as_bytes());
    let Ok(Claim::Claimed(ticket)) = guard.claim(&key.into(), &"T1".into(), &hash) else {
        panic!("fresh key must be claimable");
    };
    ledger
        .create(
            &ticket,
            NewTransaction::charge("T1".into(), "stripe".into(), key.into(), gross),
            &FeeSchedule::new(dec!(2.9), dec!(0.30)),
        )
        .unwrap()
        .id
}

fn create_completed(ledger: &Ledger, key: &str, gross: Decimal) -> TransactionId {
    let id = create_pending(ledger, key, gross);
    ledger
        .transition(
            id,
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            Some(format!("pi_{key}")),
        )
        .unwrap();
    id
}

fn registry() -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register("stripe".into(), Arc::new(ApprovingProvider));
    Arc::new(registry)
}

// =============================================================================
// Fee Split Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Platform fee plus tenant net always equals gross; neither is negative.
    #[test]
    fn fee_split_conserves_gross(gross in arb_amount(), schedule in arb_schedule()) {
        let breakdown = schedule.split(gross, 2).unwrap();

        prop_assert_eq!(breakdown.platform_fee() + breakdown.tenant_net, gross);
        prop_assert!(breakdown.percentage_fee >= Decimal::ZERO);
        prop_assert!(breakdown.fixed_fee >= Decimal::ZERO);
        prop_assert!(breakdown.tenant_net >= Decimal::ZERO);
        prop_assert!(breakdown.platform_fee().scale() <= 2);
    }

    /// Ledger rows satisfy both amount identities.
    #[test]
    fn ledger_rows_balance(gross in arb_amount()) {
        let ledger = Ledger::new();
        let id = create_pending(&ledger, "k", gross);
        let transaction = ledger.get(id).unwrap();
        let split = ledger.fee_split(id).unwrap();

        prop_assert_eq!(
            transaction.gross_amount,
            transaction.net_amount + transaction.fee_amount + transaction.tax_amount
        );
        prop_assert_eq!(
            transaction.gross_amount,
            transaction.platform_fee + transaction.tenant_net_amount
        );
        prop_assert!(split.is_balanced());
    }
}

// =============================================================================
// Refund Bound
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Completed refunds never exceed the gross amount, whatever is requested.
    #[test]
    fn refunds_never_exceed_gross(
        gross in arb_amount(),
        requests in prop::collection::vec(arb_amount(), 1..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ledger = Arc::new(Ledger::new());
        let id = create_completed(&ledger, "k", gross);
        let refunds = RefundManager::new(ledger.clone(), registry());

        let mut accepted = Decimal::ZERO;
        for amount in &requests {
            match runtime.block_on(refunds.create_refund(id, *amount, "prop".into())) {
                Ok(refund) => accepted += refund.amount,
                Err(PaymentError::InsufficientRefundable { requested, refundable }) => {
                    prop_assert_eq!(requested, *amount);
                    prop_assert!(requested > refundable);
                }
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }

        let transaction = ledger.get(id).unwrap();
        prop_assert!(accepted <= gross);
        prop_assert_eq!(transaction.refunded_amount, accepted);
        prop_assert_eq!(transaction.refund_reserved, accepted);
    }
}

// =============================================================================
// Webhook Delivery
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Each event is applied at most once however often and in whatever
    /// order it is delivered.
    #[test]
    fn webhook_events_apply_at_most_once(
        deliveries in prop::collection::vec(0usize..5, 1..30),
    ) {
        let directory = Arc::new(Directory::new());
        directory
            .upsert_provider(
                "stripe".into(),
                ProviderSettings {
                    base_url: "http://localhost:9".into(),
                    api_key: "sk".into(),
                    webhook_secret: SECRET.into(),
                },
            )
            .unwrap();
        let ledger = Arc::new(Ledger::new());
        let ids: Vec<TransactionId> = (0..5)
            .map(|i| create_pending(&ledger, &format!("k{i}"), dec!(10.00)))
            .collect();
        let ingestor = WebhookIngestor::new(
            directory,
            ledger.clone(),
            Arc::new(DisputeManager::new(ledger.clone())),
            &WebhookSettings::default(),
        );

        let mut seen = HashSet::new();
        for index in &deliveries {
            let body = serde_json::to_vec(&serde_json::json!({
                "id": format!("evt_{index}"),
                "type": "payment.succeeded",
                "data": {"transaction_id": ids[*index], "amount": "10.00"}
            }))
            .unwrap();
            let signature = sign(SECRET, &body).unwrap();
            let outcome = ingestor
                .receive(&"stripe".into(), &"T1".into(), &body, Some(&signature))
                .unwrap();

            if seen.insert(*index) {
                prop_assert_eq!(outcome, IngestOutcome::Applied);
            } else {
                prop_assert_eq!(outcome, IngestOutcome::Duplicate);
            }
        }

        prop_assert_eq!(ingestor.events().len(), seen.len());
        for (index, id) in ids.iter().enumerate() {
            let expected = if seen.contains(&index) {
                TransactionStatus::Completed
            } else {
                TransactionStatus::Pending
            };
            prop_assert_eq!(ledger.get(*id).unwrap().status, expected);
        }
    }
}

// =============================================================================
// Settlement
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A settlement reconciles with its inputs, and re-running it changes nothing.
    #[test]
    fn settlement_balances_and_is_rerunnable(
        amounts in prop::collection::vec(arb_amount(), 0..20),
    ) {
        let ledger = Arc::new(Ledger::new());
        for (i, gross) in amounts.iter().enumerate() {
            create_completed(&ledger, &format!("k{i}"), *gross);
        }
        let batcher = SettlementBatcher::new(
            ledger.clone(),
            Arc::new(RefundManager::new(ledger.clone(), registry())),
            Arc::new(DisputeManager::new(ledger.clone())),
        );
        let today = Utc::now().date_naive();

        let first = batcher.run_for_period(&"stripe".into(), today).unwrap();
        let expected_gross: Decimal = amounts.iter().copied().sum();
        prop_assert_eq!(first.gross_amount, expected_gross);
        prop_assert_eq!(first.transaction_count, amounts.len());
        prop_assert!(first.is_balanced());

        let second = batcher.run_for_period(&"stripe".into(), today).unwrap();
        prop_assert_eq!(second.id, first.id);
        prop_assert_eq!(second.net_amount, first.net_amount);
        prop_assert_eq!(batcher.all().len(), 1);
    }
}
