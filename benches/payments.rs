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

//! Benchmarks for the payment core.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Fee split computation
//! - Idempotency claims, fresh and replayed
//! - Transaction creation, single-threaded and from many threads
//! - Webhook ingestion including signature verification
//! - Settlement runs over a day of charges

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dispensary_payments::config::{ProviderSettings, WebhookSettings};
use dispensary_payments::webhook::sign;
use dispensary_payments::{
    Claim, Directory, DisputeManager, FeeSchedule, IdempotencyGuard, Ledger, NewTransaction,
    ProviderRegistry, RefundManager, RequestHash, SettlementBatcher, TransactionId,
    TransactionStatus, WebhookIngestor,
};
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SECRET: &str = "whsec_bench";

// =============================================================================
// Helper Functions
// =============================================================================

fn schedule() -> FeeSchedule {
    FeeSchedule::new(Decimal::new(29, 1), Decimal::new(30, 2))
}

fn create(ledger: &Ledger, guard: &IdempotencyGuard<()>, key: u64) -> TransactionId {
    let key = key.to_string();
    let hash = RequestHash::from_bytes(key.as_bytes());
    let Ok(Claim::Claimed(ticket)) = guard.claim(&key.as_str().into(), &"T1".into(), &hash) else {
        panic!("fresh key must be claimable");
    };
    ledger
        .create(
            &ticket,
            NewTransaction::charge(
                "T1".into(),
                "stripe".into(),
                key.as_str().into(),
                Decimal::new(10_000, 2),
            ),
            &schedule(),
        )
        .unwrap()
        .id
}

fn guard() -> IdempotencyGuard<()> {
    IdempotencyGuard::new(Duration::from_secs(3600))
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_fee_split(c: &mut Criterion) {
    let schedule = schedule();
    c.bench_function("fee_split", |b| {
        b.iter(|| schedule.split(black_box(Decimal::new(12_345, 2)), 2).unwrap())
    });
}

fn bench_idempotency(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency");

    group.bench_function("fresh_claim", |b| {
        let guard = guard();
        let hash = RequestHash::from_bytes(b"body");
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            let key = key.to_string();
            black_box(guard.claim(&key.as_str().into(), &"T1".into(), &hash).unwrap());
        })
    });

    group.bench_function("replay", |b| {
        let guard: IdempotencyGuard<u64> = IdempotencyGuard::new(Duration::from_secs(3600));
        let hash = RequestHash::from_bytes(b"body");
        let Ok(Claim::Claimed(ticket)) = guard.claim(&"k".into(), &"T1".into(), &hash) else {
            panic!("fresh key must be claimable");
        };
        guard.complete(&ticket, 42).unwrap();
        b.iter(|| black_box(guard.claim(&"k".into(), &"T1".into(), &hash).unwrap()))
    });

    group.finish();
}

fn bench_create_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_throughput");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let ledger = Ledger::new();
                let guard = guard();
                for key in 0..count {
                    create(&ledger, &guard, key as u64);
                }
                black_box(&ledger);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_concurrent_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_create");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let ledger = Ledger::new();
                let guard = guard();
                let next = AtomicU64::new(0);
                (0..count).into_par_iter().for_each(|_| {
                    let key = next.fetch_add(1, Ordering::Relaxed);
                    let id = create(&ledger, &guard, key);
                    ledger
                        .transition(
                            id,
                            TransactionStatus::Pending,
                            TransactionStatus::Completed,
                            None,
                        )
                        .unwrap();
                });
                black_box(&ledger);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Webhook and Settlement Benchmarks
// =============================================================================

fn bench_webhook_ingest(c: &mut Criterion) {
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

    c.bench_function("webhook_ingest", |b| {
        let ledger = Arc::new(Ledger::new());
        let guard = guard();
        let ingestor = WebhookIngestor::new(
            directory.clone(),
            ledger.clone(),
            Arc::new(DisputeManager::new(ledger.clone())),
            &WebhookSettings::default(),
        );
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            let id = create(&ledger, &guard, key);
            let body = serde_json::to_vec(&serde_json::json!({
                "id": format!("evt_{key}"),
                "type": "payment.succeeded",
                "data": {"transaction_id": id, "amount": "100.00"}
            }))
            .unwrap();
            let signature = sign(SECRET, &body).unwrap();
            black_box(
                ingestor
                    .receive(&"stripe".into(), &"T1".into(), &body, Some(&signature))
                    .unwrap(),
            );
        })
    });
}

fn bench_settlement_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("settlement_run");

    for count in [100, 1_000, 10_000].iter() {
        let ledger = Arc::new(Ledger::new());
        let guard = guard();
        for key in 0..*count {
            let id = create(&ledger, &guard, key as u64);
            ledger
                .transition(
                    id,
                    TransactionStatus::Pending,
                    TransactionStatus::Completed,
                    None,
                )
                .unwrap();
        }
        let batcher = SettlementBatcher::new(
            ledger.clone(),
            Arc::new(RefundManager::new(
                ledger.clone(),
                Arc::new(ProviderRegistry::new()),
            )),
            Arc::new(DisputeManager::new(ledger.clone())),
        );
        let today = Utc::now().date_naive();

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(batcher.run_for_period(&"stripe".into(), today).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fee_split,
    bench_idempotency,
    bench_create_throughput,
    bench_concurrent_create,
    bench_webhook_ingest,
    bench_settlement_run,
);
criterion_main!(benches);
