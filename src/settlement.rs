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

//! Settlement batches.
//!
//! A settlement is recomputed from the ledger on every run instead of being
//! incremented, so re-running a period after late webhooks never counts a
//! transaction twice. Once reconciled with the provider's payout a row is
//! frozen.
//!
//! ```text
//! net = gross - refunds - chargebacks - platform fees
//! ```

use crate::base::{ProviderId, SettlementId, TransactionId};
use crate::config::Directory;
use crate::dispute::DisputeManager;
use crate::error::PaymentError;
use crate::ledger::Ledger;
use crate::refund::RefundManager;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use csv::Writer;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Computed,
    /// Matched against the provider payout; never recomputed.
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub provider_id: ProviderId,
    pub settlement_date: NaiveDate,
    pub gross_amount: Decimal,
    pub refund_amount: Decimal,
    pub chargeback_amount: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub transaction_count: usize,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    transaction_ids: Vec<TransactionId>,
}

impl Settlement {
    pub fn is_balanced(&self) -> bool {
        self.net_amount
            == self.gross_amount - self.refund_amount - self.chargeback_amount - self.fee_amount
    }
}

type PeriodKey = (ProviderId, NaiveDate);

/// Holds the single-flight slot for one period; released on drop.
struct RunGuard<'a> {
    slots: &'a DashMap<PeriodKey, ()>,
    key: PeriodKey,
}

impl<'a> RunGuard<'a> {
    fn acquire(slots: &'a DashMap<PeriodKey, ()>, key: PeriodKey) -> Result<Self, PaymentError> {
        match slots.entry(key.clone()) {
            Entry::Occupied(_) => Err(PaymentError::SettlementInProgress),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(Self { slots, key })
            }
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

pub struct SettlementBatcher {
    ledger: Arc<Ledger>,
    refunds: Arc<RefundManager>,
    disputes: Arc<DisputeManager>,
    settlements: DashMap<PeriodKey, Settlement>,
    running: DashMap<PeriodKey, ()>,
}

impl SettlementBatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        refunds: Arc<RefundManager>,
        disputes: Arc<DisputeManager>,
    ) -> Self {
        Self {
            ledger,
            refunds,
            disputes,
            settlements: DashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Computes (or recomputes) the settlement of `provider_id` for `date`.
    ///
    /// A reconciled row is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`PaymentError::SettlementInProgress`] if another run holds the period.
    #[instrument(skip(self), fields(provider = %provider_id))]
    pub fn run_for_period(
        &self,
        provider_id: &ProviderId,
        date: NaiveDate,
    ) -> Result<Settlement, PaymentError> {
        let key = (provider_id.clone(), date);
        let _guard = RunGuard::acquire(&self.running, key.clone())?;

        if let Some(existing) = self.get(provider_id, date) {
            if existing.status == SettlementStatus::Reconciled {
                info!("settlement already reconciled, not recomputed");
                return Ok(existing);
            }
        }

        let charges = self.ledger.completed_charges(provider_id, date);
        let gross_amount: Decimal = charges.iter().map(|t| t.gross_amount).sum();
        let fee_amount: Decimal = charges.iter().map(|t| t.platform_fee).sum();
        let refund_amount: Decimal = self
            .refunds
            .completed_refunds(provider_id, date)
            .iter()
            .map(|r| r.amount)
            .sum();
        let chargeback_amount: Decimal = self
            .disputes
            .lost_disputes(provider_id, date)
            .iter()
            .map(|d| d.amount)
            .sum();
        let net_amount = gross_amount - refund_amount - chargeback_amount - fee_amount;
        let transaction_ids: Vec<TransactionId> = charges.iter().map(|t| t.id).collect();

        let now = Utc::now();
        let settlement = match self.settlements.entry(key) {
            Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                row.gross_amount = gross_amount;
                row.refund_amount = refund_amount;
                row.chargeback_amount = chargeback_amount;
                row.fee_amount = fee_amount;
                row.net_amount = net_amount;
                row.transaction_count = transaction_ids.len();
                row.transaction_ids = transaction_ids;
                row.updated_at = now;
                row.clone()
            }
            Entry::Vacant(entry) => {
                let row = Settlement {
                    id: SettlementId::new(),
                    provider_id: provider_id.clone(),
                    settlement_date: date,
                    gross_amount,
                    refund_amount,
                    chargeback_amount,
                    fee_amount,
                    net_amount,
                    transaction_count: transaction_ids.len(),
                    status: SettlementStatus::Computed,
                    created_at: now,
                    updated_at: now,
                    reconciled_at: None,
                    transaction_ids,
                };
                entry.insert(row.clone());
                row
            }
        };

        info!(
            %date,
            gross = %settlement.gross_amount,
            net = %settlement.net_amount,
            transactions = settlement.transaction_count,
            "settlement computed"
        );
        Ok(settlement)
    }

    /// Freezes the settlement and flags its fee splits as paid to tenants.
    pub fn mark_reconciled(
        &self,
        provider_id: &ProviderId,
        date: NaiveDate,
    ) -> Result<Settlement, PaymentError> {
        let key = (provider_id.clone(), date);
        let _guard = RunGuard::acquire(&self.running, key.clone())?;

        let settlement = {
            let mut row = self
                .settlements
                .get_mut(&key)
                .ok_or(PaymentError::SettlementNotFound)?;
            if row.status == SettlementStatus::Reconciled {
                return Ok(row.clone());
            }
            let now = Utc::now();
            row.status = SettlementStatus::Reconciled;
            row.reconciled_at = Some(now);
            row.updated_at = now;
            row.clone()
        };
        self.ledger.mark_tenant_settled(&settlement.transaction_ids);
        info!(provider = %provider_id, %date, "settlement reconciled");
        Ok(settlement)
    }

    pub fn get(&self, provider_id: &ProviderId, date: NaiveDate) -> Option<Settlement> {
        self.settlements
            .get(&(provider_id.clone(), date))
            .map(|s| s.clone())
    }

    /// All settlements ordered by date, then provider.
    pub fn all(&self) -> Vec<Settlement> {
        let mut rows: Vec<Settlement> = self.settlements.iter().map(|s| s.clone()).collect();
        rows.sort_by(|a, b| {
            (a.settlement_date, &a.provider_id).cmp(&(b.settlement_date, &b.provider_id))
        });
        rows
    }

    /// Settles yesterday and today for every configured provider, until
    /// `shutdown`. Writes a CSV report per run when `report_dir` is set.
    pub async fn run_worker(
        self: Arc<Self>,
        directory: Arc<Directory>,
        interval: Duration,
        report_dir: Option<PathBuf>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let today = Utc::now().date_naive();
                    let yesterday = today - ChronoDuration::days(1);
                    let mut settled = Vec::new();
                    for provider_id in directory.provider_ids() {
                        for date in [yesterday, today] {
                            match self.run_for_period(&provider_id, date) {
                                Ok(settlement) => settled.push(settlement),
                                Err(err) => warn!(provider = %provider_id, %date, error = %err, "settlement run skipped"),
                            }
                        }
                    }
                    if let Some(dir) = &report_dir {
                        if let Err(err) = write_report_file(dir, today, &settled) {
                            error!(dir = %dir.display(), error = %err, "failed to write settlement report");
                        }
                    }
                }
            }
        }
        info!("settlement worker stopped");
    }
}

/// Writes settlements as CSV.
///
/// # CSV Format
///
/// Columns: `id, provider_id, settlement_date, gross_amount, refund_amount,
/// chargeback_amount, fee_amount, net_amount, transaction_count, status,
/// created_at, updated_at, reconciled_at`
pub fn write_report<W: Write>(settlements: &[Settlement], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for settlement in settlements {
        wtr.serialize(settlement)?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_report_file(
    dir: &Path,
    date: NaiveDate,
    settlements: &[Settlement],
) -> Result<(), csv::Error> {
    std::fs::create_dir_all(dir)?;
    let file = File::create(dir.join(format!("settlements-{date}.csv")))?;
    write_report(settlements, file)
}
