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

//! Fee split calculation.
//!
//! The platform fee is `round(gross * pct / 100) + fixed`, rounded half-up
//! to the currency's minor unit, and the tenant receives the remainder. Only
//! the percentage part is rounded, so the three parts always sum to the
//! gross amount exactly.
//!
//! # Example
//!
//! ```
//! use dispensary_payments::fees::compute;
//! use rust_decimal_macros::dec;
//!
//! let (platform_fee, tenant_net) = compute(dec!(100.00), dec!(2.9), dec!(0.30)).unwrap();
//! assert_eq!(platform_fee, dec!(3.20));
//! assert_eq!(tenant_net, dec!(96.80));
//! ```

use crate::base::TransactionId;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Minor units of the settlement currency when none is configured (cents).
pub const DEFAULT_MINOR_UNITS: u32 = 2;

/// Largest gross amount accepted. Settlement sums over many such amounts
/// stay inside `Decimal` range.
pub const MAX_AMOUNT: Decimal = dec!(1000000000000);

/// Per-tenant platform fee schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Percentage of the gross amount, e.g. `2.9` for 2.9%.
    pub platform_fee_percentage: Decimal,
    /// Flat fee per transaction.
    pub platform_fee_fixed: Decimal,
}

impl FeeSchedule {
    pub fn new(platform_fee_percentage: Decimal, platform_fee_fixed: Decimal) -> Self {
        Self {
            platform_fee_percentage,
            platform_fee_fixed,
        }
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.platform_fee_percentage < Decimal::ZERO
            || self.platform_fee_percentage > Decimal::ONE_HUNDRED
        {
            return Err(PaymentError::Config(format!(
                "platform_fee_percentage {} outside [0, 100]",
                self.platform_fee_percentage
            )));
        }
        if self.platform_fee_fixed < Decimal::ZERO {
            return Err(PaymentError::Config(format!(
                "platform_fee_fixed {} is negative",
                self.platform_fee_fixed
            )));
        }
        Ok(())
    }

    /// Splits `gross` according to this schedule.
    ///
    /// Both fee parts are capped so the tenant share never goes negative on
    /// very small payments. Amounts above [`MAX_AMOUNT`] are rejected.
    pub fn split(&self, gross: Decimal, minor_units: u32) -> Result<FeeBreakdown, PaymentError> {
        if gross <= Decimal::ZERO || gross > MAX_AMOUNT || round_minor(gross, minor_units) != gross
        {
            return Err(PaymentError::InvalidAmount);
        }

        let percentage_fee = gross
            .checked_mul(self.platform_fee_percentage)
            .and_then(|fee| fee.checked_div(Decimal::ONE_HUNDRED))
            .map(|fee| round_minor(fee, minor_units).min(gross))
            .ok_or(PaymentError::InvalidAmount)?;
        let fixed_fee = self.platform_fee_fixed.min(gross - percentage_fee);
        let tenant_net = gross - percentage_fee - fixed_fee;

        Ok(FeeBreakdown {
            gross,
            percentage_fee,
            fixed_fee,
            tenant_net,
        })
    }
}

/// Round half-up to `minor_units` decimal places.
pub fn round_minor(amount: Decimal, minor_units: u32) -> Decimal {
    amount.round_dp_with_strategy(minor_units, RoundingStrategy::MidpointAwayFromZero)
}

/// Result of a fee computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub gross: Decimal,
    pub percentage_fee: Decimal,
    pub fixed_fee: Decimal,
    pub tenant_net: Decimal,
}

impl FeeBreakdown {
    pub fn platform_fee(&self) -> Decimal {
        self.percentage_fee + self.fixed_fee
    }
}

/// Computes `(platform_fee, tenant_net)` for `gross` in cents-denominated currency.
pub fn compute(
    gross: Decimal,
    pct_fee: Decimal,
    fixed_fee: Decimal,
) -> Result<(Decimal, Decimal), PaymentError> {
    let breakdown = FeeSchedule::new(pct_fee, fixed_fee).split(gross, DEFAULT_MINOR_UNITS)?;
    Ok((breakdown.platform_fee(), breakdown.tenant_net))
}

/// Fee split row, recorded exactly once per transaction.
///
/// Only the settlement flags change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeSplit {
    pub transaction_id: TransactionId,
    pub gross_amount: Decimal,
    pub platform_fee: Decimal,
    pub platform_fixed_fee: Decimal,
    pub tenant_net_amount: Decimal,
    pub platform_fee_collected: bool,
    pub tenant_settled: bool,
    pub created_at: DateTime<Utc>,
}

impl FeeSplit {
    pub fn new(transaction_id: TransactionId, breakdown: &FeeBreakdown) -> Self {
        Self {
            transaction_id,
            gross_amount: breakdown.gross,
            platform_fee: breakdown.percentage_fee,
            platform_fixed_fee: breakdown.fixed_fee,
            tenant_net_amount: breakdown.tenant_net,
            platform_fee_collected: false,
            tenant_settled: false,
            created_at: Utc::now(),
        }
    }

    /// `gross = platform_fee + platform_fixed_fee + tenant_net`.
    pub fn is_balanced(&self) -> bool {
        self.gross_amount == self.platform_fee + self.platform_fixed_fee + self.tenant_net_amount
    }
}
