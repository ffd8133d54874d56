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

//! Logging setup.
//!
//! Integrity and security failures are emitted at `error` level on
//! [`ALERT_TARGET`], so an alerting pipeline can subscribe to that target
//! alone (`RUST_LOG=payments::alert=error`).

use tracing_subscriber::EnvFilter;

/// Log target for events that must page someone.
pub const ALERT_TARGET: &str = "payments::alert";

const DEFAULT_FILTER: &str = "dispensary_payments=info,payments::alert=error";

/// Installs the global `fmt` subscriber, honouring `RUST_LOG` when set.
///
/// Calling it more than once is harmless; later calls are ignored.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
