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

//! Settings.
//!
//! Layered with `figment`: built-in defaults, then an optional TOML file,
//! then `PAYMENTS_`-prefixed environment variables (`__` separates nested
//! keys, e.g. `PAYMENTS_WEBHOOK__MAX_ATTEMPTS=8`). Monetary values in the
//! TOML file are written as strings:
//!
//! ```toml
//! [tenants.green-leaf]
//! platform_fee_percentage = "2.9"
//! platform_fee_fixed = "0.30"
//!
//! [providers.stripe]
//! base_url = "https://api.stripe.example"
//! api_key = "sk_live_..."
//! webhook_secret = "whsec_..."
//! ```

use crate::base::{ProviderId, TenantId};
use crate::error::PaymentError;
use crate::fees::{DEFAULT_MINOR_UNITS, FeeSchedule};
use crate::provider::RetryPolicy;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdempotencySettings {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long a duplicate request waits for the owner before giving up.
    #[serde(with = "humantime_serde")]
    pub in_flight_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            in_flight_wait: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookSettings {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_poll_interval: Duration,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            retry_poll_interval: Duration::from_secs(1),
        }
    }
}

impl WebhookSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderHttpSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for ProviderHttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ProviderHttpSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SettlementSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Directory for CSV settlement reports; none are written when unset.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            report_dir: None,
        }
    }
}

/// Credentials for one provider account.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub provider_http: ProviderHttpSettings,
    #[serde(default)]
    pub settlement: SettlementSettings,
    #[serde(default = "default_minor_units")]
    pub currency_minor_units: u32,
    #[serde(default)]
    pub providers: HashMap<ProviderId, ProviderSettings>,
    #[serde(default)]
    pub tenants: HashMap<TenantId, FeeSchedule>,
}

fn default_minor_units() -> u32 {
    DEFAULT_MINOR_UNITS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            idempotency: IdempotencySettings::default(),
            webhook: WebhookSettings::default(),
            provider_http: ProviderHttpSettings::default(),
            settlement: SettlementSettings::default(),
            currency_minor_units: DEFAULT_MINOR_UNITS,
            providers: HashMap::new(),
            tenants: HashMap::new(),
        }
    }
}

impl Settings {
    /// Loads defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, PaymentError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("PAYMENTS_").split("__"))
            .extract()
            .map_err(|e| PaymentError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.webhook.max_attempts == 0 {
            return Err(PaymentError::Config(
                "webhook.max_attempts must be at least 1".into(),
            ));
        }
        for (name, interval) in [
            ("idempotency.sweep_interval", self.idempotency.sweep_interval),
            ("webhook.retry_poll_interval", self.webhook.retry_poll_interval),
            ("settlement.interval", self.settlement.interval),
        ] {
            if interval.is_zero() {
                return Err(PaymentError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.currency_minor_units > 4 {
            return Err(PaymentError::Config(format!(
                "currency_minor_units {} is not supported",
                self.currency_minor_units
            )));
        }
        for (tenant, schedule) in &self.tenants {
            schedule
                .validate()
                .map_err(|e| PaymentError::Config(format!("tenant {tenant}: {e}")))?;
        }
        for (provider, credentials) in &self.providers {
            if credentials.webhook_secret.is_empty() {
                return Err(PaymentError::Config(format!(
                    "provider {provider}: webhook_secret is empty"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DirectoryData {
    tenants: HashMap<TenantId, FeeSchedule>,
    providers: HashMap<ProviderId, ProviderSettings>,
}

/// Tenant fee schedules and provider credentials.
///
/// Owned by the tenant configuration store; this crate only reads it, and
/// entries may be replaced while the service runs.
#[derive(Debug, Default)]
pub struct Directory {
    inner: RwLock<DirectoryData>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            inner: RwLock::new(DirectoryData {
                tenants: settings.tenants.clone(),
                providers: settings.providers.clone(),
            }),
        }
    }

    pub fn fee_schedule(&self, tenant_id: &TenantId) -> Result<FeeSchedule, PaymentError> {
        self.inner
            .read()
            .tenants
            .get(tenant_id)
            .copied()
            .ok_or(PaymentError::UnknownTenant)
    }

    pub fn webhook_secret(&self, provider_id: &ProviderId) -> Result<String, PaymentError> {
        self.inner
            .read()
            .providers
            .get(provider_id)
            .map(|p| p.webhook_secret.clone())
            .ok_or(PaymentError::UnknownProvider)
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.inner.read().providers.keys().cloned().collect()
    }

    pub fn upsert_tenant(
        &self,
        tenant_id: TenantId,
        schedule: FeeSchedule,
    ) -> Result<(), PaymentError> {
        schedule.validate()?;
        self.inner.write().tenants.insert(tenant_id, schedule);
        Ok(())
    }

    pub fn upsert_provider(
        &self,
        provider_id: ProviderId,
        settings: ProviderSettings,
    ) -> Result<(), PaymentError> {
        if settings.webhook_secret.is_empty() {
            return Err(PaymentError::Config(format!(
                "provider {provider_id}: webhook_secret is empty"
            )));
        }
        self.inner.write().providers.insert(provider_id, settings);
        Ok(())
    }
}
