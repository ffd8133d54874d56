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

//! Idempotency guard.
//!
//! A `(key, tenant)` pair is claimed by an atomic check-and-insert on the
//! key table. The claim is the only coordination point between concurrent
//! requests: whoever inserts the `processing` row owns the operation, every
//! other caller either replays the stored response or backs off.
//!
//! ```text
//!   (absent | expired) ──claim──► processing ──complete──► completed
//!                                     │
//!                                     └──fail──► failed ──claim (same hash)──► processing
//! ```

use crate::base::{IdempotencyKey, TenantId};
use crate::error::PaymentError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// SHA-256 of a request's canonical JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestHash(String);

impl RequestHash {
    pub fn of<T: Serialize>(request: &T) -> Result<Self, PaymentError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| PaymentError::MalformedPayload(e.to_string()))?;
        Ok(Self::from_bytes(&body))
    }

    pub fn from_bytes(body: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(body)))
    }
}

impl fmt::Display for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord<R> {
    pub key: IdempotencyKey,
    pub tenant_id: TenantId,
    pub request_hash: RequestHash,
    pub status: IdempotencyStatus,
    pub response: Option<R>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<R> IdempotencyRecord<R> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Proof that the holder owns an idempotency key.
///
/// Ledger writes require one, so a transaction cannot be created without
/// first winning the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    key: IdempotencyKey,
    tenant_id: TenantId,
}

impl ClaimTicket {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Outcome of a successful [`IdempotencyGuard::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim<R> {
    /// Caller owns the key and must run the operation.
    Claimed(ClaimTicket),
    /// Operation already ran; do not repeat side effects.
    Replay(R),
}

/// Table of idempotency keys for one kind of operation.
#[derive(Debug)]
pub struct IdempotencyGuard<R> {
    records: DashMap<(IdempotencyKey, TenantId), IdempotencyRecord<R>>,
    ttl: ChronoDuration,
}

impl<R: Clone> IdempotencyGuard<R> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX),
        }
    }

    /// Claims `(key, tenant_id)` for the request identified by `request_hash`.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::IdempotencyConflict`] - key already used for a different request.
    /// - [`PaymentError::InFlight`] - the owning request has not finished yet.
    #[instrument(skip(self, request_hash), fields(key = %key, tenant = %tenant_id))]
    pub fn claim(
        &self,
        key: &IdempotencyKey,
        tenant_id: &TenantId,
        request_hash: &RequestHash,
    ) -> Result<Claim<R>, PaymentError> {
        let now = Utc::now();
        let ticket = ClaimTicket {
            key: key.clone(),
            tenant_id: tenant_id.clone(),
        };

        // Entry API holds the shard lock for the whole check-and-insert.
        match self.records.entry((key.clone(), tenant_id.clone())) {
            Entry::Vacant(entry) => {
                entry.insert(self.processing_record(&ticket, request_hash, now));
                debug!("idempotency key claimed");
                Ok(Claim::Claimed(ticket))
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get();
                if record.is_expired(now) {
                    entry.insert(self.processing_record(&ticket, request_hash, now));
                    debug!("expired idempotency key reclaimed");
                    return Ok(Claim::Claimed(ticket));
                }
                if &record.request_hash != request_hash {
                    return Err(PaymentError::IdempotencyConflict);
                }
                match (record.status, &record.response) {
                    (IdempotencyStatus::Completed, Some(response)) => {
                        Ok(Claim::Replay(response.clone()))
                    }
                    (IdempotencyStatus::Failed, _) => {
                        entry.insert(self.processing_record(&ticket, request_hash, now));
                        debug!("failed idempotency key reclaimed");
                        Ok(Claim::Claimed(ticket))
                    }
                    _ => Err(PaymentError::InFlight),
                }
            }
        }
    }

    /// Stores the response and moves the key to `completed`.
    ///
    /// Completed responses are immutable; a second call is rejected.
    pub fn complete(&self, ticket: &ClaimTicket, response: R) -> Result<(), PaymentError> {
        let mut record = self
            .records
            .get_mut(&(ticket.key.clone(), ticket.tenant_id.clone()))
            .ok_or(PaymentError::InFlight)?;
        if record.status != IdempotencyStatus::Processing {
            return Err(PaymentError::IdempotencyConflict);
        }
        record.status = IdempotencyStatus::Completed;
        record.response = Some(response);
        Ok(())
    }

    /// Marks the operation as aborted without side effects.
    pub fn fail(&self, ticket: &ClaimTicket) {
        if let Some(mut record) = self
            .records
            .get_mut(&(ticket.key.clone(), ticket.tenant_id.clone()))
        {
            if record.status == IdempotencyStatus::Processing {
                record.status = IdempotencyStatus::Failed;
            }
        }
    }

    /// Read-only view of a key.
    pub fn get(&self, key: &IdempotencyKey, tenant_id: &TenantId) -> Option<IdempotencyRecord<R>> {
        self.records
            .get(&(key.clone(), tenant_id.clone()))
            .map(|record| record.clone())
    }

    /// Waits for another request holding the key to finish.
    ///
    /// Only reads the table, so dropping the future (caller cancellation or
    /// timeout) leaves stored state untouched. Gives up with
    /// [`PaymentError::InFlight`] after `max_wait`.
    pub async fn wait_for_completion(
        &self,
        key: &IdempotencyKey,
        tenant_id: &TenantId,
        request_hash: &RequestHash,
        max_wait: Duration,
    ) -> Result<R, PaymentError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut delay = Duration::from_millis(10);

        loop {
            if let Some(record) = self.get(key, tenant_id) {
                if &record.request_hash != request_hash {
                    return Err(PaymentError::IdempotencyConflict);
                }
                match (record.status, record.response) {
                    (IdempotencyStatus::Completed, Some(response)) => return Ok(response),
                    (IdempotencyStatus::Failed, _) => return Err(PaymentError::InFlight),
                    _ => {}
                }
            } else {
                return Err(PaymentError::InFlight);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PaymentError::InFlight);
            }
            let jitter = Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 4));
            tokio::time::sleep((delay + jitter).min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(500));
        }
    }

    /// Deletes expired keys, returning how many were removed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!(removed, "expired idempotency keys swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn processing_record(
        &self,
        ticket: &ClaimTicket,
        request_hash: &RequestHash,
        now: DateTime<Utc>,
    ) -> IdempotencyRecord<R> {
        IdempotencyRecord {
            key: ticket.key.clone(),
            tenant_id: ticket.tenant_id.clone(),
            request_hash: request_hash.clone(),
            status: IdempotencyStatus::Processing,
            response: None,
            created_at: now,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}
