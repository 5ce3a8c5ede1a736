/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Outbox Entry Model
//!
//! An outbox entry is one pending delivery of a write to the external memory
//! service. Entries are created when a direct delivery attempt fails and are
//! never deleted; the table is an append-only audit of delivery attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Awaiting delivery (or retry after failure).
    Pending,
    /// Delivered to the memory service. At most one entry per
    /// (namespace, payload hash) may hold this status.
    Sent,
    /// Retry budget exhausted or permanently rejected; requires manual
    /// intervention to reactivate.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending delivery of one write to the external memory service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Unique identifier for the entry.
    pub id: Uuid,
    /// Namespace the payload is delivered into.
    pub target_namespace: String,
    /// The payload body.
    pub payload: String,
    /// SHA-256 hex digest of the payload; dedup key together with the
    /// namespace.
    pub payload_hash: String,
    /// Current delivery status.
    pub status: OutboxStatus,
    /// Number of failed delivery attempts so far.
    pub retry_count: i32,
    /// The entry is not claimable before this time.
    pub next_attempt_at: DateTime<Utc>,
    /// Worker currently holding the delivery lease, if any.
    pub locked_by: Option<String>,
    /// When the current lease was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// How long a lease is honored before another worker may reclaim.
    pub lease_seconds: i32,
    /// Correlation id of the originating write request, linking this entry
    /// to its write-audit record.
    pub correlation_id: Option<Uuid>,
    /// Most recent delivery error.
    pub last_error: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Whether the lease (if any) has expired as of `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(at) => at + chrono::Duration::seconds(self.lease_seconds as i64) < now,
            None => true,
        }
    }
}

/// Parameters for enqueueing a new outbox entry.
///
/// Callers must have already attempted direct delivery and failed, and must
/// have consulted `check_dedup` first.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    /// Namespace the payload is delivered into.
    pub target_namespace: String,
    /// The payload body.
    pub payload: String,
    /// SHA-256 hex digest of the payload.
    pub payload_hash: String,
    /// Correlation id of the originating write request.
    pub correlation_id: Option<Uuid>,
    /// First time the entry becomes claimable; `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [OutboxStatus::Pending, OutboxStatus::Sent, OutboxStatus::Dead] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("bogus"), None);
    }

    #[test]
    fn lease_expiry_is_computed() {
        let now = Utc::now();
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            target_namespace: "team:x".to_string(),
            payload: "{}".to_string(),
            payload_hash: "abc".to_string(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: now,
            locked_by: Some("worker-1".to_string()),
            locked_at: Some(now - chrono::Duration::seconds(301)),
            lease_seconds: 300,
            correlation_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(entry.lease_expired(now));

        let held = OutboxEntry {
            locked_at: Some(now - chrono::Duration::seconds(299)),
            ..entry
        };
        assert!(!held.lease_expired(now));
    }
}
