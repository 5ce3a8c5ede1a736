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

//! Data Access Layer.
//!
//! One DAL per entity, all reached through the root [`DAL`] facade. Claim
//! operations are implemented as conditional updates inside a single
//! immediate write transaction, so at-most-one-claimant holds even under
//! concurrent claimers: every mutation to a claimable row carries the
//! lease/holder predicate, never a blind write.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::database::Database;
use crate::error::StoreError;

pub mod models;
pub mod outbox;
pub mod rate_limit;
pub mod sync_job;
pub mod sync_lock;
pub mod sync_run;
pub mod write_audit;

pub use outbox::{AckOutcome, DedupHit, OutboxDAL};
pub use rate_limit::RateLimitDAL;
pub use sync_job::{ReapedJob, SyncJobDAL};
pub use sync_lock::SyncLockDAL;
pub use sync_run::{RunOutcome, SyncRunDAL};
pub use write_audit::WriteAuditDAL;

/// The root Data Access Layer facade.
///
/// `DAL` is `Clone`; each clone references the same underlying connection
/// pool.
#[derive(Clone, Debug)]
pub struct DAL {
    /// The database instance with connection pool.
    pub database: Database,
}

impl DAL {
    /// Creates a new DAL instance.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Returns an outbox DAL for delivery-queue operations.
    pub fn outbox(&self) -> OutboxDAL {
        OutboxDAL::new(self)
    }

    /// Returns a write-audit DAL for audit state-machine operations.
    pub fn write_audit(&self) -> WriteAuditDAL {
        WriteAuditDAL::new(self)
    }

    /// Returns a sync-job DAL for job-queue operations.
    pub fn sync_job(&self) -> SyncJobDAL {
        SyncJobDAL::new(self)
    }

    /// Returns a sync-run DAL for execution records.
    pub fn sync_run(&self) -> SyncRunDAL {
        SyncRunDAL::new(self)
    }

    /// Returns a sync-lock DAL for the distributed lock table.
    pub fn sync_lock(&self) -> SyncLockDAL {
        SyncLockDAL::new(self)
    }

    /// Returns a rate-limit DAL for token-bucket operations.
    pub fn rate_limit(&self) -> RateLimitDAL {
        RateLimitDAL::new(self)
    }
}

/// Error type used inside transaction closures, where both Diesel errors
/// and decode failures can occur.
#[derive(Debug)]
pub(crate) enum TxError {
    Db(diesel::result::Error),
    Corrupt(String),
}

impl From<diesel::result::Error> for TxError {
    fn from(e: diesel::result::Error) -> Self {
        TxError::Db(e)
    }
}

impl From<TxError> for StoreError {
    fn from(e: TxError) -> Self {
        match e {
            TxError::Db(e) => StoreError::Database(e),
            TxError::Corrupt(msg) => StoreError::Corrupt(msg),
        }
    }
}

/// Formats a timestamp as fixed-width RFC3339 (UTC, microseconds, 'Z').
///
/// The fixed width makes lexicographic order in SQL equal chronological
/// order; all writes must go through this function.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, TxError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TxError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, TxError> {
    raw.map(parse_ts).transpose()
}

/// Parses a stored UUID BLOB.
pub(crate) fn parse_uuid(raw: &[u8]) -> Result<Uuid, TxError> {
    Uuid::from_slice(raw).map_err(|e| TxError::Corrupt(format!("bad uuid blob: {}", e)))
}

pub(crate) fn parse_opt_uuid(raw: Option<&[u8]>) -> Result<Option<Uuid>, TxError> {
    raw.map(parse_uuid).transpose()
}

/// Converts a UUID to its stored BLOB form.
pub(crate) fn uuid_bytes(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Whether a row with the given lease fields is claimable as of `now`:
/// the lease is absent or has expired.
pub(crate) fn lease_available(
    locked_by: Option<&str>,
    locked_at: Option<&str>,
    lease_seconds: i32,
    now: DateTime<Utc>,
) -> Result<bool, TxError> {
    match (locked_by, locked_at) {
        (Some(_), Some(at)) => {
            let at = parse_ts(at)?;
            Ok(at + chrono::Duration::seconds(lease_seconds as i64) < now)
        }
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ts_is_fixed_width_and_sortable() {
        let a = format_ts("2026-01-02T03:04:05.000001Z".parse().unwrap());
        let b = format_ts("2026-01-02T03:04:05.100000Z".parse().unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn ts_roundtrip_is_exact() {
        let now = Utc::now();
        let stored = format_ts(now);
        let parsed = parse_ts(&stored).unwrap();
        assert_eq!(format_ts(parsed), stored);
    }

    #[test]
    fn lease_availability() {
        let now = Utc::now();
        let held = format_ts(now - chrono::Duration::seconds(10));
        assert!(!lease_available(Some("w"), Some(&held), 60, now).unwrap());
        assert!(lease_available(Some("w"), Some(&held), 5, now).unwrap());
        assert!(lease_available(None, None, 60, now).unwrap());
    }

    #[test]
    fn uuid_blob_roundtrip() {
        let id = Uuid::new_v4();
        assert_eq!(parse_uuid(&uuid_bytes(id)).unwrap(), id);
        assert!(parse_uuid(&[1, 2, 3]).is_err());
    }
}
