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

//! Error types for the reliability engine.
//!
//! The taxonomy is deliberately closed and checked by variant, not by
//! downcasting library error hierarchies:
//!
//! - Contention is not an error: claim/acquire return empty results or
//!   `false`.
//! - Lease loss is surfaced distinctly (`LeaseLost` variants) so callers
//!   log-and-abandon instead of retrying destructively.
//! - External failures are split into transient and permanent
//!   ([`UpstreamError`]); permanent failures route straight to dead-letter
//!   without consuming retry budget.
//! - Invariant violations (double finalize, orphaned audits) are reported,
//!   never silently repaired.

use thiserror::Error;
use uuid::Uuid;

use crate::models::write_audit::WriteStatus;

/// Infrastructure-level storage errors.
///
/// These are the "truly exceptional" conditions: a worker aborts its current
/// iteration when it sees one, rather than treating it as a business outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to get a connection from the pool or to run the closure on it.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Database error surfaced by Diesel.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Stored data could not be decoded into domain types.
    #[error("malformed stored data: {0}")]
    Corrupt(String),

    /// Schema migration failure.
    #[error("migration error: {0}")]
    Migration(String),

    /// Missing or invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors from outbox queue operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("outbox entry {id} not found")]
    NotFound { id: Uuid },

    /// The caller no longer holds the lease on this entry. Log and abandon;
    /// another worker owns it now.
    #[error("lease on outbox entry {id} is no longer held by {holder}")]
    LeaseLost { id: Uuid, holder: String },
}

/// Errors from sync job queue operations.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sync job {id} not found")]
    NotFound { id: Uuid },

    /// The caller no longer holds the lease on this job.
    #[error("lease on sync job {id} is no longer held by {holder}")]
    LeaseLost { id: Uuid, holder: String },

    /// An active job already exists for this scope. Callers treat this as
    /// "already scheduled", not as a failure.
    #[error("an active sync job already exists for {repo_id} ({job_type}/{mode})")]
    DuplicateActive {
        repo_id: String,
        job_type: String,
        mode: String,
    },
}

/// Errors from the write-audit state machine.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no audit entry exists for correlation id {0}")]
    UnknownCorrelation(Uuid),

    /// A finalize call tried to move an already-terminal entry to a
    /// different terminal status. This is a double-resolution bug in the
    /// caller and must be surfaced, not absorbed.
    #[error(
        "audit entry for correlation id {correlation_id} is already {current}, refusing {requested}"
    )]
    AlreadyFinalized {
        correlation_id: Uuid,
        current: WriteStatus,
        requested: WriteStatus,
    },
}

/// Failures reported by external collaborators (the memory service and
/// source-control APIs).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network/timeout-class failure. Consumes one retry attempt and is
    /// re-attempted after backoff, never in the same cycle.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// The upstream rejected the operation permanently. Routed straight to
    /// dead/failed without consuming retry budget.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    /// Whether this failure is non-retryable.
    pub fn is_permanent(&self) -> bool {
        matches!(self, UpstreamError::Permanent(_))
    }
}

/// Umbrella error for worker loops and the write pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    JobQueue(#[from] JobQueueError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}
