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

//! Storage-native row models.
//!
//! These structs use SQLite-compatible types: UUIDs as BLOB (`Vec<u8>`),
//! timestamps as RFC3339 TEXT. They are used internally by the DAL and
//! converted to/from domain types at the DAL boundary; malformed stored
//! data surfaces as `StoreError::Corrupt` rather than a panic.

use diesel::prelude::*;

use super::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, TxError};
use crate::database::schema::{
    outbox_entries, rate_limit_buckets, sync_jobs, sync_locks, sync_runs, write_audit,
};
use crate::models::outbox::{OutboxEntry, OutboxStatus};
use crate::models::rate_limit::{BucketMeta, RateLimitBucket};
use crate::models::sync_job::{JobMode, JobStatus, SyncJob};
use crate::models::sync_lock::SyncLock;
use crate::models::sync_run::{RunStatus, SyncRun};
use crate::models::write_audit::{WriteAction, WriteAuditEntry, WriteStatus};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = outbox_entries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OutboxRow {
    pub id: Vec<u8>,
    pub target_namespace: String,
    pub payload: String,
    pub payload_hash: String,
    pub status: String,
    pub retry_count: i32,
    pub next_attempt_at: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub lease_seconds: i32,
    pub correlation_id: Option<Vec<u8>>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbox_entries)]
pub struct NewOutboxRow {
    pub id: Vec<u8>,
    pub target_namespace: String,
    pub payload: String,
    pub payload_hash: String,
    pub status: String,
    pub retry_count: i32,
    pub next_attempt_at: String,
    pub lease_seconds: i32,
    pub correlation_id: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

impl OutboxRow {
    pub fn into_domain(self) -> Result<OutboxEntry, TxError> {
        Ok(OutboxEntry {
            id: parse_uuid(&self.id)?,
            target_namespace: self.target_namespace,
            payload: self.payload,
            payload_hash: self.payload_hash,
            status: OutboxStatus::parse(&self.status)
                .ok_or_else(|| TxError::Corrupt(format!("bad outbox status {:?}", self.status)))?,
            retry_count: self.retry_count,
            next_attempt_at: parse_ts(&self.next_attempt_at)?,
            locked_by: self.locked_by,
            locked_at: parse_opt_ts(self.locked_at.as_deref())?,
            lease_seconds: self.lease_seconds,
            correlation_id: parse_opt_uuid(self.correlation_id.as_deref())?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = write_audit)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WriteAuditRow {
    pub id: Vec<u8>,
    pub correlation_id: Vec<u8>,
    pub actor: String,
    pub target_namespace: String,
    pub action: String,
    pub status: String,
    pub payload_hash: String,
    pub evidence: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finalized_at: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = write_audit)]
pub struct NewWriteAuditRow {
    pub id: Vec<u8>,
    pub correlation_id: Vec<u8>,
    pub actor: String,
    pub target_namespace: String,
    pub action: String,
    pub status: String,
    pub payload_hash: String,
    pub evidence: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finalized_at: Option<String>,
}

impl WriteAuditRow {
    pub fn into_domain(self) -> Result<WriteAuditEntry, TxError> {
        let evidence = self
            .evidence
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| TxError::Corrupt(format!("bad audit evidence json: {}", e)))?;
        Ok(WriteAuditEntry {
            id: parse_uuid(&self.id)?,
            correlation_id: parse_uuid(&self.correlation_id)?,
            actor: self.actor,
            target_namespace: self.target_namespace,
            action: WriteAction::parse(&self.action)
                .ok_or_else(|| TxError::Corrupt(format!("bad audit action {:?}", self.action)))?,
            status: WriteStatus::parse(&self.status)
                .ok_or_else(|| TxError::Corrupt(format!("bad audit status {:?}", self.status)))?,
            payload_hash: self.payload_hash,
            evidence,
            reason: self.reason,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            finalized_at: parse_opt_ts(self.finalized_at.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sync_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncJobRow {
    pub job_id: Vec<u8>,
    pub repo_id: String,
    pub job_type: String,
    pub mode: String,
    pub priority: i32,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub lease_seconds: i32,
    pub last_error: Option<String>,
    pub last_run_id: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sync_jobs)]
pub struct NewSyncJobRow {
    pub job_id: Vec<u8>,
    pub repo_id: String,
    pub job_type: String,
    pub mode: String,
    pub priority: i32,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: String,
    pub lease_seconds: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl SyncJobRow {
    pub fn into_domain(self) -> Result<SyncJob, TxError> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| TxError::Corrupt(format!("bad job payload json: {}", e)))?;
        Ok(SyncJob {
            job_id: parse_uuid(&self.job_id)?,
            repo_id: self.repo_id,
            job_type: self.job_type,
            mode: JobMode::parse(&self.mode)
                .ok_or_else(|| TxError::Corrupt(format!("bad job mode {:?}", self.mode)))?,
            priority: self.priority,
            payload,
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| TxError::Corrupt(format!("bad job status {:?}", self.status)))?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            not_before: parse_ts(&self.not_before)?,
            locked_by: self.locked_by,
            locked_at: parse_opt_ts(self.locked_at.as_deref())?,
            lease_seconds: self.lease_seconds,
            last_error: self.last_error,
            last_run_id: parse_opt_uuid(self.last_run_id.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sync_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRunRow {
    pub run_id: Vec<u8>,
    pub job_id: Vec<u8>,
    pub repo_id: String,
    pub job_type: String,
    pub mode: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
    pub items_fetched: i32,
    pub items_written: i32,
    pub error_summary: Option<String>,
    pub status: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sync_runs)]
pub struct NewSyncRunRow {
    pub run_id: Vec<u8>,
    pub job_id: Vec<u8>,
    pub repo_id: String,
    pub job_type: String,
    pub mode: String,
    pub started_at: String,
    pub cursor_before: Option<String>,
    pub status: String,
}

impl SyncRunRow {
    pub fn into_domain(self) -> Result<SyncRun, TxError> {
        Ok(SyncRun {
            run_id: parse_uuid(&self.run_id)?,
            job_id: parse_uuid(&self.job_id)?,
            repo_id: self.repo_id,
            job_type: self.job_type,
            mode: self.mode,
            started_at: parse_ts(&self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at.as_deref())?,
            cursor_before: self.cursor_before,
            cursor_after: self.cursor_after,
            items_fetched: self.items_fetched,
            items_written: self.items_written,
            error_summary: self.error_summary,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| TxError::Corrupt(format!("bad run status {:?}", self.status)))?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = sync_locks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncLockRow {
    pub repo_id: String,
    pub job_type: String,
    pub locked_by: String,
    pub locked_at: String,
    pub lease_seconds: i32,
}

impl SyncLockRow {
    pub fn into_domain(self) -> Result<SyncLock, TxError> {
        Ok(SyncLock {
            repo_id: self.repo_id,
            job_type: self.job_type,
            locked_by: self.locked_by,
            locked_at: parse_ts(&self.locked_at)?,
            lease_seconds: self.lease_seconds,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = rate_limit_buckets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RateLimitBucketRow {
    pub instance_key: String,
    pub tokens: f64,
    pub rate: f64,
    pub burst: f64,
    pub paused_until: Option<String>,
    pub meta: String,
    pub updated_at: String,
}

impl RateLimitBucketRow {
    pub fn into_domain(self) -> Result<RateLimitBucket, TxError> {
        let meta: BucketMeta = serde_json::from_str(&self.meta)
            .map_err(|e| TxError::Corrupt(format!("bad bucket meta json: {}", e)))?;
        Ok(RateLimitBucket {
            instance_key: self.instance_key,
            tokens: self.tokens,
            rate: self.rate,
            burst: self.burst,
            paused_until: parse_opt_ts(self.paused_until.as_deref())?,
            meta,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
