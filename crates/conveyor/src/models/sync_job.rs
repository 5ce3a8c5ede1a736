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

//! Sync Job Model
//!
//! A sync job is one unit of synchronization work against one repository.
//! At most one active job may exist per (repo_id, job_type, mode) scope,
//! preventing duplicate concurrent sync of the same resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sync scope: incremental catch-up or full backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Fetch changes since the last recorded cursor.
    Incremental,
    /// Re-fetch the full history.
    Backfill,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Incremental => "incremental",
            JobMode::Backfill => "backfill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incremental" => Some(JobMode::Incremental),
            "backfill" => Some(JobMode::Backfill),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Claimable once `not_before` has passed.
    Pending,
    /// Claimed by a worker under lease.
    Running,
    /// Finished successfully; terminal.
    Completed,
    /// Last attempt failed; claimable again once `not_before` has passed.
    Failed,
    /// Retry budget exhausted or permanently rejected; terminal, requires
    /// manual intervention to reactivate.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    /// Whether the job still occupies its (repo, type, mode) scope.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of synchronization work against one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    /// Unique identifier for the job.
    pub job_id: Uuid,
    /// Repository the job synchronizes.
    pub repo_id: String,
    /// The physical task performed against a specific external system
    /// (e.g. "issues", "pull_requests").
    pub job_type: String,
    /// Incremental or backfill.
    pub mode: JobMode,
    /// Scheduling priority; lower is more urgent.
    pub priority: i32,
    /// Job parameters (JSON).
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub attempts: i32,
    /// Attempt ceiling; the job goes dead when `attempts` reaches it.
    pub max_attempts: i32,
    /// Delay gate; the job is not claimable before this time.
    pub not_before: DateTime<Utc>,
    /// Worker currently holding the lease, if any.
    pub locked_by: Option<String>,
    /// When the current lease was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// How long a lease is honored before the reaper may reclaim.
    pub lease_seconds: i32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// The most recent execution record.
    pub last_run_id: Option<Uuid>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Whether the lease (if any) has expired as of `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(at) => at + chrono::Duration::seconds(self.lease_seconds as i64) < now,
            None => true,
        }
    }
}

/// Parameters for submitting a new sync job.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    /// Repository the job synchronizes.
    pub repo_id: String,
    /// The physical task performed against a specific external system.
    pub job_type: String,
    /// Incremental or backfill.
    pub mode: JobMode,
    /// Scheduling priority; lower is more urgent.
    pub priority: i32,
    /// Job parameters (JSON).
    pub payload: serde_json::Value,
    /// Attempt ceiling.
    pub max_attempts: i32,
    /// Lease duration granted at claim time.
    pub lease_seconds: i32,
    /// Earliest claimable time; `None` means immediately.
    pub not_before: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Dead,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn active_statuses_occupy_the_scope() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(JobStatus::Failed.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Dead.is_active());
    }
}
