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

//! Sync Run Model
//!
//! A sync run is an immutable record of one execution of a sync job:
//! created at claim time, finalized once at job completion, and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Execution in progress.
    Running,
    /// Finished and fetched at least one item.
    Completed,
    /// Finished with an error.
    Failed,
    /// Finished cleanly but the source had nothing new.
    NoData,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::NoData => "no_data",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "no_data" => Some(RunStatus::NoData),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of one execution of a sync job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    /// Unique identifier for the run.
    pub run_id: Uuid,
    /// The job this run executed.
    pub job_id: Uuid,
    /// Repository synchronized.
    pub repo_id: String,
    /// The physical task performed.
    pub job_type: String,
    /// Incremental or backfill.
    pub mode: String,
    /// When the run started (claim time).
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Source cursor before the run.
    pub cursor_before: Option<String>,
    /// Source cursor after the run; the next incremental run starts here.
    pub cursor_after: Option<String>,
    /// Items fetched from the source.
    pub items_fetched: i32,
    /// Items applied downstream.
    pub items_written: i32,
    /// Error summary for failed runs.
    pub error_summary: Option<String>,
    /// Outcome of the run.
    pub status: RunStatus,
}
