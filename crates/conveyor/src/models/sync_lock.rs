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

//! Sync Lock Model
//!
//! A named mutex over a (repo_id, job_type) resource. Distinct from the job
//! queue's per-row lease: a sync lock serializes access to a resource whose
//! job type may be claimed by multiple queue rows over time, where
//! exclusivity must span multiple job invocations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A held lock over one (repo_id, job_type) resource.
///
/// Expiry is computed, never actively pushed: any reader sees the lock as
/// free once `locked_at + lease_seconds` has passed, regardless of whether a
/// cleanup pass has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLock {
    /// Repository the lock covers.
    pub repo_id: String,
    /// The task type the lock covers.
    pub job_type: String,
    /// Current holder.
    pub locked_by: String,
    /// When the lock was taken or last renewed.
    pub locked_at: DateTime<Utc>,
    /// How long the hold is honored.
    pub lease_seconds: i32,
}

impl SyncLock {
    /// Whether the hold has expired as of `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_at + chrono::Duration::seconds(self.lease_seconds as i64) < now
    }
}
