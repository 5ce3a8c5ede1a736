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

//! Domain models for the reliability engine.
//!
//! These are plain domain types (`uuid::Uuid`, `chrono::DateTime<Utc>`);
//! storage-native representations live in the DAL and are converted at the
//! DAL boundary.

pub mod outbox;
pub mod rate_limit;
pub mod sync_job;
pub mod sync_lock;
pub mod sync_run;
pub mod write_audit;

pub use outbox::{NewOutboxEntry, OutboxEntry, OutboxStatus};
pub use rate_limit::{BucketDefaults, BucketMeta, RateDecision, RateLimitBucket};
pub use sync_job::{JobMode, JobStatus, NewSyncJob, SyncJob};
pub use sync_lock::SyncLock;
pub use sync_run::{RunStatus, SyncRun};
pub use write_audit::{NewWriteAuditEntry, WriteAction, WriteAuditEntry, WriteStatus};
