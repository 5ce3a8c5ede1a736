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

//! Conveyor is a reliability engine for work that crosses process
//! boundaries through a shared relational store.
//!
//! It coordinates two classes of work:
//!
//! - **Outbox delivery**: at-least-once delivery of write operations to an
//!   external memory service, with an append-only audit trail that converges
//!   to each operation's true final state.
//! - **Sync scheduling**: a distributed job queue that schedules, throttles,
//!   and retries synchronization work against external source-control APIs.
//!
//! Both halves are built from the same primitives: lease-based claims,
//!   idempotent dedup, bounded retry with backoff, and dead-lettering.
//!
//! # Architecture
//!
//! Independent worker processes share no memory and communicate only through
//! the store. Every claim is a single atomic conditional update ("update to
//! leased-by-me where currently unleased or lease-expired"), and every
//! mutation to a claimable row carries the lease/holder predicate, so
//! at-most-one-claimant holds even under concurrent claimers.
//!
//! - [`dal::OutboxDAL`] — delivery retry engine (enqueue/claim/ack/fail).
//! - [`dal::WriteAuditDAL`] — caller-facing write outcome state machine.
//! - [`dal::SyncJobDAL`] — priority job queue with the unique-active-job
//!   invariant.
//! - [`dal::SyncLockDAL`] — per-resource distributed lock table.
//! - [`dal::RateLimitDAL`] — token-bucket rate limiter per external endpoint.
//! - [`workers`] — long-running loops: outbox worker, sync worker, reaper,
//!   and reconciler.
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor::database::Database;
//! use conveyor::dal::DAL;
//!
//! # async fn example() -> Result<(), conveyor::error::StoreError> {
//! let database = Database::new("conveyor.db");
//! database.run_migrations().await?;
//! let dal = DAL::new(database);
//!
//! let pending = dal.outbox().claim("worker-1", 10, 300).await;
//! # Ok(())
//! # }
//! ```

pub mod dal;
pub mod database;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod models;
pub mod retry;
pub mod workers;

pub use dal::DAL;
pub use database::Database;
pub use delivery::{
    content_hash, MemoryService, PolicyAction, SourceControlClient, SyncPage, WriteOutcome,
    WritePipeline, WriteRequest,
};
pub use error::{
    AuditError, EngineError, JobQueueError, OutboxError, StoreError, UpstreamError,
};
pub use retry::BackoffPolicy;
