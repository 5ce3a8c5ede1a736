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

//! Sync job worker.
//!
//! Claims due jobs, takes the per-resource lock, and pulls pages from the
//! source under the endpoint's rate limit, renewing job lease and lock
//! between pages. Lock contention releases the job without consuming an
//! attempt; transient source failures consume one and requeue with
//! backoff; permanent rejections dead-letter. Every execution leaves one
//! sync-run record.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dal::{RunOutcome, DAL};
use crate::delivery::SourceControlClient;
use crate::error::{EngineError, JobQueueError, UpstreamError};
use crate::models::rate_limit::BucketDefaults;
use crate::models::sync_job::{JobMode, SyncJob};
use crate::models::sync_run::RunStatus;
use crate::retry::BackoffPolicy;

/// Tuning for the sync worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// How often to poll for due jobs.
    pub poll_interval: Duration,
    /// Jobs claimed per pass.
    pub batch_size: usize,
    /// Lease on the per-resource lock.
    pub lock_lease_seconds: i32,
    /// How long a job waits before re-claim when the lock was busy.
    pub lock_retry_delay: Duration,
    /// Bucket parameters for endpoints seen for the first time.
    pub rate_defaults: BucketDefaults,
    /// Tokens consumed per page fetch.
    pub tokens_per_page: f64,
    /// Longest single sleep while waiting out a rate limit; leases are
    /// renewed between sleeps.
    pub max_throttle_sleep: Duration,
    /// Page ceiling per run; the cursor persists, the next run resumes.
    pub max_pages_per_run: usize,
    /// Backoff schedule for transient failures.
    pub backoff: BackoffPolicy,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 1,
            lock_lease_seconds: 600,
            lock_retry_delay: Duration::from_secs(30),
            rate_defaults: BucketDefaults::default(),
            tokens_per_page: 1.0,
            max_throttle_sleep: Duration::from_secs(30),
            max_pages_per_run: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What a single page-pulling loop ended with.
enum PullEnd {
    Drained,
    PageLimit,
    Upstream(UpstreamError),
    LeaseLost,
}

/// Accumulated totals for one run.
#[derive(Default)]
struct PullTotals {
    fetched: i32,
    written: i32,
    cursor: Option<String>,
}

/// Executes sync jobs against an external source.
pub struct SyncWorker {
    dal: DAL,
    client: Arc<dyn SourceControlClient>,
    config: SyncWorkerConfig,
    worker_id: String,
}

impl SyncWorker {
    pub fn new(dal: DAL, client: Arc<dyn SourceControlClient>, config: SyncWorkerConfig) -> Self {
        Self {
            dal,
            client,
            config,
            worker_id: format!("sync-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs the polling loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker_id = %self.worker_id, "sync worker started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(worker_id = %self.worker_id, error = %e, "sync pass failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker_id = %self.worker_id, "sync worker shutting down");
                    break;
                }
            }
        }
    }

    /// Claims and executes one batch of jobs. Returns the number of jobs
    /// that completed.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        let jobs = self
            .dal
            .sync_job()
            .claim(&self.worker_id, self.config.batch_size)
            .await?;

        let mut completed = 0;
        for job in jobs {
            match self.execute(&job).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(EngineError::JobQueue(JobQueueError::LeaseLost { id, holder })) => {
                    warn!(job_id = %id, holder = %holder, "abandoning job after lease loss");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(completed)
    }

    /// Executes one claimed job end to end. Returns whether it completed.
    async fn execute(&self, job: &SyncJob) -> Result<bool, EngineError> {
        // Resource lock first: the job-queue lease protects the row, the
        // lock protects the external resource across job rows.
        let locked = self
            .dal
            .sync_lock()
            .acquire(
                &job.repo_id,
                &job.job_type,
                &self.worker_id,
                self.config.lock_lease_seconds,
            )
            .await
            .map_err(JobQueueError::from)?;
        if !locked {
            let not_before = Utc::now()
                + chrono::Duration::from_std(self.config.lock_retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            debug!(job_id = %job.job_id, repo_id = %job.repo_id, "resource lock busy, releasing job");
            self.dal
                .sync_job()
                .release(job.job_id, &self.worker_id, not_before)
                .await?;
            return Ok(false);
        }

        let result = self.execute_locked(job).await;

        // The lock is released on every path; an error releasing it is
        // survivable since the lease expires on its own.
        if let Err(e) = self
            .dal
            .sync_lock()
            .release(&job.repo_id, &job.job_type, &self.worker_id)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to release resource lock");
        }

        result
    }

    async fn execute_locked(&self, job: &SyncJob) -> Result<bool, EngineError> {
        let cursor_before = match job.mode {
            JobMode::Incremental => {
                self.dal
                    .sync_run()
                    .latest_cursor(&job.repo_id, &job.job_type)
                    .await
                    .map_err(JobQueueError::from)?
            }
            JobMode::Backfill => None,
        };

        let run_id = self
            .dal
            .sync_run()
            .start(
                job.job_id,
                &job.repo_id,
                &job.job_type,
                job.mode,
                cursor_before.as_deref(),
            )
            .await
            .map_err(JobQueueError::from)?;

        let mut totals = PullTotals {
            cursor: cursor_before,
            ..PullTotals::default()
        };
        let end = self.pull_pages(job, &mut totals).await?;

        match end {
            PullEnd::Drained | PullEnd::PageLimit => {
                let status = if totals.fetched == 0 {
                    RunStatus::NoData
                } else {
                    RunStatus::Completed
                };
                self.finish_run(run_id, status, &totals, None).await?;
                self.dal
                    .sync_job()
                    .complete(job.job_id, &self.worker_id, Some(run_id))
                    .await?;
                info!(
                    job_id = %job.job_id,
                    run_id = %run_id,
                    fetched = totals.fetched,
                    written = totals.written,
                    status = %status,
                    "sync job completed"
                );
                Ok(true)
            }
            PullEnd::Upstream(UpstreamError::Transient(reason)) => {
                self.finish_run(run_id, RunStatus::Failed, &totals, Some(&reason))
                    .await?;
                let next = self
                    .config
                    .backoff
                    .next_attempt_at(job.attempts + 1, Utc::now());
                let status = self
                    .dal
                    .sync_job()
                    .fail(job.job_id, &self.worker_id, &reason, next, Some(run_id))
                    .await?;
                warn!(job_id = %job.job_id, status = %status, reason = %reason, "sync job attempt failed");
                Ok(false)
            }
            PullEnd::Upstream(UpstreamError::Permanent(reason)) => {
                self.finish_run(run_id, RunStatus::Failed, &totals, Some(&reason))
                    .await?;
                self.dal
                    .sync_job()
                    .dead_letter(job.job_id, &self.worker_id, &reason, Some(run_id))
                    .await?;
                Ok(false)
            }
            PullEnd::LeaseLost => {
                // Another worker may already be re-running the job; the run
                // record is closed so it never claims to still be running.
                self.finish_run(run_id, RunStatus::Failed, &totals, Some("job lease lost mid-run"))
                    .await?;
                warn!(job_id = %job.job_id, run_id = %run_id, "job lease lost mid-run");
                Ok(false)
            }
        }
    }

    /// Pulls pages until the source drains, the page ceiling is hit, the
    /// upstream fails, or the job lease is lost.
    async fn pull_pages(&self, job: &SyncJob, totals: &mut PullTotals) -> Result<PullEnd, EngineError> {
        for _ in 0..self.config.max_pages_per_run {
            if !self.throttle(job).await? {
                return Ok(PullEnd::LeaseLost);
            }

            let page = match self
                .client
                .sync_page(&job.repo_id, &job.job_type, job.mode, totals.cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => return Ok(PullEnd::Upstream(e)),
            };

            totals.fetched += page.fetched;
            totals.written += page.written;
            if page.next_cursor.is_some() {
                totals.cursor = page.next_cursor;
            }
            if !page.has_more {
                return Ok(PullEnd::Drained);
            }
            if !self.renew(job).await? {
                return Ok(PullEnd::LeaseLost);
            }
        }
        Ok(PullEnd::PageLimit)
    }

    /// Waits out the endpoint's rate limit, renewing leases between
    /// sleeps. Returns `false` if the job lease was lost while waiting.
    async fn throttle(&self, job: &SyncJob) -> Result<bool, EngineError> {
        loop {
            let decision = self
                .dal
                .rate_limit()
                .consume(
                    self.client.instance_key(),
                    self.config.tokens_per_page,
                    &self.config.rate_defaults,
                )
                .await
                .map_err(JobQueueError::from)?;
            if decision.allowed {
                return Ok(true);
            }

            let sleep = decision.wait.min(self.config.max_throttle_sleep);
            debug!(
                job_id = %job.job_id,
                instance_key = %self.client.instance_key(),
                wait_ms = sleep.as_millis() as u64,
                "rate limited, waiting"
            );
            tokio::time::sleep(sleep).await;
            if !self.renew(job).await? {
                return Ok(false);
            }
        }
    }

    /// Renews the job lease and the resource lock. Returns `false` when
    /// either is no longer held.
    async fn renew(&self, job: &SyncJob) -> Result<bool, EngineError> {
        match self
            .dal
            .sync_job()
            .renew_lease(job.job_id, &self.worker_id)
            .await
        {
            Ok(()) => {}
            Err(JobQueueError::LeaseLost { .. }) | Err(JobQueueError::NotFound { .. }) => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }
        let held = self
            .dal
            .sync_lock()
            .renew(&job.repo_id, &job.job_type, &self.worker_id)
            .await
            .map_err(JobQueueError::from)?;
        Ok(held)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        totals: &PullTotals,
        error_summary: Option<&str>,
    ) -> Result<(), EngineError> {
        self.dal
            .sync_run()
            .finish(
                run_id,
                RunOutcome {
                    status,
                    cursor_after: totals.cursor.clone(),
                    items_fetched: totals.fetched,
                    items_written: totals.written,
                    error_summary: error_summary.map(str::to_string),
                },
            )
            .await
            .map_err(JobQueueError::from)?;
        Ok(())
    }
}
