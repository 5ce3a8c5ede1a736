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

//! Sync job queue.
//!
//! Jobs are claimed under lease in (priority, not_before, created_at) order.
//! A partial unique index on (repo_id, job_type, mode) over active statuses
//! enforces at most one active job per scope; submit surfaces the collision
//! as [`JobQueueError::DuplicateActive`] rather than failing the caller.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{NewSyncJobRow, SyncJobRow};
use super::{format_ts, lease_available, uuid_bytes, TxError, DAL};
use crate::database::schema::sync_jobs;
use crate::error::{JobQueueError, StoreError};
use crate::models::sync_job::{JobStatus, NewSyncJob, SyncJob};
use crate::retry::BackoffPolicy;

/// A job reclaimed from a crashed or stalled worker.
#[derive(Debug, Clone)]
pub struct ReapedJob {
    pub job_id: Uuid,
    pub repo_id: String,
    pub job_type: String,
    /// The worker whose lease expired.
    pub previous_holder: String,
    /// `failed` (requeued with backoff) or `dead` (budget exhausted).
    pub status: JobStatus,
}

enum LeaseOp<T> {
    Done(T),
    NotFound,
    LeaseLost,
}

/// Data access layer for sync-job queue operations.
#[derive(Clone)]
pub struct SyncJobDAL<'a> {
    dal: &'a DAL,
}

impl<'a> SyncJobDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Submits a new pending job and returns its id.
    ///
    /// Returns [`JobQueueError::DuplicateActive`] when an active job already
    /// occupies the (repo_id, job_type, mode) scope.
    pub async fn submit(&self, job: NewSyncJob) -> Result<Uuid, JobQueueError> {
        let conn = self.dal.database.get_connection().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let scope = (job.repo_id.clone(), job.job_type.clone(), job.mode);
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| StoreError::Corrupt(format!("unencodable job payload json: {}", e)))?;
        let row = NewSyncJobRow {
            job_id: uuid_bytes(id),
            repo_id: job.repo_id,
            job_type: job.job_type,
            mode: job.mode.as_str().to_string(),
            priority: job.priority,
            payload,
            status: JobStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: job.max_attempts,
            not_before: format_ts(job.not_before.unwrap_or(now)),
            lease_seconds: job.lease_seconds,
            created_at: format_ts(now),
            updated_at: format_ts(now),
        };

        let result = conn
            .interact(move |conn| {
                diesel::insert_into(sync_jobs::table)
                    .values(&row)
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?;

        match result {
            Ok(_) => {
                debug!(job_id = %id, "sync job submitted");
                Ok(id)
            }
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(JobQueueError::DuplicateActive {
                    repo_id: scope.0,
                    job_type: scope.1,
                    mode: scope.2.as_str().to_string(),
                })
            }
            Err(e) => Err(JobQueueError::from(StoreError::from(e))),
        }
    }

    /// Atomically claims up to `limit` due jobs for `worker_id`, marking
    /// them `running` under their configured lease.
    ///
    /// Eligible jobs are `pending` or `failed`, past their `not_before`
    /// gate, and unleased or lease-expired; ordered by (priority,
    /// not_before, created_at). An empty result on contention is not an
    /// error.
    pub async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<SyncJob>, JobQueueError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();

        let rows = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Vec<SyncJobRow>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);
                    let active = [JobStatus::Pending.as_str(), JobStatus::Failed.as_str()];

                    let candidates: Vec<SyncJobRow> = sync_jobs::table
                        .filter(sync_jobs::status.eq_any(active))
                        .filter(sync_jobs::not_before.le(&now_s))
                        .order((
                            sync_jobs::priority.asc(),
                            sync_jobs::not_before.asc(),
                            sync_jobs::created_at.asc(),
                        ))
                        .limit((limit * 8 + 16) as i64)
                        .select(SyncJobRow::as_select())
                        .load(conn)?;

                    let mut claimed: Vec<Vec<u8>> = Vec::new();
                    for row in candidates {
                        if claimed.len() >= limit {
                            break;
                        }
                        if !lease_available(
                            row.locked_by.as_deref(),
                            row.locked_at.as_deref(),
                            row.lease_seconds,
                            now,
                        )? {
                            continue;
                        }

                        let won = match (&row.locked_by, &row.locked_at) {
                            (Some(holder), Some(at)) => diesel::update(
                                sync_jobs::table
                                    .filter(sync_jobs::job_id.eq(&row.job_id))
                                    .filter(sync_jobs::status.eq(&row.status))
                                    .filter(sync_jobs::locked_by.eq(holder))
                                    .filter(sync_jobs::locked_at.eq(at)),
                            )
                            .set((
                                sync_jobs::status.eq(JobStatus::Running.as_str()),
                                sync_jobs::locked_by.eq(&worker),
                                sync_jobs::locked_at.eq(&now_s),
                                sync_jobs::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                            _ => diesel::update(
                                sync_jobs::table
                                    .filter(sync_jobs::job_id.eq(&row.job_id))
                                    .filter(sync_jobs::status.eq(&row.status))
                                    .filter(sync_jobs::locked_by.is_null()),
                            )
                            .set((
                                sync_jobs::status.eq(JobStatus::Running.as_str()),
                                sync_jobs::locked_by.eq(&worker),
                                sync_jobs::locked_at.eq(&now_s),
                                sync_jobs::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                        };

                        if won == 1 {
                            claimed.push(row.job_id);
                        }
                    }

                    let rows: Vec<SyncJobRow> = sync_jobs::table
                        .filter(sync_jobs::job_id.eq_any(&claimed))
                        .order((sync_jobs::priority.asc(), sync_jobs::created_at.asc()))
                        .select(SyncJobRow::as_select())
                        .load(conn)?;
                    Ok(rows)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|r| {
                r.into_domain()
                    .map_err(StoreError::from)
                    .map_err(JobQueueError::from)
            })
            .collect()
    }

    /// Marks a running job `completed`, releasing the lease and freeing its
    /// active scope.
    pub async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        last_run_id: Option<Uuid>,
    ) -> Result<(), JobQueueError> {
        self.finish(id, worker_id, move |row, now_s| FinishUpdate {
            status: JobStatus::Completed,
            attempts: row.attempts,
            not_before: None,
            last_error: None,
            last_run_id: last_run_id.map(uuid_bytes),
            now_s: now_s.to_string(),
        })
        .await?;
        debug!(job_id = %id, "sync job completed");
        Ok(())
    }

    /// Records a failed attempt: increments the attempt count and either
    /// requeues as `failed` gated by `next_attempt_at`, or dead-letters once
    /// the job's own `max_attempts` ceiling is reached. Returns the
    /// resulting status.
    pub async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        last_run_id: Option<Uuid>,
    ) -> Result<JobStatus, JobQueueError> {
        let error = error.to_string();
        let status = self
            .finish(id, worker_id, move |row, now_s| {
                let attempts = row.attempts + 1;
                let status = if attempts >= row.max_attempts {
                    JobStatus::Dead
                } else {
                    JobStatus::Failed
                };
                FinishUpdate {
                    status,
                    attempts,
                    not_before: Some(format_ts(next_attempt_at)),
                    last_error: Some(error.clone()),
                    last_run_id: last_run_id.map(uuid_bytes),
                    now_s: now_s.to_string(),
                }
            })
            .await?;
        if status == JobStatus::Dead {
            warn!(job_id = %id, "sync job dead-lettered after retry exhaustion");
        } else {
            debug!(job_id = %id, next_attempt_at = %next_attempt_at, "sync job failed, retry scheduled");
        }
        Ok(status)
    }

    /// Dead-letters a running job without consuming retry budget, for
    /// permanent upstream rejections.
    pub async fn dead_letter(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        last_run_id: Option<Uuid>,
    ) -> Result<(), JobQueueError> {
        let error = error.to_string();
        self.finish(id, worker_id, move |row, now_s| FinishUpdate {
            status: JobStatus::Dead,
            attempts: row.attempts,
            not_before: None,
            last_error: Some(error.clone()),
            last_run_id: last_run_id.map(uuid_bytes),
            now_s: now_s.to_string(),
        })
        .await?;
        warn!(job_id = %id, "sync job dead-lettered (permanent rejection)");
        Ok(())
    }

    /// Returns a running job to `pending` without consuming retry budget.
    ///
    /// Used when the worker cannot make progress through no fault of the
    /// job, e.g. the resource lock is held by someone else. `not_before`
    /// delays the next claim so the holder gets a chance to finish.
    pub async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<(), JobQueueError> {
        self.finish(id, worker_id, move |row, now_s| FinishUpdate {
            status: JobStatus::Pending,
            attempts: row.attempts,
            not_before: Some(format_ts(not_before)),
            last_error: None,
            last_run_id: None,
            now_s: now_s.to_string(),
        })
        .await?;
        debug!(job_id = %id, not_before = %not_before, "sync job released without attempt");
        Ok(())
    }

    /// Extends the lease on a running job.
    pub async fn renew_lease(&self, id: Uuid, worker_id: &str) -> Result<(), JobQueueError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();

        let op = conn
            .interact(move |conn| {
                conn.immediate_transaction::<LeaseOp<()>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let row = match load_row(conn, id)? {
                        Some(row) => row,
                        None => return Ok(LeaseOp::NotFound),
                    };
                    if !holds_lease(&row, &worker, now)? {
                        return Ok(LeaseOp::LeaseLost);
                    }

                    diesel::update(
                        sync_jobs::table
                            .filter(sync_jobs::job_id.eq(&row.job_id))
                            .filter(sync_jobs::locked_by.eq(&worker)),
                    )
                    .set((
                        sync_jobs::locked_at.eq(format_ts(now)),
                        sync_jobs::updated_at.eq(format_ts(now)),
                    ))
                    .execute(conn)?;
                    Ok(LeaseOp::Done(()))
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?
            .map_err(StoreError::from)?;

        self.resolve(op, id, worker_id)
    }

    /// Requeues or dead-letters every `running` job whose lease has
    /// expired, applying failure semantics (the attempt was consumed by the
    /// crashed worker). Returns what was reclaimed.
    pub async fn reap_expired(&self, backoff: &BackoffPolicy) -> Result<Vec<ReapedJob>, JobQueueError> {
        let conn = self.dal.database.get_connection().await?;
        let backoff = backoff.clone();

        let reaped = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Vec<ReapedJob>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let running: Vec<SyncJobRow> = sync_jobs::table
                        .filter(sync_jobs::status.eq(JobStatus::Running.as_str()))
                        .select(SyncJobRow::as_select())
                        .load(conn)?;

                    let mut reaped = Vec::new();
                    for row in running {
                        if !lease_available(
                            row.locked_by.as_deref(),
                            row.locked_at.as_deref(),
                            row.lease_seconds,
                            now,
                        )? {
                            continue;
                        }
                        let holder = match (&row.locked_by, &row.locked_at) {
                            (Some(holder), Some(_)) => holder.clone(),
                            // Running without a lease should not happen;
                            // reclaim it all the same.
                            _ => String::new(),
                        };

                        let attempts = row.attempts + 1;
                        let status = if attempts >= row.max_attempts {
                            JobStatus::Dead
                        } else {
                            JobStatus::Failed
                        };
                        let next = format_ts(backoff.next_attempt_at(attempts, now));

                        let won = match (&row.locked_by, &row.locked_at) {
                            (Some(h), Some(at)) => diesel::update(
                                sync_jobs::table
                                    .filter(sync_jobs::job_id.eq(&row.job_id))
                                    .filter(sync_jobs::status.eq(JobStatus::Running.as_str()))
                                    .filter(sync_jobs::locked_by.eq(h))
                                    .filter(sync_jobs::locked_at.eq(at)),
                            )
                            .set((
                                sync_jobs::status.eq(status.as_str()),
                                sync_jobs::attempts.eq(attempts),
                                sync_jobs::not_before.eq(&next),
                                sync_jobs::last_error.eq("lease expired: worker presumed dead"),
                                sync_jobs::locked_by.eq(None::<String>),
                                sync_jobs::locked_at.eq(None::<String>),
                                sync_jobs::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                            _ => diesel::update(
                                sync_jobs::table
                                    .filter(sync_jobs::job_id.eq(&row.job_id))
                                    .filter(sync_jobs::status.eq(JobStatus::Running.as_str()))
                                    .filter(sync_jobs::locked_by.is_null()),
                            )
                            .set((
                                sync_jobs::status.eq(status.as_str()),
                                sync_jobs::attempts.eq(attempts),
                                sync_jobs::not_before.eq(&next),
                                sync_jobs::last_error.eq("lease expired: worker presumed dead"),
                                sync_jobs::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                        };

                        if won == 1 {
                            reaped.push(ReapedJob {
                                job_id: super::parse_uuid(&row.job_id)?,
                                repo_id: row.repo_id,
                                job_type: row.job_type,
                                previous_holder: holder,
                                status,
                            });
                        }
                    }
                    Ok(reaped)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?
            .map_err(StoreError::from)?;

        Ok(reaped)
    }

    /// Fetches one job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<SyncJob>, JobQueueError> {
        let conn = self.dal.database.get_connection().await?;
        let row = conn
            .interact(move |conn| -> Result<Option<SyncJobRow>, TxError> {
                Ok(load_row(conn, id)?)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?
            .map_err(StoreError::from)?;

        row.map(|r| {
            r.into_domain()
                .map_err(StoreError::from)
                .map_err(JobQueueError::from)
        })
        .transpose()
    }

    /// Shared lease-checked terminal transition for a running job.
    async fn finish<F>(&self, id: Uuid, worker_id: &str, make: F) -> Result<JobStatus, JobQueueError>
    where
        F: FnOnce(&SyncJobRow, &str) -> FinishUpdate + Send + 'static,
    {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();

        let op = conn
            .interact(move |conn| {
                conn.immediate_transaction::<LeaseOp<JobStatus>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let row = match load_row(conn, id)? {
                        Some(row) => row,
                        None => return Ok(LeaseOp::NotFound),
                    };
                    if !holds_lease(&row, &worker, now)? {
                        return Ok(LeaseOp::LeaseLost);
                    }

                    let update = make(&row, &now_s);
                    let updated = diesel::update(
                        sync_jobs::table
                            .filter(sync_jobs::job_id.eq(&row.job_id))
                            .filter(sync_jobs::status.eq(JobStatus::Running.as_str()))
                            .filter(sync_jobs::locked_by.eq(&worker)),
                    )
                    .set((
                        sync_jobs::status.eq(update.status.as_str()),
                        sync_jobs::attempts.eq(update.attempts),
                        sync_jobs::locked_by.eq(None::<String>),
                        sync_jobs::locked_at.eq(None::<String>),
                        sync_jobs::updated_at.eq(&update.now_s),
                    ))
                    .execute(conn)?;

                    if updated == 0 {
                        return Ok(LeaseOp::LeaseLost);
                    }

                    // Optional columns go in follow-up sets so the main
                    // update keeps one statically-typed changeset.
                    if let Some(not_before) = &update.not_before {
                        diesel::update(sync_jobs::table.filter(sync_jobs::job_id.eq(&row.job_id)))
                            .set(sync_jobs::not_before.eq(not_before))
                            .execute(conn)?;
                    }
                    if let Some(error) = &update.last_error {
                        diesel::update(sync_jobs::table.filter(sync_jobs::job_id.eq(&row.job_id)))
                            .set(sync_jobs::last_error.eq(error))
                            .execute(conn)?;
                    }
                    if let Some(run_id) = &update.last_run_id {
                        diesel::update(sync_jobs::table.filter(sync_jobs::job_id.eq(&row.job_id)))
                            .set(sync_jobs::last_run_id.eq(run_id))
                            .execute(conn)?;
                    }
                    Ok(LeaseOp::Done(update.status))
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(JobQueueError::from)?
            .map_err(StoreError::from)?;

        self.resolve(op, id, worker_id)
    }

    fn resolve<T>(&self, op: LeaseOp<T>, id: Uuid, worker_id: &str) -> Result<T, JobQueueError> {
        match op {
            LeaseOp::Done(v) => Ok(v),
            LeaseOp::NotFound => Err(JobQueueError::NotFound { id }),
            LeaseOp::LeaseLost => {
                warn!(job_id = %id, holder = %worker_id, "job mutation refused: lease lost");
                Err(JobQueueError::LeaseLost {
                    id,
                    holder: worker_id.to_string(),
                })
            }
        }
    }
}

/// Terminal-transition parameters produced per finish flavor.
struct FinishUpdate {
    status: JobStatus,
    attempts: i32,
    not_before: Option<String>,
    last_error: Option<String>,
    last_run_id: Option<Vec<u8>>,
    now_s: String,
}

fn load_row(
    conn: &mut diesel::SqliteConnection,
    id: Uuid,
) -> Result<Option<SyncJobRow>, diesel::result::Error> {
    sync_jobs::table
        .find(uuid_bytes(id))
        .select(SyncJobRow::as_select())
        .first(conn)
        .optional()
}

/// Whether `worker` still holds a live lease on a running job.
fn holds_lease(row: &SyncJobRow, worker: &str, now: DateTime<Utc>) -> Result<bool, TxError> {
    if row.status != JobStatus::Running.as_str() {
        return Ok(false);
    }
    if row.locked_by.as_deref() != Some(worker) {
        return Ok(false);
    }
    Ok(!lease_available(
        row.locked_by.as_deref(),
        row.locked_at.as_deref(),
        row.lease_seconds,
        now,
    )?)
}
