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

//! Sync run records.
//!
//! One row per execution of a sync job. A run is created `running` at claim
//! time and finished exactly once; finished rows are immutable.

use chrono::Utc;
use diesel::prelude::*;
use tracing::debug;
use uuid::Uuid;

use super::models::{NewSyncRunRow, SyncRunRow};
use super::{format_ts, uuid_bytes, TxError, DAL};
use crate::database::schema::sync_runs;
use crate::error::StoreError;
use crate::models::sync_job::JobMode;
use crate::models::sync_run::{RunStatus, SyncRun};

/// Terminal outcome reported to [`SyncRunDAL::finish`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub cursor_after: Option<String>,
    pub items_fetched: i32,
    pub items_written: i32,
    pub error_summary: Option<String>,
}

/// Data access layer for sync-run execution records.
#[derive(Clone)]
pub struct SyncRunDAL<'a> {
    dal: &'a DAL,
}

impl<'a> SyncRunDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Starts a new `running` record for one execution of `job_id`.
    pub async fn start(
        &self,
        job_id: Uuid,
        repo_id: &str,
        job_type: &str,
        mode: JobMode,
        cursor_before: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let run_id = Uuid::new_v4();
        let row = NewSyncRunRow {
            run_id: uuid_bytes(run_id),
            job_id: uuid_bytes(job_id),
            repo_id: repo_id.to_string(),
            job_type: job_type.to_string(),
            mode: mode.as_str().to_string(),
            started_at: format_ts(Utc::now()),
            cursor_before: cursor_before.map(str::to_string),
            status: RunStatus::Running.as_str().to_string(),
        };

        conn.interact(move |conn| {
            diesel::insert_into(sync_runs::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?
        .map_err(StoreError::from)?;

        debug!(run_id = %run_id, job_id = %job_id, "sync run started");
        Ok(run_id)
    }

    /// Finishes a run exactly once.
    ///
    /// Returns `true` if this call performed the transition and `false` if
    /// the run was already finished; a finished run is never mutated again.
    pub async fn finish(&self, run_id: Uuid, outcome: RunOutcome) -> Result<bool, StoreError> {
        debug_assert!(outcome.status != RunStatus::Running);
        let conn = self.dal.database.get_connection().await?;

        let updated = conn
            .interact(move |conn| {
                conn.immediate_transaction::<usize, TxError, _>(|conn| {
                    let now_s = format_ts(Utc::now());
                    let n = diesel::update(
                        sync_runs::table
                            .filter(sync_runs::run_id.eq(uuid_bytes(run_id)))
                            .filter(sync_runs::status.eq(RunStatus::Running.as_str())),
                    )
                    .set((
                        sync_runs::status.eq(outcome.status.as_str()),
                        sync_runs::finished_at.eq(&now_s),
                        sync_runs::cursor_after.eq(&outcome.cursor_after),
                        sync_runs::items_fetched.eq(outcome.items_fetched),
                        sync_runs::items_written.eq(outcome.items_written),
                        sync_runs::error_summary.eq(&outcome.error_summary),
                    ))
                    .execute(conn)?;
                    Ok(n)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        Ok(updated == 1)
    }

    /// The cursor where the next incremental run for (repo_id, job_type)
    /// should start: the `cursor_after` of the most recent finished run
    /// that advanced the cursor.
    pub async fn latest_cursor(
        &self,
        repo_id: &str,
        job_type: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let repo = repo_id.to_string();
        let jt = job_type.to_string();

        let cursor = conn
            .interact(move |conn| -> Result<Option<String>, TxError> {
                let row: Option<Option<String>> = sync_runs::table
                    .filter(sync_runs::repo_id.eq(&repo))
                    .filter(sync_runs::job_type.eq(&jt))
                    .filter(sync_runs::cursor_after.is_not_null())
                    .order(sync_runs::started_at.desc())
                    .select(sync_runs::cursor_after)
                    .first(conn)
                    .optional()?;
                Ok(row.flatten())
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        Ok(cursor)
    }

    /// Fetches one run by id.
    pub async fn get(&self, run_id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let row = conn
            .interact(move |conn| -> Result<Option<SyncRunRow>, TxError> {
                let row = sync_runs::table
                    .find(uuid_bytes(run_id))
                    .select(SyncRunRow::as_select())
                    .first(conn)
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        row.map(|r| r.into_domain().map_err(StoreError::from)).transpose()
    }

    /// Lists runs for a job, most recent first.
    pub async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<SyncRun>, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let rows = conn
            .interact(move |conn| -> Result<Vec<SyncRunRow>, TxError> {
                let rows = sync_runs::table
                    .filter(sync_runs::job_id.eq(uuid_bytes(job_id)))
                    .order(sync_runs::started_at.desc())
                    .select(SyncRunRow::as_select())
                    .load(conn)?;
                Ok(rows)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|r| r.into_domain().map_err(StoreError::from))
            .collect()
    }
}
