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

//! Distributed lock table.
//!
//! A named mutex over (repo_id, job_type). Acquire, renew, and release all
//! return `bool`: contention is a normal outcome, not an error. Expiry is
//! computed at read time from `locked_at + lease_seconds`, so a crashed
//! holder's lock becomes acquirable without any cleanup pass.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::debug;

use super::models::SyncLockRow;
use super::{format_ts, parse_ts, TxError, DAL};
use crate::database::schema::sync_locks;
use crate::error::StoreError;
use crate::models::sync_lock::SyncLock;

/// Data access layer for the distributed lock table.
#[derive(Clone)]
pub struct SyncLockDAL<'a> {
    dal: &'a DAL,
}

impl<'a> SyncLockDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Attempts to take the lock for `holder`. Returns `true` on success.
    ///
    /// Succeeds when no row exists, the existing hold has expired, or
    /// `holder` already owns it (re-entrant: the hold is refreshed).
    pub async fn acquire(
        &self,
        repo_id: &str,
        job_type: &str,
        holder: &str,
        lease_seconds: i32,
    ) -> Result<bool, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let repo = repo_id.to_string();
        let jt = job_type.to_string();
        let owner = holder.to_string();

        let acquired = conn
            .interact(move |conn| {
                conn.immediate_transaction::<bool, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let existing: Option<SyncLockRow> = sync_locks::table
                        .find((&repo, &jt))
                        .select(SyncLockRow::as_select())
                        .first(conn)
                        .optional()?;

                    match existing {
                        None => {
                            let row = SyncLockRow {
                                repo_id: repo.clone(),
                                job_type: jt.clone(),
                                locked_by: owner.clone(),
                                locked_at: now_s,
                                lease_seconds,
                            };
                            diesel::insert_into(sync_locks::table)
                                .values(&row)
                                .execute(conn)?;
                            Ok(true)
                        }
                        Some(row) => {
                            let expired = parse_ts(&row.locked_at)?
                                + chrono::Duration::seconds(row.lease_seconds as i64)
                                < now;
                            if !expired && row.locked_by != owner {
                                return Ok(false);
                            }
                            // Conditional on the observed hold: a racing
                            // acquirer that re-read a newer hold wins over us.
                            let won = diesel::update(
                                sync_locks::table
                                    .find((&repo, &jt))
                                    .filter(sync_locks::locked_by.eq(&row.locked_by))
                                    .filter(sync_locks::locked_at.eq(&row.locked_at)),
                            )
                            .set((
                                sync_locks::locked_by.eq(&owner),
                                sync_locks::locked_at.eq(&now_s),
                                sync_locks::lease_seconds.eq(lease_seconds),
                            ))
                            .execute(conn)?;
                            Ok(won == 1)
                        }
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        if acquired {
            debug!(repo_id = %repo_id, job_type = %job_type, holder = %holder, "lock acquired");
        }
        Ok(acquired)
    }

    /// Refreshes the hold. Returns `false` if `holder` no longer owns the
    /// lock (expired and taken by someone else).
    pub async fn renew(
        &self,
        repo_id: &str,
        job_type: &str,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let repo = repo_id.to_string();
        let jt = job_type.to_string();
        let holder = holder.to_string();

        let renewed = conn
            .interact(move |conn| {
                conn.immediate_transaction::<bool, TxError, _>(|conn| {
                    let now = Utc::now();

                    let existing: Option<SyncLockRow> = sync_locks::table
                        .find((&repo, &jt))
                        .select(SyncLockRow::as_select())
                        .first(conn)
                        .optional()?;
                    let row = match existing {
                        Some(row) if row.locked_by == holder => row,
                        _ => return Ok(false),
                    };
                    // An expired hold is no longer ours to renew.
                    let expired = parse_ts(&row.locked_at)?
                        + chrono::Duration::seconds(row.lease_seconds as i64)
                        < now;
                    if expired {
                        return Ok(false);
                    }

                    let n = diesel::update(
                        sync_locks::table
                            .find((&repo, &jt))
                            .filter(sync_locks::locked_by.eq(&holder)),
                    )
                    .set(sync_locks::locked_at.eq(format_ts(now)))
                    .execute(conn)?;
                    Ok(n == 1)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        Ok(renewed)
    }

    /// Releases the lock if `holder` owns it. Returns `false` otherwise;
    /// releasing someone else's hold is refused, not an error.
    pub async fn release(
        &self,
        repo_id: &str,
        job_type: &str,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let repo = repo_id.to_string();
        let jt = job_type.to_string();
        let holder = holder.to_string();

        let released = conn
            .interact(move |conn| {
                conn.immediate_transaction::<bool, TxError, _>(|conn| {
                    let n = diesel::delete(
                        sync_locks::table
                            .find((&repo, &jt))
                            .filter(sync_locks::locked_by.eq(&holder)),
                    )
                    .execute(conn)?;
                    Ok(n == 1)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        Ok(released)
    }

    /// Fetches the current lock row, held or expired.
    pub async fn get(&self, repo_id: &str, job_type: &str) -> Result<Option<SyncLock>, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let repo = repo_id.to_string();
        let jt = job_type.to_string();

        let row = conn
            .interact(move |conn| -> Result<Option<SyncLockRow>, TxError> {
                let row = sync_locks::table
                    .find((&repo, &jt))
                    .select(SyncLockRow::as_select())
                    .first(conn)
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        row.map(|r| r.into_domain().map_err(StoreError::from)).transpose()
    }
}
