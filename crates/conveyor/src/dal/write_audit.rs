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

//! Write-audit state machine.
//!
//! One entry per correlation id. Entries are born terminal (allow/reject)
//! or pending (redirect), and a pending entry is finalized exactly once:
//! finalize is idempotent for a repeated identical status and an error for
//! a conflicting one.

use chrono::Utc;
use diesel::prelude::*;
use tracing::debug;
use uuid::Uuid;

use super::models::{NewWriteAuditRow, WriteAuditRow};
use super::{format_ts, uuid_bytes, TxError, DAL};
use crate::database::schema::write_audit;
use crate::error::{AuditError, StoreError};
use crate::models::write_audit::{NewWriteAuditEntry, WriteAction, WriteAuditEntry, WriteStatus};

/// Internal finalize resolution, mapped to errors at the DAL boundary.
enum FinalizeOp {
    Finalized,
    AlreadyThere,
    Conflict(WriteStatus),
    NotFound,
}

/// Data access layer for write-audit operations.
#[derive(Clone)]
pub struct WriteAuditDAL<'a> {
    dal: &'a DAL,
}

impl<'a> WriteAuditDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts a new audit entry and returns its id.
    pub async fn insert(&self, entry: NewWriteAuditEntry) -> Result<Uuid, AuditError> {
        let conn = self.dal.database.get_connection().await?;
        let id = Uuid::new_v4();
        let now_s = format_ts(Utc::now());
        let evidence = entry
            .evidence
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("unencodable evidence json: {}", e)))?;
        // Terminal-at-insert entries carry their finalized_at immediately.
        let finalized_at = entry.status.is_terminal().then(|| now_s.clone());
        let row = NewWriteAuditRow {
            id: uuid_bytes(id),
            correlation_id: uuid_bytes(entry.correlation_id),
            actor: entry.actor,
            target_namespace: entry.target_namespace,
            action: entry.action.as_str().to_string(),
            status: entry.status.as_str().to_string(),
            payload_hash: entry.payload_hash,
            evidence,
            reason: entry.reason,
            created_at: now_s.clone(),
            updated_at: now_s,
            finalized_at,
        };

        conn.interact(move |conn| {
            diesel::insert_into(write_audit::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))
        .map_err(AuditError::from)?
        .map_err(StoreError::from)
        .map_err(AuditError::from)?;

        debug!(audit_id = %id, correlation_id = %entry.correlation_id, "audit entry recorded");
        Ok(id)
    }

    /// Finalizes the pending entry for `correlation_id` to a terminal status.
    ///
    /// Repeating the same terminal status is a no-op; requesting a different
    /// terminal status than the one already recorded is
    /// [`AuditError::AlreadyFinalized`].
    pub async fn finalize(
        &self,
        correlation_id: Uuid,
        status: WriteStatus,
        reason: Option<&str>,
    ) -> Result<(), AuditError> {
        debug_assert!(status.is_terminal());
        let conn = self.dal.database.get_connection().await?;
        let reason = reason.map(str::to_string);

        let op = conn
            .interact(move |conn| {
                conn.immediate_transaction::<FinalizeOp, TxError, _>(|conn| {
                    let now_s = format_ts(Utc::now());
                    let key = uuid_bytes(correlation_id);

                    let row: Option<WriteAuditRow> = write_audit::table
                        .filter(write_audit::correlation_id.eq(&key))
                        .select(WriteAuditRow::as_select())
                        .first(conn)
                        .optional()?;
                    let row = match row {
                        Some(row) => row,
                        None => return Ok(FinalizeOp::NotFound),
                    };

                    let current = WriteStatus::parse(&row.status).ok_or_else(|| {
                        TxError::Corrupt(format!("bad audit status {:?}", row.status))
                    })?;
                    if current.is_terminal() {
                        return Ok(if current == status {
                            FinalizeOp::AlreadyThere
                        } else {
                            FinalizeOp::Conflict(current)
                        });
                    }

                    let updated = diesel::update(
                        write_audit::table
                            .filter(write_audit::correlation_id.eq(&key))
                            .filter(write_audit::status.eq(WriteStatus::Pending.as_str())),
                    )
                    .set((
                        write_audit::status.eq(status.as_str()),
                        write_audit::reason.eq(&reason),
                        write_audit::finalized_at.eq(&now_s),
                        write_audit::updated_at.eq(&now_s),
                    ))
                    .execute(conn)?;

                    if updated == 1 {
                        Ok(FinalizeOp::Finalized)
                    } else {
                        // Raced with another finalizer inside this process;
                        // reread to classify.
                        let row: WriteAuditRow = write_audit::table
                            .filter(write_audit::correlation_id.eq(&key))
                            .select(WriteAuditRow::as_select())
                            .first(conn)?;
                        let current = WriteStatus::parse(&row.status).ok_or_else(|| {
                            TxError::Corrupt(format!("bad audit status {:?}", row.status))
                        })?;
                        Ok(if current == status {
                            FinalizeOp::AlreadyThere
                        } else {
                            FinalizeOp::Conflict(current)
                        })
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(AuditError::from)?
            .map_err(StoreError::from)?;

        match op {
            FinalizeOp::Finalized => {
                debug!(correlation_id = %correlation_id, status = %status, "audit entry finalized");
                Ok(())
            }
            FinalizeOp::AlreadyThere => Ok(()),
            FinalizeOp::Conflict(current) => Err(AuditError::AlreadyFinalized {
                correlation_id,
                current,
                requested: status,
            }),
            FinalizeOp::NotFound => Err(AuditError::UnknownCorrelation(correlation_id)),
        }
    }

    /// Fetches the entry for a correlation id, if any.
    pub async fn get_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<WriteAuditEntry>, AuditError> {
        let conn = self.dal.database.get_connection().await?;
        let row = conn
            .interact(move |conn| -> Result<Option<WriteAuditRow>, TxError> {
                let row = write_audit::table
                    .filter(write_audit::correlation_id.eq(uuid_bytes(correlation_id)))
                    .select(WriteAuditRow::as_select())
                    .first(conn)
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(AuditError::from)?
            .map_err(StoreError::from)?;

        row.map(|r| r.into_domain().map_err(StoreError::from).map_err(AuditError::from))
            .transpose()
    }

    /// Lists pending `redirect` entries, oldest first.
    ///
    /// This is the reconciler's work set: redirects are the only action that
    /// can legally sit in `pending`, and rows predating the redirect
    /// convention carry other actions and are exempt.
    pub async fn pending_redirects(&self, limit: usize) -> Result<Vec<WriteAuditEntry>, AuditError> {
        let conn = self.dal.database.get_connection().await?;
        let rows = conn
            .interact(move |conn| -> Result<Vec<WriteAuditRow>, TxError> {
                let rows = write_audit::table
                    .filter(write_audit::status.eq(WriteStatus::Pending.as_str()))
                    .filter(write_audit::action.eq(WriteAction::Redirect.as_str()))
                    .order(write_audit::created_at.asc())
                    .limit(limit as i64)
                    .select(WriteAuditRow::as_select())
                    .load(conn)?;
                Ok(rows)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(AuditError::from)?
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|r| r.into_domain().map_err(StoreError::from).map_err(AuditError::from))
            .collect()
    }
}
