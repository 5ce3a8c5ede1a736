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

//! Outbox delivery queue.
//!
//! Entries are claimed under lease, delivered, and acked or failed with
//! exponential backoff; retry exhaustion dead-letters the entry. The table
//! is append-only: entries are never deleted, forming a durable audit of
//! delivery attempts.
//!
//! Claims run inside an immediate write transaction and every mutation
//! carries the lease predicate, so two workers can never resolve the same
//! entry.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{NewOutboxRow, OutboxRow};
use super::{format_ts, lease_available, uuid_bytes, TxError, DAL};
use crate::database::schema::outbox_entries;
use crate::error::{OutboxError, StoreError};
use crate::models::outbox::{NewOutboxEntry, OutboxEntry, OutboxStatus};

/// Result of acking an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry is now `sent`.
    Sent,
    /// Another entry with the same (namespace, payload hash) is already
    /// `sent`; this copy was parked as `dead` since the write is durable.
    Superseded,
}

/// A dedup-check hit: an existing entry for the same (namespace, hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupHit {
    pub id: Uuid,
    pub status: OutboxStatus,
}

/// Internal result of a lease-checked mutation, resolved to errors at the
/// DAL boundary.
enum LeaseOp<T> {
    Done(T),
    NotFound,
    LeaseLost,
}

/// Data access layer for outbox delivery-queue operations.
#[derive(Clone)]
pub struct OutboxDAL<'a> {
    dal: &'a DAL,
}

impl<'a> OutboxDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts a new pending entry and returns its id.
    ///
    /// Callers should consult [`check_dedup`](Self::check_dedup) first: a
    /// `sent` hit means the payload is already durable and nothing should
    /// be queued. Multiple pending entries for the same payload may
    /// coexist; the sent dedup index lets only one of them reach `sent`.
    pub async fn enqueue(&self, entry: NewOutboxEntry) -> Result<Uuid, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = NewOutboxRow {
            id: uuid_bytes(id),
            target_namespace: entry.target_namespace,
            payload: entry.payload,
            payload_hash: entry.payload_hash,
            status: OutboxStatus::Pending.as_str().to_string(),
            retry_count: 0,
            next_attempt_at: format_ts(entry.next_attempt_at.unwrap_or(now)),
            lease_seconds: 300,
            correlation_id: entry.correlation_id.map(uuid_bytes),
            created_at: format_ts(now),
            updated_at: format_ts(now),
        };

        conn.interact(move |conn| {
            diesel::insert_into(outbox_entries::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))
        .map_err(OutboxError::from)?
        .map_err(StoreError::from)
        .map_err(OutboxError::from)?;

        debug!(entry_id = %id, "outbox entry enqueued");
        Ok(id)
    }

    /// Looks up an existing entry for the same (namespace, payload hash).
    ///
    /// A hit with status `sent` means the write is already durable and no
    /// new attempt should be made; a `pending` hit means delivery is
    /// already scheduled.
    pub async fn check_dedup(
        &self,
        target_namespace: &str,
        payload_hash: &str,
    ) -> Result<Option<DedupHit>, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let namespace = target_namespace.to_string();
        let hash = payload_hash.to_string();

        let hit = conn
            .interact(move |conn| -> Result<Option<DedupHit>, TxError> {
                // Prefer the durable copy over an in-flight one.
                for status in [OutboxStatus::Sent, OutboxStatus::Pending] {
                    let row: Option<OutboxRow> = outbox_entries::table
                        .filter(outbox_entries::target_namespace.eq(&namespace))
                        .filter(outbox_entries::payload_hash.eq(&hash))
                        .filter(outbox_entries::status.eq(status.as_str()))
                        .order(outbox_entries::created_at.asc())
                        .select(OutboxRow::as_select())
                        .first(conn)
                        .optional()?;
                    if let Some(row) = row {
                        return Ok(Some(DedupHit {
                            id: super::parse_uuid(&row.id)?,
                            status,
                        }));
                    }
                }
                Ok(None)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        Ok(hit)
    }

    /// Atomically claims up to `limit` due entries for `worker_id`.
    ///
    /// Eligible entries are `pending`, due (`next_attempt_at <= now`), and
    /// unleased or lease-expired, ordered by (next_attempt_at, created_at).
    /// Returns the empty vector on contention; that is not an error.
    pub async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        lease_seconds: i32,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();

        let rows = conn
            .interact(move |conn| {
                conn.immediate_transaction::<Vec<OutboxRow>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    // Overselect: some candidates may still hold live
                    // leases and get skipped below.
                    let candidates: Vec<OutboxRow> = outbox_entries::table
                        .filter(outbox_entries::status.eq(OutboxStatus::Pending.as_str()))
                        .filter(outbox_entries::next_attempt_at.le(&now_s))
                        .order((
                            outbox_entries::next_attempt_at.asc(),
                            outbox_entries::created_at.asc(),
                        ))
                        .limit((limit * 8 + 16) as i64)
                        .select(OutboxRow::as_select())
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

                        // Conditional update on the observed lease state:
                        // only the claimant that saw the row unowned wins.
                        let won = match (&row.locked_by, &row.locked_at) {
                            (Some(holder), Some(at)) => diesel::update(
                                outbox_entries::table
                                    .filter(outbox_entries::id.eq(&row.id))
                                    .filter(
                                        outbox_entries::status
                                            .eq(OutboxStatus::Pending.as_str()),
                                    )
                                    .filter(outbox_entries::locked_by.eq(holder))
                                    .filter(outbox_entries::locked_at.eq(at)),
                            )
                            .set((
                                outbox_entries::locked_by.eq(&worker),
                                outbox_entries::locked_at.eq(&now_s),
                                outbox_entries::lease_seconds.eq(lease_seconds),
                                outbox_entries::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                            _ => diesel::update(
                                outbox_entries::table
                                    .filter(outbox_entries::id.eq(&row.id))
                                    .filter(
                                        outbox_entries::status
                                            .eq(OutboxStatus::Pending.as_str()),
                                    )
                                    .filter(outbox_entries::locked_by.is_null()),
                            )
                            .set((
                                outbox_entries::locked_by.eq(&worker),
                                outbox_entries::locked_at.eq(&now_s),
                                outbox_entries::lease_seconds.eq(lease_seconds),
                                outbox_entries::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?,
                        };

                        if won == 1 {
                            claimed.push(row.id);
                        }
                    }

                    let rows: Vec<OutboxRow> = outbox_entries::table
                        .filter(outbox_entries::id.eq_any(&claimed))
                        .order((
                            outbox_entries::next_attempt_at.asc(),
                            outbox_entries::created_at.asc(),
                        ))
                        .select(OutboxRow::as_select())
                        .load(conn)?;
                    Ok(rows)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|r| r.into_domain().map_err(StoreError::from).map_err(OutboxError::from))
            .collect()
    }

    /// Marks an entry `sent`, releasing the lease.
    ///
    /// Only the current lease holder may ack; anyone else gets
    /// [`OutboxError::LeaseLost`]. If another entry with the same
    /// (namespace, payload hash) is already `sent`, this copy is parked as
    /// `dead` and [`AckOutcome::Superseded`] is returned — the write itself
    /// is durable either way.
    pub async fn ack(&self, id: Uuid, worker_id: &str) -> Result<AckOutcome, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();

        let op = conn
            .interact(move |conn| {
                conn.immediate_transaction::<LeaseOp<AckOutcome>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let row = match load_row(conn, id)? {
                        Some(row) => row,
                        None => return Ok(LeaseOp::NotFound),
                    };
                    if !holds_lease(&row, &worker, now)? {
                        return Ok(LeaseOp::LeaseLost);
                    }

                    let result = diesel::update(
                        outbox_entries::table
                            .filter(outbox_entries::id.eq(&row.id))
                            .filter(outbox_entries::status.eq(OutboxStatus::Pending.as_str()))
                            .filter(outbox_entries::locked_by.eq(&worker)),
                    )
                    .set((
                        outbox_entries::status.eq(OutboxStatus::Sent.as_str()),
                        outbox_entries::locked_by.eq(None::<String>),
                        outbox_entries::locked_at.eq(None::<String>),
                        outbox_entries::updated_at.eq(&now_s),
                    ))
                    .execute(conn);

                    match result {
                        Ok(1) => Ok(LeaseOp::Done(AckOutcome::Sent)),
                        Ok(_) => Ok(LeaseOp::LeaseLost),
                        Err(diesel::result::Error::DatabaseError(
                            DatabaseErrorKind::UniqueViolation,
                            _,
                        )) => {
                            // The dedup index says a sibling entry already
                            // delivered this payload. Park this copy.
                            diesel::update(
                                outbox_entries::table
                                    .filter(outbox_entries::id.eq(&row.id))
                                    .filter(outbox_entries::locked_by.eq(&worker)),
                            )
                            .set((
                                outbox_entries::status.eq(OutboxStatus::Dead.as_str()),
                                outbox_entries::last_error
                                    .eq("superseded: payload already sent by sibling entry"),
                                outbox_entries::locked_by.eq(None::<String>),
                                outbox_entries::locked_at.eq(None::<String>),
                                outbox_entries::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?;
                            Ok(LeaseOp::Done(AckOutcome::Superseded))
                        }
                        Err(e) => Err(e.into()),
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        match op {
            LeaseOp::Done(outcome) => {
                debug!(entry_id = %id, ?outcome, "outbox entry acked");
                Ok(outcome)
            }
            LeaseOp::NotFound => Err(OutboxError::NotFound { id }),
            LeaseOp::LeaseLost => {
                warn!(entry_id = %id, holder = %worker_id, "ack refused: lease lost");
                Err(OutboxError::LeaseLost {
                    id,
                    holder: worker_id.to_string(),
                })
            }
        }
    }

    /// Records a failed delivery attempt, releasing the lease.
    ///
    /// Increments the retry count and schedules the next attempt at the
    /// caller-computed backoff time; once the count reaches `retry_ceiling`
    /// the entry transitions to `dead` instead. Returns the resulting
    /// status.
    pub async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        retry_ceiling: i32,
    ) -> Result<OutboxStatus, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();
        let error = error.to_string();

        let op = conn
            .interact(move |conn| {
                conn.immediate_transaction::<LeaseOp<OutboxStatus>, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let row = match load_row(conn, id)? {
                        Some(row) => row,
                        None => return Ok(LeaseOp::NotFound),
                    };
                    if !holds_lease(&row, &worker, now)? {
                        return Ok(LeaseOp::LeaseLost);
                    }

                    let new_count = row.retry_count + 1;
                    let new_status = if new_count >= retry_ceiling {
                        OutboxStatus::Dead
                    } else {
                        OutboxStatus::Pending
                    };

                    let updated = diesel::update(
                        outbox_entries::table
                            .filter(outbox_entries::id.eq(&row.id))
                            .filter(outbox_entries::status.eq(OutboxStatus::Pending.as_str()))
                            .filter(outbox_entries::locked_by.eq(&worker)),
                    )
                    .set((
                        outbox_entries::status.eq(new_status.as_str()),
                        outbox_entries::retry_count.eq(new_count),
                        outbox_entries::next_attempt_at.eq(format_ts(next_attempt_at)),
                        outbox_entries::last_error.eq(&error),
                        outbox_entries::locked_by.eq(None::<String>),
                        outbox_entries::locked_at.eq(None::<String>),
                        outbox_entries::updated_at.eq(&now_s),
                    ))
                    .execute(conn)?;

                    if updated == 1 {
                        Ok(LeaseOp::Done(new_status))
                    } else {
                        Ok(LeaseOp::LeaseLost)
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        match op {
            LeaseOp::Done(status) => {
                if status == OutboxStatus::Dead {
                    warn!(entry_id = %id, "outbox entry dead-lettered after retry exhaustion");
                } else {
                    debug!(entry_id = %id, next_attempt_at = %next_attempt_at, "outbox entry failed, retry scheduled");
                }
                Ok(status)
            }
            LeaseOp::NotFound => Err(OutboxError::NotFound { id }),
            LeaseOp::LeaseLost => Err(OutboxError::LeaseLost {
                id,
                holder: worker_id.to_string(),
            }),
        }
    }

    /// Dead-letters an entry without consuming retry budget.
    ///
    /// Used for permanent upstream rejections, which will never succeed no
    /// matter how often they are retried.
    pub async fn dead_letter(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let worker = worker_id.to_string();
        let error = error.to_string();

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

                    let updated = diesel::update(
                        outbox_entries::table
                            .filter(outbox_entries::id.eq(&row.id))
                            .filter(outbox_entries::status.eq(OutboxStatus::Pending.as_str()))
                            .filter(outbox_entries::locked_by.eq(&worker)),
                    )
                    .set((
                        outbox_entries::status.eq(OutboxStatus::Dead.as_str()),
                        outbox_entries::last_error.eq(&error),
                        outbox_entries::locked_by.eq(None::<String>),
                        outbox_entries::locked_at.eq(None::<String>),
                        outbox_entries::updated_at.eq(format_ts(now)),
                    ))
                    .execute(conn)?;

                    if updated == 1 {
                        Ok(LeaseOp::Done(()))
                    } else {
                        Ok(LeaseOp::LeaseLost)
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        match op {
            LeaseOp::Done(()) => {
                warn!(entry_id = %id, "outbox entry dead-lettered (permanent rejection)");
                Ok(())
            }
            LeaseOp::NotFound => Err(OutboxError::NotFound { id }),
            LeaseOp::LeaseLost => Err(OutboxError::LeaseLost {
                id,
                holder: worker_id.to_string(),
            }),
        }
    }

    /// Extends the lease for a long-running delivery attempt.
    ///
    /// Fails with [`OutboxError::LeaseLost`] if the lease has already
    /// expired and been reclaimed.
    pub async fn renew_lease(&self, id: Uuid, worker_id: &str) -> Result<(), OutboxError> {
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

                    let updated = diesel::update(
                        outbox_entries::table
                            .filter(outbox_entries::id.eq(&row.id))
                            .filter(outbox_entries::locked_by.eq(&worker)),
                    )
                    .set((
                        outbox_entries::locked_at.eq(format_ts(now)),
                        outbox_entries::updated_at.eq(format_ts(now)),
                    ))
                    .execute(conn)?;

                    if updated == 1 {
                        Ok(LeaseOp::Done(()))
                    } else {
                        Ok(LeaseOp::LeaseLost)
                    }
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        match op {
            LeaseOp::Done(()) => Ok(()),
            LeaseOp::NotFound => Err(OutboxError::NotFound { id }),
            LeaseOp::LeaseLost => Err(OutboxError::LeaseLost {
                id,
                holder: worker_id.to_string(),
            }),
        }
    }

    /// Fetches one entry by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let row = conn
            .interact(move |conn| -> Result<Option<OutboxRow>, TxError> {
                Ok(load_row(conn, id)?)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        row.map(|r| r.into_domain().map_err(StoreError::from).map_err(OutboxError::from))
            .transpose()
    }

    /// Fetches the entry correlated with a write request, if any.
    pub async fn find_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<OutboxEntry>, OutboxError> {
        let conn = self.dal.database.get_connection().await?;
        let row = conn
            .interact(move |conn| -> Result<Option<OutboxRow>, TxError> {
                let row: Option<OutboxRow> = outbox_entries::table
                    .filter(outbox_entries::correlation_id.eq(uuid_bytes(correlation_id)))
                    .order(outbox_entries::created_at.asc())
                    .select(OutboxRow::as_select())
                    .first(conn)
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
            .map_err(OutboxError::from)?
            .map_err(StoreError::from)?;

        row.map(|r| r.into_domain().map_err(StoreError::from).map_err(OutboxError::from))
            .transpose()
    }
}

fn load_row(
    conn: &mut diesel::SqliteConnection,
    id: Uuid,
) -> Result<Option<OutboxRow>, diesel::result::Error> {
    outbox_entries::table
        .find(uuid_bytes(id))
        .select(OutboxRow::as_select())
        .first(conn)
        .optional()
}

/// Whether `worker` still holds a live lease on `row`.
fn holds_lease(row: &OutboxRow, worker: &str, now: DateTime<Utc>) -> Result<bool, TxError> {
    if row.status != OutboxStatus::Pending.as_str() {
        return Ok(false);
    }
    if row.locked_by.as_deref() != Some(worker) {
        return Ok(false);
    }
    // Holder matches, but an expired lease is no longer a lease.
    Ok(!lease_available(
        row.locked_by.as_deref(),
        row.locked_at.as_deref(),
        row.lease_seconds,
        now,
    )?)
}
