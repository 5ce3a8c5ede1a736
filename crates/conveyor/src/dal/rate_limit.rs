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

//! Token-bucket rate limiter.
//!
//! One bucket per external endpoint, shared across processes through the
//! store. Consume is a single transactional read-refill-consume-write, so
//! concurrent consumers never over-grant. Buckets are created lazily on
//! first use with the caller's defaults.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::time::Duration;
use tracing::debug;

use super::models::RateLimitBucketRow;
use super::{format_ts, parse_ts, TxError, DAL};
use crate::database::schema::rate_limit_buckets;
use crate::error::StoreError;
use crate::models::rate_limit::{BucketDefaults, BucketMeta, RateDecision, RateLimitBucket};

/// Data access layer for token-bucket operations.
#[derive(Clone)]
pub struct RateLimitDAL<'a> {
    dal: &'a DAL,
}

impl<'a> RateLimitDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Attempts to consume `requested` tokens from the bucket for
    /// `instance_key`, creating the bucket with `defaults` on first use.
    ///
    /// Refill is computed from wall-clock elapsed time, capped at `burst`.
    /// A paused bucket denies everything until `paused_until`; an
    /// insufficient bucket denies with the time until enough tokens will
    /// have accumulated. Denials leave the token count untouched.
    pub async fn consume(
        &self,
        instance_key: &str,
        requested: f64,
        defaults: &BucketDefaults,
    ) -> Result<RateDecision, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let key = instance_key.to_string();
        let defaults = defaults.clone();

        let decision = conn
            .interact(move |conn| {
                conn.immediate_transaction::<RateDecision, TxError, _>(|conn| {
                    let now = Utc::now();
                    let now_s = format_ts(now);

                    let existing: Option<RateLimitBucketRow> = rate_limit_buckets::table
                        .find(&key)
                        .select(RateLimitBucketRow::as_select())
                        .first(conn)
                        .optional()?;

                    let (mut tokens, rate, burst, paused_until, mut meta, fresh) = match existing {
                        Some(row) => {
                            let meta: BucketMeta = serde_json::from_str(&row.meta).map_err(|e| {
                                TxError::Corrupt(format!("bad bucket meta json: {}", e))
                            })?;
                            let last = parse_ts(&row.updated_at)?;
                            let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                            let tokens = (row.tokens + elapsed * row.rate).min(row.burst);
                            let paused_until = row
                                .paused_until
                                .as_deref()
                                .map(parse_ts)
                                .transpose()?;
                            (tokens, row.rate, row.burst, paused_until, meta, false)
                        }
                        None => (
                            defaults.burst,
                            defaults.rate,
                            defaults.burst,
                            None,
                            BucketMeta::default(),
                            true,
                        ),
                    };

                    let decision = if let Some(until) = paused_until.filter(|u| *u > now) {
                        meta.denied += 1;
                        let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
                        RateDecision::denied(wait)
                    } else if tokens >= requested {
                        tokens -= requested;
                        meta.allowed += 1;
                        RateDecision::allowed()
                    } else {
                        meta.denied += 1;
                        let deficit = requested - tokens;
                        let wait = if rate > 0.0 {
                            Duration::from_secs_f64(deficit / rate)
                        } else {
                            Duration::MAX
                        };
                        RateDecision::denied(wait)
                    };

                    let meta_s = serde_json::to_string(&meta).map_err(|e| {
                        TxError::Corrupt(format!("unencodable bucket meta json: {}", e))
                    })?;
                    // An expired pause is cleared on the next touch.
                    let pause_s = paused_until.filter(|u| *u > now).map(format_ts);

                    if fresh {
                        let row = RateLimitBucketRow {
                            instance_key: key.clone(),
                            tokens,
                            rate,
                            burst,
                            paused_until: pause_s,
                            meta: meta_s,
                            updated_at: now_s,
                        };
                        diesel::insert_into(rate_limit_buckets::table)
                            .values(&row)
                            .execute(conn)?;
                    } else {
                        diesel::update(rate_limit_buckets::table.find(&key))
                            .set((
                                rate_limit_buckets::tokens.eq(tokens),
                                rate_limit_buckets::paused_until.eq(&pause_s),
                                rate_limit_buckets::meta.eq(&meta_s),
                                rate_limit_buckets::updated_at.eq(&now_s),
                            ))
                            .execute(conn)?;
                    }

                    Ok(decision)
                })
            })
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?
            .map_err(StoreError::from)?;

        Ok(decision)
    }

    /// Pauses the bucket until `until` in response to a server backoff
    /// directive (e.g. Retry-After). All consumes are denied until then.
    ///
    /// A pause earlier than an existing one never shortens it.
    pub async fn pause(
        &self,
        instance_key: &str,
        until: DateTime<Utc>,
        defaults: &BucketDefaults,
    ) -> Result<(), StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let key = instance_key.to_string();
        let defaults = defaults.clone();

        conn.interact(move |conn| {
            conn.immediate_transaction::<(), TxError, _>(|conn| {
                let now = Utc::now();
                let now_s = format_ts(now);

                let existing: Option<RateLimitBucketRow> = rate_limit_buckets::table
                    .find(&key)
                    .select(RateLimitBucketRow::as_select())
                    .first(conn)
                    .optional()?;

                match existing {
                    Some(row) => {
                        let current = row
                            .paused_until
                            .as_deref()
                            .map(parse_ts)
                            .transpose()?;
                        let effective = match current {
                            Some(cur) if cur >= until => cur,
                            _ => until,
                        };
                        let mut meta: BucketMeta = serde_json::from_str(&row.meta)
                            .map_err(|e| TxError::Corrupt(format!("bad bucket meta json: {}", e)))?;
                        meta.pauses += 1;
                        let meta_s = serde_json::to_string(&meta).map_err(|e| {
                            TxError::Corrupt(format!("unencodable bucket meta json: {}", e))
                        })?;

                        diesel::update(rate_limit_buckets::table.find(&key))
                            .set((
                                rate_limit_buckets::paused_until.eq(Some(format_ts(effective))),
                                rate_limit_buckets::meta.eq(&meta_s),
                            ))
                            .execute(conn)?;
                    }
                    None => {
                        let mut meta = BucketMeta::default();
                        meta.pauses = 1;
                        let meta_s = serde_json::to_string(&meta).map_err(|e| {
                            TxError::Corrupt(format!("unencodable bucket meta json: {}", e))
                        })?;
                        let row = RateLimitBucketRow {
                            instance_key: key.clone(),
                            tokens: defaults.burst,
                            rate: defaults.rate,
                            burst: defaults.burst,
                            paused_until: Some(format_ts(until)),
                            meta: meta_s,
                            updated_at: now_s,
                        };
                        diesel::insert_into(rate_limit_buckets::table)
                            .values(&row)
                            .execute(conn)?;
                    }
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))?
        .map_err(StoreError::from)?;

        debug!(instance_key = %instance_key, until = %until, "rate-limit bucket paused");
        Ok(())
    }

    /// Fetches the bucket for `instance_key`, if it has ever been touched.
    pub async fn get(&self, instance_key: &str) -> Result<Option<RateLimitBucket>, StoreError> {
        let conn = self.dal.database.get_connection().await?;
        let key = instance_key.to_string();

        let row = conn
            .interact(move |conn| -> Result<Option<RateLimitBucketRow>, TxError> {
                let row = rate_limit_buckets::table
                    .find(&key)
                    .select(RateLimitBucketRow::as_select())
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
