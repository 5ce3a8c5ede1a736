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

//! Rate Limit Bucket Model
//!
//! One token bucket per external endpoint. Buckets are created lazily on
//! first use with configured defaults and mutated on every consume attempt
//! (refill-then-consume).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A per-endpoint token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
    /// External endpoint this bucket throttles.
    pub instance_key: String,
    /// Tokens currently available.
    pub tokens: f64,
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Maximum accumulated capacity.
    pub burst: f64,
    /// Server-imposed backoff deadline; all consumes are denied until then.
    pub paused_until: Option<DateTime<Utc>>,
    /// Usage counters.
    pub meta: BucketMeta,
    /// Last refill time.
    pub updated_at: DateTime<Utc>,
}

/// Counters carried alongside a bucket.
///
/// Fixed known fields plus an explicit `extra` map for forward-compatible
/// unknown keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketMeta {
    /// Consume calls that were allowed.
    #[serde(default)]
    pub allowed: u64,
    /// Consume calls that were denied.
    #[serde(default)]
    pub denied: u64,
    /// Times the bucket was paused by a server backoff directive.
    #[serde(default)]
    pub pauses: u64,
    /// Unknown keys preserved across read-modify-write cycles.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Defaults applied when a bucket is created lazily on first use.
#[derive(Debug, Clone)]
pub struct BucketDefaults {
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Maximum accumulated capacity.
    pub burst: f64,
}

impl Default for BucketDefaults {
    fn default() -> Self {
        Self {
            rate: 1.0,
            burst: 10.0,
        }
    }
}

/// Outcome of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Whether the requested tokens were granted.
    pub allowed: bool,
    /// How long the caller should wait before trying again. Zero when
    /// allowed.
    pub wait: Duration,
}

impl RateDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
        }
    }

    pub fn denied(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
        }
    }
}
