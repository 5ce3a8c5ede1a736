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

//! Lease reaper.
//!
//! Reclaims `running` sync jobs whose worker died mid-execution: once the
//! lease expires the job is requeued with failure semantics (the crashed
//! attempt counts against the budget) or dead-lettered at the ceiling.
//!
//! Outbox entries and resource locks need no reaping: both stay in a
//! claimable state and expiry is computed at read time, so the next
//! claimer simply takes over.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::dal::{ReapedJob, DAL};
use crate::error::EngineError;
use crate::retry::BackoffPolicy;

/// Tuning for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan for expired leases.
    pub poll_interval: Duration,
    /// Backoff schedule applied to reclaimed jobs.
    pub backoff: BackoffPolicy,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Reclaims jobs from crashed workers.
pub struct Reaper {
    dal: DAL,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(dal: DAL, config: ReaperConfig) -> Self {
        Self { dal, config }
    }

    /// Runs the scanning loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("reaper started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "reap pass failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Performs one reap pass and returns what was reclaimed.
    pub async fn run_once(&self) -> Result<Vec<ReapedJob>, EngineError> {
        let reaped = self
            .dal
            .sync_job()
            .reap_expired(&self.config.backoff)
            .await?;
        for job in &reaped {
            warn!(
                job_id = %job.job_id,
                repo_id = %job.repo_id,
                job_type = %job.job_type,
                previous_holder = %job.previous_holder,
                status = %job.status,
                "reclaimed job from expired lease"
            );
        }
        Ok(reaped)
    }
}
