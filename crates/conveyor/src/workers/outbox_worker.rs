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

//! Outbox delivery worker.
//!
//! Claims due entries under lease, attempts delivery to the memory
//! service, and resolves each entry: ack on success, backoff-and-retry on
//! transient failure, dead-letter on permanent rejection or retry
//! exhaustion. Each terminal resolution also finalizes the correlated
//! write-audit entry; the reconciler covers the crash window between the
//! two updates.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dal::{AckOutcome, DAL};
use crate::delivery::MemoryService;
use crate::error::{AuditError, EngineError, OutboxError, UpstreamError};
use crate::models::outbox::{OutboxEntry, OutboxStatus};
use crate::models::write_audit::WriteStatus;
use crate::retry::BackoffPolicy;

/// Tuning for the outbox worker.
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// How often to poll for due entries.
    pub poll_interval: Duration,
    /// Entries claimed per pass.
    pub batch_size: usize,
    /// Lease granted per claimed entry.
    pub lease_seconds: i32,
    /// Failed attempts after which an entry goes dead.
    pub retry_ceiling: i32,
    /// Backoff schedule for transient failures.
    pub backoff: BackoffPolicy,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            lease_seconds: 300,
            retry_ceiling: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Delivers queued writes to the memory service.
pub struct OutboxWorker {
    dal: DAL,
    memory: Arc<dyn MemoryService>,
    config: OutboxWorkerConfig,
    worker_id: String,
}

impl OutboxWorker {
    pub fn new(dal: DAL, memory: Arc<dyn MemoryService>, config: OutboxWorkerConfig) -> Self {
        Self {
            dal,
            memory,
            config,
            worker_id: format!("outbox-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs the polling loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker_id = %self.worker_id, "outbox worker started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(worker_id = %self.worker_id, error = %e, "outbox pass failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker_id = %self.worker_id, "outbox worker shutting down");
                    break;
                }
            }
        }
    }

    /// Performs one claim-deliver-resolve pass. Returns the number of
    /// entries that reached `sent`.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        let entries = self
            .dal
            .outbox()
            .claim(&self.worker_id, self.config.batch_size, self.config.lease_seconds)
            .await?;

        let mut delivered = 0;
        for entry in entries {
            match self.deliver(&entry).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                // Lease loss means another worker owns the entry now.
                // Abandon it; resolving twice is the real hazard.
                Err(EngineError::Outbox(OutboxError::LeaseLost { id, holder })) => {
                    warn!(entry_id = %id, holder = %holder, "abandoning entry after lease loss");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(delivered)
    }

    /// Delivers one claimed entry and resolves it. Returns whether the
    /// entry reached `sent`.
    async fn deliver(&self, entry: &OutboxEntry) -> Result<bool, EngineError> {
        match self
            .memory
            .write(&entry.target_namespace, &entry.payload)
            .await
        {
            Ok(()) => {
                let outcome = self.dal.outbox().ack(entry.id, &self.worker_id).await?;
                // Either way the payload is durable upstream.
                let (status, reason) = match outcome {
                    AckOutcome::Sent => (WriteStatus::Success, "delivered by outbox worker"),
                    AckOutcome::Superseded => (
                        WriteStatus::Redirected,
                        "payload delivered by a sibling outbox entry",
                    ),
                };
                self.finalize(entry, status, reason).await?;
                debug!(entry_id = %entry.id, ?outcome, "outbox entry delivered");
                Ok(outcome == AckOutcome::Sent)
            }
            Err(UpstreamError::Transient(reason)) => {
                let next = self
                    .config
                    .backoff
                    .next_attempt_at(entry.retry_count + 1, Utc::now());
                let status = self
                    .dal
                    .outbox()
                    .fail(entry.id, &self.worker_id, &reason, next, self.config.retry_ceiling)
                    .await?;
                if status == OutboxStatus::Dead {
                    self.finalize(entry, WriteStatus::Failed, &reason).await?;
                }
                Ok(false)
            }
            Err(UpstreamError::Permanent(reason)) => {
                self.dal
                    .outbox()
                    .dead_letter(entry.id, &self.worker_id, &reason)
                    .await?;
                self.finalize(entry, WriteStatus::Failed, &reason).await?;
                Ok(false)
            }
        }
    }

    /// Finalizes the correlated audit entry, if one exists.
    ///
    /// A conflicting prior finalization is a double-resolution bug
    /// somewhere; it is logged loudly but does not abort the pass, since
    /// the outbox entry itself is already resolved.
    async fn finalize(
        &self,
        entry: &OutboxEntry,
        status: WriteStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        let correlation_id = match entry.correlation_id {
            Some(id) => id,
            None => return Ok(()),
        };
        match self
            .dal
            .write_audit()
            .finalize(correlation_id, status, Some(reason))
            .await
        {
            Ok(()) => Ok(()),
            Err(AuditError::UnknownCorrelation(id)) => {
                warn!(correlation_id = %id, entry_id = %entry.id, "outbox entry has no audit record");
                Ok(())
            }
            Err(AuditError::AlreadyFinalized {
                correlation_id,
                current,
                requested,
            }) => {
                error!(
                    correlation_id = %correlation_id,
                    current = %current,
                    requested = %requested,
                    "audit finalization conflict"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
