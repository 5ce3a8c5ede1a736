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

//! Audit reconciler.
//!
//! A redirected write leaves a pending audit entry that the outbox worker
//! finalizes when the entry resolves. If the worker crashes between
//! resolving the outbox row and finalizing the audit row, the two
//! disagree. The reconciler closes that window: it scans pending redirect
//! audits and converges each one to its outbox entry's true state.
//!
//! Entries it cannot repair are reported, never guessed at: a pending
//! audit whose outbox entry is still in flight past the stall threshold
//! is stalled; one with no outbox entry at all is orphaned.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dal::DAL;
use crate::error::{AuditError, EngineError};
use crate::models::outbox::OutboxStatus;
use crate::models::write_audit::WriteStatus;

/// Tuning for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to scan.
    pub poll_interval: Duration,
    /// Pending audits examined per pass.
    pub batch_size: usize,
    /// Age past which an unresolved redirect is reported as stalled.
    pub stall_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            stall_after: Duration::from_secs(3600),
        }
    }
}

/// What one reconciliation pass did and found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerReport {
    /// Audits finalized as durable: the entry was sent, or the payload was
    /// sent by a sibling entry.
    pub finalized_success: usize,
    /// Audits finalized to `failed` (outbox entry dead).
    pub finalized_failed: usize,
    /// Correlation ids still legitimately in flight.
    pub in_flight: usize,
    /// Correlation ids pending past the stall threshold.
    pub stalled: Vec<Uuid>,
    /// Correlation ids with no outbox entry at all.
    pub orphaned: Vec<Uuid>,
}

/// Converges pending redirect audits to their outbox entries' state.
pub struct Reconciler {
    dal: DAL,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(dal: DAL, config: ReconcilerConfig) -> Self {
        Self { dal, config }
    }

    /// Runs the scanning loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("reconciler started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            if !report.stalled.is_empty() || !report.orphaned.is_empty() {
                                warn!(
                                    stalled = report.stalled.len(),
                                    orphaned = report.orphaned.len(),
                                    "reconciliation found unresolved audits"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Performs one reconciliation pass.
    pub async fn run_once(&self) -> Result<ReconcilerReport, EngineError> {
        let pending = self
            .dal
            .write_audit()
            .pending_redirects(self.config.batch_size)
            .await?;

        let now = Utc::now();
        let stall_cutoff = now
            - chrono::Duration::from_std(self.config.stall_after)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut report = ReconcilerReport::default();
        for audit in pending {
            let entry = self
                .dal
                .outbox()
                .find_by_correlation(audit.correlation_id)
                .await?;

            match entry {
                Some(entry) => match entry.status {
                    OutboxStatus::Sent => {
                        self.finalize(audit.correlation_id, WriteStatus::Success, "reconciled: outbox entry sent")
                            .await?;
                        report.finalized_success += 1;
                    }
                    OutboxStatus::Dead => {
                        // A dead copy superseded by a sibling still
                        // represents a durable write.
                        let sibling_sent = self
                            .dal
                            .outbox()
                            .check_dedup(&entry.target_namespace, &entry.payload_hash)
                            .await?
                            .map_or(false, |hit| hit.status == OutboxStatus::Sent);
                        if sibling_sent {
                            self.finalize(
                                audit.correlation_id,
                                WriteStatus::Redirected,
                                "reconciled: payload sent by sibling entry",
                            )
                            .await?;
                            report.finalized_success += 1;
                        } else {
                            let reason = entry
                                .last_error
                                .as_deref()
                                .unwrap_or("reconciled: outbox entry dead");
                            self.finalize(audit.correlation_id, WriteStatus::Failed, reason)
                                .await?;
                            report.finalized_failed += 1;
                        }
                    }
                    OutboxStatus::Pending => {
                        if audit.created_at < stall_cutoff {
                            warn!(
                                correlation_id = %audit.correlation_id,
                                entry_id = %entry.id,
                                age_seconds = (now - audit.created_at).num_seconds(),
                                "redirected write stalled in outbox"
                            );
                            report.stalled.push(audit.correlation_id);
                        } else {
                            report.in_flight += 1;
                        }
                    }
                },
                None => {
                    warn!(
                        correlation_id = %audit.correlation_id,
                        "pending redirect audit has no outbox entry"
                    );
                    report.orphaned.push(audit.correlation_id);
                }
            }
        }

        debug!(
            finalized_success = report.finalized_success,
            finalized_failed = report.finalized_failed,
            in_flight = report.in_flight,
            "reconciliation pass done"
        );
        Ok(report)
    }

    async fn finalize(
        &self,
        correlation_id: Uuid,
        status: WriteStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        match self
            .dal
            .write_audit()
            .finalize(correlation_id, status, Some(reason))
            .await
        {
            // Finalize is idempotent for a repeated identical status, so a
            // race with the outbox worker lands here as Ok.
            Ok(()) => Ok(()),
            Err(AuditError::AlreadyFinalized {
                correlation_id,
                current,
                requested,
            }) => {
                error!(
                    correlation_id = %correlation_id,
                    current = %current,
                    requested = %requested,
                    "audit finalization conflict during reconciliation"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
