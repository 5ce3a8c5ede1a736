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

//! Write delivery: external-service contracts and the write pipeline.
//!
//! The pipeline is the single entry point for writes to the memory
//! service. Every request leaves exactly one audit entry; direct delivery
//! failures redirect the write into the outbox instead of failing the
//! caller, so the caller observes "accepted" while durability is settled
//! asynchronously.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dal::DAL;
use crate::error::{EngineError, UpstreamError};
use crate::models::outbox::{NewOutboxEntry, OutboxStatus};
use crate::models::sync_job::JobMode;
use crate::models::write_audit::{NewWriteAuditEntry, WriteAction, WriteStatus};

/// SHA-256 hex digest of a payload, as stored in `payload_hash` columns.
pub fn content_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The downstream memory service writes are delivered to.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Durably stores `payload` under `namespace`.
    async fn write(&self, namespace: &str, payload: &str) -> Result<(), UpstreamError>;
}

/// One page of items pulled from an external source.
#[derive(Debug, Clone, Default)]
pub struct SyncPage {
    /// Items fetched from the source in this page.
    pub fetched: i32,
    /// Items applied downstream in this page.
    pub written: i32,
    /// Cursor the next fetch (this run or the next incremental run) should
    /// start from.
    pub next_cursor: Option<String>,
    /// Whether the source has more pages beyond this one.
    pub has_more: bool,
}

/// A source-control (or similar upstream) API the sync workers pull from.
#[async_trait]
pub trait SourceControlClient: Send + Sync {
    /// Rate-limit bucket key for this client's endpoint.
    fn instance_key(&self) -> &str;

    /// Fetches and applies one page of `job_type` data for `repo_id`,
    /// starting at `cursor`.
    async fn sync_page(
        &self,
        repo_id: &str,
        job_type: &str,
        mode: JobMode,
        cursor: Option<&str>,
    ) -> Result<SyncPage, UpstreamError>;
}

/// Policy decision made at the front door, before delivery is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Reject { reason: String },
}

/// One write request entering the pipeline.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Correlation id generated once per external request.
    pub correlation_id: Uuid,
    /// Who issued the write.
    pub actor: String,
    /// Namespace the write targets.
    pub target_namespace: String,
    /// The payload to store.
    pub payload: String,
    /// References to supporting evidence (JSON).
    pub evidence: Option<serde_json::Value>,
}

/// What the caller observes for a submitted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write is durable in the memory service.
    Allowed {
        /// True when an identical payload was already durable and no new
        /// delivery was performed.
        deduplicated: bool,
    },
    /// Direct delivery failed transiently, or an identical payload is
    /// already in flight; the write is queued in the outbox and will be
    /// resolved asynchronously.
    Redirected { outbox_id: Uuid },
    /// Refused by policy or permanently by the upstream; will never be
    /// delivered.
    Rejected { reason: String },
}

/// The write pipeline: policy gate, direct delivery, outbox redirect.
#[derive(Clone)]
pub struct WritePipeline {
    dal: DAL,
    memory: Arc<dyn MemoryService>,
}

impl WritePipeline {
    pub fn new(dal: DAL, memory: Arc<dyn MemoryService>) -> Self {
        Self { dal, memory }
    }

    /// Submits one write. Exactly one audit entry is recorded per call;
    /// the entry is terminal unless the write was redirected to the outbox.
    pub async fn submit(
        &self,
        request: WriteRequest,
        policy: PolicyAction,
    ) -> Result<WriteOutcome, EngineError> {
        let hash = content_hash(&request.payload);

        if let PolicyAction::Reject { reason } = policy {
            self.audit(&request, &hash, WriteAction::Reject, WriteStatus::Failed, Some(&reason))
                .await?;
            info!(correlation_id = %request.correlation_id, reason = %reason, "write rejected by policy");
            return Ok(WriteOutcome::Rejected { reason });
        }

        // An identical payload already durable means the caller's intent is
        // satisfied without another delivery. One already queued skips the
        // direct attempt and goes straight to the outbox.
        if let Some(hit) = self
            .dal
            .outbox()
            .check_dedup(&request.target_namespace, &hash)
            .await?
        {
            return match hit.status {
                OutboxStatus::Sent => {
                    self.audit(
                        &request,
                        &hash,
                        WriteAction::Allow,
                        WriteStatus::Success,
                        Some("duplicate of an already-delivered payload"),
                    )
                    .await?;
                    debug!(correlation_id = %request.correlation_id, "write deduplicated against sent entry");
                    Ok(WriteOutcome::Allowed { deduplicated: true })
                }
                _ => {
                    // The request still gets its own outbox entry so its
                    // audit resolves independently of the sibling's; the
                    // sent dedup index lets only one copy be delivered.
                    let outbox_id = self
                        .dal
                        .outbox()
                        .enqueue(NewOutboxEntry {
                            target_namespace: request.target_namespace.clone(),
                            payload: request.payload.clone(),
                            payload_hash: hash.clone(),
                            correlation_id: Some(request.correlation_id),
                            next_attempt_at: None,
                        })
                        .await?;
                    self.audit(
                        &request,
                        &hash,
                        WriteAction::Redirect,
                        WriteStatus::Pending,
                        Some("duplicate of an already-queued payload"),
                    )
                    .await?;
                    debug!(
                        correlation_id = %request.correlation_id,
                        outbox_id = %outbox_id,
                        sibling_id = %hit.id,
                        "write queued behind in-flight sibling entry"
                    );
                    Ok(WriteOutcome::Redirected { outbox_id })
                }
            };
        }

        match self
            .memory
            .write(&request.target_namespace, &request.payload)
            .await
        {
            Ok(()) => {
                self.audit(&request, &hash, WriteAction::Allow, WriteStatus::Success, None)
                    .await?;
                debug!(correlation_id = %request.correlation_id, "write delivered directly");
                Ok(WriteOutcome::Allowed { deduplicated: false })
            }
            Err(UpstreamError::Permanent(reason)) => {
                self.audit(&request, &hash, WriteAction::Allow, WriteStatus::Failed, Some(&reason))
                    .await?;
                warn!(correlation_id = %request.correlation_id, reason = %reason, "write permanently rejected by upstream");
                Ok(WriteOutcome::Rejected { reason })
            }
            Err(UpstreamError::Transient(reason)) => {
                let outbox_id = self
                    .dal
                    .outbox()
                    .enqueue(NewOutboxEntry {
                        target_namespace: request.target_namespace.clone(),
                        payload: request.payload.clone(),
                        payload_hash: hash.clone(),
                        correlation_id: Some(request.correlation_id),
                        next_attempt_at: None,
                    })
                    .await?;
                self.audit(&request, &hash, WriteAction::Redirect, WriteStatus::Pending, Some(&reason))
                    .await?;
                info!(
                    correlation_id = %request.correlation_id,
                    outbox_id = %outbox_id,
                    reason = %reason,
                    "write redirected to outbox"
                );
                Ok(WriteOutcome::Redirected { outbox_id })
            }
        }
    }

    async fn audit(
        &self,
        request: &WriteRequest,
        hash: &str,
        action: WriteAction,
        status: WriteStatus,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        self.dal
            .write_audit()
            .insert(NewWriteAuditEntry {
                correlation_id: request.correlation_id,
                actor: request.actor.clone(),
                target_namespace: request.target_namespace.clone(),
                action,
                status,
                payload_hash: hash.to_string(),
                evidence: request.evidence.clone(),
                reason: reason.map(str::to_string),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn identical_payloads_hash_identically() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
