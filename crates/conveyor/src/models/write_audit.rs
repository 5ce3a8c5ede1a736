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

//! Write Audit Model
//!
//! A write-audit entry is the caller-visible record of one write request's
//! outcome. It is created at write time (pending or immediately terminal)
//! and finalized exactly once per correlation id, by either the direct
//! success path or the outbox worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The request-time decision recorded for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    /// Delivered directly (or rejected-then-allowed by policy); terminal at
    /// insert time.
    Allow,
    /// Direct delivery failed; the write was redirected to the outbox and
    /// the entry stays pending until the outbox resolves.
    Redirect,
    /// Refused by policy; terminal at insert time.
    Reject,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Allow => "allow",
            WriteAction::Redirect => "redirect",
            WriteAction::Reject => "reject",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "allow" => Some(WriteAction::Allow),
            "redirect" => Some(WriteAction::Redirect),
            "reject" => Some(WriteAction::Reject),
            _ => None,
        }
    }
}

impl std::fmt::Display for WriteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an audit entry. `Pending` transitions to exactly one
/// of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Awaiting resolution by the outbox worker or reconciler.
    Pending,
    /// The write is durable in the memory service.
    Success,
    /// The write will never be delivered.
    Failed,
    /// The payload became durable through a sibling outbox entry; this
    /// request's own entry was superseded.
    Redirected,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStatus::Pending => "pending",
            WriteStatus::Success => "success",
            WriteStatus::Failed => "failed",
            WriteStatus::Redirected => "redirected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(WriteStatus::Pending),
            "success" => Some(WriteStatus::Success),
            "failed" => Some(WriteStatus::Failed),
            "redirected" => Some(WriteStatus::Redirected),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WriteStatus::Pending)
    }
}

impl std::fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller-visible record of one write request's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAuditEntry {
    /// Unique identifier for the audit entry.
    pub id: Uuid,
    /// Correlation id generated once per external request; links to at most
    /// one outbox entry.
    pub correlation_id: Uuid,
    /// Who issued the write.
    pub actor: String,
    /// Namespace the write targeted.
    pub target_namespace: String,
    /// The request-time decision.
    pub action: WriteAction,
    /// Current lifecycle state.
    pub status: WriteStatus,
    /// SHA-256 hex digest of the payload.
    pub payload_hash: String,
    /// References to supporting evidence (JSON).
    pub evidence: Option<serde_json::Value>,
    /// Resolution detail recorded at finalize time.
    pub reason: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the entry reached a terminal state.
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Parameters for inserting a new audit entry.
#[derive(Debug, Clone)]
pub struct NewWriteAuditEntry {
    /// Correlation id from the protocol front door.
    pub correlation_id: Uuid,
    /// Who issued the write.
    pub actor: String,
    /// Namespace the write targeted.
    pub target_namespace: String,
    /// The request-time decision.
    pub action: WriteAction,
    /// Initial status: terminal for allow/reject, pending for redirect.
    pub status: WriteStatus,
    /// SHA-256 hex digest of the payload.
    pub payload_hash: String,
    /// References to supporting evidence (JSON).
    pub evidence: Option<serde_json::Value>,
    /// Insert-time detail, e.g. the direct-delivery error that caused a
    /// redirect.
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_roundtrip() {
        for action in [WriteAction::Allow, WriteAction::Redirect, WriteAction::Reject] {
            assert_eq!(WriteAction::parse(action.as_str()), Some(action));
        }
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!WriteStatus::Pending.is_terminal());
        assert!(WriteStatus::Success.is_terminal());
        assert!(WriteStatus::Failed.is_terminal());
        assert!(WriteStatus::Redirected.is_terminal());
    }
}
