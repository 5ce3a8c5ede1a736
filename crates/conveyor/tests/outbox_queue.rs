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

//! Integration tests for the outbox delivery queue: claim exclusivity,
//! retry/backoff accounting, dead-lettering, and sent-dedup.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use conveyor::dal::{AckOutcome, DAL};
use conveyor::database::Database;
use conveyor::error::OutboxError;
use conveyor::models::outbox::{NewOutboxEntry, OutboxStatus};
use std::collections::HashSet;
use uuid::Uuid;

fn entry(namespace: &str, payload: &str) -> NewOutboxEntry {
    NewOutboxEntry {
        target_namespace: namespace.to_string(),
        payload: payload.to_string(),
        payload_hash: conveyor::content_hash(payload),
        correlation_id: None,
        next_attempt_at: None,
    }
}

#[tokio::test]
async fn claim_returns_due_entries_in_order() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let first = outbox.enqueue(entry("team:x", "a")).await.unwrap();
    let second = outbox.enqueue(entry("team:x", "b")).await.unwrap();
    // Not due yet: must not be claimable.
    let future = outbox
        .enqueue(NewOutboxEntry {
            next_attempt_at: Some(Utc::now() + ChronoDuration::hours(1)),
            ..entry("team:x", "c")
        })
        .await
        .unwrap();

    let claimed = outbox.claim("worker-1", 10, 300).await.unwrap();
    let ids: Vec<Uuid> = claimed.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(!ids.contains(&future));
    for e in &claimed {
        assert_eq!(e.locked_by.as_deref(), Some("worker-1"));
        assert_eq!(e.status, OutboxStatus::Pending);
    }
}

#[tokio::test]
async fn two_workers_never_claim_the_same_entry() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    for i in 0..10 {
        outbox
            .enqueue(entry("team:x", &format!("payload-{}", i)))
            .await
            .unwrap();
    }

    let a = outbox.claim("worker-a", 6, 300).await.unwrap();
    let b = outbox.claim("worker-b", 6, 300).await.unwrap();

    let ids_a: HashSet<Uuid> = a.iter().map(|e| e.id).collect();
    let ids_b: HashSet<Uuid> = b.iter().map(|e| e.id).collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(ids_a.len() + ids_b.len(), 10);
}

#[tokio::test]
async fn racing_claims_from_two_processes_yield_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conveyor-race.db");
    let url = path.to_str().unwrap();

    // Two pools on the same file, as two worker processes would hold.
    let db_a = Database::new(url);
    db_a.run_migrations().await.unwrap();
    let db_b = Database::new(url);
    db_b.run_migrations().await.unwrap();
    let dal_a = DAL::new(db_a);
    let dal_b = DAL::new(db_b);

    dal_a
        .outbox()
        .enqueue(entry("team:x", "payload"))
        .await
        .unwrap();

    let outbox_a = dal_a.outbox();
    let outbox_b = dal_b.outbox();
    let (a, b) = tokio::join!(
        outbox_a.claim("worker-a", 1, 300),
        outbox_b.claim("worker-b", 1, 300),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.len() + b.len(), 1);

    // The loser's retry also comes up empty while the lease is live.
    assert!(dal_b.outbox().claim("worker-b", 1, 300).await.unwrap().is_empty());
}

#[tokio::test]
async fn ack_marks_sent_and_releases_lease() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    outbox.claim("worker-1", 1, 300).await.unwrap();

    let outcome = outbox.ack(id, "worker-1").await.unwrap();
    assert_eq!(outcome, AckOutcome::Sent);

    let stored = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Sent);
    assert!(stored.locked_by.is_none());

    // Sent entries are never claimable again.
    assert!(outbox.claim("worker-2", 10, 300).await.unwrap().is_empty());
}

#[tokio::test]
async fn ack_by_non_holder_is_lease_lost() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    outbox.claim("worker-1", 1, 300).await.unwrap();

    let err = outbox.ack(id, "worker-2").await.unwrap_err();
    assert!(matches!(err, OutboxError::LeaseLost { .. }));

    // The rightful holder is unaffected.
    assert_eq!(outbox.ack(id, "worker-1").await.unwrap(), AckOutcome::Sent);
}

#[tokio::test]
async fn expired_lease_is_reclaimable_and_old_holder_loses() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    // Zero-second lease expires as soon as any time passes.
    let claimed = outbox.claim("worker-1", 1, 0).await.unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let reclaimed = outbox.claim("worker-2", 1, 300).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    let err = outbox.ack(id, "worker-1").await.unwrap_err();
    assert!(matches!(err, OutboxError::LeaseLost { .. }));
    assert_eq!(outbox.ack(id, "worker-2").await.unwrap(), AckOutcome::Sent);
}

#[tokio::test]
async fn fail_consumes_budget_and_dead_letters_at_ceiling() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    let ceiling = 3;

    for attempt in 1..=ceiling {
        let claimed = outbox.claim("worker-1", 1, 300).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {} should be claimable", attempt);

        let status = outbox
            .fail(id, "worker-1", "connection refused", Utc::now(), ceiling)
            .await
            .unwrap();
        let expected = if attempt == ceiling {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Pending
        };
        assert_eq!(status, expected);
    }

    let stored = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Dead);
    assert_eq!(stored.retry_count, ceiling);
    assert_eq!(stored.last_error.as_deref(), Some("connection refused"));

    // Dead entries are never claimable.
    assert!(outbox.claim("worker-1", 10, 300).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_entry_waits_for_its_backoff_gate() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    outbox.claim("worker-1", 1, 300).await.unwrap();
    outbox
        .fail(id, "worker-1", "timeout", Utc::now() + ChronoDuration::hours(1), 5)
        .await
        .unwrap();

    assert!(outbox.claim("worker-1", 10, 300).await.unwrap().is_empty());
}

#[tokio::test]
async fn dead_letter_skips_retry_budget() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    outbox.claim("worker-1", 1, 300).await.unwrap();
    outbox
        .dead_letter(id, "worker-1", "schema rejected")
        .await
        .unwrap();

    let stored = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Dead);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn check_dedup_prefers_sent_over_pending() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();
    let hash = conveyor::content_hash("payload");

    assert!(outbox.check_dedup("team:x", &hash).await.unwrap().is_none());

    let pending = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    let hit = outbox.check_dedup("team:x", &hash).await.unwrap().unwrap();
    assert_eq!(hit.id, pending);
    assert_eq!(hit.status, OutboxStatus::Pending);

    // Same hash in another namespace is a different write.
    assert!(outbox.check_dedup("team:y", &hash).await.unwrap().is_none());

    outbox.claim("worker-1", 1, 300).await.unwrap();
    outbox.ack(pending, "worker-1").await.unwrap();
    let hit = outbox.check_dedup("team:x", &hash).await.unwrap().unwrap();
    assert_eq!(hit.status, OutboxStatus::Sent);
}

#[tokio::test]
async fn duplicate_ack_is_superseded_not_double_sent() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    // Two entries for the same (namespace, hash) can exist pending; only
    // one may ever reach sent.
    let first = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    let second = outbox.enqueue(entry("team:x", "payload")).await.unwrap();

    let claimed = outbox.claim("worker-1", 2, 300).await.unwrap();
    assert_eq!(claimed.len(), 2);

    assert_eq!(outbox.ack(first, "worker-1").await.unwrap(), AckOutcome::Sent);
    assert_eq!(
        outbox.ack(second, "worker-1").await.unwrap(),
        AckOutcome::Superseded
    );

    let second_stored = outbox.get(second).await.unwrap().unwrap();
    assert_eq!(second_stored.status, OutboxStatus::Dead);
}

#[tokio::test]
async fn renew_lease_extends_the_hold() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();

    let id = outbox.enqueue(entry("team:x", "payload")).await.unwrap();
    outbox.claim("worker-1", 1, 300).await.unwrap();
    outbox.renew_lease(id, "worker-1").await.unwrap();

    let err = outbox.renew_lease(id, "worker-2").await.unwrap_err();
    assert!(matches!(err, OutboxError::LeaseLost { .. }));
}

#[tokio::test]
async fn find_by_correlation_links_back_to_the_write() {
    let h = common::harness().await;
    let outbox = h.dal.outbox();
    let correlation_id = Uuid::new_v4();

    outbox
        .enqueue(NewOutboxEntry {
            correlation_id: Some(correlation_id),
            ..entry("team:x", "payload")
        })
        .await
        .unwrap();

    let found = outbox
        .find_by_correlation(correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.correlation_id, Some(correlation_id));
    assert!(outbox
        .find_by_correlation(Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}
