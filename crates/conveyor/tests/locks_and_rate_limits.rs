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

//! Integration tests for the distributed lock table and the token-bucket
//! rate limiter.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use conveyor::models::rate_limit::BucketDefaults;
use serial_test::serial;
use std::time::Duration;

#[tokio::test]
async fn lock_is_exclusive_until_released() {
    let h = common::harness().await;
    let locks = h.dal.sync_lock();

    assert!(locks.acquire("repo-1", "issues", "worker-a", 300).await.unwrap());
    assert!(!locks.acquire("repo-1", "issues", "worker-b", 300).await.unwrap());

    // A different resource is a different lock.
    assert!(locks.acquire("repo-1", "pull_requests", "worker-b", 300).await.unwrap());
    assert!(locks.acquire("repo-2", "issues", "worker-b", 300).await.unwrap());

    assert!(locks.release("repo-1", "issues", "worker-a").await.unwrap());
    assert!(locks.acquire("repo-1", "issues", "worker-b", 300).await.unwrap());
}

#[tokio::test]
async fn lock_is_reentrant_for_its_holder() {
    let h = common::harness().await;
    let locks = h.dal.sync_lock();

    assert!(locks.acquire("repo-1", "issues", "worker-a", 300).await.unwrap());
    assert!(locks.acquire("repo-1", "issues", "worker-a", 300).await.unwrap());
}

#[tokio::test]
async fn expired_lock_is_acquirable_without_cleanup() {
    let h = common::harness().await;
    let locks = h.dal.sync_lock();

    assert!(locks.acquire("repo-1", "issues", "worker-a", 0).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(locks.acquire("repo-1", "issues", "worker-b", 300).await.unwrap());
    // The old holder's hold is gone.
    assert!(!locks.renew("repo-1", "issues", "worker-a").await.unwrap());
    assert!(!locks.release("repo-1", "issues", "worker-a").await.unwrap());
    assert!(locks.renew("repo-1", "issues", "worker-b").await.unwrap());
}

#[tokio::test]
async fn release_by_non_holder_is_refused() {
    let h = common::harness().await;
    let locks = h.dal.sync_lock();

    assert!(locks.acquire("repo-1", "issues", "worker-a", 300).await.unwrap());
    assert!(!locks.release("repo-1", "issues", "worker-b").await.unwrap());
    assert!(locks.get("repo-1", "issues").await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn bucket_allows_burst_then_denies_with_wait() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults { rate: 1.0, burst: 2.0 };

    // Fresh bucket starts full.
    assert!(limiter.consume("api.example.com", 1.0, &defaults).await.unwrap().allowed);
    assert!(limiter.consume("api.example.com", 1.0, &defaults).await.unwrap().allowed);

    let denied = limiter.consume("api.example.com", 1.0, &defaults).await.unwrap();
    assert!(!denied.allowed);
    // One token at 1/s: roughly a second away.
    assert!(denied.wait > Duration::from_millis(800));
    assert!(denied.wait <= Duration::from_secs(1));

    // Denial does not consume tokens.
    let bucket = limiter.get("api.example.com").await.unwrap().unwrap();
    assert!(bucket.tokens >= 0.0);
    assert_eq!(bucket.meta.allowed, 2);
    assert_eq!(bucket.meta.denied, 1);
}

#[tokio::test]
#[serial]
async fn bucket_refills_over_time_up_to_burst() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults { rate: 50.0, burst: 5.0 };

    assert!(limiter.consume("api.example.com", 5.0, &defaults).await.unwrap().allowed);
    assert!(!limiter.consume("api.example.com", 5.0, &defaults).await.unwrap().allowed);

    // 120ms at 50/s refills well past 5 tokens, capped at burst.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(limiter.consume("api.example.com", 5.0, &defaults).await.unwrap().allowed);

    let bucket = limiter.get("api.example.com").await.unwrap().unwrap();
    assert!(bucket.tokens <= bucket.burst);
}

#[tokio::test]
async fn buckets_are_independent_per_endpoint() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults { rate: 1.0, burst: 1.0 };

    assert!(limiter.consume("api.one.com", 1.0, &defaults).await.unwrap().allowed);
    assert!(!limiter.consume("api.one.com", 1.0, &defaults).await.unwrap().allowed);
    assert!(limiter.consume("api.two.com", 1.0, &defaults).await.unwrap().allowed);
}

#[tokio::test]
async fn paused_bucket_denies_until_the_deadline() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults::default();

    limiter
        .pause("api.example.com", Utc::now() + ChronoDuration::seconds(5), &defaults)
        .await
        .unwrap();

    let denied = limiter.consume("api.example.com", 1.0, &defaults).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.wait > Duration::from_secs(4));
    assert!(denied.wait <= Duration::from_secs(5));

    let bucket = limiter.get("api.example.com").await.unwrap().unwrap();
    assert_eq!(bucket.meta.pauses, 1);
}

#[tokio::test]
async fn pause_never_shortens_an_existing_pause() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults::default();

    let long = Utc::now() + ChronoDuration::seconds(60);
    limiter.pause("api.example.com", long, &defaults).await.unwrap();
    limiter
        .pause("api.example.com", Utc::now() + ChronoDuration::seconds(1), &defaults)
        .await
        .unwrap();

    let bucket = limiter.get("api.example.com").await.unwrap().unwrap();
    let until = bucket.paused_until.unwrap();
    assert!(until > Utc::now() + ChronoDuration::seconds(50));
}

#[tokio::test]
#[serial]
async fn expired_pause_clears_on_next_consume() {
    let h = common::harness().await;
    let limiter = h.dal.rate_limit();
    let defaults = BucketDefaults::default();

    limiter
        .pause("api.example.com", Utc::now() + ChronoDuration::milliseconds(30), &defaults)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(limiter.consume("api.example.com", 1.0, &defaults).await.unwrap().allowed);
    let bucket = limiter.get("api.example.com").await.unwrap().unwrap();
    assert!(bucket.paused_until.is_none());
}
