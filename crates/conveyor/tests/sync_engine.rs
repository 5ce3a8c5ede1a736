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

//! End-to-end tests for the sync worker: lock handling, run records,
//! cursor resumption, and failure routing.

mod common;

use async_trait::async_trait;
use conveyor::delivery::{SourceControlClient, SyncPage};
use conveyor::error::UpstreamError;
use conveyor::models::rate_limit::BucketDefaults;
use conveyor::models::sync_job::{JobMode, JobStatus, NewSyncJob};
use conveyor::models::sync_run::RunStatus;
use conveyor::workers::{SyncWorker, SyncWorkerConfig};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Source double: pops scripted pages and records the cursors it was asked
/// to start from.
struct ScriptedSource {
    pages: Mutex<VecDeque<Result<SyncPage, UpstreamError>>>,
    cursors: Mutex<Vec<Option<String>>>,
}

impl ScriptedSource {
    fn new(pages: Vec<Result<SyncPage, UpstreamError>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            cursors: Mutex::new(Vec::new()),
        })
    }

    fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceControlClient for ScriptedSource {
    fn instance_key(&self) -> &str {
        "api.example.com"
    }

    async fn sync_page(
        &self,
        _repo_id: &str,
        _job_type: &str,
        _mode: JobMode,
        cursor: Option<&str>,
    ) -> Result<SyncPage, UpstreamError> {
        self.cursors
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SyncPage::default()))
    }
}

fn page(fetched: i32, cursor: &str, has_more: bool) -> Result<SyncPage, UpstreamError> {
    Ok(SyncPage {
        fetched,
        written: fetched,
        next_cursor: Some(cursor.to_string()),
        has_more,
    })
}

fn job(repo_id: &str, mode: JobMode) -> NewSyncJob {
    NewSyncJob {
        repo_id: repo_id.to_string(),
        job_type: "issues".to_string(),
        mode,
        priority: 100,
        payload: json!({}),
        max_attempts: 5,
        lease_seconds: 300,
        not_before: None,
    }
}

fn config() -> SyncWorkerConfig {
    SyncWorkerConfig {
        // Generous bucket so throttling never engages in tests.
        rate_defaults: BucketDefaults {
            rate: 10_000.0,
            burst: 10_000.0,
        },
        ..SyncWorkerConfig::default()
    }
}

#[tokio::test]
async fn worker_completes_a_job_and_records_the_run() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![page(10, "c1", true), page(5, "c2", false)]);

    let job_id = h
        .dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();

    let worker = SyncWorker::new(h.dal.clone(), source.clone(), config());
    assert_eq!(worker.run_once().await.unwrap(), 1);

    let stored = h.dal.sync_job().get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.locked_by.is_none());

    let run_id = stored.last_run_id.expect("completed job should link its run");
    let run = h.dal.sync_run().get(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_fetched, 15);
    assert_eq!(run.items_written, 15);
    assert_eq!(run.cursor_before, None);
    assert_eq!(run.cursor_after.as_deref(), Some("c2"));
    assert!(run.finished_at.is_some());

    // First page from the start, second from the first page's cursor.
    assert_eq!(
        source.cursors(),
        vec![None, Some("c1".to_string())]
    );

    // The resource lock was released.
    assert!(h
        .dal
        .sync_lock()
        .acquire("repo-1", "issues", "someone-else", 300)
        .await
        .unwrap());
}

#[tokio::test]
async fn incremental_runs_resume_from_the_last_cursor() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![page(3, "c9", false), page(2, "c12", false)]);
    let worker = SyncWorker::new(h.dal.clone(), source.clone(), config());

    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    // The scope is free after completion; the next incremental job starts
    // where the last run left off.
    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(
        source.cursors(),
        vec![None, Some("c9".to_string())]
    );

    let cursor = h
        .dal
        .sync_run()
        .latest_cursor("repo-1", "issues")
        .await
        .unwrap();
    assert_eq!(cursor.as_deref(), Some("c12"));
}

#[tokio::test]
async fn backfill_ignores_the_stored_cursor() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![page(3, "c9", false), page(100, "c1", false)]);
    let worker = SyncWorker::new(h.dal.clone(), source.clone(), config());

    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Backfill))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    // The backfill started from the beginning despite the stored cursor.
    assert_eq!(source.cursors(), vec![None, None]);
}

#[tokio::test]
async fn empty_source_finishes_as_no_data() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![]);
    let worker = SyncWorker::new(h.dal.clone(), source, config());

    let job_id = h
        .dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), 1);

    let stored = h.dal.sync_job().get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    let run = h
        .dal
        .sync_run()
        .get(stored.last_run_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::NoData);
}

#[tokio::test]
async fn busy_lock_releases_the_job_without_an_attempt() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![page(1, "c1", false)]);
    let worker = SyncWorker::new(h.dal.clone(), source.clone(), config());

    // Someone else holds the resource.
    assert!(h
        .dal
        .sync_lock()
        .acquire("repo-1", "issues", "other-process", 300)
        .await
        .unwrap());

    let job_id = h
        .dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), 0);

    let stored = h.dal.sync_job().get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 0);
    // Delayed so the holder gets a chance to finish.
    assert!(stored.not_before > chrono::Utc::now());
    // The source was never touched.
    assert!(source.cursors().is_empty());
}

#[tokio::test]
async fn transient_source_failure_consumes_one_attempt() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![Err(UpstreamError::Transient(
        "502 bad gateway".to_string(),
    ))]);
    let worker = SyncWorker::new(h.dal.clone(), source, config());

    let job_id = h
        .dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), 0);

    let stored = h.dal.sync_job().get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error.as_deref(), Some("502 bad gateway"));

    let run = h
        .dal
        .sync_run()
        .get(stored.last_run_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_summary.as_deref(), Some("502 bad gateway"));

    // The lock is free for the retry.
    assert!(h
        .dal
        .sync_lock()
        .acquire("repo-1", "issues", "someone-else", 300)
        .await
        .unwrap());
}

#[tokio::test]
async fn permanent_source_failure_dead_letters_the_job() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![Err(UpstreamError::Permanent(
        "repository deleted".to_string(),
    ))]);
    let worker = SyncWorker::new(h.dal.clone(), source, config());

    let job_id = h
        .dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), 0);

    let stored = h.dal.sync_job().get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.attempts, 0);

    // The scope is free for manual resubmission.
    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
}

#[tokio::test]
async fn page_pulls_consume_rate_limit_tokens() {
    let h = common::harness().await;
    let source = ScriptedSource::new(vec![page(1, "c1", true), page(1, "c2", false)]);
    let worker = SyncWorker::new(h.dal.clone(), source, config());

    h.dal
        .sync_job()
        .submit(job("repo-1", JobMode::Incremental))
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    let bucket = h
        .dal
        .rate_limit()
        .get("api.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.meta.allowed, 2);
}
