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

//! Diesel schema definitions for the reliability-engine tables.
//!
//! UUIDs are stored as 16-byte BLOBs, timestamps as fixed-width RFC3339
//! TEXT (UTC, 'Z' suffix) so that lexicographic comparison in SQL matches
//! chronological comparison.

diesel::table! {
    outbox_entries (id) {
        id -> Binary,
        target_namespace -> Text,
        payload -> Text,
        payload_hash -> Text,
        status -> Text,
        retry_count -> Integer,
        next_attempt_at -> Text,
        locked_by -> Nullable<Text>,
        locked_at -> Nullable<Text>,
        lease_seconds -> Integer,
        correlation_id -> Nullable<Binary>,
        last_error -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    write_audit (id) {
        id -> Binary,
        correlation_id -> Binary,
        actor -> Text,
        target_namespace -> Text,
        action -> Text,
        status -> Text,
        payload_hash -> Text,
        evidence -> Nullable<Text>,
        reason -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
        finalized_at -> Nullable<Text>,
    }
}

diesel::table! {
    sync_jobs (job_id) {
        job_id -> Binary,
        repo_id -> Text,
        job_type -> Text,
        mode -> Text,
        priority -> Integer,
        payload -> Text,
        status -> Text,
        attempts -> Integer,
        max_attempts -> Integer,
        not_before -> Text,
        locked_by -> Nullable<Text>,
        locked_at -> Nullable<Text>,
        lease_seconds -> Integer,
        last_error -> Nullable<Text>,
        last_run_id -> Nullable<Binary>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_runs (run_id) {
        run_id -> Binary,
        job_id -> Binary,
        repo_id -> Text,
        job_type -> Text,
        mode -> Text,
        started_at -> Text,
        finished_at -> Nullable<Text>,
        cursor_before -> Nullable<Text>,
        cursor_after -> Nullable<Text>,
        items_fetched -> Integer,
        items_written -> Integer,
        error_summary -> Nullable<Text>,
        status -> Text,
    }
}

diesel::table! {
    sync_locks (repo_id, job_type) {
        repo_id -> Text,
        job_type -> Text,
        locked_by -> Text,
        locked_at -> Text,
        lease_seconds -> Integer,
    }
}

diesel::table! {
    rate_limit_buckets (instance_key) {
        instance_key -> Text,
        tokens -> Double,
        rate -> Double,
        burst -> Double,
        paused_until -> Nullable<Text>,
        meta -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    outbox_entries,
    write_audit,
    sync_jobs,
    sync_runs,
    sync_locks,
    rate_limit_buckets,
);
