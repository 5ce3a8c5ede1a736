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

//! Shared test fixtures: a migrated SQLite database in a temp directory.

use conveyor::dal::DAL;
use conveyor::database::Database;
use once_cell::sync::Lazy;
use tempfile::TempDir;

static TRACING: Lazy<()> = Lazy::new(|| {
    conveyor::logging::init("conveyor=debug");
});

/// A fresh database for one test. The temp directory lives as long as the
/// harness; dropping it removes the database file.
pub struct TestHarness {
    pub dal: DAL,
    _dir: TempDir,
}

pub async fn harness() -> TestHarness {
    Lazy::force(&TRACING);
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("conveyor-test.db");
    let database = Database::new(path.to_str().expect("non-utf8 temp path"));
    database
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    TestHarness {
        dal: DAL::new(database),
        _dir: dir,
    }
}
