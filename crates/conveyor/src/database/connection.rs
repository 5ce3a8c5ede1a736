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

//! Database connection management over SQLite.
//!
//! This module provides an async connection pool implementation using
//! `deadpool-diesel`. Every worker process constructs one [`Database`] at
//! startup and passes it explicitly into the components that need it; there
//! is no ambient global connection state.
//!
//! # Concurrency
//!
//! SQLite has limited concurrent write support even with WAL mode, so the
//! pool holds a single connection per process. Cross-process coordination
//! happens through conditional updates, with WAL mode and a generous
//! `busy_timeout` letting concurrent processes queue on the write lock
//! instead of failing.

use deadpool_diesel::sqlite::{Manager, Object, Pool, Runtime};
use tracing::info;

use crate::error::StoreError;

/// A thread-safe handle to the connection pool.
///
/// `Database` is `Clone`; each clone references the same underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    url: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("url", &self.url).finish()
    }
}

impl Database {
    /// Creates a new connection pool for the given SQLite path.
    ///
    /// Accepts a file path, `:memory:`, or a `sqlite://` / `file:` URL.
    ///
    /// # Panics
    ///
    /// Panics if the pool cannot be created.
    pub fn new(connection_string: &str) -> Self {
        let url = Self::normalize_url(connection_string);
        let manager = Manager::new(url.clone(), Runtime::Tokio1);
        // Single connection: avoids "database is locked" errors between
        // tasks in the same process. Inter-process contention is handled by
        // busy_timeout.
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .expect("Failed to create SQLite connection pool");

        info!(url = %url, "SQLite connection pool initialized");

        Self { pool, url }
    }

    /// Creates a `Database` from the `CONVEYOR_DATABASE_URL` environment
    /// variable, loading a `.env` file if one is present.
    pub fn from_env() -> Result<Self, StoreError> {
        dotenvy::dotenv().ok();
        let url = std::env::var("CONVEYOR_DATABASE_URL")
            .map_err(|_| StoreError::Config("CONVEYOR_DATABASE_URL is not set".to_string()))?;
        Ok(Self::new(&url))
    }

    /// Returns the normalized connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks out a pooled connection.
    pub async fn get_connection(&self) -> Result<Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Strips the `sqlite://` prefix if present; `file:` URIs and plain
    /// paths pass through unchanged.
    fn normalize_url(connection_string: &str) -> String {
        connection_string
            .strip_prefix("sqlite://")
            .unwrap_or(connection_string)
            .to_string()
    }

    /// Runs pending migrations and sets the concurrency pragmas.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        use diesel::prelude::*;
        use diesel_migrations::MigrationHarness;

        let conn = self.get_connection().await?;
        conn.interact(|conn| {
            // WAL mode allows concurrent reads during writes.
            diesel::sql_query("PRAGMA journal_mode=WAL;")
                .execute(conn)
                .map_err(|e| StoreError::Migration(format!("failed to set WAL mode: {}", e)))?;
            // Wait up to 30s on a locked database instead of failing.
            diesel::sql_query("PRAGMA busy_timeout=30000;")
                .execute(conn)
                .map_err(|e| StoreError::Migration(format!("failed to set busy_timeout: {}", e)))?;

            conn.run_pending_migrations(crate::database::MIGRATIONS)
                .map(|_| ())
                .map_err(|e| StoreError::Migration(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))??;

        info!("database migrations up to date");
        Ok(())
    }
}
