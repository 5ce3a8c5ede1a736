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

//! Long-running worker loops.
//!
//! Each worker polls the store on an interval and exits cleanly when its
//! shutdown channel fires. Workers share no memory with each other;
//! multiple instances of the same worker may run in separate processes
//! against the same store, coordinated entirely by leases.
//!
//! Every worker exposes a `run_once` method performing a single pass, used
//! by the loop and directly by tests.

pub mod outbox_worker;
pub mod reaper;
pub mod reconciler;
pub mod sync_worker;

pub use outbox_worker::{OutboxWorker, OutboxWorkerConfig};
pub use reaper::{Reaper, ReaperConfig};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerReport};
pub use sync_worker::{SyncWorker, SyncWorkerConfig};
