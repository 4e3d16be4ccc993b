//! # Capstan
//!
//! A durable, pluggable job queue: jobs are scheduled, dispatched,
//! throttled, and tracked through a lifecycle against swappable storage.
//!
//! ## Core Concepts
//!
//! A **job** carries an opaque JSON input, produces an opaque JSON output,
//! and fails with one of a small set of settlement-classifying errors.
//! The job row in storage is the single source of truth; everything else
//! (events, stats, waiters) is derived from its transitions.
//!
//! ```text
//!                 add                     next() claim
//!         ∅ ──────────────► pending ─────────────────────► processing
//!                            ▲  ▲                               │
//!                            │  │  retryable error              │
//!                            │  └───── retry hint/limiter ──────┤
//!                            │                                  │
//!        server restart fix-up                                  ▼
//!   completed ◄──────────── success ──────────────────── (settlement)
//!      failed ◄──────────── permanent error / budget spent / abort
//!    disabled ◄──────────── job disabled itself
//!
//!        abort request: status := aborting ──► observed by the worker,
//!        which cancels the run and settles the row failed.
//! ```
//!
//! ## Architecture
//!
//! ```text
//! JobClient ──submit──► JobStorage ◄──next/settle── Worker ◄─┐
//!     │                     │                          │     │ pool
//!     │ wait_for            │ change stream            │     │
//!     ▼                     ▼                          ▼     │
//! outcome ◄─────── events (either path) ◄──────── QueueEvents│
//!                                                      ▲     │
//!                                      JobServer ──────┴─────┘
//!                                      (fix-up, cleanup, stats)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Claims are atomic** - two workers never hold the same job
//! 2. **Terminal states absorb** - a settled row never changes again
//! 3. **Attempts count at dispatch** - `run_attempts <= max_retries + 1`
//! 4. **Progress is monotonic** - never decreasing within one run
//! 5. **Aborts win** - anything finishing after an abort settles as one
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use capstan::{
//!     FnJobHandler, InMemoryJobStorage, JobClient, JobServer, ServerConfig,
//!     SubmitOptions,
//! };
//! use serde_json::json;
//!
//! let storage = Arc::new(InMemoryJobStorage::new());
//! let handler = Arc::new(FnJobHandler::new(|input, ctx| async move {
//!     ctx.update_progress(50.0, "halfway", None).await;
//!     Ok(json!({ "doubled": input["n"].as_i64().unwrap_or(0) * 2 }))
//! }));
//!
//! let server = JobServer::new(storage.clone(), handler, ServerConfig::for_queue("math"));
//! server.start().await?;
//!
//! let client = JobClient::attach(&server);
//! let handle = client.submit(json!({ "n": 21 }), SubmitOptions::new()).await?;
//! let output = handle.wait().await?;
//! assert_eq!(output["doubled"], 42);
//!
//! server.stop().await;
//! ```
//!
//! ## What This Is Not
//!
//! Capstan is **not**:
//! - A workflow/DAG engine
//! - A distributed-consensus system (storage linearizes; workers trust it)
//! - A storage format (adapters own representation)

mod client;
mod error;
mod events;
mod handler;
mod job;
mod server;
mod worker;

pub mod limiter;
pub mod storage;


// Re-export model types
pub use crate::job::{fingerprint_input, JobRecord, JobStatus, SubmitOptions};

// Re-export error types
pub use crate::error::{ErrorCode, JobError};

// Re-export event types
pub use crate::events::{JobEvent, QueueEvents, QueueStats};

// Re-export the handler contract
pub use crate::handler::{FnJobHandler, JobContext, JobHandler, ProgressReporter};

// Re-export limiters at the crate root
pub use crate::limiter::{
    CompositeLimiter, ConcurrencyLimiter, Limiter, NullLimiter, RateLimiter, RateLimiterConfig,
    SpacedRateLimiter,
};

// Re-export the storage port and reference adapter
pub use crate::storage::{ChangeKind, InMemoryJobStorage, JobChange, JobStorage};

// Re-export engine types
pub use crate::server::{JobServer, ServerConfig};
pub use crate::worker::{Worker, WorkerConfig};

// Re-export client types
pub use crate::client::{JobClient, JobHandle, ProgressSubscription, ProgressUpdate};

// Re-export commonly used external types
pub use async_trait::async_trait;
