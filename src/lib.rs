//! An at-least-once job queue over a pluggable document store.
//!
//! Producers add JSON payloads; consumers claim one visible job at a time
//! under a visibility timeout, then acknowledge it or keep the claim alive.
//! Claims that lapse make the job claimable again. Jobs that keep failing
//! are moved to a dead-letter queue.
//!
//! Storage backends implement [`Storage`]. Built-in implementations:
//!
//! - [`MemoryStorage`] - In-memory storage for tests and single processes
//! - `PostgresStorage` - Postgres via diesel (feature `postgres`)
//!
//! # Lifecycle
//!
//! ```text
//!  add ──► visible ──get──► claimed ──ack──► deleted ──purge──► gone
//!             ▲               │  ▲
//!             └──window lapses┘  └─ping─┘
//!
//!  claimed too often ──get──► dead queue
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use docqueue::{AddOptions, ClaimOptions, MemoryStorage, Queue, QueueError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let storage = MemoryStorage::new();
//!     let queue = Queue::builder(storage, "emails").connect().await?;
//!
//!     queue.add(json!({ "to": "ops@example.com" }), AddOptions::default()).await?;
//!
//!     if let Some(job) = queue.get(ClaimOptions::default()).await? {
//!         // ... send the email ...
//!         queue.ack(&job.ack).await?;
//!     }
//!     Ok(())
//! }
//! ```

mod clock;
mod error;
mod job;
mod queue;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::QueueError;
pub use job::{
    AckToken, Added, ClaimedJob, JobId, JobRecord, NewJob, Payloads, RecurringTemplate, Recurrence,
};
pub use queue::{AddOptions, ClaimOptions, Queue, QueueBuilder, QueueConfig};
#[cfg(feature = "postgres")]
pub use storage::{PostgresStorage, PostgresStorageError};
pub use storage::{
    Filter, MemoryStorage, MemoryStorageError, Purger, Storage, StorageError, Update, WriteOp,
};
