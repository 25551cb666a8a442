//! Storage backend implementations for the queue.
//!
//! This module provides:
//! - [`Storage`] trait - Atomic conditional update, counting and transaction
//!   capability that [`Queue`](crate::Queue) depends on
//! - [`Filter`] / [`Update`] - Backend-neutral predicates and mutations
//! - [`MemoryStorage`] - In-memory storage for testing and single-process use
//! - `PostgresStorage` - Postgres storage (feature `postgres`)

use std::error::Error;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::job::{AckToken, JobId, JobRecord, NewJob};

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryStorage, MemoryStorageError, Purger};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStorage, PostgresStorageError};

/// Shared error type used by storage backends.
pub type StorageError = Box<dyn Error + Send + Sync + 'static>;

/// Conjunction of conditions on a job record.
///
/// Every `Some` field must hold for a record to match; `None` fields are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub id: Option<JobId>,
    pub ack: Option<AckToken>,
    /// `Some(true)` requires an ack token, `Some(false)` forbids one.
    pub has_ack: Option<bool>,
    pub visible_at_or_before: Option<DateTime<Utc>>,
    pub visible_after: Option<DateTime<Utc>>,
    /// `Some(true)` requires `deleted` to be set, `Some(false)` requires it absent.
    pub deleted: Option<bool>,
}

impl Filter {
    /// Every record, deleted or not.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Live records visible at `now`.
    #[must_use]
    pub fn claimable(now: DateTime<Utc>) -> Self {
        Self {
            visible_at_or_before: Some(now),
            deleted: Some(false),
            ..Self::default()
        }
    }

    /// The live record holding `ack` whose claim has not expired at `now`.
    #[must_use]
    pub fn outstanding(ack: AckToken, now: DateTime<Utc>) -> Self {
        Self {
            ack: Some(ack),
            visible_after: Some(now),
            deleted: Some(false),
            ..Self::default()
        }
    }

    /// Live records with an unexpired claim at `now`.
    #[must_use]
    pub fn in_flight(now: DateTime<Utc>) -> Self {
        Self {
            has_ack: Some(true),
            visible_after: Some(now),
            deleted: Some(false),
            ..Self::default()
        }
    }

    /// Records marked deleted and awaiting purge.
    #[must_use]
    pub fn done() -> Self {
        Self {
            deleted: Some(true),
            ..Self::default()
        }
    }

    /// The live record `id` still carrying the claim `ack`, expired or not.
    #[must_use]
    pub fn owned(id: JobId, ack: AckToken) -> Self {
        Self {
            id: Some(id),
            ack: Some(ack),
            deleted: Some(false),
            ..Self::default()
        }
    }

    /// Evaluate the filter against a record.
    #[must_use]
    pub fn matches(&self, record: &JobRecord) -> bool {
        if self.id.is_some_and(|id| id != record.id) {
            return false;
        }
        if self
            .ack
            .as_ref()
            .is_some_and(|ack| record.ack.as_ref() != Some(ack))
        {
            return false;
        }
        if self
            .has_ack
            .is_some_and(|has_ack| has_ack != record.ack.is_some())
        {
            return false;
        }
        if self
            .visible_at_or_before
            .is_some_and(|at| record.visible > at)
        {
            return false;
        }
        if self.visible_after.is_some_and(|at| record.visible <= at) {
            return false;
        }
        if self
            .deleted
            .is_some_and(|deleted| deleted != record.deleted.is_some())
        {
            return false;
        }
        true
    }
}

/// Set of mutations applied to a matched record in one atomic step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub increment_tries: bool,
    pub ack: Option<AckToken>,
    pub visible: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
}

impl Update {
    /// Take a claim: bump `tries`, issue `ack` and hide until `visible`.
    #[must_use]
    pub fn claim(ack: AckToken, visible: DateTime<Utc>) -> Self {
        Self {
            increment_tries: true,
            ack: Some(ack),
            visible: Some(visible),
            deleted: None,
        }
    }

    /// Push an outstanding claim's visibility out to `visible`.
    #[must_use]
    pub fn extend(visible: DateTime<Utc>) -> Self {
        Self {
            visible: Some(visible),
            ..Self::default()
        }
    }

    /// Make the record terminal.
    #[must_use]
    pub fn mark_deleted(at: DateTime<Utc>) -> Self {
        Self {
            deleted: Some(at),
            ..Self::default()
        }
    }

    /// Apply the mutations in place.
    pub fn apply(&self, record: &mut JobRecord) {
        if self.increment_tries {
            record.tries = record.tries.saturating_add(1);
        }
        if let Some(ack) = &self.ack {
            record.ack = Some(ack.clone());
        }
        if let Some(visible) = self.visible {
            record.visible = visible;
        }
        if let Some(deleted) = self.deleted {
            record.deleted = Some(deleted);
        }
    }
}

/// One write inside [`Storage::apply_atomically`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        collection: String,
        job: NewJob,
    },
    /// Updates the first match; matching nothing aborts the whole batch.
    Update {
        collection: String,
        filter: Filter,
        update: Update,
    },
}

/// Trait for queue storage backends.
///
/// A backend holds any number of named collections of [`JobRecord`]s. Handles
/// are cheap to clone and clones refer to the same underlying data.
///
/// # Contract
///
/// - [`find_one_and_update`](Storage::find_one_and_update) is atomic: no other
///   operation observes the record between matching and mutating it. Among
///   several matches the lowest [`JobId`] wins.
/// - A live record's ack token is unique within its collection; an update
///   that would duplicate one fails.
/// - Ids are assigned in increasing order across the whole backend.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Create whatever indexes the backend needs. Must be idempotent.
    fn ensure_indexes(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert one record and return its id.
    fn insert(
        &self,
        collection: &str,
        job: NewJob,
    ) -> impl Future<Output = Result<JobId, StorageError>> + Send;

    /// Insert records independently, returning ids in input order.
    ///
    /// Every insert is attempted even if an earlier one fails; the first
    /// failure is returned after all attempts.
    fn insert_many(
        &self,
        collection: &str,
        jobs: Vec<NewJob>,
    ) -> impl Future<Output = Result<Vec<JobId>, StorageError>> + Send {
        async move {
            let mut ids = Vec::with_capacity(jobs.len());
            let mut first_error = None;
            for job in jobs {
                match self.insert(collection, job).await {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(ids),
            }
        }
    }

    /// Atomically update the lowest-id record matching `filter`.
    ///
    /// Returns the record as it is after the update, or `Ok(None)` if nothing
    /// matched.
    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> impl Future<Output = Result<Option<JobRecord>, StorageError>> + Send;

    /// Count records matching `filter`.
    fn count(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Whether [`apply_atomically`](Storage::apply_atomically) is available.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Whether `other` reaches the same data, so one transaction on `self`
    /// can write collections read through `other`.
    ///
    /// Backends that cannot tell must keep the default.
    fn same_store(&self, other: &Self) -> bool {
        let _ = other;
        false
    }

    /// Apply all writes or none of them.
    ///
    /// The transaction is opened, committed or rolled back within this call.
    fn apply_atomically(
        &self,
        ops: Vec<WriteOp>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        let _ = ops;
        async move { Err(StorageError::from("storage backend does not support transactions")) }
    }
}
