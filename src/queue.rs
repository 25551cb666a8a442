//! Queue implementation: claim, extend, acknowledge and dead-letter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{self, Clock, SystemClock};
use crate::error::QueueError;
use crate::job::{
    AckToken, Added, ClaimedJob, JobId, JobRecord, NewJob, Payloads, RecurringTemplate,
    Recurrence,
};
use crate::storage::{Filter, Storage, Update, WriteOp};

/// Configuration for a queue.
///
/// Durations are (de)serialized as whole seconds and every field falls back
/// to its default when missing.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use docqueue::QueueConfig;
///
/// let config: QueueConfig = serde_json::from_str(r#"{ "visibility": 60 }"#).unwrap();
/// assert_eq!(config.visibility, Duration::from_secs(60));
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a claimed job stays hidden from other consumers.
    #[serde(with = "seconds")]
    pub visibility: Duration,

    /// How long a newly added job waits before it can be claimed.
    #[serde(with = "seconds")]
    pub delay: Duration,

    /// Redeliveries allowed after the first delivery before a job is
    /// dead-lettered. Only enforced when a dead queue is configured.
    pub max_retries: u32,

    /// Move dead letters inside a storage transaction.
    pub transactional_dead_letter: bool,
}

impl Default for QueueConfig {
    /// Returns a configuration with sensible defaults.
    ///
    /// - `visibility`: 30 seconds
    /// - `delay`: none
    /// - `max_retries`: 5
    /// - `transactional_dead_letter`: false
    fn default() -> Self {
        Self {
            visibility: Duration::from_secs(30),
            delay: Duration::ZERO,
            max_retries: 5,
            transactional_dead_letter: false,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Options for [`Queue::add`] and the scheduling helpers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Overrides [`QueueConfig::delay`].
    pub delay: Option<Duration>,
}

impl AddOptions {
    #[must_use]
    pub fn delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// Options for [`Queue::get`] and [`Queue::ping`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClaimOptions {
    /// Overrides [`QueueConfig::visibility`].
    pub visibility: Option<Duration>,
}

impl ClaimOptions {
    #[must_use]
    pub fn visibility(visibility: Duration) -> Self {
        Self {
            visibility: Some(visibility),
        }
    }
}

/// Builder for [`Queue`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use docqueue::{MemoryStorage, Queue};
///
/// # async fn example() -> Result<(), docqueue::QueueError> {
/// let storage = MemoryStorage::new();
/// let dead = Queue::builder(storage.clone(), "emails-dead").connect().await?;
/// let queue = Queue::builder(storage, "emails")
///     .visibility(Duration::from_secs(60))
///     .max_retries(3)
///     .dead_queue(dead)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder<S> {
    storage: S,
    name: String,
    config: QueueConfig,
    dead_queue: Option<Queue<S>>,
    clock: Arc<dyn Clock>,
}

impl<S: Storage> QueueBuilder<S> {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn visibility(mut self, visibility: Duration) -> Self {
        self.config.visibility = visibility;
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Send jobs that exceed the retry budget to `dead_queue`.
    #[must_use]
    pub fn dead_queue(mut self, dead_queue: Queue<S>) -> Self {
        self.dead_queue = Some(dead_queue);
        self
    }

    /// Move dead letters as one storage transaction.
    ///
    /// The dead queue must live in the same storage as this queue, i.e. be
    /// built from a clone of the same handle.
    #[must_use]
    pub fn transactional_dead_letter(mut self, enabled: bool) -> Self {
        self.config.transactional_dead_letter = enabled;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration, create indexes and return the queue.
    ///
    /// Safe to call repeatedly for the same collection.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Configuration`] if:
    /// - the collection name is empty
    /// - transactional dead-lettering is enabled without a dead queue
    /// - transactional dead-lettering is enabled on storage without transactions
    /// - transactional dead-lettering is enabled with a dead queue on another
    ///   store (see [`Storage::same_store`])
    ///
    /// Returns [`QueueError::Storage`] if index creation fails.
    pub async fn connect(self) -> Result<Queue<S>, QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Configuration(
                "collection name must not be empty".into(),
            ));
        }

        if self.config.transactional_dead_letter {
            let Some(dead) = &self.dead_queue else {
                return Err(QueueError::Configuration(
                    "transactional dead-lettering requires a dead queue".into(),
                ));
            };
            if !self.storage.supports_transactions() {
                return Err(QueueError::Configuration(
                    "transactional dead-lettering requires storage with transaction support"
                        .into(),
                ));
            }
            if !self.storage.same_store(&dead.inner.storage) {
                return Err(QueueError::Configuration(format!(
                    "transactional dead-lettering requires dead queue {} to share storage with {}",
                    dead.name(),
                    self.name
                )));
            }
        }

        self.storage.ensure_indexes(&self.name).await?;

        debug!(
            queue = %self.name,
            visibility_secs = self.config.visibility.as_secs(),
            max_retries = self.config.max_retries,
            dead_queue = self.dead_queue.as_ref().map(|q| q.name()),
            "Queue connected"
        );

        Ok(Queue {
            inner: Arc::new(Inner {
                storage: self.storage,
                name: self.name,
                config: self.config,
                dead_queue: self.dead_queue,
                clock: self.clock,
            }),
        })
    }
}

struct Inner<S> {
    storage: S,
    name: String,
    config: QueueConfig,
    dead_queue: Option<Queue<S>>,
    clock: Arc<dyn Clock>,
}

/// A job queue over one collection of a [`Storage`] backend.
///
/// Delivery is at-least-once. A consumer claims a job with [`Queue::get`],
/// which hides it for the visibility window and hands out an [`AckToken`].
/// The consumer then either finishes with [`Queue::ack`], or keeps the claim
/// alive with [`Queue::ping`]. If the window lapses first, the job becomes
/// claimable again and the old token stops working.
///
/// All mutual exclusion comes from the storage's atomic conditional update;
/// any number of queue handles, in any number of processes, can share a
/// collection.
///
/// Cloning is cheap and clones share configuration.
pub struct Queue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field(
                "dead_queue",
                &self.inner.dead_queue.as_ref().map(|q| q.inner.name.as_str()),
            )
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Queue<S> {
    /// Start building a queue over `collection` in `storage`.
    #[must_use]
    pub fn builder(storage: S, collection: impl Into<String>) -> QueueBuilder<S> {
        QueueBuilder {
            storage,
            name: collection.into(),
            config: QueueConfig::default(),
            dead_queue: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Connect with an explicit configuration and no dead queue.
    ///
    /// # Errors
    ///
    /// See [`QueueBuilder::connect`].
    pub async fn connect(
        storage: S,
        collection: impl Into<String>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        Self::builder(storage, collection).config(config).connect().await
    }

    /// Name of the underlying collection.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn dead_queue(&self) -> Option<&Queue<S>> {
        self.inner.dead_queue.as_ref()
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // -------------------------------------------------------------------------
    // Produce
    // -------------------------------------------------------------------------

    /// Add one payload or a batch of payloads.
    ///
    /// Batch inserts are unordered: a failing insert does not stop the
    /// others. The returned ids mirror the input shape and order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if any insert fails.
    pub async fn add(
        &self,
        payloads: impl Into<Payloads>,
        options: AddOptions,
    ) -> Result<Added, QueueError> {
        let delay = options.delay.unwrap_or(self.inner.config.delay);
        let visible = clock::after(self.now(), delay);

        match payloads.into() {
            Payloads::Single(payload) => Ok(Added::Single(self.insert(payload, visible).await?)),
            Payloads::Batch(payloads) => {
                if payloads.is_empty() {
                    return Ok(Added::Batch(Vec::new()));
                }
                let jobs = payloads
                    .into_iter()
                    .map(|payload| NewJob::new(payload, visible))
                    .collect();
                let ids = self.inner.storage.insert_many(&self.inner.name, jobs).await?;
                debug!(queue = %self.inner.name, count = ids.len(), "Jobs added");
                Ok(Added::Batch(ids))
            }
        }
    }

    /// Add a payload that becomes claimable at `at`.
    ///
    /// The delay is rounded down to whole seconds; instants in the past mean
    /// immediately. There is no [`AddOptions`] parameter because `at` already
    /// fixes the visibility, and the configured default delay is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the insert fails.
    pub async fn schedule_at(&self, at: DateTime<Utc>, payload: Value) -> Result<JobId, QueueError> {
        let now = self.now();
        let seconds = (at - now).num_seconds().max(0);
        let visible = clock::after(now, Duration::from_secs(seconds.unsigned_abs()));
        self.insert(payload, visible).await
    }

    /// Persist a recurring-job template.
    ///
    /// The queue stores `{ originalPayload, recurrence: { pattern, createdAt } }`
    /// as an ordinary job. Turning templates into concrete jobs is left to an
    /// external scheduler; the pattern is not parsed here.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the insert fails.
    pub async fn schedule_recurring(
        &self,
        pattern: impl Into<String>,
        payload: Value,
        options: AddOptions,
    ) -> Result<JobId, QueueError> {
        let template = RecurringTemplate {
            original_payload: payload,
            recurrence: Recurrence {
                pattern: pattern.into(),
                created_at: self.now(),
            },
        };
        let delay = options.delay.unwrap_or(self.inner.config.delay);
        let visible = clock::after(self.now(), delay);
        self.insert(serde_json::to_value(template)?, visible).await
    }

    async fn insert(&self, payload: Value, visible: DateTime<Utc>) -> Result<JobId, QueueError> {
        let id = self
            .inner
            .storage
            .insert(&self.inner.name, NewJob::new(payload, visible))
            .await?;
        debug!(queue = %self.inner.name, job_id = %id, "Job added");
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Consume
    // -------------------------------------------------------------------------

    /// Claim the oldest visible job.
    ///
    /// Returns `Ok(None)` when nothing is claimable; poll again later. Jobs
    /// already redelivered `max_retries` times are moved to the dead queue
    /// instead of being returned.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the claim or a dead-letter move fails.
    pub async fn get(&self, options: ClaimOptions) -> Result<Option<ClaimedJob>, QueueError> {
        let visibility = options.visibility.unwrap_or(self.inner.config.visibility);

        // Each pass either returns or dead-letters one record, removing it
        // from the claimable set, so the loop ends.
        loop {
            let now = self.now();
            let ack = AckToken::generate();
            let update = Update::claim(ack.clone(), clock::after(now, visibility));
            let Some(record) = self
                .inner
                .storage
                .find_one_and_update(&self.inner.name, &Filter::claimable(now), &update)
                .await?
            else {
                return Ok(None);
            };

            if self.is_poisoned(&record) {
                self.move_to_dead_letter(&record, ack).await?;
                continue;
            }

            debug!(
                queue = %self.inner.name,
                job_id = %record.id,
                tries = record.tries,
                "Job claimed"
            );
            return Ok(Some(ClaimedJob {
                id: record.id,
                ack,
                payload: record.payload,
                tries: record.tries,
            }));
        }
    }

    /// A job may be delivered once plus `max_retries` more times; the claim
    /// after that is intercepted.
    fn is_poisoned(&self, record: &JobRecord) -> bool {
        let retries = record.tries.saturating_sub(1);
        self.inner.dead_queue.is_some() && retries > self.inner.config.max_retries
    }

    /// Extend an outstanding claim by the visibility window.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownAck`] if the token does not match an
    /// unexpired claim; the job must no longer be treated as owned.
    /// Returns [`QueueError::Storage`] if the update fails.
    pub async fn ping(&self, ack: &AckToken, options: ClaimOptions) -> Result<JobId, QueueError> {
        let visibility = options.visibility.unwrap_or(self.inner.config.visibility);
        let now = self.now();
        let id = self
            .update_outstanding(ack, now, Update::extend(clock::after(now, visibility)))
            .await?;
        debug!(queue = %self.inner.name, job_id = %id, "Claim extended");
        Ok(id)
    }

    /// Mark a claimed job as done.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownAck`] if the token does not match an
    /// unexpired claim. Returns [`QueueError::Storage`] if the update fails.
    pub async fn ack(&self, ack: &AckToken) -> Result<JobId, QueueError> {
        let now = self.now();
        let id = self
            .update_outstanding(ack, now, Update::mark_deleted(now))
            .await?;
        debug!(queue = %self.inner.name, job_id = %id, "Job acknowledged");
        Ok(id)
    }

    async fn update_outstanding(
        &self,
        ack: &AckToken,
        now: DateTime<Utc>,
        update: Update,
    ) -> Result<JobId, QueueError> {
        self.inner
            .storage
            .find_one_and_update(
                &self.inner.name,
                &Filter::outstanding(ack.clone(), now),
                &update,
            )
            .await?
            .map(|record| record.id)
            .ok_or_else(|| QueueError::UnknownAck { ack: ack.clone() })
    }

    // -------------------------------------------------------------------------
    // Dead letters
    // -------------------------------------------------------------------------

    /// Copy `record` into the dead queue and retire it here.
    ///
    /// The copy carries the deliveries the consumer actually saw, which
    /// excludes the claim that intercepted the record.
    ///
    /// Without transactions the copy is inserted before the source is marked
    /// deleted. A crash in between leaves the job in both queues, and it will
    /// be delivered again from here.
    async fn move_to_dead_letter(
        &self,
        record: &JobRecord,
        ack: AckToken,
    ) -> Result<(), QueueError> {
        let Some(dead) = &self.inner.dead_queue else {
            return Ok(());
        };

        let now = self.now();
        let copy = NewJob {
            payload: record.payload.clone(),
            visible: now,
            tries: record.tries.saturating_sub(1),
        };
        let retire = Filter::owned(record.id, ack);

        warn!(
            queue = %self.inner.name,
            dead_queue = %dead.name(),
            job_id = %record.id,
            tries = record.tries,
            max_retries = self.inner.config.max_retries,
            "Moving job to dead-letter queue"
        );

        if self.inner.config.transactional_dead_letter {
            self.inner
                .storage
                .apply_atomically(vec![
                    WriteOp::Insert {
                        collection: dead.name().to_owned(),
                        job: copy,
                    },
                    WriteOp::Update {
                        collection: self.inner.name.clone(),
                        filter: retire,
                        update: Update::mark_deleted(now),
                    },
                ])
                .await?;
            return Ok(());
        }

        let dead_id = dead.inner.storage.insert(dead.name(), copy).await?;
        let retired = self
            .inner
            .storage
            .find_one_and_update(&self.inner.name, &retire, &Update::mark_deleted(now))
            .await
            .inspect_err(|e| {
                warn!(
                    queue = %self.inner.name,
                    job_id = %record.id,
                    dead_job_id = %dead_id,
                    error = %e,
                    "Dead letter copied but source not retired; job is now in both queues"
                );
            })?;
        if retired.is_none() {
            warn!(
                queue = %self.inner.name,
                job_id = %record.id,
                dead_job_id = %dead_id,
                "Source job changed before it could be retired"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Every record still stored, including ones awaiting purge.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the count fails.
    pub async fn total(&self) -> Result<u64, QueueError> {
        self.count(Filter::all()).await
    }

    /// Records claimable right now.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the count fails.
    pub async fn size(&self) -> Result<u64, QueueError> {
        self.count(Filter::claimable(self.now())).await
    }

    /// Records with an unexpired claim.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the count fails.
    pub async fn in_flight(&self) -> Result<u64, QueueError> {
        self.count(Filter::in_flight(self.now())).await
    }

    /// Records acknowledged or dead-lettered and awaiting purge.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the count fails.
    pub async fn done(&self) -> Result<u64, QueueError> {
        self.count(Filter::done()).await
    }

    async fn count(&self, filter: Filter) -> Result<u64, QueueError> {
        Ok(self.inner.storage.count(&self.inner.name, &filter).await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
