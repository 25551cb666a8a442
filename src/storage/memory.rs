//! In-memory storage implementation for testing and simple use cases.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Filter, Storage, StorageError, Update, WriteOp};
use crate::job::{AckToken, JobId, JobRecord, NewJob};

/// Errors raised by [`MemoryStorage`].
#[derive(Debug, Error)]
pub enum MemoryStorageError {
    /// Another live record in the collection already holds this token.
    #[error("Duplicate ack token {ack} in collection {collection}")]
    DuplicateAck { collection: String, ack: AckToken },

    /// An update inside a transaction matched no record.
    #[error("Transaction aborted: update on collection {collection} matched no record")]
    TransactionConflict { collection: String },

    /// The handle was created with transactions disabled.
    #[error("Transactions are disabled for this storage")]
    TransactionsUnsupported,
}

type Collection = BTreeMap<JobId, JobRecord>;

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    collections: HashMap<String, Collection>,
}

impl State {
    fn allocate_id(&mut self) -> JobId {
        self.next_id += 1;
        JobId(self.next_id)
    }
}

/// In-memory job storage.
///
/// Collections live in a shared `Arc<Mutex<..>>`; every operation takes the
/// lock once, which makes conditional updates and transactions atomic.
///
/// # Cloning
///
/// Cloning creates a new handle to the **same** underlying collections, so a
/// dead-letter queue built from a clone can take part in transactions.
///
/// # Purging
///
/// Records marked deleted stay in place until [`MemoryStorage::purge_deleted`]
/// runs, either directly or from a [`Purger`].
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    transactions: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty storage with transaction support.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            transactions: true,
        }
    }

    /// Create an empty storage that refuses transactions, like a standalone
    /// database server.
    #[must_use]
    pub fn without_transactions() -> Self {
        Self {
            transactions: false,
            ..Self::new()
        }
    }

    /// Snapshot of every record in a collection, in id order.
    pub async fn records(&self, collection: &str) -> Vec<JobRecord> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Physically remove every record marked deleted. Returns how many went.
    pub async fn purge_deleted(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut purged = 0;
        for records in state.collections.values_mut() {
            let before = records.len();
            records.retain(|_, record| record.deleted.is_none());
            purged += before - records.len();
        }
        purged
    }

    /// Run [`purge_deleted`](Self::purge_deleted) every `interval` on a
    /// background task.
    #[must_use = "the purger stops when shut down; dropping it leaves the task running detached"]
    pub fn spawn_purger(&self, interval: Duration) -> Purger {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let storage = self.clone();

        let handle = tokio::spawn(async move {
            debug!(?interval, "Purger starting");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Purger received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let purged = storage.purge_deleted().await;
                        if purged > 0 {
                            debug!(purged = purged, "Purged deleted jobs");
                        }
                    }
                }
            }
        });

        Purger {
            handle,
            shutdown_tx,
        }
    }
}

/// Updates the lowest-id match in `records`, enforcing ack uniqueness.
fn update_first(
    collection: &str,
    records: &mut Collection,
    filter: &Filter,
    update: &Update,
) -> Result<Option<JobRecord>, MemoryStorageError> {
    let Some(id) = records
        .values()
        .find(|record| filter.matches(record))
        .map(|record| record.id)
    else {
        return Ok(None);
    };

    if let Some(ack) = &update.ack {
        let taken = records.values().any(|record| {
            record.id != id && record.deleted.is_none() && record.ack.as_ref() == Some(ack)
        });
        if taken {
            return Err(MemoryStorageError::DuplicateAck {
                collection: collection.to_owned(),
                ack: ack.clone(),
            });
        }
    }

    Ok(records.get_mut(&id).map(|record| {
        update.apply(record);
        record.clone()
    }))
}

impl Storage for MemoryStorage {
    async fn ensure_indexes(&self, collection: &str) -> Result<(), StorageError> {
        self.state
            .lock()
            .await
            .collections
            .entry(collection.to_owned())
            .or_default();
        Ok(())
    }

    async fn insert(&self, collection: &str, job: NewJob) -> Result<JobId, StorageError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id, job.into_record(id));
        Ok(id)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<JobRecord>, StorageError> {
        let mut state = self.state.lock().await;
        let records = state.collections.entry(collection.to_owned()).or_default();
        Ok(update_first(collection, records, filter, update)?)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let state = self.state.lock().await;
        let count = state
            .collections
            .get(collection)
            .map(|records| records.values().filter(|r| filter.matches(r)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    async fn apply_atomically(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        if !self.transactions {
            return Err(MemoryStorageError::TransactionsUnsupported.into());
        }

        let mut state = self.state.lock().await;

        // Writes land on copies of the touched collections and are swapped
        // in only once every op has succeeded.
        let mut next_id = state.next_id;
        let mut staged: HashMap<String, Collection> = HashMap::new();
        for op in ops {
            match op {
                WriteOp::Insert { collection, job } => {
                    let records = staged.entry(collection.clone()).or_insert_with(|| {
                        state.collections.get(&collection).cloned().unwrap_or_default()
                    });
                    next_id += 1;
                    let id = JobId(next_id);
                    records.insert(id, job.into_record(id));
                }
                WriteOp::Update {
                    collection,
                    filter,
                    update,
                } => {
                    let records = staged.entry(collection.clone()).or_insert_with(|| {
                        state.collections.get(&collection).cloned().unwrap_or_default()
                    });
                    if update_first(&collection, records, &filter, &update)?.is_none() {
                        return Err(MemoryStorageError::TransactionConflict { collection }.into());
                    }
                }
            }
        }

        state.next_id = next_id;
        state.collections.extend(staged);
        Ok(())
    }
}

/// Background task started by [`MemoryStorage::spawn_purger`].
pub struct Purger {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Purger {
    /// Signal the task to stop and wait for it.
    ///
    /// # Errors
    ///
    /// Returns the join error if the task panicked.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(());
        self.handle.await?;
        info!("Purger shut down");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
