//! Postgres storage backend via diesel.
//!
//! All collections share one `queue_jobs` table keyed by a `collection`
//! column, so dead-letter moves between collections can run in a single
//! transaction.
//!
//! Claims follow the usual pattern:
//! 1. `SELECT id ... ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. `UPDATE ... WHERE id = selected_id RETURNING *`
//!
//! Both run as one statement, so concurrent consumers skip rows another
//! consumer is claiming instead of waiting on them.
//!
//! Postgres has no TTL indexes; call [`PostgresStorage::purge_deleted`]
//! periodically to drop terminal rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::sql_types::{BigInt, Bool, Integer, Jsonb, Nullable, Text, Timestamptz};
use diesel::{OptionalExtension, QueryableByName, sql_query};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{Filter, Storage, StorageError, Update, WriteOp};
use crate::job::{AckToken, JobId, JobRecord, NewJob};

/// Errors raised by [`PostgresStorage`].
#[derive(Debug, Error)]
pub enum PostgresStorageError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    /// An update inside a transaction matched no row.
    #[error("Transaction aborted: update on collection {collection} matched no record")]
    TransactionConflict { collection: String },

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS queue_jobs (
    id BIGSERIAL PRIMARY KEY,
    collection TEXT NOT NULL,
    payload JSONB NOT NULL,
    visible TIMESTAMPTZ NOT NULL,
    tries INTEGER NOT NULL DEFAULT 0,
    ack TEXT,
    deleted TIMESTAMPTZ
)";

const CREATE_VISIBLE_INDEX: &str = "CREATE INDEX IF NOT EXISTS queue_jobs_visible_idx \
    ON queue_jobs (collection, deleted, visible, id)";

const CREATE_ACK_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_ack_idx \
    ON queue_jobs (collection, ack) WHERE ack IS NOT NULL AND deleted IS NULL";

const INSERT: &str = "INSERT INTO queue_jobs (collection, payload, visible, tries) \
    VALUES ($1, $2, $3, $4) RETURNING id";

const PURGE: &str = "DELETE FROM queue_jobs WHERE deleted IS NOT NULL";

/// `WHERE` clause matching a [`Filter`]; binds `$1` to `$7`.
macro_rules! filter_sql {
    () => {
        "collection = $1 \
         AND ($2::BIGINT IS NULL OR id = $2) \
         AND ($3::TEXT IS NULL OR ack = $3) \
         AND ($4::BOOLEAN IS NULL OR (ack IS NOT NULL) = $4) \
         AND ($5::TIMESTAMPTZ IS NULL OR visible <= $5) \
         AND ($6::TIMESTAMPTZ IS NULL OR visible > $6) \
         AND ($7::BOOLEAN IS NULL OR (deleted IS NOT NULL) = $7)"
    };
}

/// Conditional update of the lowest matching id; binds `$8` to `$11` after
/// the filter.
macro_rules! update_sql {
    ($lock:literal) => {
        concat!(
            "UPDATE queue_jobs SET \
             tries = tries + $8, \
             ack = COALESCE($9, ack), \
             visible = COALESCE($10, visible), \
             deleted = COALESCE($11, deleted) \
             WHERE id = (SELECT id FROM queue_jobs WHERE ",
            filter_sql!(),
            " ORDER BY id LIMIT 1 ",
            $lock,
            ") RETURNING id, payload, visible, tries, ack, deleted"
        )
    };
}

const CLAIM: &str = update_sql!("FOR UPDATE SKIP LOCKED");
const UPDATE: &str = update_sql!("FOR UPDATE");
const COUNT: &str = concat!("SELECT COUNT(*) AS count FROM queue_jobs WHERE ", filter_sql!());

/// Bind a collection and [`FilterParams`] to `$1`..`$7`.
macro_rules! bind_filter {
    ($query:expr, $collection:expr, $params:expr) => {{
        let params: FilterParams = $params;
        $query
            .bind::<Text, _>($collection.to_owned())
            .bind::<Nullable<BigInt>, _>(params.id)
            .bind::<Nullable<Text>, _>(params.ack)
            .bind::<Nullable<Bool>, _>(params.has_ack)
            .bind::<Nullable<Timestamptz>, _>(params.visible_at_or_before)
            .bind::<Nullable<Timestamptz>, _>(params.visible_after)
            .bind::<Nullable<Bool>, _>(params.deleted)
    }};
}

struct FilterParams {
    id: Option<i64>,
    ack: Option<String>,
    has_ack: Option<bool>,
    visible_at_or_before: Option<DateTime<Utc>>,
    visible_after: Option<DateTime<Utc>>,
    deleted: Option<bool>,
}

impl TryFrom<&Filter> for FilterParams {
    type Error = PostgresStorageError;

    fn try_from(filter: &Filter) -> Result<Self, Self::Error> {
        let id = filter
            .id
            .map(|id| {
                i64::try_from(id.0).map_err(|_| {
                    PostgresStorageError::InvalidRow(format!("job id {id} exceeds BIGINT"))
                })
            })
            .transpose()?;
        Ok(Self {
            id,
            ack: filter.ack.as_ref().map(|ack| ack.as_str().to_owned()),
            has_ack: filter.has_ack,
            visible_at_or_before: filter.visible_at_or_before,
            visible_after: filter.visible_after,
            deleted: filter.deleted,
        })
    }
}

#[derive(QueryableByName)]
struct JobRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Jsonb)]
    payload: Value,
    #[diesel(sql_type = Timestamptz)]
    visible: DateTime<Utc>,
    #[diesel(sql_type = Integer)]
    tries: i32,
    #[diesel(sql_type = Nullable<Text>)]
    ack: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    deleted: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = PostgresStorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: job_id(row.id)?,
            payload: row.payload,
            visible: row.visible,
            tries: u32::try_from(row.tries).map_err(|_| {
                PostgresStorageError::InvalidRow(format!("negative tries on job {}", row.id))
            })?,
            ack: row.ack.map(AckToken::from),
            deleted: row.deleted,
        })
    }
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

fn job_id(id: i64) -> Result<JobId, PostgresStorageError> {
    u64::try_from(id)
        .map(JobId)
        .map_err(|_| PostgresStorageError::InvalidRow(format!("negative job id {id}")))
}

async fn insert_job(
    conn: &mut AsyncPgConnection,
    collection: &str,
    job: NewJob,
) -> Result<JobId, PostgresStorageError> {
    let tries = i32::try_from(job.tries)
        .map_err(|_| PostgresStorageError::InvalidRow(format!("tries {} exceed INTEGER", job.tries)))?;
    let row = sql_query(INSERT)
        .bind::<Text, _>(collection.to_owned())
        .bind::<Jsonb, _>(job.payload)
        .bind::<Timestamptz, _>(job.visible)
        .bind::<Integer, _>(tries)
        .get_result::<IdRow>(conn)
        .await?;
    job_id(row.id)
}

async fn update_first(
    conn: &mut AsyncPgConnection,
    collection: &str,
    filter: &Filter,
    update: &Update,
) -> Result<Option<JobRecord>, PostgresStorageError> {
    // Only claims skip locked rows; ack and ping wait so a busy row is not
    // mistaken for a lost claim.
    let sql = if update.increment_tries { CLAIM } else { UPDATE };
    let row = bind_filter!(sql_query(sql), collection, FilterParams::try_from(filter)?)
        .bind::<Integer, _>(i32::from(update.increment_tries))
        .bind::<Nullable<Text>, _>(update.ack.as_ref().map(|ack| ack.as_str().to_owned()))
        .bind::<Nullable<Timestamptz>, _>(update.visible)
        .bind::<Nullable<Timestamptz>, _>(update.deleted)
        .get_result::<JobRow>(conn)
        .await
        .optional()?;
    row.map(JobRecord::try_from).transpose()
}

/// Postgres-backed job storage.
///
/// Cloning shares the connection pool. Only clones count as the same store
/// for transactional dead-lettering; two storages built separately are
/// treated as different databases even if they point at the same one.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: Pool<AsyncPgConnection>,
    identity: Arc<()>,
}

impl PostgresStorage {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self {
            pool,
            identity: Arc::new(()),
        }
    }

    /// Build a pool of up to `max_connections` for `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresStorageError::Pool`] if the pool cannot be built.
    pub fn connect(database_url: &str, max_connections: usize) -> Result<Self, PostgresStorageError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| PostgresStorageError::Pool(e.to_string()))?;
        Ok(Self::new(pool))
    }

    async fn connection(&self) -> Result<Object<AsyncPgConnection>, PostgresStorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| PostgresStorageError::Pool(e.to_string()))
    }

    /// Delete every row marked deleted. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns the database or pool error.
    pub async fn purge_deleted(&self) -> Result<usize, PostgresStorageError> {
        let mut conn = self.connection().await?;
        let purged = sql_query(PURGE).execute(&mut *conn).await?;
        debug!(purged = purged, "Purged deleted jobs");
        Ok(purged)
    }
}

impl Storage for PostgresStorage {
    async fn ensure_indexes(&self, _collection: &str) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        for statement in [CREATE_TABLE, CREATE_VISIBLE_INDEX, CREATE_ACK_INDEX] {
            sql_query(statement)
                .execute(&mut *conn)
                .await
                .map_err(PostgresStorageError::from)?;
        }
        Ok(())
    }

    async fn insert(&self, collection: &str, job: NewJob) -> Result<JobId, StorageError> {
        let mut conn = self.connection().await?;
        Ok(insert_job(&mut *conn, collection, job).await?)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<JobRecord>, StorageError> {
        let mut conn = self.connection().await?;
        Ok(update_first(&mut *conn, collection, filter, update).await?)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let mut conn = self.connection().await?;
        let row = bind_filter!(sql_query(COUNT), collection, FilterParams::try_from(filter)?)
            .get_result::<CountRow>(&mut *conn)
            .await
            .map_err(PostgresStorageError::from)?;
        Ok(u64::try_from(row.count).unwrap_or(0))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.identity, &other.identity)
    }

    async fn apply_atomically(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        conn.transaction(|conn| {
            async move {
                for op in ops {
                    match op {
                        WriteOp::Insert { collection, job } => {
                            insert_job(conn, &collection, job).await?;
                        }
                        WriteOp::Update {
                            collection,
                            filter,
                            update,
                        } => {
                            if update_first(conn, &collection, &filter, &update)
                                .await?
                                .is_none()
                            {
                                return Err(PostgresStorageError::TransactionConflict {
                                    collection,
                                });
                            }
                        }
                    }
                }
                Ok::<(), PostgresStorageError>(())
            }
            .scope_boxed()
        })
        .await?;
        Ok(())
    }
}
