use crate::backend::Lease;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::debug;

/// Advisory lock key shared by every process draining the same database.
pub const DEFAULT_LEASE_KEY: i64 = 0x7072_6576_6965_7773;

/// [`Lease`] backed by a PostgreSQL session level advisory lock.
///
/// The lock lives on a dedicated pooled connection for as long as the lease
/// is held, so it is released by the server if the process dies.
#[derive(Debug)]
pub struct AdvisoryLease {
    pool: PgPool,
    key: i64,
    connection: Mutex<Option<PoolConnection<Postgres>>>,
}

impl AdvisoryLease {
    /// A lease on [`DEFAULT_LEASE_KEY`].
    pub fn new(pool: PgPool) -> Self {
        Self::with_key(pool, DEFAULT_LEASE_KEY)
    }

    /// A lease on an arbitrary advisory lock key.
    pub fn with_key(pool: PgPool, key: i64) -> Self {
        Self {
            pool,
            key,
            connection: Mutex::new(None),
        }
    }
}

impl Lease for AdvisoryLease {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let mut held = self.connection.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        let mut connection = self.pool.acquire().await?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *connection)
            .await?;

        if acquired {
            debug!(key = self.key, "Acquired run lease");
            *held = Some(connection);
        }
        Ok(acquired)
    }

    async fn release(&self) -> anyhow::Result<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *connection)
            .await?;
        debug!(key = self.key, "Released run lease");
        Ok(())
    }
}
