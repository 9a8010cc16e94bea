use crate::schema::QueueEntry;
use sqlx::{PgPool, Postgres, Transaction};

/// Run the pending migrations of the `preview_generation` table.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Inserts a row unless one for the same owner and file exists already.
///
/// The check and the insert are one statement but not exclusive: two
/// concurrent producers may still both insert.
pub(crate) async fn enqueue(
    pool: &PgPool,
    uid: &str,
    file_id: i64,
    queued_at: Option<i64>,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO preview_generation (uid, file_id, queued_at)
        SELECT $1, $2, $3
        WHERE NOT EXISTS (
            SELECT 1 FROM preview_generation
            WHERE uid = $1 AND file_id = $2
        )
        RETURNING id
        ",
    )
    .bind(uid)
    .bind(file_id)
    .bind(queued_at)
    .fetch_optional(pool)
    .await
}

/// Finds the oldest row not locked by another transaction.
pub(crate) async fn find_oldest_unlocked_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<QueueEntry>, sqlx::Error> {
    sqlx::query_as::<_, QueueEntry>(
        r"
        SELECT id, uid, file_id, queued_at
        FROM preview_generation
        ORDER BY id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    )
    .fetch_optional(&mut **tx)
    .await
}

pub(crate) async fn delete_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM preview_generation WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Selects and deletes the oldest row in one transaction.
pub(crate) async fn claim_oldest(pool: &PgPool) -> Result<Option<QueueEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let entry = find_oldest_unlocked_entry_tx(&mut tx).await?;
    match &entry {
        Some(entry) => {
            delete_entry_tx(&mut tx, entry.id).await?;
            tx.commit().await?;
        }
        None => tx.rollback().await?,
    }

    Ok(entry)
}

/// Rows enqueued at or before `threshold`, or all rows without a threshold.
///
/// Rows without an enqueue time only count towards the total.
pub(crate) async fn count_queued_before(
    pool: &PgPool,
    threshold: Option<i64>,
) -> Result<i64, sqlx::Error> {
    match threshold {
        Some(threshold) => {
            sqlx::query_scalar::<_, i64>(
                r"
                SELECT COUNT(*) FROM preview_generation
                WHERE queued_at IS NOT NULL AND queued_at <= $1
                ",
            )
            .bind(threshold)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM preview_generation")
                .fetch_one(pool)
                .await
        }
    }
}

pub(crate) async fn file_is_queued(pool: &PgPool, file_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM preview_generation WHERE file_id = $1)",
    )
    .bind(file_id)
    .fetch_one(pool)
    .await
}

/// Deletes every row of `file_id`, whichever account queued it.
pub(crate) async fn delete_file_entries(pool: &PgPool, file_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM preview_generation WHERE file_id = $1")
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
