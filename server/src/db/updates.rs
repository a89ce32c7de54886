//! Queries on the `doc_updates` table.
//!
//! Every accepted update is one row; its `id` is the server clock handed to
//! clients. Identical bytes for the same document are stored once, keyed by
//! `md5(data)`.

use sqlx::{PgPool, Row};

/// A stored update row.
#[derive(Debug)]
pub struct StoredUpdate {
    pub id: i64,
    pub doc_id: String,
    pub data: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredUpdate {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredUpdate {
            id: row.try_get("id")?,
            doc_id: row.try_get("doc_id")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Outcome of [`insert_update`].
#[derive(Debug)]
pub struct Inserted {
    pub update: StoredUpdate,
    /// False when identical bytes were already stored
    pub accepted: bool,
}

/// Find an identical update already stored for the document.
pub async fn find_update(
    pool: &PgPool,
    workspace_id: &str,
    doc_id: &str,
    data: &[u8],
) -> Result<Option<StoredUpdate>, sqlx::Error> {
    sqlx::query_as::<_, StoredUpdate>(
        r#"
        SELECT id, doc_id, data, created_at
        FROM doc_updates
        WHERE workspace_id = $1 AND doc_id = $2 AND digest = md5($3)
        "#,
    )
    .bind(workspace_id)
    .bind(doc_id)
    .bind(data)
    .fetch_optional(pool)
    .await
}

/// Store an update unless identical bytes are already stored.
pub async fn insert_update(
    pool: &PgPool,
    workspace_id: &str,
    doc_id: &str,
    data: &[u8],
) -> Result<Inserted, sqlx::Error> {
    if let Some(update) = find_update(pool, workspace_id, doc_id, data).await? {
        return Ok(Inserted {
            update,
            accepted: false,
        });
    }

    let inserted = sqlx::query_as::<_, StoredUpdate>(
        r#"
        INSERT INTO doc_updates (workspace_id, doc_id, digest, data)
        VALUES ($1, $2, md5($3), $3)
        RETURNING id, doc_id, data, created_at
        "#,
    )
    .bind(workspace_id)
    .bind(doc_id)
    .bind(data)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(update) => Ok(Inserted {
            update,
            accepted: true,
        }),
        // a concurrent push stored the same bytes first
        Err(err) if is_unique_violation(&err) => {
            let update = find_update(pool, workspace_id, doc_id, data)
                .await?
                .ok_or(err)?;
            Ok(Inserted {
                update,
                accepted: false,
            })
        }
        Err(err) => Err(err),
    }
}

/// Updates of a document newer than `since`, in clock order.
pub async fn updates_since(
    pool: &PgPool,
    workspace_id: &str,
    doc_id: &str,
    since: i64,
    limit: i64,
) -> Result<Vec<StoredUpdate>, sqlx::Error> {
    sqlx::query_as::<_, StoredUpdate>(
        r#"
        SELECT id, doc_id, data, created_at
        FROM doc_updates
        WHERE workspace_id = $1 AND doc_id = $2 AND id > $3
        ORDER BY id ASC
        LIMIT $4
        "#,
    )
    .bind(workspace_id)
    .bind(doc_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Latest clock of every document in the workspace that changed after `after`.
pub async fn doc_clocks(pool: &PgPool, workspace_id: &str, after: i64) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT doc_id, MAX(id) AS clock
        FROM doc_updates
        WHERE workspace_id = $1
        GROUP BY doc_id
        HAVING MAX(id) > $2
        "#,
    )
    .bind(workspace_id)
    .bind(after)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| Ok((row.try_get("doc_id")?, row.try_get("clock")?)))
        .collect()
}

/// Check if a SQL error is a unique constraint violation.
fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        // PostgreSQL unique violation code is "23505"
        db_err.code().map(|c| c == "23505").unwrap_or(false)
    } else {
        false
    }
}
