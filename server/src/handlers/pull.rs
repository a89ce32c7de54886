//! Pull handler - serves stored updates to clients.

use super::clock_to_id;
use crate::db;
use crate::error::Result;
use docsync_engine::server::wire::{encode_bytes, PullQuery, PullResponse};
use sqlx::PgPool;

/// Default limit for pulled updates.
const DEFAULT_LIMIT: i64 = 100;

/// Maximum limit for pulled updates.
const MAX_LIMIT: i64 = 1000;

fn effective_limit(limit: Option<i64>) -> i64 {
    limit.map(|l| l.clamp(1, MAX_LIMIT)).unwrap_or(DEFAULT_LIMIT)
}

/// Updates of one document newer than `query.since`.
#[tracing::instrument(skip(pool))]
pub async fn handle_pull(pool: &PgPool, workspace_id: &str, doc_id: &str, query: PullQuery) -> Result<PullResponse> {
    let since = clock_to_id(query.since)?;
    let limit = effective_limit(query.limit);

    // Fetch one more than requested to check if there are more
    let mut stored = db::updates_since(pool, workspace_id, doc_id, since, limit + 1).await?;
    let has_more = stored.len() as i64 > limit;
    stored.truncate(limit as usize);

    let clock = stored.last().map(|update| update.id).unwrap_or(since) as u64;
    Ok(PullResponse {
        updates: stored.iter().map(|update| encode_bytes(&update.data)).collect(),
        clock,
        has_more,
    })
}
