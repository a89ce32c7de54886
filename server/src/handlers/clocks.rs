//! Clock handler - which documents changed since a workspace clock.

use super::clock_to_id;
use crate::db;
use crate::error::Result;
use docsync_engine::server::wire::{ClocksQuery, ClocksResponse};
use sqlx::PgPool;

#[tracing::instrument(skip(pool))]
pub async fn handle_clocks(pool: &PgPool, workspace_id: &str, query: ClocksQuery) -> Result<ClocksResponse> {
    let after = clock_to_id(query.after)?;
    let clocks = db::doc_clocks(pool, workspace_id, after)
        .await?
        .into_iter()
        .map(|(doc_id, clock)| (doc_id, clock as u64))
        .collect();
    Ok(ClocksResponse { clocks })
}
