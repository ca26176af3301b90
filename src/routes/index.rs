use crate::error::ApiError;
use crate::indexer::BatchIndexer;
use crate::models::IndexStats;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Serialize;

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatsResponse {
    #[serde(flatten)]
    pub stats: IndexStats,
    /// Documents buffered in memory and not yet written.
    pub batch_queue_size: usize,
}

/// Document count, on-disk size and category breakdown of the email index.
#[openapi(tag = "Index")]
#[get("/index/stats")]
pub async fn get_index_stats(
    indexer: &State<BatchIndexer>,
) -> Result<Json<IndexStatsResponse>, ApiError> {
    let stats = indexer.get_index_stats().await?;
    Ok(Json(IndexStatsResponse {
        stats,
        batch_queue_size: indexer.batch_queue_size(),
    }))
}
