use sqlx::PgPool;
use std::sync::Arc;

use crate::services::pipeline::DistributedPipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DistributedPipeline>,
    /// Present when results are persisted to PostgreSQL.
    pub db: Option<PgPool>,
}

impl AppState {
    pub fn new(pipeline: Arc<DistributedPipeline>, db: Option<PgPool>) -> Self {
        Self { pipeline, db }
    }
}
