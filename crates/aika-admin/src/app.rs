use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use aika_affection::AffectionService;
use aika_core::config::AikaConfig;
use aika_graph::GraphStore;
use aika_guard::TempBlacklist;
use aika_memory::VectorStore;
use aika_stats::StatsService;

use crate::auth::require_token;
use crate::routes;

#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<AikaConfig>,
    pub stats: Arc<StatsService>,
    pub affection: Arc<AffectionService>,
    pub graph: Arc<GraphStore>,
    pub blacklist: Arc<TempBlacklist>,
    pub store: Arc<VectorStore>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/stats", get(routes::stats_summary))
        .route("/api/stats/daily", get(routes::stats_daily))
        .route("/api/affection/overview", get(routes::affection_overview))
        .route("/api/affection/users", get(routes::affection_users))
        .route("/api/affection/score", post(routes::affection_set_score))
        .route("/api/graph/stats", get(routes::graph_stats))
        .route("/api/graph/users", get(routes::graph_users))
        .route("/api/graph/data", get(routes::graph_data))
        .route("/api/graph/clear", post(routes::graph_clear))
        .route("/api/blacklist", get(routes::blacklist_list))
        .route("/api/blacklist/stats", get(routes::blacklist_stats))
        .route("/api/ban", post(routes::ban_user))
        .route("/api/unban", post(routes::unban_user))
        .route("/api/memory/rebuild", post(routes::memory_rebuild))
        .route("/api/db", get(routes::db_list))
        .route("/api/db/tables", get(routes::db_tables))
        .route("/api/db/rows", get(routes::db_rows))
        .route("/api/db/query", post(routes::db_query))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits. Spawned by the composition root.
pub async fn serve(state: AdminState) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.config.admin.bind, state.config.admin.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "admin surface listening");
    axum::serve(listener, router(state)).await
}
