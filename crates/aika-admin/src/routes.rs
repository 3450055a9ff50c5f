use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AdminState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn not_found(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() })))
}

// --- stats ----------------------------------------------------------------

pub async fn stats_summary(State(state): State<AdminState>) -> ApiResult {
    let summary = state.stats.summary().map_err(internal)?;
    let memory = state.store.global_stats();
    Ok(Json(json!({ "stats": summary, "memory": memory })))
}

#[derive(Deserialize)]
pub struct DaysQuery {
    #[serde(default = "default_days")]
    days: usize,
}

fn default_days() -> usize {
    7
}

pub async fn stats_daily(
    State(state): State<AdminState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult {
    let daily = state.stats.daily(query.days).map_err(internal)?;
    Ok(Json(json!({ "daily": daily })))
}

// --- affection ------------------------------------------------------------

pub async fn affection_overview(State(state): State<AdminState>) -> ApiResult {
    let overview = state.affection.overview().map_err(internal)?;
    Ok(Json(serde_json::to_value(overview).map_err(internal)?))
}

#[derive(Deserialize)]
pub struct AffectionListQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    level: Option<i32>,
    keyword: Option<String>,
}

fn default_page() -> usize {
    1
}
fn default_page_size() -> usize {
    20
}

pub async fn affection_users(
    State(state): State<AdminState>,
    Query(query): Query<AffectionListQuery>,
) -> ApiResult {
    let page = state
        .affection
        .list_users(
            query.page,
            query.page_size,
            query.level,
            query.keyword.as_deref(),
        )
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(page).map_err(internal)?))
}

#[derive(Deserialize)]
pub struct SetScoreBody {
    user_id: String,
    score: f64,
}

pub async fn affection_set_score(
    State(state): State<AdminState>,
    Json(body): Json<SetScoreBody>,
) -> ApiResult {
    let info = state
        .affection
        .admin_set_score(&body.user_id, body.score)
        .map_err(not_found)?;
    Ok(Json(serde_json::to_value(info).map_err(internal)?))
}

// --- knowledge graph ------------------------------------------------------

pub async fn graph_stats(State(state): State<AdminState>) -> ApiResult {
    let stats = state.graph.stats().map_err(internal)?;
    Ok(Json(serde_json::to_value(stats).map_err(internal)?))
}

pub async fn graph_users(State(state): State<AdminState>) -> ApiResult {
    let users = state.graph.users().map_err(internal)?;
    Ok(Json(json!({ "users": users })))
}

#[derive(Deserialize)]
pub struct GraphDataQuery {
    user_id: Option<String>,
}

pub async fn graph_data(
    State(state): State<AdminState>,
    Query(query): Query<GraphDataQuery>,
) -> ApiResult {
    let (nodes, edges) = state
        .graph
        .graph_data(query.user_id.as_deref())
        .map_err(internal)?;
    Ok(Json(json!({ "nodes": nodes, "edges": edges })))
}

#[derive(Deserialize)]
pub struct GraphClearBody {
    /// Absent clears every user's graph.
    user_id: Option<String>,
}

pub async fn graph_clear(
    State(state): State<AdminState>,
    Json(body): Json<GraphClearBody>,
) -> ApiResult {
    let cleared = match body.user_id.as_deref() {
        Some(user_id) => state.graph.clear_user(user_id).map_err(internal)?,
        None => state.graph.clear_all().map_err(internal)?,
    };
    Ok(Json(json!({ "cleared_nodes": cleared })))
}

// --- blacklist ------------------------------------------------------------

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

pub async fn blacklist_list(
    State(state): State<AdminState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let page = state
        .blacklist
        .list_active(query.page, query.page_size)
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(page).map_err(internal)?))
}

pub async fn blacklist_stats(State(state): State<AdminState>) -> ApiResult {
    let stats = state.blacklist.stats().map_err(internal)?;
    Ok(Json(serde_json::to_value(stats).map_err(internal)?))
}

#[derive(Deserialize)]
pub struct BanBody {
    user_id: String,
    #[serde(default = "default_ban_minutes")]
    minutes: i64,
    reason: Option<String>,
}

fn default_ban_minutes() -> i64 {
    30
}

pub async fn ban_user(State(state): State<AdminState>, Json(body): Json<BanBody>) -> ApiResult {
    let info = state
        .blacklist
        .ban(&body.user_id, body.minutes, body.reason.as_deref(), "admin_api")
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(info).map_err(internal)?))
}

#[derive(Deserialize)]
pub struct UnbanBody {
    user_id: String,
}

pub async fn unban_user(
    State(state): State<AdminState>,
    Json(body): Json<UnbanBody>,
) -> ApiResult {
    let removed = state.blacklist.unban(&body.user_id).map_err(internal)?;
    Ok(Json(json!({ "removed": removed })))
}

// --- database browsing ----------------------------------------------------

fn data_dir(state: &AdminState) -> std::path::PathBuf {
    std::path::PathBuf::from(&state.config.storage.data_dir)
}

fn bad_request(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn db_list(State(state): State<AdminState>) -> ApiResult {
    let databases = crate::browse::list_databases(&data_dir(&state));
    Ok(Json(json!({ "databases": databases })))
}

#[derive(Deserialize)]
pub struct DbPathQuery {
    path: String,
}

pub async fn db_tables(
    State(state): State<AdminState>,
    Query(query): Query<DbPathQuery>,
) -> ApiResult {
    let tables =
        crate::browse::list_tables(&data_dir(&state), &query.path).map_err(bad_request)?;
    Ok(Json(json!({ "tables": tables })))
}

#[derive(Deserialize)]
pub struct DbRowsQuery {
    path: String,
    table: String,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

pub async fn db_rows(
    State(state): State<AdminState>,
    Query(query): Query<DbRowsQuery>,
) -> ApiResult {
    let page = crate::browse::fetch_table_rows(
        &data_dir(&state),
        &query.path,
        &query.table,
        query.page,
        query.page_size,
    )
    .map_err(bad_request)?;
    Ok(Json(serde_json::to_value(page).map_err(internal)?))
}

#[derive(Deserialize)]
pub struct DbQueryBody {
    path: String,
    sql: String,
}

pub async fn db_query(
    State(state): State<AdminState>,
    Json(body): Json<DbQueryBody>,
) -> ApiResult {
    let result = crate::browse::run_select_query(&data_dir(&state), &body.path, &body.sql)
        .map_err(bad_request)?;
    Ok(Json(serde_json::to_value(result).map_err(internal)?))
}

// --- memory maintenance ---------------------------------------------------

#[derive(Deserialize)]
pub struct RebuildBody {
    user_id: String,
}

/// Force a private-index rebuild after GC has left the index stale.
pub async fn memory_rebuild(
    State(state): State<AdminState>,
    Json(body): Json<RebuildBody>,
) -> ApiResult {
    let vectors = state
        .store
        .rebuild_private_index(&body.user_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "user_id": body.user_id, "vectors": vectors })))
}
