//! HTTP API endpoints

mod error;

pub use error::ApiError;

use axum::{
    body::Bytes,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use fluxseries_core::query::ProcessOut;
use fluxseries_core::stats::StatsSnapshot;
use fluxseries_core::{now_key, validate_db_name, Changes, DatabaseInfo, SeriesEngine, SeriesError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Dump lines buffered ahead of a slow client
const DUMP_BUFFER: usize = 64;

/// Application state
pub type AppState = Arc<SeriesEngine>;

/// Create the API router
pub fn create_router(engine: AppState, log_access: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/", get(server_info))
        .route("/_all_dbs", get(list_databases))
        .route("/_debug/open", get(debug_open))
        .route("/_debug/vars", get(debug_vars))
        // Database management
        .route(
            "/:db",
            get(db_info)
                .put(create_database)
                .delete(delete_database)
                .post(new_document),
        )
        .route("/:db/_query", get(query))
        .route("/:db/_changes", get(changes))
        .route("/:db/_all", get(all_documents))
        .route("/:db/_dump", get(dump))
        .route("/:db/_bulks", delete(delete_bulk))
        .route("/:db/_bulk", delete(delete_bulk))
        .route("/:db/_compact", post(compact))
        // Documents
        .route(
            "/:db/:key",
            get(get_document).put(put_document).delete(delete_document),
        );

    let router = if log_access {
        router.layer(middleware::from_fn(access_log))
    } else {
        router
    };

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    info!("{} {} {}", method, uri, response.status().as_u16());
    response
}

/// Run a blocking engine call off the async runtime
async fn blocking<T, F>(engine: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&SeriesEngine) -> fluxseries_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

fn check_db(db: &str) -> Result<(), ApiError> {
    validate_db_name(db).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "illegal_database_name",
            e.to_string(),
        )
    })
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub fluxseries: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct NewDocParams {
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesParams {
    #[serde(default)]
    since: u64,
    limit: Option<usize>,
}

/// `_query` parameters; `ptr`, `reducer`, `f` and `fv` may repeat
#[derive(Debug, Default, PartialEq)]
pub struct QueryParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub group: u64,
    pub ptrs: Vec<String>,
    pub reducers: Vec<String>,
    pub filters: Vec<String>,
    pub filter_values: Vec<String>,
}

impl QueryParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, ApiError> {
        let mut params = QueryParams::default();
        for (k, v) in pairs {
            match k.as_str() {
                "from" => params.from = Some(v),
                "to" => params.to = Some(v),
                "group" => {
                    params.group = v.parse().map_err(|_| {
                        ApiError::bad_request(format!("invalid group {:?}", v))
                    })?
                }
                "ptr" => params.ptrs.push(v),
                "reducer" => params.reducers.push(v),
                "f" => params.filters.push(v),
                "fv" => params.filter_values.push(v),
                _ => {}
            }
        }
        if params.filters.len() != params.filter_values.len() {
            return Err(ApiError::bad_request(
                "each filter (f) needs a value (fv)".to_string(),
            ));
        }
        Ok(params)
    }
}

/// Query results keyed by bucket start in milliseconds, in bucket order
pub struct QueryResponse(pub Vec<ProcessOut>);

impl Serialize for QueryResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for out in &self.0 {
            map.serialize_entry(&out.key.to_string(), out)?;
        }
        map.end()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn server_info() -> Json<ServerInfo> {
    Json(ServerInfo {
        fluxseries: "Welcome",
        version: fluxseries_core::VERSION,
    })
}

async fn list_databases(State(engine): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    blocking(&engine, |e| e.list_databases()).await.map(Json)
}

async fn debug_open(State(engine): State<AppState>) -> Json<Vec<String>> {
    Json(engine.open_databases())
}

async fn debug_vars(State(engine): State<AppState>) -> Json<StatsSnapshot> {
    Json(engine.diagnostics())
}

async fn db_info(
    State(engine): State<AppState>,
    Path(db): Path<String>,
) -> Result<Json<DatabaseInfo>, ApiError> {
    check_db(&db)?;
    blocking(&engine, move |e| e.database_info(&db)).await.map(Json)
}

async fn create_database(
    State(engine): State<AppState>,
    Path(db): Path<String>,
) -> Result<Response, ApiError> {
    check_db(&db)?;
    let created = blocking(&engine, move |e| e.create_database(&db)).await?;
    if created {
        Ok((StatusCode::CREATED, Json(json!({"ok": true}))).into_response())
    } else {
        Err(ApiError::new(
            StatusCode::PRECONDITION_FAILED,
            "file_exists",
            "the database could not be created, the file already exists".to_string(),
        ))
    }
}

async fn delete_database(
    State(engine): State<AppState>,
    Path(db): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_db(&db)?;
    blocking(&engine, move |e| e.delete_database(&db)).await?;
    Ok(Json(json!({"ok": true})))
}

async fn new_document(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(params): Query<NewDocParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_db(&db)?;
    let key = params.ts.unwrap_or_else(now_key);
    let id = blocking(&engine, move |e| e.store_document(&db, &key, body)).await?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))))
}

async fn put_document(
    State(engine): State<AppState>,
    Path((db, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_db(&db)?;
    let id = blocking(&engine, move |e| e.store_document(&db, &key, body)).await?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))))
}

async fn get_document(
    State(engine): State<AppState>,
    Path((db, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    check_db(&db)?;
    let body = blocking(&engine, move |e| e.get_document(&db, &key)).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn delete_document(
    State(engine): State<AppState>,
    Path((db, key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    check_db(&db)?;
    blocking(&engine, move |e| e.delete_document(&db, &key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<QueryResponse>, ApiError> {
    check_db(&db)?;
    let params = QueryParams::from_pairs(pairs)?;

    let mut req = engine
        .query_request(&db, Duration::from_millis(params.group))
        .range(params.from, params.to);
    req.ptrs = params.ptrs;
    req.reducers = params.reducers;
    for (f, fv) in params.filters.into_iter().zip(params.filter_values) {
        req = req.filter(f, fv);
    }

    let mut outs = blocking(&engine, move |e| e.run_query(req)).await?;
    if let Some(pos) = outs.iter().position(|o| !o.is_ok()) {
        if let Some(err) = outs.swap_remove(pos).err {
            return Err(err.into());
        }
    }
    Ok(Json(QueryResponse(outs)))
}

async fn all_documents(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<BTreeMap<String, Value>>, ApiError> {
    check_db(&db)?;
    let docs = blocking(&engine, move |e| {
        e.all_documents(&db, params.from.as_deref(), params.to.as_deref(), params.limit)
    })
    .await?;
    Ok(Json(
        docs.into_iter()
            .map(|(k, body)| (k, serde_json::from_slice(&body).unwrap_or(Value::Null)))
            .collect(),
    ))
}

async fn changes(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<Changes>, ApiError> {
    check_db(&db)?;
    blocking(&engine, move |e| e.changes(&db, params.since, params.limit))
        .await
        .map(Json)
}

/// One line of a dump: `{"id": <key>, "doc": <body>}`
fn dump_line(id: &str, body: &[u8]) -> Bytes {
    let id = serde_json::to_string(id).unwrap_or_default();
    let mut line = Vec::with_capacity(id.len() + body.len() + 16);
    line.extend_from_slice(b"{\"id\":");
    line.extend_from_slice(id.as_bytes());
    line.extend_from_slice(b",\"doc\":");
    line.extend_from_slice(body);
    line.extend_from_slice(b"}\n");
    Bytes::from(line)
}

/// Stream every document in the range as newline-delimited JSON
async fn dump(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    check_db(&db)?;
    {
        let db = db.clone();
        blocking(&engine, move |e| e.database_info(&db)).await?;
    }

    let (tx, rx) = mpsc::channel::<Bytes>(DUMP_BUFFER);
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || {
        let result = engine.dump_documents(
            &db,
            params.from.as_deref(),
            params.to.as_deref(),
            |id, body| {
                tx.blocking_send(dump_line(id, &body))
                    .map_err(|_| SeriesError::Internal("dump client went away".into()))
            },
        );
        if let Err(e) = result {
            warn!("Dump of {} stopped: {}", db, e);
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, std::io::Error>(line), rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn delete_bulk(
    State(engine): State<AppState>,
    Path(db): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Value>, ApiError> {
    check_db(&db)?;
    let deleted = blocking(&engine, move |e| {
        e.delete_range(&db, params.from.as_deref(), params.to.as_deref())
    })
    .await?;
    Ok(Json(json!({"deleted": deleted})))
}

async fn compact(
    State(engine): State<AppState>,
    Path(db): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_db(&db)?;
    blocking(&engine, move |e| e.compact_database(&db)).await?;
    Ok(Json(json!({"ok": true})))
}
