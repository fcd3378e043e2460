use crate::config::Config;
use crate::diagnostics::{LoggingHook, spawn_sampler};
use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{StreamExt, TryStreamExt};
use hookdrive_core::{DriveError, DriveFs, EndpointStats, Manager, OpenMode, Result, VirtualFs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub fs: Arc<dyn DriveFs>,
    pub manager: Arc<Manager>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(status: StatusCode, data: T) -> Response {
        let resp = ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        };
        (status, axum::Json(resp)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    length: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    chunk_size: usize,
    endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Drive(#[from] DriveError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Drive(error) => match error {
                DriveError::NotFound(_) => StatusCode::NOT_FOUND,
                DriveError::AlreadyExists(_)
                | DriveError::DirectoryNotEmpty(_)
                | DriveError::Conflict(_) => StatusCode::CONFLICT,
                DriveError::NotADirectory(_)
                | DriveError::IsADirectory(_)
                | DriveError::InvalidPath(_)
                | DriveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                DriveError::NoHealthyEndpoint => StatusCode::SERVICE_UNAVAILABLE,
                DriveError::Io(_) | DriveError::Upload(_) | DriveError::Download(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }
        let resp = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.to_string()),
        };
        (status, axum::Json(resp)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

pub async fn run_server(config: Config) -> Result<()> {
    let manager = Arc::new(config.build_manager()?);
    let meta = config.build_metadata_store()?;
    let fs: Arc<dyn DriveFs> = Arc::new(VirtualFs::new(manager.clone(), meta));

    if config.diagnostics.enabled {
        let period = Duration::from_secs(config.diagnostics.interval_secs.max(1));
        spawn_sampler(manager.clone(), Arc::new(LoggingHook), period);
    }

    let state = Arc::new(ServerState { fs, manager });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr).await?;
    tracing::info!("Server listening on {}", config.http.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/files/*path", get(get_file).put(put_file).delete(delete_file))
        .route("/dirs", get(list_root))
        .route("/dirs/*path", get(list_dir).post(make_dir).delete(remove_dir))
        .route("/rename", post(rename))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok",
        chunk_size: state.manager.chunk_size(),
        endpoints: state.manager.endpoint_stats(),
    };
    ApiResponse::ok(StatusCode::OK, response)
}

async fn get_file(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult {
    let offset = query.offset.unwrap_or(0);
    let length = query.length.unwrap_or(u64::MAX);

    let handle = state.fs.open(&path, OpenMode::Read).await?;
    let stream = state.fs.read(&handle, offset, length).await?;
    state.fs.close(handle).await?;

    let content_length = stream.length();
    let body_stream =
        stream.map(|result| result.map_err(|e| std::io::Error::other(e.to_string())));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, content_length.to_string()),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}

async fn put_file(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    body: Body,
) -> ApiResult {
    let body_with_io_error = body
        .into_data_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));
    let reader = StreamReader::new(body_with_io_error);

    let info = state.fs.write_all(&path, Box::new(reader)).await?;
    Ok(ApiResponse::ok(StatusCode::CREATED, info))
}

async fn delete_file(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> ApiResult {
    state.fs.remove(&path).await?;
    Ok(ApiResponse::ok(StatusCode::OK, path))
}

async fn list_root(State(state): State<Arc<ServerState>>) -> ApiResult {
    let entries = state.fs.list("/").await?;
    Ok(ApiResponse::ok(StatusCode::OK, entries))
}

async fn list_dir(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> ApiResult {
    let entries = state.fs.list(&path).await?;
    Ok(ApiResponse::ok(StatusCode::OK, entries))
}

async fn make_dir(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> ApiResult {
    let info = state.fs.mkdir(&path).await?;
    Ok(ApiResponse::ok(StatusCode::CREATED, info))
}

async fn remove_dir(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> ApiResult {
    state.fs.rmdir(&path).await?;
    Ok(ApiResponse::ok(StatusCode::OK, path))
}

async fn rename(
    State(state): State<Arc<ServerState>>,
    axum::Json(request): axum::Json<RenameRequest>,
) -> ApiResult {
    state.fs.rename(&request.from, &request.to).await?;
    Ok(ApiResponse::ok(StatusCode::OK, request.to))
}
