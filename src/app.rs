use crate::annotation::{parse_id, Project, ProjectBundle, Video};
use crate::blob_store::{BlobStore, LocalBlobStore};
use crate::broker::{Broker, BrokerStatsSnapshot};
use crate::cache::ResultCache;
use crate::cancel::Cancellation;
use crate::decoder::{publish_decoder, DecoderArtifact, DecoderInfo};
use crate::embedding::EmbedService;
use crate::error::ServiceError;
use crate::worker::pool::WorkerPool;
use crate::worker::process::{start_embed_servers, EmbedServerConfig};
use crate::worker::real::HttpWorkerClient;
use crate::worker::CropRect;
use crate::AppState;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{prelude::*, Registry};
use tracing_tree::HierarchicalLayer;

/// An error response: `{"error_code": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    fn segmentation_disabled() -> Self {
        Self::bad_request(
            "ErrOnlineSegmentationDisabled",
            "online segmentation is disabled",
        )
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let (status, code) = match &e {
            ServiceError::NotFound => (StatusCode::NOT_FOUND, "ErrNotFound"),
            ServiceError::Conflict => (StatusCode::CONFLICT, "ErrConflict"),
            ServiceError::InvalidId(_) => {
                (StatusCode::BAD_REQUEST, "ErrInvalidId")
            }
            ServiceError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "ErrInvalidRequest")
            }
            ServiceError::Upstream(_) => (StatusCode::BAD_GATEWAY, "ErrUpstream"),
            ServiceError::Cancelled => {
                (StatusCode::REQUEST_TIMEOUT, "ErrCancelled")
            }
            ServiceError::DeadlineExceeded => {
                (StatusCode::REQUEST_TIMEOUT, "ErrDeadlineExceeded")
            }
            ServiceError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ErrInternal")
            }
        };
        if e.is_client_fault() {
            debug!("request rejected: {}", e);
        } else if e.is_cancellation() {
            info!("request gave up: {}", e);
        } else {
            error!("request failed: {}", e);
        }
        Self {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error_code": self.code, "message": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn request_cancellation(state: &AppState) -> Cancellation {
    Cancellation::child_of(&state.shutdown_token)
        .and_deadline(Instant::now() + state.request_timeout)
}

// Health check endpoint
#[instrument]
pub async fn health_check() -> &'static str {
    debug!("Health check requested");
    "OK"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    online_segmentation: bool,
    embed: Option<BrokerStatsSnapshot>,
    video_locks: usize,
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let embed = state.embed_service.as_ref().map(|s| s.broker().stats());
    Json(StatusResponse {
        online_segmentation: embed.is_some(),
        embed,
        video_locks: state.annotations.locks().len(),
    })
}

#[derive(Debug, Deserialize)]
struct CreateProjectReq {
    #[serde(default)]
    name: String,
    #[serde(default)]
    remark: String,
    spec_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateProjectReq {
    #[serde(default)]
    name: String,
    #[serde(default)]
    remark: String,
}

#[derive(Debug, Serialize)]
struct ProjectList {
    projects: Vec<Project>,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectReq>,
) -> ApiResult<Project> {
    let project = state
        .annotations
        .create_project(&req.name, &req.remark, req.spec_json)
        .await?;
    Ok(Json(project))
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> ApiResult<ProjectList> {
    let projects = state.annotations.list_projects().await?;
    Ok(Json(ProjectList { projects }))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Project> {
    let project = state.annotations.get_project(parse_id(&id)?).await?;
    Ok(Json(project))
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectReq>,
) -> ApiResult<Project> {
    let project = state
        .annotations
        .update_project(parse_id(&id)?, &req.name, &req.remark)
        .await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Project> {
    let project = state.annotations.delete_project(parse_id(&id)?).await?;
    Ok(Json(project))
}

#[instrument(skip(state, bundle))]
async fn import_project(
    State(state): State<Arc<AppState>>,
    Json(bundle): Json<ProjectBundle>,
) -> ApiResult<Project> {
    let project = state.annotations.import_project(bundle).await?;
    Ok(Json(project))
}

async fn export_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ProjectBundle> {
    let bundle = state.annotations.export_project(parse_id(&id)?).await?;
    Ok(Json(bundle))
}

#[derive(Debug, Deserialize)]
struct CreateVideoReq {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    frame_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateVideoReq {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct VideoList {
    videos: Vec<Video>,
}

async fn list_videos(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<VideoList> {
    let videos = state
        .annotations
        .list_videos(parse_id(&project_id)?)
        .await?;
    Ok(Json(VideoList { videos }))
}

async fn create_video(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVideoReq>,
) -> ApiResult<Video> {
    let video = state
        .annotations
        .create_video(parse_id(&req.project_id)?, &req.name, req.frame_urls)
        .await?;
    Ok(Json(video))
}

async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Video> {
    let video = state.annotations.get_video(parse_id(&id)?).await?;
    Ok(Json(video))
}

async fn update_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateVideoReq>,
) -> ApiResult<Video> {
    let video = state
        .annotations
        .update_video(parse_id(&id)?, &req.name)
        .await?;
    Ok(Json(video))
}

async fn delete_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Video> {
    let video = state.annotations.delete_video(parse_id(&id)?).await?;
    Ok(Json(video))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnotationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_json: Option<String>,
    pub annotation_version: String,
}

#[derive(Debug, Deserialize)]
struct PatchAnnotationReq {
    #[serde(default)]
    json_merge_patch: String,
    #[serde(default)]
    annotation_version: String,
}

#[derive(Debug, Serialize)]
struct PatchAnnotationResponse {
    annotation_version: String,
}

async fn get_annotation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AnnotationResponse> {
    let (annotation_json, annotation_version) =
        state.annotations.get_annotation(parse_id(&id)?).await?;
    Ok(Json(AnnotationResponse {
        annotation_json,
        annotation_version,
    }))
}

#[instrument(skip(state, req))]
async fn patch_annotation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PatchAnnotationReq>,
) -> ApiResult<PatchAnnotationResponse> {
    if req.json_merge_patch.is_empty() {
        return Err(ApiError::bad_request(
            "ErrMissingJsonPatch",
            "missing json merge patch",
        ));
    }
    let cancel = request_cancellation(&state);
    let annotation_version = state
        .annotations
        .patch_annotation(
            parse_id(&id)?,
            &req.json_merge_patch,
            &req.annotation_version,
            &cancel,
        )
        .await?;
    Ok(Json(PatchAnnotationResponse { annotation_version }))
}

#[derive(Debug, Serialize, Default)]
struct OnlineSegmentationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    decoder: Option<DecoderInfo>,
}

async fn get_online_segmentation(
    State(state): State<Arc<AppState>>,
) -> ApiResult<OnlineSegmentationResponse> {
    let Some(service) = &state.embed_service else {
        return Ok(Json(OnlineSegmentationResponse::default()));
    };
    let decoder =
        publish_decoder(state.public_store.as_ref(), service.decoder()).await?;
    Ok(Json(OnlineSegmentationResponse {
        decoder: Some(decoder),
    }))
}

#[derive(Debug, Deserialize)]
struct EmbeddingQuery {
    image_url: Option<String>,
    decoder_uuid: Option<String>,
    crop_x: Option<i64>,
    crop_y: Option<i64>,
    crop_width: Option<i64>,
    crop_height: Option<i64>,
}

impl EmbeddingQuery {
    fn crop(&self) -> std::result::Result<Option<CropRect>, ApiError> {
        let parts = [self.crop_x, self.crop_y, self.crop_width, self.crop_height];
        let mut values = [0u32; 4];
        for (value, part) in values.iter_mut().zip(parts) {
            let raw = part.unwrap_or(0);
            *value = u32::try_from(raw).map_err(|_| {
                ApiError::bad_request("ErrInvalidRequest", "invalid crop")
            })?;
        }
        Ok(CropRect::new(values[0], values[1], values[2], values[3]))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding_url: String,
}

#[instrument(skip(state))]
async fn get_embedding(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmbeddingQuery>,
) -> ApiResult<EmbeddingResponse> {
    let Some(service) = &state.embed_service else {
        return Err(ApiError::segmentation_disabled());
    };
    let decoder_uuid = query
        .decoder_uuid
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("ErrInvalidRequest", "missing decoder uuid")
        })?;
    let image_url = query
        .image_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("ErrInvalidRequest", "missing image url")
        })?;
    let crop = query.crop()?;

    let cancel = request_cancellation(&state);
    let embedding_url = service
        .embed_url(image_url, decoder_uuid, crop, &cancel)
        .await?;
    Ok(Json(EmbeddingResponse { embedding_url }))
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/api/projects/import", axum::routing::post(import_project))
        .route("/api/projects/{id}/export", get(export_project))
        .route("/api/projects/{id}/videos", get(list_videos))
        .route("/api/videos", axum::routing::post(create_video))
        .route(
            "/api/videos/{id}",
            get(get_video).put(update_video).delete(delete_video),
        )
        .route(
            "/api/videos/{id}/annotation",
            get(get_annotation).patch(patch_annotation),
        )
        .route("/api/online_segmentation", get(get_online_segmentation))
        .route("/api/online_segmentation/embedding", get(get_embedding))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the annotation database
    #[arg(long, env = "VIDANNO_DB", default_value = "data/vidanno.db")]
    db: String,

    /// Port to listen on
    #[arg(long, default_value_t = 12346)]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Directory backing the public store
    #[arg(long, env = "VIDANNO_PUBLIC_DIR", default_value = "data/public")]
    public_dir: PathBuf,

    /// URL prefix under which the public dir is served
    #[arg(long, default_value = "/public/")]
    public_url_prefix: String,

    /// Directory that data:// image URLs resolve against
    #[arg(long, env = "VIDANNO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable online segmentation (embedding workers)
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    enable_segmentation: bool,

    /// Devices to start one embed server on each; integers mean GPUs
    #[arg(long, value_delimiter = ',', default_value = "cpu")]
    devices: Vec<String>,

    #[arg(long, env = "VIDANNO_PYTHON", default_value = "python3")]
    python_bin: String,

    /// Script that serves embeddings over HTTP
    #[arg(long, default_value = "python/embed_server.py")]
    embed_script: PathBuf,

    #[arg(long, default_value = "vit_h")]
    encoder_type: String,

    #[arg(long)]
    encoder_checkpoint: Option<PathBuf>,

    /// ONNX decoder paired with the encoder
    #[arg(long)]
    decoder_path: Option<PathBuf>,

    /// Script that prepares decoder inputs in the browser
    #[arg(long)]
    decoder_feed_js: Option<PathBuf>,

    /// Per-request deadline
    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,

    /// Idle per-video locks kept around
    #[arg(long, default_value_t = crate::DEFAULT_LOCK_CAPACITY)]
    lock_capacity: usize,

    #[arg(long, default_value_t = 60)]
    temp_lifespan_secs: u64,

    #[arg(long, default_value_t = 60)]
    temp_sweep_interval_secs: u64,

    /// Seconds to wait for each embed server to accept connections
    #[arg(long, default_value_t = 300)]
    worker_startup_timeout_secs: u64,
}

async fn start_segmentation(
    args: &Args,
    public_store: Arc<dyn BlobStore>,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Result<(Arc<EmbedService>, Vec<tokio::task::JoinHandle<()>>)> {
    let checkpoint = args.encoder_checkpoint.clone().ok_or_else(|| {
        anyhow::anyhow!("--encoder-checkpoint is required with segmentation")
    })?;
    let decoder_path = args.decoder_path.as_deref().ok_or_else(|| {
        anyhow::anyhow!("--decoder-path is required with segmentation")
    })?;

    let decoder = DecoderArtifact::load(
        &args.encoder_type,
        decoder_path,
        args.decoder_feed_js.as_deref(),
    )
    .await?;

    let config = EmbedServerConfig {
        python_bin: args.python_bin.clone(),
        script: args.embed_script.clone(),
        encoder_type: args.encoder_type.clone(),
        encoder_checkpoint: checkpoint,
        startup_timeout: Duration::from_secs(args.worker_startup_timeout_secs),
    };
    let (slots, mut handles) = start_embed_servers(
        &config,
        &args.devices,
        Arc::new(HttpWorkerClient::new()),
        shutdown,
    )
    .await?;
    info!("Started {} embed servers", slots.len());

    let (broker, broker_handle) =
        Broker::start(Arc::new(WorkerPool::new(slots)), shutdown.clone());
    handles.push(broker_handle);

    let service = EmbedService::new(
        broker,
        ResultCache::new(public_store),
        Arc::new(decoder),
        args.data_dir.clone(),
    );
    Ok((Arc::new(service), handles))
}

pub async fn serve() -> Result<()> {
    // Initialize logging with tracing
    let subscriber = Registry::default()
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        );
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    info!("Starting vidanno service");

    info!("Opening annotation database at {}", args.db);
    let db_pool = crate::create_db_pool(&args.db)?;
    {
        let mut conn = db_pool.get()?;
        crate::init_db(&mut conn)?;
    }

    let shutdown = tokio_util::sync::CancellationToken::new();
    let local_store = Arc::new(LocalBlobStore::new(
        &args.public_dir,
        args.public_url_prefix.clone(),
    ));
    tokio::fs::create_dir_all(local_store.root()).await?;
    let mut handles = vec![local_store.clone().run_temp_sweeper(
        Duration::from_secs(args.temp_sweep_interval_secs),
        Duration::from_secs(args.temp_lifespan_secs),
        shutdown.clone(),
    )];
    let public_store: Arc<dyn BlobStore> = local_store;

    let embed_service = if args.enable_segmentation {
        let (service, worker_handles) =
            start_segmentation(&args, public_store.clone(), &shutdown).await?;
        handles.extend(worker_handles);
        Some(service)
    } else {
        info!("Online segmentation disabled");
        None
    };

    let state = crate::create_app_state(crate::AppConfig {
        db_pool,
        public_store,
        embed_service,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        lock_capacity: args.lock_capacity,
        shutdown_token: shutdown.clone(),
    });

    // Set up ctrl-c handler
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL-C, initiating shutdown");
            ctrl_c_token.cancel();
        }
    });

    let app = routes(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        error!("Server error: {}", e);
    }
    shutdown.cancel();

    info!("Waiting for background tasks to complete...");
    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            warn!("Background task timed out during shutdown");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_device_list() {
        let args = Args::try_parse_from([
            "vidanno_server",
            "--devices",
            "0,1,cpu",
            "--enable-segmentation",
            "true",
        ])
        .unwrap();
        assert_eq!(args.devices, vec!["0", "1", "cpu"]);
        assert!(args.enable_segmentation);
        assert_eq!(args.lock_capacity, crate::DEFAULT_LOCK_CAPACITY);
    }

    #[test]
    fn service_errors_map_to_statuses() {
        let cases = [
            (ServiceError::NotFound, StatusCode::NOT_FOUND),
            (ServiceError::Conflict, StatusCode::CONFLICT),
            (ServiceError::InvalidId("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (ServiceError::Cancelled, StatusCode::REQUEST_TIMEOUT),
            (ServiceError::DeadlineExceeded, StatusCode::REQUEST_TIMEOUT),
            (
                ServiceError::Internal(anyhow::anyhow!("x")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn negative_crop_is_rejected() {
        let query = EmbeddingQuery {
            image_url: None,
            decoder_uuid: None,
            crop_x: Some(-1),
            crop_y: None,
            crop_width: Some(2),
            crop_height: Some(2),
        };
        assert!(query.crop().is_err());

        let query = EmbeddingQuery {
            crop_x: Some(1),
            ..query
        };
        assert_eq!(query.crop().unwrap(), CropRect::new(1, 0, 2, 2));
    }
}
