use axum::{
    extract::{
        multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::DateTime;
use image::DynamicImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::constants::{
    generate_record_id, unix_now, DEFAULT_DEVICE_ID, DEFAULT_PAGE_LIMIT, MANUAL_DEVICE_ID,
};
use crate::db::{self, DynError, MigrationOutcome};
use crate::detect::{build_detector, DetectionAdapter, ThresholdPolicy};
use crate::error::{AppError, Result};
use crate::record::{Detection, DetectionRecord};
use crate::render::{to_data_uri, Renderer};
use crate::store::RecordStore;

/// Numbered variants tried before an upload is refused for lack of a free name
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Shared state for request handlers
pub struct AppState {
    pub store: RecordStore,
    pub adapter: DetectionAdapter,
    pub renderer: Renderer,
    pub upload_dir: PathBuf,
    pub model_name: String,
    pub camera_prefix: String,
    pub public_base_url: Option<String>,
}

/// Run the HTTP service until it fails (for serve command)
pub fn serve(config: ServerConfig) -> std::result::Result<(), DynError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        std::fs::create_dir_all(&config.upload_dir).map_err(|e| {
            format!(
                "Failed to create upload directory '{}': {}",
                config.upload_dir.display(),
                e
            )
        })?;

        let pool = db::open_database(&config.database).await?;
        log_migration(&db::migrate(&pool).await?);

        let detector = build_detector(&config.detector)?;
        let adapter = DetectionAdapter::new(
            detector,
            ThresholdPolicy {
                loose: config.detector.loose_threshold,
                strict: config.detector.strict_threshold,
            },
        );

        let app_state = Arc::new(AppState {
            store: RecordStore::new(pool),
            adapter,
            renderer: Renderer::from_config(&config.render),
            upload_dir: config.upload_dir.clone(),
            model_name: config.model_name(),
            camera_prefix: config.camera_prefix.clone(),
            public_base_url: config.public_base_url.clone(),
        });

        let app = build_router(app_state, config.max_upload_bytes);

        let bind_addr = format!("{}:{}", config.host, config.port);
        println!("Database: {}", config.database.display());
        println!("Upload directory: {}", config.upload_dir.display());
        println!("Model: {}", config.model_name());
        println!(
            "Thresholds: loose {:.2}, strict {:.2}",
            config.detector.loose_threshold, config.detector.strict_threshold
        );
        println!("Listening on: http://{}", bind_addr);
        println!("Endpoints:");
        println!("  POST /upload             - JSON {{device_id, timestamp, image(base64)}}");
        println!("  POST /upload-file        - multipart form with field 'file'");
        println!("  GET  /latest             - latest annotated image (JPEG)");
        println!("  GET  /result             - latest record as JSON");
        println!("  GET  /results?limit=&offset=  - records page, newest first");
        println!("  GET  /latest-detection   - latest record with source and datetime");
        println!("  GET  /uploads/{{filename}} - stored source image");
        println!("  GET  /health             - service status");

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("Failed to bind to {}: {}", bind_addr, e))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), DynError>(())
    })
}

/// Report a migration outcome at the appropriate level
pub fn log_migration(outcome: &MigrationOutcome) {
    match outcome {
        MigrationOutcome::Created => info!("Created new database schema"),
        MigrationOutcome::UpToDate => info!("Database schema is up to date"),
        MigrationOutcome::Migrated { records, rows } => {
            info!("Migrated {} legacy records ({} detection rows)", records, rows)
        }
        MigrationOutcome::FreshStart {
            reason,
            backup_table,
        } => warn!(
            "Legacy data could not be migrated ({}); kept in '{}', starting empty",
            reason, backup_table
        ),
    }
}

/// Routes of the service with permissive CORS and a request body limit
pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload", post(upload_handler))
        .route("/upload-file", post(upload_file_handler))
        .route("/latest", get(latest_image_handler))
        .route("/result", get(result_handler))
        .route("/results", get(results_handler))
        .route("/latest-detection", get(latest_detection_handler))
        .route("/health", get(health_handler))
        .route("/uploads/{*filename}", get(uploaded_file_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub id: String,
    pub file: String,
    pub pred: Vec<Detection>,
    pub image_with_boxes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    pub id: String,
    pub device_id: String,
    pub timestamp: i64,
    pub file: String,
    pub pred: Vec<Detection>,
    pub image_url: String,
}

impl RecordResponse {
    fn from_record(record: DetectionRecord, base_url: &str) -> Self {
        Self {
            image_url: image_url(base_url, &record.file),
            id: record.id,
            device_id: record.device_id,
            timestamp: record.captured_at,
            file: record.file,
            pred: record.detections,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsPage {
    pub items: Vec<RecordResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LatestDetectionResponse {
    pub id: String,
    pub device_id: String,
    pub source: String,
    pub timestamp: i64,
    pub datetime: Option<String>,
    pub file: String,
    pub image_url: String,
    pub pred: Vec<Detection>,
    pub total_detections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub timestamp: i64,
    pub records: i64,
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimestampValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TimestampValue {
    fn to_seconds(&self) -> Result<i64> {
        match self {
            TimestampValue::Integer(v) => Ok(*v),
            TimestampValue::Float(v) if v.is_finite() => Ok(v.trunc() as i64),
            TimestampValue::Float(v) => {
                Err(AppError::BadRequest(format!("Invalid timestamp: {}", v)))
            }
            TimestampValue::Text(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    return Ok(v);
                }
                match s.parse::<f64>() {
                    Ok(v) if v.is_finite() => Ok(v.trunc() as i64),
                    _ => Err(AppError::BadRequest(format!("Invalid timestamp: '{}'", s))),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadPayload {
    device_id: Option<String>,
    timestamp: Option<TimestampValue>,
    image: Option<String>,
}

/// Decode a base64 image, accepting an optional `data:<mime>;base64,` header
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>> {
    let encoded = encoded.trim();
    let payload = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| AppError::BadRequest("Malformed data URI".to_string()))?,
        None => encoded,
    };

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| AppError::BadRequest("Invalid base64 image data".to_string()))?;

    if bytes.is_empty() {
        return Err(AppError::BadRequest("Image data is empty".to_string()));
    }
    Ok(bytes)
}

/// Reduce a client-supplied name to a single safe path component
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload.jpg".to_string()
    } else {
        cleaned.to_string()
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<UploadResponse>> {
    let payload: UploadPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;

    let encoded = payload
        .image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("No image provided".to_string()))?;
    let image_bytes = decode_base64_image(&encoded)?;

    let device_id = payload
        .device_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
    let captured_at = match payload.timestamp {
        Some(ts) => ts.to_seconds()?,
        None => unix_now(),
    };

    let filename = format!("{}_{}.jpg", sanitize_filename(&device_id), captured_at);
    ingest(&state, &device_id, captured_at, filename, image_bytes).await
}

async fn upload_file_handler(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    let mut multipart =
        multipart.map_err(|_| AppError::BadRequest("No file uploaded".to_string()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original = field.file_name().unwrap_or_default().to_string();
        if original.trim().is_empty() {
            return Err(AppError::BadRequest("Empty filename".to_string()));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;
        if data.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
        }

        let captured_at = unix_now();
        let filename = format!("manual_{}_{}", captured_at, sanitize_filename(&original));
        return ingest(&state, MANUAL_DEVICE_ID, captured_at, filename, data.to_vec()).await;
    }

    Err(AppError::BadRequest("No file uploaded".to_string()))
}

/// `name` with `_{n}` inserted before its extension; `n = 0` leaves it unchanged
pub fn numbered_filename(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", name, n),
    }
}

/// Write `bytes` to a file under `dir` that did not exist before
///
/// Existing files are never replaced: a taken name gets a numeric suffix.
/// Returns the name actually used.
async fn write_new_file(
    dir: &std::path::Path,
    name: &str,
    bytes: &[u8],
) -> Result<(PathBuf, String)> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = numbered_filename(name, n);
        let path = dir.join(&candidate);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };

        let written = match file.write_all(bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            drop(file);
            remove_upload(&path).await;
            return Err(e.into());
        }
        return Ok((path, candidate));
    }

    Err(AppError::Storage(format!(
        "No free filename for '{}' after {} attempts",
        name, MAX_NAME_ATTEMPTS
    )))
}

async fn remove_upload(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove upload {}: {}", path.display(), e);
    }
}

/// Detect, render, store the source image and persist one record
///
/// Nothing touches the upload directory until the image has been decoded and
/// annotated, and the stored file is removed again if the record cannot be
/// saved.
async fn ingest(
    state: &AppState,
    device_id: &str,
    captured_at: i64,
    filename: String,
    image_bytes: Vec<u8>,
) -> Result<Json<UploadResponse>> {
    let adapter = state.adapter.clone();
    let renderer = state.renderer;
    let (image_bytes, detections, annotated) = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&image_bytes)
            .map_err(|e| AppError::Detection(format!("Could not decode image: {}", e)))?;
        let detections = adapter
            .run(&image)
            .map_err(|e| AppError::Detection(e.to_string()))?;
        let annotated = renderer.render(&image, &detections)?;
        Ok::<_, AppError>((image_bytes, detections, annotated))
    })
    .await
    .map_err(|e| AppError::Detection(format!("Detection task failed: {}", e)))??;

    let (path, filename) = write_new_file(&state.upload_dir, &filename, &image_bytes).await?;
    info!("Saved upload {} ({} bytes)", path.display(), image_bytes.len());

    let record_id = generate_record_id();
    let record = match state
        .store
        .save(&record_id, device_id, captured_at, &filename, detections)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            remove_upload(&path).await;
            return Err(e);
        }
    };

    info!(
        "Stored record {} from {} with {} detection(s) ({} backend)",
        record.id,
        record.device_id,
        record.detection_count(),
        state.adapter.backend_name()
    );

    Ok(Json(UploadResponse {
        status: "ok".to_string(),
        id: record.id,
        file: record.file,
        pred: record.detections,
        image_with_boxes: to_data_uri(&annotated),
    }))
}

// ============================================================================
// Queries
// ============================================================================

fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.public_base_url {
        return base.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}", host)
}

/// Public URL of a stored file, percent-encoding the name
pub fn image_url(base_url: &str, file: &str) -> String {
    format!("{}/uploads/{}", base_url, urlencoding::encode(file))
}

/// `"camera"` for devices named with the camera prefix, `"mobile"` otherwise
pub fn source_tag(device_id: &str, camera_prefix: &str) -> &'static str {
    if !camera_prefix.is_empty() && device_id.starts_with(camera_prefix) {
        "camera"
    } else {
        "mobile"
    }
}

async fn latest_record(state: &AppState, missing: &str) -> Result<DetectionRecord> {
    state
        .store
        .get_latest()
        .await?
        .ok_or_else(|| AppError::NotFound(missing.to_string()))
}

async fn latest_image_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let record = latest_record(&state, "No images found").await?;

    let path = state.upload_dir.join(&record.file);
    let source = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "Source image for record {} not found",
                record.id
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let renderer = state.renderer;
    let detections = record.detections;
    let jpeg = tokio::task::spawn_blocking(move || {
        let image: DynamicImage = image::load_from_memory(&source)?;
        Ok::<_, AppError>(renderer.render(&image, &detections)?)
    })
    .await
    .map_err(|e| AppError::Detection(format!("Render task failed: {}", e)))??;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

async fn result_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RecordResponse>> {
    let record = latest_record(&state, "No results found").await?;
    Ok(Json(RecordResponse::from_record(
        record,
        &base_url(&state, &headers),
    )))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<String>,
    offset: Option<String>,
}

fn parse_page_param(name: &str, value: Option<&str>, default: i64) -> Result<u64> {
    let value = match value.map(str::trim) {
        None | Some("") => default,
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            AppError::BadRequest(format!("{} must be a non-negative integer", name))
        })?,
    };
    u64::try_from(value)
        .map_err(|_| AppError::BadRequest(format!("{} must be a non-negative integer", name)))
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> Result<Json<ResultsPage>> {
    let limit = parse_page_param("limit", params.limit.as_deref(), DEFAULT_PAGE_LIMIT)?;
    let offset = parse_page_param("offset", params.offset.as_deref(), 0)?;

    let base = base_url(&state, &headers);
    let items: Vec<RecordResponse> = state
        .store
        .list(limit, offset)
        .await?
        .into_iter()
        .map(|record| RecordResponse::from_record(record, &base))
        .collect();

    Ok(Json(ResultsPage {
        count: items.len(),
        items,
    }))
}

async fn latest_detection_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<LatestDetectionResponse>> {
    let record = latest_record(&state, "No detections found").await?;

    Ok(Json(LatestDetectionResponse {
        source: source_tag(&record.device_id, &state.camera_prefix).to_string(),
        datetime: DateTime::from_timestamp(record.captured_at, 0).map(|dt| dt.to_rfc3339()),
        image_url: image_url(&base_url(&state, &headers), &record.file),
        total_detections: record.detection_count(),
        id: record.id,
        device_id: record.device_id,
        timestamp: record.captured_at,
        file: record.file,
        pred: record.detections,
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let records = state.store.count().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        model: state.model_name.clone(),
        timestamp: unix_now(),
        records,
    }))
}

// ============================================================================
// Stored files
// ============================================================================

/// Join `name` under `dir` if it stays inside it
pub fn resolve_upload_path(dir: &std::path::Path, name: &str) -> Option<PathBuf> {
    let relative = std::path::Path::new(name);
    let mut components = relative.components().peekable();
    components.peek()?;
    if components.all(|c| matches!(c, Component::Normal(_))) {
        Some(dir.join(relative))
    } else {
        None
    }
}

fn content_type_for(name: &str) -> &'static str {
    let extension = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

async fn uploaded_file_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse> {
    let path = resolve_upload_path(&state.upload_dir, &filename)
        .ok_or_else(|| AppError::BadRequest("Invalid filename".to_string()))?;

    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&filename))],
            bytes,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(AppError::NotFound("File not found".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
