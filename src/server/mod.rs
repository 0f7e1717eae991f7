pub mod api_keys;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::catalog::{Catalog, ChangePublisher, DbUpload, DbUser};
use crate::error::Error;
use crate::uploads::{
    Assembler, BlockRequestWriter, BlockTracker, ChunkRequest, DirService, IdRequest, IdService,
    RequestPath, UploadService,
};

pub use api_keys::{monitor_users, ApiKeyCache};

/// Default chunk size when the client does not pick one.
pub const DEFAULT_CHUNK_SIZE: i64 = 1024 * 1024;

/// Shared server state. The tracker and the key cache are the only
/// process-wide mutable pieces; both are created once at startup and
/// handed to every request by reference.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub tracker: Arc<BlockTracker>,
    pub key_cache: Arc<ApiKeyCache>,
    pub paths: RequestPath,
    pub changes: ChangePublisher,
}

impl AppState {
    pub fn new(catalog: Catalog, paths: RequestPath) -> Self {
        AppState {
            catalog,
            tracker: Arc::new(BlockTracker::new()),
            key_cache: Arc::new(ApiKeyCache::new()),
            paths,
            changes: ChangePublisher::new(),
        }
    }

    fn id_service(&self) -> IdService {
        IdService::new(
            self.catalog.clone(),
            self.tracker.clone(),
            self.paths.clone(),
        )
    }

    fn upload_service(&self) -> UploadService {
        let assembler = Assembler::new(
            self.catalog.clone(),
            self.tracker.clone(),
            self.paths.clone(),
            self.changes.clone(),
        );
        UploadService::new(
            self.catalog.clone(),
            self.tracker.clone(),
            Arc::new(BlockRequestWriter),
            self.paths.clone(),
            assembler,
        )
    }

    fn dir_service(&self) -> DirService {
        DirService::new(self.catalog.clone())
    }
}

/// Build the service router. All routes sit behind the API-key filter.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(create_upload_request))
        .route("/upload/chunk", post(upload_file_chunk))
        .route(
            "/upload/:id",
            delete(delete_upload_request).get(list_project_upload_requests),
        )
        .route("/directory", post(ensure_directory))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_filter))
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::NoAccess => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolve the requester from the `apikey` header or query parameter,
/// priming the cache from the catalog on a miss.
async fn api_key_filter(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Error> {
    let key = apikey_from_request(&req).ok_or(Error::NoAccess)?;

    let user = match state.key_cache.get_user(&key) {
        Some(user) => user,
        None => {
            let user = state
                .catalog
                .user_by_apikey(&key)
                .await?
                .ok_or(Error::NoAccess)?;
            state.key_cache.add_key(&key, &user);
            user
        }
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

fn apikey_from_request(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get("apikey") {
        if let Ok(key) = value.to_str() {
            return Some(key.to_string());
        }
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("apikey=").map(|key| key.to_string())
        })
    })
}

async fn authorize_project(state: &AppState, project_id: &str, user: &DbUser) -> Result<(), Error> {
    if state.catalog.user_has_access(project_id, &user.id).await? {
        Ok(())
    } else {
        Err(Error::NoAccess)
    }
}

// ---- POST /upload ----

/// JSON body a client sends to create a new upload request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUploadRequest {
    pub project_id: String,
    #[serde(default)]
    pub directory_id: String,
    #[serde(default)]
    pub directory_path: String,
    pub filename: String,
    pub filesize: i64,
    #[serde(default)]
    pub chunk_size: i64,
    /// RFC 1123 timestamp of the file on the client.
    pub filemtime: String,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub request_id: String,
    pub starting_block: u64,
}

async fn create_upload_request(
    State(state): State<AppState>,
    Extension(user): Extension<DbUser>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<CreateUploadRequest>,
) -> Result<Json<CreateUploadResponse>, Error> {
    authorize_project(&state, &body.project_id, &user).await?;

    let mtime = DateTime::parse_from_rfc2822(&body.filemtime)
        .map_err(|err| Error::invalid(format!("bad filemtime {:?}: {}", body.filemtime, err)))?
        .with_timezone(&Utc);

    let chunk_size = if body.chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        body.chunk_size
    };

    let directory_id = resolve_directory_id(&state, &body).await?;
    let host = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let created = state
        .id_service()
        .create(IdRequest {
            user: user.id,
            project_id: body.project_id,
            directory_id,
            filename: body.filename,
            file_size: body.filesize,
            file_mtime: mtime,
            chunk_size,
            checksum: body.checksum,
            host,
        })
        .await?;

    Ok(Json(CreateUploadResponse {
        request_id: created.id,
        starting_block: created.starting_block,
    }))
}

/// A client may address the target directory by id or by path. Paths are
/// created on demand.
async fn resolve_directory_id(
    state: &AppState,
    body: &CreateUploadRequest,
) -> Result<String, Error> {
    if !body.directory_id.is_empty() {
        return Ok(body.directory_id.clone());
    }
    if body.directory_path.is_empty() {
        debug!("create upload request carries neither directory_id nor directory_path");
        return Err(Error::invalid(
            "one of directory_id or directory_path is required",
        ));
    }
    let dir = state
        .dir_service()
        .create(&body.project_id, &body.directory_path)
        .await?;
    Ok(dir.id)
}

// ---- POST /upload/chunk ----

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub file_id: String,
    pub done: bool,
}

async fn upload_file_chunk(
    State(state): State<AppState>,
    Extension(user): Extension<DbUser>,
    multipart: Multipart,
) -> Result<Json<UploadChunkResponse>, Error> {
    let req = chunk_request_from_form(multipart).await?;
    authorize_project(&state, &req.project_id, &user).await?;

    let status = state.upload_service().upload(&req).await?;
    Ok(Json(UploadChunkResponse {
        file_id: status.file_id,
        done: status.done,
    }))
}

/// Pull the flow fields and the chunk bytes out of the multipart form.
async fn chunk_request_from_form(mut multipart: Multipart) -> Result<ChunkRequest, Error> {
    let mut chunk_number = None;
    let mut total_chunks = None;
    let mut chunk_size = None;
    let mut total_size = None;
    let mut identifier = None;
    let mut filename = None;
    let mut project_id = None;
    let mut directory_id = None;
    let mut chunk = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| Error::invalid(format!("bad multipart body: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "flowChunkNumber" => chunk_number = Some(text_field(field, &name).await?),
            "flowTotalChunks" => total_chunks = Some(text_field(field, &name).await?),
            "flowChunkSize" => chunk_size = Some(text_field(field, &name).await?),
            "flowTotalSize" => total_size = Some(text_field(field, &name).await?),
            "flowIdentifier" => identifier = Some(raw_field(field, &name).await?),
            "flowFilename" => filename = Some(raw_field(field, &name).await?),
            "flowRelativePath" => {
                let _ = raw_field(field, &name).await?;
            }
            "projectID" => project_id = Some(raw_field(field, &name).await?),
            "directoryID" => directory_id = Some(raw_field(field, &name).await?),
            "file" => {
                chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| Error::invalid(format!("bad chunk data: {}", err)))?
                        .to_vec(),
                )
            }
            _ => {}
        }
    }

    Ok(ChunkRequest {
        upload_id: identifier.ok_or_else(|| missing("flowIdentifier"))?,
        chunk_number: parse_number(&chunk_number.ok_or_else(|| missing("flowChunkNumber"))?)?,
        chunk_size: parse_number(&chunk_size.ok_or_else(|| missing("flowChunkSize"))?)?,
        total_chunks: parse_number(&total_chunks.ok_or_else(|| missing("flowTotalChunks"))?)?,
        total_size: parse_number(&total_size.ok_or_else(|| missing("flowTotalSize"))?)?,
        filename: filename.unwrap_or_default(),
        project_id: project_id.ok_or_else(|| missing("projectID"))?,
        directory_id: directory_id.unwrap_or_default(),
        chunk: chunk.ok_or_else(|| missing("file"))?,
    })
}

async fn raw_field(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, Error> {
    field
        .text()
        .await
        .map_err(|err| Error::invalid(format!("bad field {}: {}", name, err)))
}

async fn text_field(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, Error> {
    let value = raw_field(field, name).await?;
    if value.trim().is_empty() {
        return Err(missing(name));
    }
    Ok(value)
}

fn missing(name: &str) -> Error {
    Error::invalid(format!("missing multipart field {}", name))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("bad numeric field value {:?}", value)))
}

// ---- DELETE /upload/:id ----

async fn delete_upload_request(
    State(state): State<AppState>,
    Extension(user): Extension<DbUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.id_service().delete(&id, &user.id).await?;
    Ok(StatusCode::OK)
}

// ---- GET /upload/:project ----

/// One outstanding upload request, as reported to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadEntry {
    pub request_id: String,
    pub filename: String,
    pub directory_id: String,
    pub project_id: String,
    pub size: i64,
    pub host: String,
    pub checksum: String,
    pub birthtime: DateTime<Utc>,
}

impl From<DbUpload> for UploadEntry {
    fn from(upload: DbUpload) -> Self {
        UploadEntry {
            request_id: upload.id,
            filename: upload.filename,
            directory_id: upload.directory_id,
            project_id: upload.project_id,
            size: upload.size,
            host: upload.host,
            checksum: upload.checksum,
            birthtime: upload.birthtime,
        }
    }
}

async fn list_project_upload_requests(
    State(state): State<AppState>,
    Extension(user): Extension<DbUser>,
    Path(project): Path<String>,
) -> Result<Json<Vec<UploadEntry>>, Error> {
    match state.id_service().list(&project, &user.id).await {
        Ok(uploads) => Ok(Json(uploads.into_iter().map(UploadEntry::from).collect())),
        // An unknown project simply has nothing outstanding.
        Err(Error::NotFound(_)) => Ok(Json(Vec::new())),
        Err(err) => Err(err),
    }
}

// ---- POST /directory ----

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectoryRequest {
    pub project_id: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectoryResponse {
    pub directory_id: String,
    pub path: String,
}

async fn ensure_directory(
    State(state): State<AppState>,
    Extension(user): Extension<DbUser>,
    Json(body): Json<DirectoryRequest>,
) -> Result<Json<DirectoryResponse>, Error> {
    authorize_project(&state, &body.project_id, &user).await?;

    let dir = state.dir_service().create(&body.project_id, &body.path).await?;
    Ok(Json(DirectoryResponse {
        directory_id: dir.id,
        path: dir.path,
    }))
}
