//! REST API Handlers
//!
//! Maps HTTP requests onto the storage facade, the chunk assembler, the
//! token authority and the node registry. Every authenticated handler gets
//! its [`IdentityContext`] from the [`Authenticated`] extractor.
//!
//! Every request passes through `with_request_layers`: it is stamped with
//! an `X-Request-Id` (the client's or a fresh one) that the context, the
//! access log span and the response all share, and a handler panic becomes
//! a `500` carrying that id instead of a dropped connection.

use crate::auth::TokenAuthority;
use crate::checksum::Checksum;
use crate::chunk::{ChunkAssembler, ChunkDescriptor, ChunkOutcome, TransferStatus};
use crate::config::{CorsConfig, ServicesConfig};
use crate::context::{redact, sanitize_query, IdentityContext};
use crate::domain::ports::{
    ByteStream, FileInfo, IdentityResolver, IdentityResolverRef, RegistryDriver, RegistryDriverRef,
    RegistryNode,
};
use crate::error::{Error, ErrorCode};
use crate::storage::StorageFacade;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequestParts, Json, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, info_span, Level};

pub const CHECKSUM_HEADER: &str = "x-checksum";
pub const TRANSFER_ID_HEADER: &str = "x-transfer-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const CHUNK_TOTAL_HEADER: &str = "x-chunk-total";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Credentials exchanged for a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

/// Move request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub source: String,
    pub target: String,
}

/// Answer to a chunk that left its set incomplete
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUploadResponse {
    pub transfer_id: String,
    pub received: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesQuery {
    pub role: Option<String>,
}

/// Liveness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backends: BTreeMap<String, bool>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

// =============================================================================
// Errors
// =============================================================================

/// A core error bound to the request it failed
#[derive(Debug)]
pub struct ApiError {
    error: Error,
    correlation_id: String,
}

impl ApiError {
    pub fn new(error: Error, ctx: &IdentityContext) -> Self {
        Self::with_correlation_id(error, ctx.correlation_id())
    }

    /// For failures raised before or outside a request context
    pub fn with_correlation_id(error: Error, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

/// HTTP status for an abstract error code
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidToken
        | ErrorCode::Unauthenticated
        | ErrorCode::BadAuthenticationData
        | ErrorCode::UserNotFound => StatusCode::UNAUTHORIZED,
        ErrorCode::BadInputData => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::BadChecksum => StatusCode::PRECONDITION_FAILED,
        ErrorCode::TooBig => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error.code();
        let message = if self.error.is_client_visible() {
            self.error.to_string()
        } else {
            error!(tid = %self.correlation_id, "Request failed: {}", self.error);
            format!("internal error, reference {}", self.correlation_id)
        };

        let body = ApiErrorResponse {
            code: code as u32,
            error: code.as_str().to_string(),
            message,
        };
        let mut response = (status_for(code), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&self.correlation_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

// =============================================================================
// Authentication
// =============================================================================

/// Context of a request whose bearer token resolved to a user
pub struct Authenticated(pub IdentityContext);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let ctx = request_context(&parts.headers);
        let token = match bearer_token(parts) {
            Some(token) => token,
            None => return Err(ApiError::new(Error::Unauthenticated, &ctx)),
        };

        match state.resolver.resolve(&token).await {
            Ok(user) => Ok(Authenticated(ctx.with_user(user).with_access_token(token))),
            Err(e) => {
                debug!(tid = %ctx.correlation_id(), token = %redact(&token), "Credential rejected: {}", e);
                Err(ApiError::new(e, &ctx))
            }
        }
    }
}

/// Fresh context, reusing a client-supplied request id when present
fn request_context(headers: &HeaderMap) -> IdentityContext {
    match headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(id) => IdentityContext::new(id),
        None => IdentityContext::generate(),
    }
}

/// Token from `Authorization: Bearer`, else from the `access_token` query
fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        });
    if from_header.is_some() {
        return from_header;
    }

    parts.uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != "access_token" {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

// =============================================================================
// REST Router
// =============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<StorageFacade>,
    pub assembler: Arc<ChunkAssembler>,
    pub tokens: Arc<TokenAuthority>,
    pub resolver: IdentityResolverRef,
    pub registry: RegistryDriverRef,
}

impl AppState {
    pub fn new(
        facade: Arc<StorageFacade>,
        assembler: Arc<ChunkAssembler>,
        tokens: Arc<TokenAuthority>,
        registry: RegistryDriverRef,
    ) -> Self {
        let resolver: IdentityResolverRef = tokens.clone();
        Self {
            facade,
            assembler,
            tokens,
            resolver,
            registry,
        }
    }
}

/// REST API router builder
pub struct RestRouter {
    state: AppState,
    cors: CorsConfig,
    services: ServicesConfig,
}

impl RestRouter {
    /// Create a new REST router with every service mounted
    pub fn new(state: AppState, cors: CorsConfig) -> Self {
        Self {
            state,
            cors,
            services: ServicesConfig::default(),
        }
    }

    /// Mount only the enabled route groups
    pub fn with_services(mut self, services: ServicesConfig) -> Self {
        self.services = services;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let mut api = Router::new();
        if self.services.auth {
            api = api.route("/auth/token", post(issue_token));
        }
        if self.services.data {
            api = api
                .route("/data/*path", put(upload).get(download))
                .route("/transfers/:id", get(transfer_status).delete(abort_transfer));
        }
        if self.services.meta {
            api = api
                .route("/meta/examine", get(examine_root))
                .route("/meta/examine/*path", get(examine))
                .route("/meta/list", get(list_root))
                .route("/meta/list/*path", get(list_folder))
                .route("/meta/move", post(move_entry))
                .route("/meta/delete/*path", delete(delete_entry))
                .route("/meta/folder/*path", post(create_folder));
        }
        if self.services.registry {
            api = api.route("/registry/nodes", get(list_nodes));
        }

        let routes = Router::new()
            .nest("/api/v1", api)
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .layer(DefaultBodyLimit::disable());
        let mut router = with_request_layers(routes).with_state(self.state);

        if self.cors.enabled {
            router = router.layer(cors_layer(&self.cors));
        }
        router
    }
}

/// Request id stamping, access logging and panic recovery, outermost last
pub(crate) fn with_request_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    let tid = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    info_span!(
                        "http",
                        method = %request.method(),
                        uri = %sanitize_query(&request.uri().to_string()),
                        tid = %tid,
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(assign_request_id))
}

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Reuse the client's request id or mint one, and echo it on the response
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let ctx = request_context(request.headers());
    let id = ctx.correlation_id().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let mut response = REQUEST_ID.scope(id.clone(), next.run(request)).await;
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

/// Turn a handler panic into an internal error bound to the request id
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else {
        "opaque panic payload"
    };
    let tid = REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| IdentityContext::generate().correlation_id().to_string());
    ApiError::with_correlation_id(Error::Internal(format!("handler panicked: {}", detail)), tid)
        .into_response()
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let wildcard = |values: &[String]| values.iter().any(|v| v == "*");

    let origins = if wildcard(&config.allowed_origins) {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )
    };
    let methods = if wildcard(&config.allowed_methods) {
        AllowMethods::any()
    } else {
        AllowMethods::list(
            config
                .allowed_methods
                .iter()
                .filter_map(|m| m.parse::<Method>().ok()),
        )
    };
    let headers = if wildcard(&config.allowed_headers) {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(
            config
                .allowed_headers
                .iter()
                .filter_map(|h| h.parse::<HeaderName>().ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers([
            HeaderName::from_static(CHECKSUM_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

// =============================================================================
// Header Parsing
// =============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> crate::Result<Option<&'a str>> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| Error::BadInputData(format!("header {} is not valid text", name))),
        None => Ok(None),
    }
}

fn client_checksum(headers: &HeaderMap) -> crate::Result<Option<Checksum>> {
    match header_str(headers, CHECKSUM_HEADER)? {
        Some(raw) if !raw.is_empty() => Checksum::parse(raw),
        _ => Ok(None),
    }
}

/// Chunk headers come as a group; none of them means a whole-file upload
fn chunk_descriptor(headers: &HeaderMap) -> crate::Result<ChunkDescriptor> {
    let id = header_str(headers, TRANSFER_ID_HEADER)?;
    let index = header_str(headers, CHUNK_INDEX_HEADER)?;
    let total = header_str(headers, CHUNK_TOTAL_HEADER)?;

    let number = |name: &str, raw: &str| {
        raw.parse::<u32>()
            .map_err(|_| Error::BadInputData(format!("header {} must be a non-negative integer", name)))
    };

    match (id, index, total) {
        (None, None, None) => Ok(ChunkDescriptor::whole_file()),
        (Some(id), Some(index), Some(total)) => Ok(ChunkDescriptor::new(
            id,
            number(CHUNK_INDEX_HEADER, index)?,
            number(CHUNK_TOTAL_HEADER, total)?,
        )),
        _ => Err(Error::BadInputData(format!(
            "chunked uploads need {}, {} and {}",
            TRANSFER_ID_HEADER, CHUNK_INDEX_HEADER, CHUNK_TOTAL_HEADER
        ))),
    }
}

fn body_stream(body: Body) -> ByteStream {
    let data = body.into_data_stream().map_err(std::io::Error::other);
    Box::pin(StreamReader::new(data))
}

fn with_checksum_header(mut response: Response, checksum: Option<&Checksum>) -> Response {
    if let Some(value) = checksum.and_then(|c| HeaderValue::from_str(&c.to_string()).ok()) {
        response.headers_mut().insert(CHECKSUM_HEADER, value);
    }
    response
}

// =============================================================================
// Handlers
// =============================================================================

/// Exchange credentials for a token, creating home roots on first login
async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> ApiResult {
    let ctx = request_context(&headers);
    let user = state
        .tokens
        .login(&request.username, &request.password)
        .map_err(|e| ApiError::new(e, &ctx))?;
    let ctx = ctx.with_user(user.clone());

    state
        .facade
        .bootstrap_home(&ctx)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;

    let token = state.tokens.issue(&user);
    info!(parent: ctx.span(), "Token issued");
    Ok((StatusCode::CREATED, Json(token)).into_response())
}

/// Upload a whole file or one chunk of a chunked transfer
async fn upload(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult {
    let fail = |e: Error| ApiError::new(e, &ctx);
    let checksum = client_checksum(&headers).map_err(fail)?;
    let descriptor = chunk_descriptor(&headers).map_err(fail)?;
    let transfer_id = descriptor.transfer_id.clone();

    let outcome = state
        .assembler
        .deliver(&ctx, &path, descriptor, body_stream(body), checksum.as_ref())
        .await
        .map_err(fail)?;

    Ok(match outcome {
        ChunkOutcome::Completed(info) => {
            let checksum = info.checksum.clone();
            with_checksum_header((StatusCode::CREATED, Json(info)).into_response(), checksum.as_ref())
        }
        ChunkOutcome::Pending { received, total } => (
            StatusCode::ACCEPTED,
            Json(PendingUploadResponse {
                transfer_id,
                received,
                total,
            }),
        )
            .into_response(),
    })
}

/// Stream a published file
async fn download(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
) -> ApiResult {
    let download = state
        .facade
        .download_file(&ctx, &path)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;

    let mut response = Body::from_stream(ReaderStream::new(download.stream)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.info.size));
    Ok(with_checksum_header(response, download.info.checksum.as_ref()))
}

async fn transfer_status(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<String>,
) -> ApiResult {
    let status: TransferStatus = state
        .assembler
        .status(&ctx, &id)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(Json(status).into_response())
}

async fn abort_transfer(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .assembler
        .abort(&ctx, &id)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn examine_entry(state: &AppState, ctx: &IdentityContext, path: &str) -> ApiResult {
    let info: FileInfo = state
        .facade
        .examine(ctx, path)
        .await
        .map_err(|e| ApiError::new(e, ctx))?;
    Ok(Json(info).into_response())
}

async fn examine(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
) -> ApiResult {
    examine_entry(&state, &ctx, &path).await
}

async fn examine_root(State(state): State<AppState>, Authenticated(ctx): Authenticated) -> ApiResult {
    examine_entry(&state, &ctx, "/").await
}

async fn list_entries(state: &AppState, ctx: &IdentityContext, path: &str) -> ApiResult {
    let entries = state
        .facade
        .list_folder(ctx, path)
        .await
        .map_err(|e| ApiError::new(e, ctx))?;
    Ok(Json(entries).into_response())
}

async fn list_folder(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
) -> ApiResult {
    list_entries(&state, &ctx, &path).await
}

async fn list_root(State(state): State<AppState>, Authenticated(ctx): Authenticated) -> ApiResult {
    list_entries(&state, &ctx, "/").await
}

async fn move_entry(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Json(request): Json<MoveRequest>,
) -> ApiResult {
    state
        .facade
        .move_entry(&ctx, &request.source, &request.target)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_entry(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
) -> ApiResult {
    state
        .facade
        .delete(&ctx, &path)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn create_folder(
    State(state): State<AppState>,
    Authenticated(ctx): Authenticated,
    Path(path): Path<String>,
) -> ApiResult {
    state
        .facade
        .create_folder(&ctx, &path)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(StatusCode::CREATED.into_response())
}

/// Live nodes serving a role
async fn list_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NodesQuery>,
) -> ApiResult {
    let ctx = request_context(&headers);
    let role = query
        .role
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::new(Error::BadInputData("query parameter role is required".into()), &ctx))?;

    let nodes: Vec<RegistryNode> = state
        .registry
        .nodes_for_role(&role)
        .await
        .map_err(|e| ApiError::new(e, &ctx))?;
    Ok(Json(nodes).into_response())
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let backends: BTreeMap<String, bool> = state.facade.health_check().await.into_iter().collect();
    let healthy = backends.values().all(|ok| *ok);
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: crate::VERSION.to_string(),
            backends,
        }),
    )
}

/// Prometheus exposition
async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let ctx = request_context(&headers);
    let (content_type, body) = state
        .facade
        .metrics()
        .encode()
        .map_err(|e| ApiError::new(e, &ctx))?;

    let mut response = body.into_response();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
