use std::sync::Arc;
use std::time::Duration;

use actix_multipart::Multipart;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;
use tokio::sync::broadcast;

use crate::approval::{self, ApprovalPolicy};
use crate::auth::{current_user, Auth};
use crate::error::ApiError;
use crate::feed::ChangeFeed;
use crate::models::*;
use crate::rate_limit::{Action, RateLimiter};
use crate::repo::PostRepo;
use crate::storage::{content_key, public_url, ImageStore, ImageStoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(web::resource("/posts/{id}").route(web::get().to(get_post)))
            .service(web::resource("/posts/{id}/status").route(web::get().to(check_status)))
            .service(web::resource("/posts/{id}/votes/{field}").route(web::put().to(write_vote)))
            .service(web::resource("/posts/{id}/votes/{field}/adjust").route(web::post().to(adjust_vote)))
            .service(web::resource("/changes").route(web::get().to(stream_changes)))
            .service(web::resource("/images").route(web::post().to(upload_image)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me))),
    );
    // outside /api/v1 so stored image URLs stay short
    cfg.route("/images/{key}", web::get().to(get_image));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn PostRepo>,
    pub image_store: Arc<dyn ImageStore>,
    pub feed: ChangeFeed,
    pub approval: ApprovalPolicy,
    pub public_base_url: String,
    pub rate_limiter: Option<RateLimiter>,
    pub sse_keepalive: Duration,
}

impl AppState {
    pub fn new(repo: Arc<dyn PostRepo>, image_store: Arc<dyn ImageStore>, feed: ChangeFeed) -> Self {
        Self {
            repo,
            image_store,
            feed,
            approval: ApprovalPolicy::default(),
            public_base_url: "http://localhost:8080".into(),
            rate_limiter: None,
            sse_keepalive: Duration::from_secs(15),
        }
    }
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string()
}

fn parse_field(raw: &str) -> Result<VoteField, ApiError> {
    raw.parse().map_err(|_| ApiError::BadRequest(format!("unknown vote field '{raw}'")))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    responses((status = 200, description = "All posts, newest first", body = [Post]))
)]
pub async fn list_posts(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let posts = data.repo.list_posts().await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = Post),
        (status = 400, description = "Invalid payload"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(
    req: HttpRequest,
    auth: Option<Auth>,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow(Action::CreatePost, &client_ip(&req)) { return Err(ApiError::RateLimited); }
    }
    let new = payload.into_inner();
    new.validate()?;
    let author = current_user(auth.as_ref()).to_string();
    let post = data.repo.create_post(&author, new).await?;
    tracing::info!(post_id = %post.id, author = %post.author, "post created");
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = Post),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<PostId>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}/status",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 200, description = "Current approval status", body = bool),
        (status = 404, description = "Post not found")
    )
)]
pub async fn check_status(data: web::Data<AppState>, path: web::Path<PostId>) -> Result<HttpResponse, ApiError> {
    let status = data.repo.get_status(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// Persist a vote write, then re-evaluate approval on the fresh row.
async fn finish_vote(data: &AppState, mut post: Post) -> Result<HttpResponse, ApiError> {
    post.status = approval::recheck(data.repo.as_ref(), &data.approval, &post).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    put,
    path = "/api/v1/posts/{id}/votes/{field}",
    request_body = WriteVote,
    params(
        ("id" = Uuid, Path, description = "Post id"),
        ("field" = String, Path, description = "upvotes | downvotes")
    ),
    responses(
        (status = 200, description = "Counter overwritten", body = Post),
        (status = 404, description = "Post not found")
    )
)]
pub async fn write_vote(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(PostId, String)>,
    payload: web::Json<WriteVote>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow(Action::Vote, &client_ip(&req)) { return Err(ApiError::RateLimited); }
    }
    let (id, field) = path.into_inner();
    let field = parse_field(&field)?;
    let post = data.repo.write_vote_count(id, field, payload.value).await?;
    metrics::increment_counter!("ecoreport_vote_writes_total", "mode" => "absolute", "field" => field.as_str());
    finish_vote(&data, post).await
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/votes/{field}/adjust",
    request_body = AdjustVote,
    params(
        ("id" = Uuid, Path, description = "Post id"),
        ("field" = String, Path, description = "upvotes | downvotes")
    ),
    responses(
        (status = 200, description = "Counter adjusted atomically", body = Post),
        (status = 404, description = "Post not found")
    )
)]
pub async fn adjust_vote(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(PostId, String)>,
    payload: web::Json<AdjustVote>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow(Action::Vote, &client_ip(&req)) { return Err(ApiError::RateLimited); }
    }
    let (id, field) = path.into_inner();
    let field = parse_field(&field)?;
    let post = data.repo.adjust_vote_count(id, field, payload.delta).await?;
    metrics::increment_counter!("ecoreport_vote_writes_total", "mode" => "delta", "field" => field.as_str());
    finish_vote(&data, post).await
}

fn sse_frame(event: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

/// Server-Sent Events stream of post changes matching the query filter.
pub async fn stream_changes(data: web::Data<AppState>, query: web::Query<ChangeFilter>) -> HttpResponse {
    let rx = data.feed.subscribe();
    let filter = query.into_inner();
    let keepalive = data.sse_keepalive;
    tracing::debug!(?filter, "change stream opened");

    let stream = futures_util::stream::unfold(rx, move |mut rx| async move {
        loop {
            let frame = match tokio::time::timeout(keepalive, rx.recv()).await {
                Err(_) => Bytes::from_static(b": keepalive\n\n"),
                Ok(Ok(change)) => {
                    if !filter.matches(&change) { continue; }
                    match serde_json::to_string(&change) {
                        Ok(json) => sse_frame("change", &json),
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode change");
                            continue;
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    tracing::warn!(skipped = n, "change stream lagged");
                    sse_frame("lagged", &n.to_string())
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            };
            return Some((Ok::<_, actix_web::Error>(frame), rx));
        }
    });

    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/event-stream"))
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ImageUploadResponse {
    pub key: String,
    pub url: String,
    pub mime: String,
    pub size: usize,
    pub duplicate: bool, // true when the same bytes were already stored
}

const IMAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp", "image/heif"];

#[utoipa::path(
    post,
    path = "/api/v1/images",
    responses(
        (status = 201, description = "Image stored (new)", body = ImageUploadResponse),
        (status = 200, description = "Image already existed", body = ImageUploadResponse),
        (status = 413, description = "Payload too large"),
        (status = 415, description = "Unsupported media type")
    )
)]
pub async fn upload_image(req: HttpRequest, data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    use actix_web::http::StatusCode;
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow(Action::Upload, &client_ip(&req)) { return Err(ApiError::RateLimited); }
    }
    while let Some(field) = payload.try_next().await.map_err(|e| {
        tracing::error!("multipart error: {e}");
        ApiError::Internal
    })? {
        if field.content_disposition().get_name() != Some("file") { continue; }
        let mut field_stream = field;
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            tracing::error!("stream read error: {e}");
            ApiError::Internal
        })? {
            if bytes.len() + chunk.len() > IMAGE_SIZE_LIMIT {
                return Ok(HttpResponse::build(StatusCode::PAYLOAD_TOO_LARGE).finish());
            }
            bytes.extend_from_slice(&chunk);
        }
        let mime = infer::get(&bytes).map(|t| t.mime_type().to_string()).unwrap_or_else(|| "application/octet-stream".into());
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Ok(HttpResponse::UnsupportedMediaType().finish());
        }
        let key = content_key(&bytes);
        let (status, duplicate) = match data.image_store.save(&key, &mime, &bytes).await {
            Ok(()) => (StatusCode::CREATED, false),
            Err(ImageStoreError::Duplicate) => (StatusCode::OK, true),
            Err(e) => {
                tracing::error!("image_store save error: {e}");
                return Err(ApiError::Internal);
            }
        };
        let url = public_url(&data.public_base_url, &key);
        let resp = ImageUploadResponse { key, url, mime, size: bytes.len(), duplicate };
        return Ok(HttpResponse::build(status).json(resp));
    }
    Err(ApiError::BadRequest("missing 'file' field".into()))
}

pub async fn get_image(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    match data.image_store.load(&path.into_inner()).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().insert_header(("Content-Type", mime)).body(bytes)),
        Err(ImageStoreError::NotFound) | Err(ImageStoreError::InvalidKey) => Err(ApiError::NotFound),
        Err(e) => {
            tracing::error!("image_store load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct MeResponse {
    pub id: String,
    pub email: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current user", body = MeResponse),
        (status = 401, description = "No valid token")
    )
)]
pub async fn auth_me(auth: Option<Auth>) -> Result<HttpResponse, ApiError> {
    let auth = auth.ok_or(ApiError::Unauthorized)?;
    Ok(HttpResponse::Ok().json(MeResponse { id: auth.0.sub.clone(), email: auth.0.email.clone() }))
}
