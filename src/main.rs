use std::{collections::HashMap, io::ErrorKind, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Mutex,
    time::{Duration, timeout},
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    registry: LinkRegistry,
    extractor: Arc<dyn MediaExtractor>,
    http_client: reqwest::Client,
    config: Arc<AppConfig>,
}

const LINK_TTL_SECONDS: i64 = 3600;
const REGISTRY_SWEEP_SECONDS: u64 = 60;
const MEDIA_FETCH_TIMEOUT_SECONDS: u64 = 30;
const MEDIA_FETCH_MAX_REDIRECTS: usize = 5;
const EXTRACTOR_TIMEOUT_SECONDS: u64 = 60;
const MAX_TITLE_CHARS: usize = 50;
const FILENAME_PREFIX: &str = "TikRelay_";
const DEFAULT_TITLE: &str = "Sin titulo";
const DEFAULT_USERNAME: &str = "desconocido";
const FALLBACK_TITLE: &str = "descarga";
const DEFAULT_QUALITY_LABEL: &str = "Standard";
const DEFAULT_EXTRACTOR_BIN: &str = "tiktok-scraper";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const TIKTOK_REFERER: &str = "https://www.tiktok.com/";
const TIKTOK_ORIGIN: &str = "https://www.tiktok.com";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum MediaKind {
    Video,
    Image,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    success: bool,
    username: String,
    title: String,
    media: Vec<MediaEntry>,
}

#[derive(Debug, Serialize)]
struct MediaEntry {
    #[serde(rename = "type")]
    kind: MediaKind,
    quality: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn gateway_timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: message.into(),
        }
    }

    fn upstream(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
        });

        (self.status, body).into_response()
    }
}

#[derive(Debug, Clone)]
struct StoredLink {
    origin_url: String,
    filename: String,
    content_type: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
struct LinkRegistry {
    entries: Arc<Mutex<HashMap<String, StoredLink>>>,
    ttl: chrono::Duration,
}

impl LinkRegistry {
    fn new(ttl: chrono::Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    async fn insert(&self, origin_url: String, filename: String, content_type: String) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let link = StoredLink {
            origin_url,
            filename,
            content_type,
            expires_at: Utc::now() + self.ttl,
        };

        self.entries.lock().await.insert(id.clone(), link);
        id
    }

    async fn lookup(&self, id: &str) -> Option<StoredLink> {
        let entries = self.entries.lock().await;
        entries
            .get(id)
            .filter(|link| link.expires_at > Utc::now())
            .cloned()
    }

    #[allow(dead_code)]
    async fn remove(&self, id: &str) {
        self.entries.lock().await.remove(id);
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, link| link.expires_at > now);
        before - entries.len()
    }

    fn spawn_sweeper(&self, period_seconds: u64) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(period_seconds));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.remove_expired(Utc::now()).await;
                if removed > 0 {
                    debug!("El barrido del registro elimino {removed} enlaces expirados.");
                }
            }
        });
    }
}

#[derive(Debug, Clone)]
enum Extraction {
    Success {
        username: Option<String>,
        title: Option<String>,
        media: Vec<RawMedia>,
    },
    Failure {
        msg: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RawMedia {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScraperReport {
    status: bool,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    data: Vec<RawMedia>,
}

#[async_trait]
trait MediaExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<Extraction, ApiError>;
}

struct CommandExtractor {
    program: String,
}

impl CommandExtractor {
    fn from_env() -> Self {
        let program = std::env::var("EXTRACTOR_BIN")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_EXTRACTOR_BIN.to_string());

        Self { program }
    }
}

#[async_trait]
impl MediaExtractor for CommandExtractor {
    async fn extract(&self, url: &str) -> Result<Extraction, ApiError> {
        let command_future = Command::new(&self.program).arg("--json").arg(url).output();
        let output = timeout(Duration::from_secs(EXTRACTOR_TIMEOUT_SECONDS), command_future)
            .await
            .map_err(|_| ApiError::internal("El extractor excedio el tiempo limite."))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ApiError::internal(format!(
                        "El extractor {} no esta instalado en el sistema.",
                        self.program
                    ))
                } else {
                    ApiError::internal(format!("No se pudo ejecutar el extractor: {error}"))
                }
            })?;

        if !output.status.success() {
            return Ok(Extraction::Failure {
                msg: Some(extractor_error_message(&output.stderr)),
            });
        }

        let report: ScraperReport = serde_json::from_slice(&output.stdout).map_err(|error| {
            warn!("El extractor devolvio una respuesta ilegible para {url}: {error}");
            ApiError::internal("Respuesta invalida del extractor.")
        })?;

        if report.status {
            Ok(Extraction::Success {
                username: report.username,
                title: report.title,
                media: report.data,
            })
        } else {
            Ok(Extraction::Failure { msg: report.msg })
        }
    }
}

fn extractor_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("El extractor no pudo procesar la publicacion")
        .to_string()
}

#[derive(Debug, Clone)]
struct AppConfig {
    bind_addr: String,
    public_base_url: String,
    include_stream_links: bool,
}

impl AppConfig {
    fn from_env() -> Self {
        let bind_addr = resolve_bind_addr();
        let public_base_url = resolve_public_base_url(&bind_addr);
        let include_stream_links = read_bool_env("INCLUDE_STREAM_LINKS").unwrap_or(true);

        Self {
            bind_addr,
            public_base_url,
            include_stream_links,
        }
    }

    fn stream_url_for(&self, id: &str) -> String {
        format!("{}/api/media/stream/{id}", self.public_base_url)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tikrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Arc::new(AppConfig::from_env());

    let http_client = reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(Duration::from_secs(MEDIA_FETCH_TIMEOUT_SECONDS))
        .redirect(reqwest::redirect::Policy::limited(MEDIA_FETCH_MAX_REDIRECTS))
        .build()
        .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))?;

    let registry = LinkRegistry::new(chrono::Duration::seconds(LINK_TTL_SECONDS));
    registry.spawn_sweeper(REGISTRY_SWEEP_SECONDS);

    let extractor = Arc::new(CommandExtractor::from_env());
    info!("Extractor configurado: {}", extractor.program);

    if config.include_stream_links {
        info!(
            "Enlaces de streaming publicados sobre {}",
            config.public_base_url
        );
    } else {
        warn!("INCLUDE_STREAM_LINKS=false: las respuestas solo llevaran URLs de origen.");
    }

    let state = AppState {
        registry,
        extractor,
        http_client,
        config: Arc::clone(&config),
    };

    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    info!("Relay listo en http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_root))
        .route("/health", get(health))
        .route("/api/data", get(resolve_media))
        .route("/api/media/stream/{id}", get(stream_media))
        .fallback(route_not_found)
        .with_state(state)
        .layer(build_cors_layer())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
}

async fn service_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "online",
        "message": "Relay de medios de TikTok. Envia un enlace de publicacion a /api/data.",
        "endpoints": {
            "data": "/api/data?url=<enlace de TikTok>",
            "stream": "/api/media/stream/{id}",
            "health": "/health"
        }
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("Ruta no encontrada.")
}

async fn resolve_media(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let url = query.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(ApiError::bad_request("Falta el parametro url."));
    }
    if !is_supported_post_url(url) {
        return Err(ApiError::bad_request(
            "URL no soportada. Usa un enlace de publicacion de TikTok.",
        ));
    }

    let extraction = state.extractor.extract(url).await?;
    let (username, title, items) = match extraction {
        Extraction::Failure { msg } => {
            let message = msg
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| "No se encontraron medios en la publicacion.".to_string());
            info!("Extraccion sin resultados para {url}: {message}");
            return Err(ApiError::not_found(message));
        }
        Extraction::Success {
            username,
            title,
            media,
        } => (
            username
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            title
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            media,
        ),
    };

    let safe_title = sanitize_title(&title);
    let mut media = Vec::with_capacity(items.len());

    for item in &items {
        let Some(origin_url) = item.url.as_deref().and_then(non_empty) else {
            continue;
        };

        let hint = [item.quality.as_deref(), item.kind.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let (kind, extension) = classify(origin_url, &hint);
        let content_type = content_type_for(kind, &extension);
        let filename = format!("{FILENAME_PREFIX}{safe_title}.{extension}");

        let id = state
            .registry
            .insert(origin_url.to_string(), filename, content_type.to_string())
            .await;

        media.push(MediaEntry {
            kind,
            quality: item
                .quality
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_QUALITY_LABEL)
                .to_string(),
            url: origin_url.to_string(),
            stream_url: state
                .config
                .include_stream_links
                .then(|| state.config.stream_url_for(&id)),
            thumbnail: item
                .thumbnail
                .as_deref()
                .and_then(non_empty)
                .map(ToString::to_string),
        });
    }

    if media.is_empty() {
        return Err(ApiError::not_found(
            "La publicacion no contiene medios descargables.",
        ));
    }

    debug!("Se registraron {} medios para {url}", media.len());

    Ok(Json(ResolveResponse {
        success: true,
        username,
        title,
        media,
    }))
}

async fn stream_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let link = state
        .registry
        .lookup(&id)
        .await
        .ok_or_else(|| ApiError::not_found("Enlace no encontrado o expirado."))?;

    let upstream = state
        .http_client
        .get(&link.origin_url)
        .header(reqwest::header::REFERER, TIKTOK_REFERER)
        .header(reqwest::header::ORIGIN, TIKTOK_ORIGIN)
        .send()
        .await
        .map_err(|error| {
            warn!("Fallo la descarga de origen para {id}: {error}");
            if error.is_timeout() || error.is_connect() {
                ApiError::gateway_timeout("El origen del medio no respondio a tiempo.")
            } else {
                ApiError::bad_gateway("No se pudo contactar el origen del medio.")
            }
        })?;

    let status = upstream.status();
    if !status.is_success() {
        warn!("El origen respondio {status} para {id}");
        return Err(match status.as_u16() {
            403 => ApiError::upstream(403, "El origen rechazo el acceso al medio."),
            404 => ApiError::not_found("El medio ya no esta disponible en el origen."),
            500..=599 => ApiError::bad_gateway("El origen del medio respondio con un error."),
            code => ApiError::upstream(code, format!("El origen respondio con estado {code}.")),
        });
    }

    let content_length = upstream.content_length();

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&link.content_type)
            .map_err(|_| ApiError::internal("No se pudo crear el tipo de contenido."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&link.filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    if let Some(length) = content_length
        && let Ok(value) = HeaderValue::from_str(&length.to_string())
    {
        headers.insert(CONTENT_LENGTH, value);
    }

    let body = Body::from_stream(upstream.bytes_stream());
    Ok((headers, body).into_response())
}

fn is_supported_post_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    const SUPPORTED_DOMAINS: [&str; 4] =
        ["tiktok.com", "vm.tiktok.com", "vt.tiktok.com", "m.tiktok.com"];

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn classify(url: &str, hint: &str) -> (MediaKind, String) {
    let url = url.to_ascii_lowercase();
    let hint = hint.to_ascii_lowercase();

    const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mov", "avi", "mkv"];
    const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

    for extension in VIDEO_EXTENSIONS {
        if url.contains(&format!(".{extension}")) {
            return (MediaKind::Video, extension.to_string());
        }
    }

    for extension in IMAGE_EXTENSIONS {
        if url.contains(&format!(".{extension}")) {
            return (MediaKind::Image, extension.to_string());
        }
    }

    if url.contains("video") || hint.contains("video") {
        return (MediaKind::Video, "mp4".to_string());
    }

    if url.contains("photo")
        || url.contains("image")
        || hint.contains("photo")
        || hint.contains("image")
    {
        return (MediaKind::Image, "jpg".to_string());
    }

    (MediaKind::Unknown, "bin".to_string())
}

fn content_type_for(kind: MediaKind, extension: &str) -> &'static str {
    match kind {
        MediaKind::Video => match extension {
            "mp4" => "video/mp4",
            "mov" => "video/quicktime",
            "avi" => "video/x-msvideo",
            "mkv" => "video/x-matroska",
            _ => "video/mp4",
        },
        MediaKind::Image => match extension {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "image/jpeg",
        },
        MediaKind::Unknown => "application/octet-stream",
    }
}

fn sanitize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    let base = if trimmed.is_empty() {
        DEFAULT_TITLE
    } else {
        trimmed
    };

    let truncated = base.chars().take(MAX_TITLE_CHARS).collect::<String>();
    let stripped = truncated
        .chars()
        .filter(|character| {
            character.is_alphanumeric()
                || character.is_whitespace()
                || matches!(character, '.' | '-' | '_')
        })
        .collect::<String>();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join("_");

    if collapsed.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        collapsed
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim_matches('_');
    if compact.is_empty() {
        "descarga.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:3000".to_string()
}

fn resolve_public_base_url(bind_addr: &str) -> String {
    if let Some(configured) = std::env::var("PUBLIC_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured.trim_end_matches('/').to_string();
    }

    if let Some(domain) = std::env::var("RAILWAY_PUBLIC_DOMAIN")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return format!("https://{}", domain.trim_end_matches('/'));
    }

    if let Some(external) = std::env::var("RENDER_EXTERNAL_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return external.trim_end_matches('/').to_string();
    }

    let port = bind_addr.rsplit(':').next().unwrap_or("3000");
    format!("http://localhost:{port}")
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
