use std::sync::LazyLock;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, process::Command, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    http_client: reqwest::Client,
}

const PROXY_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_PROXY_FILENAME: &str = "video.mp4";
const FORMAT_SELECTOR: &str = "best[ext=mp4][height<=720]/best[ext=mp4]/best";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

static YOUTUBE_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/.+")
        .unwrap_or_else(|error| panic!("invalid YouTube URL pattern: {error}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    #[default]
    Info,
    GetDownloadUrl,
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    url: String,
    #[serde(default)]
    action: Action,
}

#[derive(Debug, Serialize)]
struct VideoInfo {
    title: String,
    duration: String,
    thumbnail: String,
    uploader: String,
    video_id: String,
    download_url: String,
    filesize: u64,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    video_info: VideoInfo,
}

#[derive(Debug, Serialize)]
struct DownloadUrlResponse {
    success: bool,
    download_url: String,
    filename: String,
    filesize: u64,
    format_note: String,
    quality: String,
}

#[derive(Debug, Deserialize)]
struct ProxyRequest {
    download_url: String,
    #[serde(default = "default_proxy_filename")]
    filename: String,
}

fn default_proxy_filename() -> String {
    DEFAULT_PROXY_FILENAME.to_string()
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    webpage_url: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    ext: Option<String>,
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    format_note: Option<String>,
    height: Option<u32>,
}

/// Extraction failure reported in-band: the body is `{"error": ...}` and the
/// status stays 200. Clients of this API key off the `error` field, not the
/// status code.
#[derive(Debug)]
struct ExtractError {
    message: String,
}

impl ExtractError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl IntoResponse for ExtractError {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn upstream(status: StatusCode) -> Self {
        Self {
            status,
            message: "Failed to fetch video".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytbridge=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let http_client = build_http_client()?;
    let app = build_router(AppState { http_client });

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_http_client() -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(PROXY_TIMEOUT_SECONDS))
        .read_timeout(Duration::from_secs(PROXY_TIMEOUT_SECONDS))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/download", post(handle_download))
        .route("/api/proxy-download", post(handle_proxy_download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
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

    "127.0.0.1:8787".to_string()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn handle_download(body: Bytes) -> Result<Response, ExtractError> {
    let payload: ExtractRequest = serde_json::from_slice(&body)
        .map_err(|error| ExtractError::new(format!("Error processing video: {error}")))?;

    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ExtractError::new("URL is required"));
    }
    if !YOUTUBE_URL_PATTERN.is_match(url) {
        return Err(ExtractError::new("Invalid YouTube URL"));
    }

    let info = extract_video_info(url, payload.action).await?;

    match payload.action {
        Action::Info => {
            let selected = select_playable_format(&info.formats);
            let download_url = selected
                .and_then(|format| format.url.clone())
                .or_else(|| info.webpage_url.clone())
                .unwrap_or_else(|| url.to_string());

            let video_info = VideoInfo {
                title: non_empty_or(info.title, "Unknown Title"),
                duration: format_duration(info.duration),
                thumbnail: info.thumbnail.unwrap_or_default(),
                uploader: non_empty_or(info.uploader, "Unknown"),
                video_id: info.id.unwrap_or_default(),
                download_url,
                filesize: selected.map(filesize_of).unwrap_or(0),
            };

            Ok(Json(InfoResponse {
                success: true,
                video_info,
            })
            .into_response())
        }
        Action::GetDownloadUrl => {
            let format = select_muxed_format(&info.formats)
                .ok_or_else(|| ExtractError::new("No suitable format found"))?;

            let title = non_empty_or(info.title.clone(), "video");
            let quality = format
                .height
                .map(|height| format!("{height}p"))
                .or_else(|| format.format_note.clone())
                .unwrap_or_else(|| "Unknown".to_string());

            Ok(Json(DownloadUrlResponse {
                success: true,
                download_url: format.url.clone().unwrap_or_default(),
                filename: format!("{}.mp4", sanitize_filename(&title)),
                filesize: filesize_of(format),
                format_note: format
                    .format_note
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                quality,
            })
            .into_response())
        }
    }
}

async fn handle_proxy_download(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request =
        parse_proxy_request(&body).ok_or_else(|| ApiError::bad_request("Missing download URL"))?;
    let filename = sanitize_filename(&request.filename);

    let upstream = state
        .http_client
        .get(&request.download_url)
        .send()
        .await
        .map_err(|error| ApiError::internal(format!("Download error: {error}")))?;

    let status = upstream.status();
    if status.as_u16() != 200 {
        warn!("Upstream returned {status} for {}", request.download_url);
        let relay = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(ApiError::upstream(relay));
    }

    let mut headers = HeaderMap::new();
    // Fixed mp4 label regardless of upstream content type; kept from the
    // original contract even though a non-mp4 source gets mislabeled.
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    if let Some(length) = upstream.content_length() {
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string())
                .map_err(|_| ApiError::internal("Could not build the download size header."))?,
        );
    }

    Ok((headers, Body::from_stream(upstream.bytes_stream())).into_response())
}

fn parse_proxy_request(body: &[u8]) -> Option<ProxyRequest> {
    let request = serde_json::from_slice::<ProxyRequest>(body)
        .ok()
        .or_else(|| {
            let mut download_url = None;
            let mut filename = None;
            for (key, value) in url::form_urlencoded::parse(body) {
                match key.as_ref() {
                    "download_url" => download_url = Some(value.into_owned()),
                    "filename" => filename = Some(value.into_owned()),
                    _ => {}
                }
            }

            Some(ProxyRequest {
                download_url: download_url?,
                filename: filename.unwrap_or_else(default_proxy_filename),
            })
        })?;

    if request.download_url.trim().is_empty() {
        None
    } else {
        Some(request)
    }
}

async fn extract_video_info(url: &str, action: Action) -> Result<YtDlpVideoInfo, ExtractError> {
    // Randomized delay before every extraction to soften the request
    // signature upstream. Best effort, not a guarantee.
    let delay_ms = rand::rng().random_range(500..=2000);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let args = extraction_args(action, sleep_interval_for(action), url);
    let output = Command::new("yt-dlp")
        .args(&args)
        .output()
        .await
        .map_err(|error| ExtractError::new(format!("Error processing video: {error}")))?;

    if !output.status.success() {
        let message = last_stderr_line(&output.stderr);
        warn!("yt-dlp failed for {url:?}: {message}");
        return Err(ExtractError::new(classify_extractor_error(&message)));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|_| ExtractError::new("Could not extract video information"))
}

fn extraction_args(action: Action, sleep_interval: u64, url: &str) -> Vec<String> {
    let retries = match action {
        Action::Info => 3,
        Action::GetDownloadUrl => 5,
    };
    let max_sleep_interval = match action {
        Action::Info => 5,
        Action::GetDownloadUrl => 8,
    };

    let mut args: Vec<String> = [
        "-J",
        "--no-playlist",
        "--no-warnings",
        "-f",
        FORMAT_SELECTOR,
        "--user-agent",
        BROWSER_USER_AGENT,
        "--add-header",
        "Accept-Language:en-US,en;q=0.9",
    ]
    .into_iter()
    .map(ToString::to_string)
    .collect();

    for flag in ["--retries", "--file-access-retries", "--fragment-retries"] {
        args.push(flag.to_string());
        args.push(retries.to_string());
    }
    args.push("--sleep-interval".to_string());
    args.push(sleep_interval.to_string());
    args.push("--max-sleep-interval".to_string());
    args.push(max_sleep_interval.to_string());
    args.push(url.to_string());

    args
}

fn sleep_interval_for(action: Action) -> u64 {
    match action {
        Action::Info => 1,
        Action::GetDownloadUrl => rand::rng().random_range(1..=3),
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not report a reason")
        .to_string()
}

fn classify_extractor_error(message: &str) -> String {
    if message.contains("Sign in to confirm") || message.contains("bot") {
        "YouTube is blocking automated requests for this video. Please try again later."
            .to_string()
    } else if message.contains("Video unavailable") {
        "This video is unavailable. It may be private, deleted, or region-locked.".to_string()
    } else if message.contains("age-restricted") {
        "This video is age-restricted and cannot be processed.".to_string()
    } else {
        format!("Error processing video: {message}")
    }
}

fn select_playable_format(formats: &[YtDlpFormat]) -> Option<&YtDlpFormat> {
    formats
        .iter()
        .rev()
        .find(|format| is_mp4(format) && has_direct_url(format) && has_video(format))
        .or_else(|| {
            formats
                .iter()
                .rev()
                .find(|format| has_direct_url(format) && has_video(format))
        })
}

fn select_muxed_format(formats: &[YtDlpFormat]) -> Option<&YtDlpFormat> {
    formats
        .iter()
        .rev()
        .find(|format| {
            is_mp4(format) && has_direct_url(format) && has_video(format) && has_audio(format)
        })
        .or_else(|| {
            formats
                .iter()
                .rev()
                .find(|format| has_direct_url(format) && has_video(format))
        })
}

fn is_mp4(format: &YtDlpFormat) -> bool {
    format.ext.as_deref() == Some("mp4")
}

fn has_direct_url(format: &YtDlpFormat) -> bool {
    matches!(format.url.as_deref(), Some(value) if !value.is_empty())
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn filesize_of(format: &YtDlpFormat) -> u64 {
    format.filesize.or(format.filesize_approx).unwrap_or(0)
}

fn format_duration(duration: Option<f64>) -> String {
    let seconds = duration.unwrap_or(0.0) as u64;
    if seconds == 0 {
        "Unknown".to_string()
    } else {
        format!("{}:{:02}", seconds / 60, seconds % 60)
    }
}

fn sanitize_filename(value: &str) -> String {
    value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.') {
                character
            } else {
                '_'
            }
        })
        .collect()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(fallback)
        .to_string()
}
