use std::{any::Any, sync::Arc};

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::{
    config::Config,
    error::ApiError,
    helpers::{API_TAG, timestamp},
    middleware::{RateLimiter, build_cors_layer, rate_limit, with_security_headers},
    ytdlp::{RawFormat, VideoBackend},
};

pub mod download;
pub mod info;
pub mod search;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const AVAILABLE_ENDPOINTS: [&str; 8] = [
    "/api",
    "/api/health",
    "/api/search",
    "/api/search/suggestions",
    "/api/info/:videoId",
    "/api/info/:videoId/formats",
    "/api/download",
    "/api/download/stream/:videoId",
];

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn VideoBackend>,
    pub config: Arc<Config>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(backend: Arc<dyn VideoBackend>, config: Config) -> Self {
        Self {
            limiter: RateLimiter::new(config.rate_limit_max, config.rate_limit_window),
            backend,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config)?;
    let development = state.config.mode.exposes_details();

    let router = Router::new()
        .route("/api", get(api_docs))
        .route("/api/health", get(health))
        .route("/api/search", get(search::search))
        .route("/api/search/suggestions", get(search::suggestions))
        .route("/api/info/{video_id}", get(info::video_info))
        .route("/api/info/{video_id}/formats", get(info::video_formats))
        .route("/api/download", post(download::download_links))
        .route("/api/download/stream/{video_id}", get(download::stream))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit,
        ))
        .with_state(state)
        .layer(cors);

    Ok(with_security_headers(router)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(panic, development),
        )))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "message": "video-api is running",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp(),
    }))
}

async fn api_docs() -> Json<serde_json::Value> {
    Json(json!({
        "name": "video-api",
        "version": env!("CARGO_PKG_VERSION"),
        "api": API_TAG,
        "description": "Search videos, read their metadata and generate download links",
        "endpoints": {
            "search": {
                "url": "/api/search",
                "method": "GET",
                "params": {
                    "q": "search query (at least 2 characters)",
                    "limit": "number (optional, 1-50, default: 20)",
                    "type": "video|channel|playlist|all (optional, default: video)"
                },
                "description": "Search videos"
            },
            "suggestions": {
                "url": "/api/search/suggestions",
                "method": "GET",
                "params": { "q": "partial search query" },
                "description": "Search suggestions for a query"
            },
            "videoInfo": {
                "url": "/api/info/:videoId",
                "method": "GET",
                "params": { "type": "all|audio|video (optional, default: all)" },
                "description": "Detailed video information"
            },
            "videoFormats": {
                "url": "/api/info/:videoId/formats",
                "method": "GET",
                "params": { "type": "all|audio|video (optional, default: all)" },
                "description": "Available formats of a video"
            },
            "download": {
                "url": "/api/download",
                "method": "POST",
                "body": {
                    "url": "video url",
                    "format": "best|mp3|audio|mp4 (optional, default: best)",
                    "quality": "quality hint (optional, default: highest)"
                },
                "description": "Direct download links for a video"
            },
            "stream": {
                "url": "/api/download/stream/:videoId",
                "method": "GET",
                "params": {
                    "format": "mp4|mp3|webm|m4a (optional, default: mp4)",
                    "quality": "highest|lowest|<itag> (optional, default: highest)"
                },
                "description": "Stream the video bytes as an attachment"
            },
            "health": {
                "url": "/api/health",
                "method": "GET",
                "description": "Service health"
            }
        }
    }))
}

async fn not_found(uri: Uri) -> Response {
    debug!("no route for {uri}");
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Endpoint not found",
            "message": "The requested endpoint does not exist",
            "availableEndpoints": AVAILABLE_ENDPOINTS,
        })),
    )
        .into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>, development: bool) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("handler panicked: {detail}");

    let message = if development {
        detail
    } else {
        "Something went wrong".to_string()
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": "Internal Server Error",
            "message": message,
            "timestamp": timestamp(),
        })),
    )
        .into_response()
}

#[derive(Debug, Clone, Serialize)]
pub struct DurationView {
    pub seconds: u64,
    pub formatted: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThumbnailSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxres: Option<String>,
}

/// One concrete encoding offered for a video.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub itag: Option<u32>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FormatDescriptor {
    fn new(raw: &RawFormat, quality: String) -> Self {
        Self {
            itag: raw.itag(),
            kind: None,
            format: None,
            quality,
            container: None,
            mime_type: None,
            size: raw.size(),
            bitrate: None,
            fps: None,
            resolution: None,
            audio_bitrate: None,
            url: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;
    use crate::ytdlp::{
        BackendError, MediaStream, RelatedVideo, SearchItem, SearchKind, StreamSelection,
        Thumbnail, VideoInfo,
    };

    pub const VIDEO_ID: &str = "dQw4w9WgXcQ";

    pub struct FakeBackend {
        pub info: Result<VideoInfo, BackendError>,
        pub search_results: Result<Vec<SearchItem>, BackendError>,
        pub suggestions: Result<Vec<String>, BackendError>,
        pub stream_bytes: Vec<u8>,
        pub stream_error: Option<BackendError>,
        pub info_calls: Mutex<Vec<String>>,
        pub search_calls: Mutex<Vec<(String, usize, SearchKind)>>,
        pub stream_calls: Mutex<Vec<(String, StreamSelection)>>,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            Self {
                info: Err(BackendError::Failed("no metadata configured".to_string())),
                search_results: Ok(Vec::new()),
                suggestions: Ok(Vec::new()),
                stream_bytes: Vec::new(),
                stream_error: None,
                info_calls: Mutex::new(Vec::new()),
                search_calls: Mutex::new(Vec::new()),
                stream_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VideoBackend for FakeBackend {
        async fn video_info(&self, url: &str) -> Result<VideoInfo, BackendError> {
            self.info_calls.lock().unwrap().push(url.to_string());
            self.info.clone()
        }

        async fn search(
            &self,
            query: &str,
            limit: usize,
            kind: SearchKind,
        ) -> Result<Vec<SearchItem>, BackendError> {
            self.search_calls
                .lock()
                .unwrap()
                .push((query.to_string(), limit, kind));
            self.search_results.clone()
        }

        async fn suggestions(&self, _query: &str) -> Result<Vec<String>, BackendError> {
            self.suggestions.clone()
        }

        async fn open_stream(
            &self,
            url: &str,
            selection: StreamSelection,
        ) -> Result<MediaStream, BackendError> {
            self.stream_calls
                .lock()
                .unwrap()
                .push((url.to_string(), selection));
            if let Some(error) = &self.stream_error {
                return Err(error.clone());
            }
            Ok(Box::new(std::io::Cursor::new(self.stream_bytes.clone())))
        }
    }

    /// State whose config reads only the given variables.
    pub fn state_from(
        backend: FakeBackend,
        vars: &[(&str, &str)],
    ) -> (AppState, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let config = Config::from_lookup(|key| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        });
        let state = AppState::new(backend.clone(), config);
        (state, backend)
    }

    pub fn state_with(backend: FakeBackend, mode: &str) -> (AppState, Arc<FakeBackend>) {
        state_from(backend, &[("APP_ENV", mode)])
    }

    pub fn state(backend: FakeBackend) -> (AppState, Arc<FakeBackend>) {
        state_with(backend, "production")
    }

    pub async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn format(id: &str, ext: &str, vcodec: &str, acodec: &str) -> RawFormat {
        RawFormat {
            format_id: id.to_string(),
            ext: Some(ext.to_string()),
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            url: Some(format!("https://media.example/{id}")),
            ..RawFormat::default()
        }
    }

    fn thumbnail(name: &str) -> Thumbnail {
        Thumbnail {
            url: format!("https://i.ytimg.com/vi/{VIDEO_ID}/{name}.jpg"),
        }
    }

    pub fn sample_info() -> VideoInfo {
        let related = (0..7)
            .map(|index| RelatedVideo {
                id: format!("related{index:04}"),
                title: Some(format!("Related {index}")),
                author: Some("Someone".to_string()),
                duration: Some(61.0),
                view_count: Some(5),
                thumbnails: vec![thumbnail("related")],
            })
            .collect();

        VideoInfo {
            id: VIDEO_ID.to_string(),
            title: Some("Never Gonna Give You Up".to_string()),
            description: Some("x".repeat(300)),
            channel: Some("Rick Astley".to_string()),
            channel_id: Some("UCuAXFkgsw1L7xaCfnd5JJOw".to_string()),
            channel_url: Some("https://www.youtube.com/channel/UCuAXFkgsw1L7xaCfnd5JJOw".to_string()),
            channel_follower_count: Some(4_000_000),
            channel_is_verified: Some(true),
            duration: Some(212.0),
            view_count: Some(1_500_000_000),
            like_count: Some(17_000_000),
            upload_date: Some("20091025".to_string()),
            thumbnails: vec![
                thumbnail("default"),
                thumbnail("mqdefault"),
                thumbnail("hqdefault"),
                thumbnail("sddefault"),
                thumbnail("maxresdefault"),
            ],
            categories: vec!["Music".to_string()],
            tags: vec!["rick".to_string(), "astley".to_string()],
            is_live: Some(false),
            availability: Some("public".to_string()),
            age_limit: Some(0),
            formats: vec![
                RawFormat {
                    abr: Some(129.5),
                    tbr: Some(129.5),
                    filesize: Some(3_433_514.0),
                    ..format("140", "m4a", "none", "mp4a.40.2")
                },
                RawFormat {
                    abr: Some(160.0),
                    ..format("251", "webm", "none", "opus")
                },
                RawFormat {
                    width: Some(640),
                    height: Some(360),
                    fps: Some(25.0),
                    tbr: Some(503.2),
                    ..format("18", "mp4", "avc1.42001E", "mp4a.40.2")
                },
                format("95", "mp4", "avc1.4d401f", "mp4a.40.2"),
                RawFormat {
                    width: Some(1280),
                    height: Some(720),
                    fps: Some(30.0),
                    ..format("22", "mp4", "avc1.64001F", "mp4a.40.2")
                },
                RawFormat {
                    width: Some(1920),
                    height: Some(1080),
                    ..format("137", "mp4", "avc1.640028", "none")
                },
            ],
            related_videos: related,
            ..VideoInfo::default()
        }
    }
}
