use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppState, DurationView, FormatDescriptor, ThumbnailSet};
use crate::{
    config::RuntimeMode,
    error::ApiError,
    helpers::{Envelope, format_duration, normalize_upload_date, sanitize, watch_url},
    ytdlp::{
        BackendError, RawFormat, RelatedVideo, VideoInfo, audio_only, video_and_audio,
        whole_seconds,
    },
};

const RELATED_LIMIT: usize = 5;
const ADULT_AGE_LIMIT: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatFilter {
    All,
    Audio,
    Video,
}

impl FormatFilter {
    /// Unknown values behave like `all`.
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("audio") => Self::Audio,
            Some("video") => Self::Video,
            _ => Self::All,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FormatTypeParams {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetailAuthor {
    name: String,
    id: Option<String>,
    url: Option<String>,
    avatar: Option<String>,
    verified: bool,
    subscribers: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FormatGroups {
    audio: Vec<FormatDescriptor>,
    video: Vec<FormatDescriptor>,
    total: usize,
}

#[derive(Debug, Serialize)]
pub struct RelatedSummary {
    id: String,
    title: Option<String>,
    author: Option<String>,
    duration: String,
    views: Option<u64>,
    thumbnail: Option<String>,
}

impl From<RelatedVideo> for RelatedSummary {
    fn from(video: RelatedVideo) -> Self {
        Self {
            thumbnail: video.thumbnails.into_iter().next().map(|thumbnail| thumbnail.url),
            duration: format_duration(whole_seconds(video.duration)),
            id: video.id,
            title: video.title,
            author: video.author,
            views: video.view_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetail {
    id: String,
    title: String,
    description: String,
    author: DetailAuthor,
    duration: DurationView,
    views: Option<u64>,
    likes: Option<u64>,
    upload_date: Option<String>,
    publish_date: Option<String>,
    thumbnails: ThumbnailSet,
    category: Option<String>,
    tags: Vec<String>,
    is_live: bool,
    is_private: bool,
    age_restricted: bool,
    family_safe: bool,
    available_countries: Option<Vec<String>>,
    formats: FormatGroups,
    related_videos: Vec<RelatedSummary>,
    url: String,
}

impl VideoDetail {
    fn build(info: VideoInfo, filter: FormatFilter) -> Self {
        let seconds = info.length_seconds();
        let age_limit = info.age_limit.unwrap_or(0);

        let audio = match filter {
            FormatFilter::Video => Vec::new(),
            _ => audio_only(&info.formats)
                .into_iter()
                .map(audio_descriptor)
                .collect(),
        };
        let video = match filter {
            FormatFilter::Audio => Vec::new(),
            _ => video_and_audio(&info.formats)
                .into_iter()
                .map(video_descriptor)
                .collect(),
        };

        let upload_date = info.upload_date.as_deref().map(normalize_upload_date);
        let publish_date = info
            .release_date
            .as_deref()
            .map(normalize_upload_date)
            .or_else(|| upload_date.clone());

        Self {
            title: sanitize(info.title.as_deref()),
            description: info.description.clone().unwrap_or_default(),
            author: DetailAuthor {
                name: info.author_name().unwrap_or("Unknown").to_string(),
                id: info.channel_id.clone(),
                url: info.channel_url.clone(),
                avatar: None,
                verified: info.channel_is_verified.unwrap_or(false),
                subscribers: info.channel_follower_count,
            },
            duration: DurationView {
                seconds,
                formatted: format_duration(seconds),
            },
            views: info.view_count,
            likes: info.like_count,
            upload_date,
            publish_date,
            thumbnails: ThumbnailSet {
                default: info.thumbnails.first().map(|thumbnail| thumbnail.url.clone()),
                medium: info.thumbnails.get(1).map(|thumbnail| thumbnail.url.clone()),
                high: info.thumbnails.get(2).map(|thumbnail| thumbnail.url.clone()),
                maxres: info.thumbnails.last().map(|thumbnail| thumbnail.url.clone()),
            },
            category: info.categories.first().cloned(),
            is_live: info.is_live.unwrap_or(false),
            is_private: info.availability.as_deref() == Some("private"),
            age_restricted: age_limit >= ADULT_AGE_LIMIT,
            family_safe: age_limit == 0,
            available_countries: info.available_countries,
            formats: FormatGroups {
                audio,
                video,
                total: info.formats.len(),
            },
            related_videos: info
                .related_videos
                .into_iter()
                .take(RELATED_LIMIT)
                .map(RelatedSummary::from)
                .collect(),
            url: watch_url(&info.id).unwrap_or_default(),
            tags: info.tags,
            id: info.id,
        }
    }
}

fn audio_descriptor(raw: &RawFormat) -> FormatDescriptor {
    FormatDescriptor {
        kind: Some("audio"),
        container: raw.ext.clone(),
        bitrate: raw.bitrate(),
        ..FormatDescriptor::new(raw, raw.audio_quality_label())
    }
}

fn video_descriptor(raw: &RawFormat) -> FormatDescriptor {
    FormatDescriptor {
        kind: Some("video"),
        container: raw.ext.clone(),
        fps: raw.fps,
        bitrate: raw.bitrate(),
        resolution: raw.resolution(),
        ..FormatDescriptor::new(raw, raw.quality_label())
    }
}

fn track_kind(raw: &RawFormat) -> &'static str {
    match (raw.has_video(), raw.has_audio()) {
        (true, true) => "video",
        (false, true) => "audio",
        _ => "video-only",
    }
}

fn listed_descriptor(raw: &RawFormat) -> FormatDescriptor {
    FormatDescriptor {
        kind: Some(track_kind(raw)),
        container: raw.ext.clone(),
        mime_type: raw.mime_type(),
        bitrate: raw.bitrate(),
        fps: raw.fps,
        resolution: raw.resolution(),
        audio_bitrate: raw.audio_bitrate(),
        ..FormatDescriptor::new(raw, raw.quality_label())
    }
}

fn canonical_url(video_id: &str) -> Result<String, ApiError> {
    watch_url(video_id).ok_or_else(|| {
        ApiError::bad_request("Invalid video ID", "Please provide a valid video ID")
    })
}

fn info_error(error: BackendError, mode: RuntimeMode) -> ApiError {
    let (status, message) = match &error {
        BackendError::Unavailable(_) => (StatusCode::NOT_FOUND, "Video not found or unavailable"),
        BackendError::Private(_) => (StatusCode::FORBIDDEN, "Video is private"),
        BackendError::AgeRestricted(_) => (StatusCode::FORBIDDEN, "Video is age-restricted"),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to get video information",
        ),
    };
    ApiError::new(status, "Info retrieval failed", message).with_details(mode, &error)
}

pub async fn video_info(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(params): Query<FormatTypeParams>,
) -> Result<Json<Envelope<VideoDetail>>, ApiError> {
    let url = canonical_url(&video_id)?;
    info!("getting info for video {video_id}");

    let info = state.backend.video_info(&url).await.map_err(|error| {
        warn!("info for {video_id} failed: {error}");
        info_error(error, state.config.mode)
    })?;

    let detail = VideoDetail::build(info, FormatFilter::parse(params.kind.as_deref()));
    Ok(Json(Envelope::success(
        detail,
        "Video information retrieved successfully",
    )))
}

pub async fn video_formats(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(params): Query<FormatTypeParams>,
) -> Result<Json<Envelope<Vec<FormatDescriptor>>>, ApiError> {
    let url = canonical_url(&video_id)?;
    info!("listing formats for video {video_id}");

    let info = state.backend.video_info(&url).await.map_err(|error| {
        warn!("formats for {video_id} failed: {error}");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get formats",
            "Unable to get video formats",
        )
        .with_details(state.config.mode, &error)
    })?;

    let selected = match FormatFilter::parse(params.kind.as_deref()) {
        FormatFilter::All => info.formats.iter().collect(),
        FormatFilter::Audio => audio_only(&info.formats),
        FormatFilter::Video => video_and_audio(&info.formats),
    };
    let formats = selected
        .into_iter()
        .map(listed_descriptor)
        .collect::<Vec<_>>();
    let count = formats.len();

    Ok(Json(
        Envelope::success(formats, "Video formats retrieved successfully")
            .with_count(count)
            .with_video_id(video_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::*;
    use axum::response::IntoResponse;
    use serde_json::Value;

    fn all() -> Query<FormatTypeParams> {
        Query(FormatTypeParams { kind: None })
    }

    fn only(kind: &str) -> Query<FormatTypeParams> {
        Query(FormatTypeParams {
            kind: Some(kind.to_string()),
        })
    }

    async fn fetch_info(backend: FakeBackend, id: &str) -> (StatusCode, Value) {
        let (state, _) = state(backend);
        let response = video_info(State(state), Path(id.to_string()), all())
            .await
            .into_response();
        let status = response.status();
        (status, body_json(response).await)
    }

    fn with_info(info: Result<VideoInfo, BackendError>) -> FakeBackend {
        FakeBackend {
            info,
            ..FakeBackend::default()
        }
    }

    #[tokio::test]
    async fn malformed_id_is_rejected_before_fetching() {
        let (state, backend) = state(with_info(Ok(sample_info())));
        let response = video_info(State(state), Path("short".to_string()), all())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid video ID");
        assert!(backend.info_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_video_is_a_404() {
        let (status, body) = fetch_info(
            with_info(Err(BackendError::Unavailable("Video unavailable".into()))),
            VIDEO_ID,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Video not found or unavailable");
    }

    #[tokio::test]
    async fn private_and_age_restricted_videos_are_403() {
        let (status, body) =
            fetch_info(with_info(Err(BackendError::Private("private".into()))), VIDEO_ID).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "Video is private");

        let (status, body) = fetch_info(
            with_info(Err(BackendError::AgeRestricted("age".into()))),
            VIDEO_ID,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "Video is age-restricted");
    }

    #[tokio::test]
    async fn other_failures_are_500() {
        let (status, body) = fetch_info(with_info(Err(BackendError::Timeout)), VIDEO_ID).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Info retrieval failed");
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn detail_maps_metadata() {
        let (state, backend) = state(with_info(Ok(sample_info())));
        let response = video_info(State(state), Path(VIDEO_ID.to_string()), all())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            backend.info_calls.lock().unwrap().as_slice(),
            &[format!("https://www.youtube.com/watch?v={VIDEO_ID}")]
        );

        let body = body_json(response).await;
        let data = &body["data"];
        assert_eq!(body["message"], "Video information retrieved successfully");
        assert_eq!(data["id"], VIDEO_ID);
        assert_eq!(data["author"]["name"], "Rick Astley");
        assert_eq!(data["author"]["subscribers"], 4_000_000);
        assert_eq!(data["duration"]["seconds"], 212);
        assert_eq!(data["duration"]["formatted"], "3:32");
        assert_eq!(data["uploadDate"], "2009-10-25");
        assert_eq!(data["publishDate"], "2009-10-25");
        assert_eq!(data["category"], "Music");
        assert_eq!(data["ageRestricted"], false);
        assert_eq!(data["familySafe"], true);
        assert_eq!(data["isPrivate"], false);
        assert!(data["availableCountries"].is_null());
        assert!(
            data["thumbnails"]["maxres"]
                .as_str()
                .unwrap()
                .ends_with("maxresdefault.jpg")
        );
        assert!(
            data["thumbnails"]["high"]
                .as_str()
                .unwrap()
                .ends_with("/hqdefault.jpg")
        );

        let formats = &data["formats"];
        assert_eq!(formats["total"], 6);
        assert_eq!(formats["audio"].as_array().unwrap().len(), 2);
        assert_eq!(formats["audio"][0]["itag"], 140);
        assert_eq!(formats["audio"][0]["quality"], "130kbps");
        assert_eq!(formats["audio"][0]["type"], "audio");
        assert_eq!(formats["audio"][1]["size"], Value::Null);
        assert_eq!(formats["video"].as_array().unwrap().len(), 3);
        assert_eq!(formats["video"][0]["resolution"], "640x360");

        let related = data["relatedVideos"].as_array().unwrap();
        assert_eq!(related.len(), 5);
        assert_eq!(related[0]["duration"], "1:01");
        assert_eq!(data["url"], format!("https://www.youtube.com/watch?v={VIDEO_ID}"));
    }

    #[tokio::test]
    async fn type_filter_narrows_format_groups() {
        let (state, _) = state(with_info(Ok(sample_info())));
        let response = video_info(State(state), Path(VIDEO_ID.to_string()), only("audio"))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["data"]["formats"]["audio"].as_array().unwrap().len(), 2);
        assert!(body["data"]["formats"]["video"].as_array().unwrap().is_empty());
        assert_eq!(body["data"]["formats"]["total"], 6);
    }

    #[tokio::test]
    async fn repeated_requests_differ_only_in_timestamp() {
        let (state, _) = state(with_info(Ok(sample_info())));
        let mut bodies = Vec::new();
        for _ in 0..2 {
            let response = video_info(State(state.clone()), Path(VIDEO_ID.to_string()), all())
                .await
                .into_response();
            let mut body = body_json(response).await;
            body.as_object_mut().unwrap().remove("timestamp");
            bodies.push(body);
        }
        assert_eq!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn formats_are_tagged_by_track_kind() {
        let (state, _) = state(with_info(Ok(sample_info())));
        let response = video_formats(State(state), Path(VIDEO_ID.to_string()), all())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["count"], 6);
        assert_eq!(body["videoId"], VIDEO_ID);

        let kinds = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|format| format["type"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            ["audio", "audio", "video", "video", "video", "video-only"]
        );

        let audio = &body["data"][0];
        assert_eq!(audio["audioBitrate"], 130);
        assert_eq!(audio["mimeType"], "audio/m4a; codecs=\"mp4a.40.2\"");
        assert!(audio.get("resolution").is_none());
        assert_eq!(body["data"][5]["resolution"], "1920x1080");
    }

    #[tokio::test]
    async fn formats_can_be_filtered() {
        let (state, _) = state(with_info(Ok(sample_info())));
        let response = video_formats(State(state), Path(VIDEO_ID.to_string()), only("video"))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["count"], 3);
    }

    #[tokio::test]
    async fn formats_failure_is_always_500() {
        let (state, _) = state(with_info(Err(BackendError::Unavailable("gone".into()))));
        let response = video_formats(State(state), Path(VIDEO_ID.to_string()), all())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Failed to get formats");
    }
}
