use axum::{
    Form, Json,
    body::Body,
    extract::{FromRequest, Path, Query, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use super::{AppState, FormatDescriptor};
use crate::{
    config::RuntimeMode,
    error::{ApiError, StreamError},
    helpers::{
        Envelope, build_content_disposition, clean_title, content_type_for_filename,
        extract_video_id, is_valid_video_url, normalize_upload_date, truncate_description,
        watch_url,
    },
    ranking::sort_by_quality,
    ytdlp::{
        BackendError, RawFormat, StreamContainer, StreamQuality, StreamSelection, VideoInfo,
        audio_only, video_and_audio,
    },
};

const MAX_LISTED_FORMATS: usize = 10;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestedFormat {
    Best,
    Mp3,
    Audio,
    Mp4,
}

impl RequestedFormat {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("best") => Some(Self::Best),
            Some("mp3") => Some(Self::Mp3),
            Some("audio") => Some(Self::Audio),
            Some("mp4") => Some(Self::Mp4),
            Some(_) => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Mp3 => "mp3",
            Self::Audio => "audio",
            Self::Mp4 => "mp4",
        }
    }

    fn wants_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::Audio)
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadVideo {
    id: String,
    title: Option<String>,
    author: Option<String>,
    duration: u64,
    views: Option<u64>,
    thumbnail: Option<String>,
    upload_date: Option<String>,
    description: String,
}

impl From<&VideoInfo> for DownloadVideo {
    fn from(info: &VideoInfo) -> Self {
        Self {
            id: info.id.clone(),
            title: info.title.clone(),
            author: info.author_name().map(ToString::to_string),
            duration: info.length_seconds(),
            views: info.view_count,
            thumbnail: info.thumbnails.last().map(|thumbnail| thumbnail.url.clone()),
            upload_date: info.upload_date.as_deref().map(normalize_upload_date),
            description: truncate_description(info.description.as_deref()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLinks {
    video: DownloadVideo,
    formats: Vec<FormatDescriptor>,
    requested_format: &'static str,
    requested_quality: String,
    total_formats: usize,
}

fn audio_link(raw: &RawFormat) -> FormatDescriptor {
    FormatDescriptor {
        format: Some("mp3"),
        mime_type: raw.mime_type(),
        url: raw.url.clone(),
        ..FormatDescriptor::new(raw, raw.audio_quality_label())
    }
}

fn video_link(raw: &RawFormat) -> FormatDescriptor {
    FormatDescriptor {
        format: Some("mp4"),
        mime_type: raw.mime_type(),
        url: raw.url.clone(),
        fps: raw.fps,
        bitrate: raw.bitrate(),
        ..FormatDescriptor::new(raw, raw.quality_label())
    }
}

/// Every link of the requested family, best tier first.
fn ranked_links(info: &VideoInfo, format: RequestedFormat) -> Vec<FormatDescriptor> {
    let mut links = if format.wants_audio() {
        audio_only(&info.formats).into_iter().map(audio_link).collect::<Vec<_>>()
    } else {
        video_and_audio(&info.formats)
            .into_iter()
            .map(video_link)
            .collect::<Vec<_>>()
    };
    sort_by_quality(&mut links, |link| link.quality.as_str());
    links
}

fn download_error(error: BackendError, mode: RuntimeMode) -> ApiError {
    let (status, message) = match &error {
        BackendError::Unavailable(_) | BackendError::Private(_) => {
            (StatusCode::NOT_FOUND, "Video is unavailable or private")
        }
        BackendError::AgeRestricted(_) => (StatusCode::FORBIDDEN, "Video is age-restricted"),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to process download request",
        ),
    };
    ApiError::new(status, "Download failed", message).with_details(mode, &error)
}

fn is_form(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(FORM_CONTENT_TYPE)
        })
}

/// Reads the body as a url-encoded form or as JSON, by content type.
async fn read_download_request(
    request: Request,
    mode: RuntimeMode,
) -> Result<DownloadRequest, ApiError> {
    let parsed = if is_form(&request) {
        Form::<DownloadRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(|rejection| rejection.body_text())
    } else {
        Json::<DownloadRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(|rejection| rejection.body_text())
    };

    parsed.map_err(|details| {
        ApiError::bad_request(
            "Invalid request body",
            "Request body must be JSON or form-encoded",
        )
        .with_details(mode, details)
    })
}

pub async fn download_links(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Envelope<DownloadLinks>>, ApiError> {
    let request = read_download_request(request, state.config.mode).await?;

    let url = request
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing URL", "Please provide a video URL"))?;

    if !is_valid_video_url(&url) {
        return Err(ApiError::bad_request(
            "Invalid URL",
            "Please provide a valid video URL",
        ));
    }

    let format = RequestedFormat::parse(request.format.as_deref()).ok_or_else(|| {
        ApiError::bad_request("Invalid format", "Format must be one of: best, mp3, audio, mp4")
    })?;

    let video_id = extract_video_id(&url).ok_or_else(|| {
        ApiError::bad_request("Invalid video", "Video not found or unavailable")
    })?;
    info!("processing download request for {video_id} ({})", format.as_str());

    let info = state.backend.video_info(&url).await.map_err(|error| {
        warn!("download request for {video_id} failed: {error}");
        download_error(error, state.config.mode)
    })?;

    let mut formats = ranked_links(&info, format);
    let total_formats = formats.len();
    formats.truncate(MAX_LISTED_FORMATS);

    let links = DownloadLinks {
        video: DownloadVideo::from(&info),
        formats,
        requested_format: format.as_str(),
        requested_quality: request.quality.unwrap_or_else(|| "highest".to_string()),
        total_formats,
    };

    Ok(Json(Envelope::success(
        links,
        "Download links generated successfully",
    )))
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    format: Option<String>,
    quality: Option<String>,
}

pub async fn stream(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Response, StreamError> {
    let url = watch_url(&video_id).ok_or_else(|| {
        StreamError::bad_request("Invalid video ID", "Please provide a valid video ID")
    })?;

    let container = StreamContainer::parse(params.format.as_deref()).ok_or_else(|| {
        StreamError::bad_request("Invalid format", "Format must be one of: mp4, mp3, webm, m4a")
    })?;
    let quality = StreamQuality::parse(params.quality.as_deref()).ok_or_else(|| {
        StreamError::bad_request(
            "Invalid quality",
            "Quality must be highest, lowest or a numeric itag",
        )
    })?;
    let selection = StreamSelection { container, quality };

    let info = state.backend.video_info(&url).await.map_err(|error| {
        warn!("stream metadata for {video_id} failed: {error}");
        StreamError::failed(error.to_string())
    })?;

    if let StreamQuality::Itag(itag) = quality
        && !info
            .formats
            .iter()
            .any(|format| format.itag() == Some(itag) && container.accepts(format))
    {
        return Err(StreamError::bad_request(
            "Invalid quality",
            format!(
                "Format {itag} is not available as {}",
                container.extension()
            ),
        ));
    }

    let filename = format!(
        "{}.{}",
        clean_title(info.title.as_deref().unwrap_or_default()),
        container.extension()
    );

    let reader = state
        .backend
        .open_stream(&url, selection)
        .await
        .map_err(|error| {
            warn!("stream for {video_id} failed to start: {error}");
            StreamError::failed(error.to_string())
        })?;
    info!("streaming {video_id} as {filename:?}");

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| StreamError::failed("Could not build the download header"))?,
    );

    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((headers, body).into_response())
}
