use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppState, DurationView, ThumbnailSet};
use crate::{
    error::ApiError,
    helpers::{Envelope, WATCH_URL_PREFIX, format_duration, normalize_upload_date, sanitize},
    ytdlp::{SearchItem, SearchKind, whole_seconds},
};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 50;
const MIN_QUERY_CHARS: usize = 2;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    limit: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuggestionParams {
    q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummaryAuthor {
    name: String,
    id: Option<String>,
    url: Option<String>,
    verified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    id: String,
    title: String,
    author: SummaryAuthor,
    description: String,
    duration: DurationView,
    views: Option<u64>,
    uploaded_at: Option<String>,
    thumbnail: ThumbnailSet,
    url: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
    live: bool,
    tags: Vec<String>,
    category: String,
}

impl From<SearchItem> for VideoSummary {
    fn from(item: SearchItem) -> Self {
        let kind = item.kind();
        let seconds = whole_seconds(item.duration);
        let default_thumbnail = if kind == SearchKind::Video && !item.id.is_empty() {
            Some(format!("https://i.ytimg.com/vi/{}/default.jpg", item.id))
        } else {
            item.thumbnails.first().map(|thumbnail| thumbnail.url.clone())
        };
        let url = item.url.clone().or_else(|| {
            (kind == SearchKind::Video && !item.id.is_empty())
                .then(|| format!("{WATCH_URL_PREFIX}{}", item.id))
        });

        Self {
            title: sanitize(item.title.as_deref()),
            author: SummaryAuthor {
                name: sanitize(
                    item.channel
                        .as_deref()
                        .or(item.uploader.as_deref())
                        .unwrap_or("Unknown"),
                ),
                id: item.channel_id.clone(),
                url: item.channel_url.clone(),
                verified: item.channel_is_verified.unwrap_or(false),
            },
            description: sanitize(item.description.as_deref()),
            duration: DurationView {
                seconds,
                formatted: format_duration(seconds),
            },
            views: item.view_count,
            uploaded_at: item.upload_date.as_deref().map(normalize_upload_date),
            thumbnail: thumbnail_variants(default_thumbnail),
            url,
            kind: kind.as_str(),
            live: item.is_live(),
            category: item
                .categories
                .first()
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string()),
            tags: item.tags,
            id: item.id,
        }
    }
}

/// Size variants derived from the `default` thumbnail URL.
fn thumbnail_variants(default: Option<String>) -> ThumbnailSet {
    let Some(default) = default else {
        return ThumbnailSet::default();
    };

    ThumbnailSet {
        medium: Some(default.replacen("default", "mqdefault", 1)),
        high: Some(default.replacen("default", "hqdefault", 1)),
        maxres: Some(default.replacen("default", "maxresdefault", 1)),
        default: Some(default),
    }
}

/// Non-numeric or zero limits fall back to the default; others are clamped.
fn parse_limit(raw: Option<&str>) -> usize {
    match raw.and_then(|value| value.trim().parse::<i64>().ok()) {
        None | Some(0) => DEFAULT_LIMIT,
        Some(limit) => limit.clamp(1, MAX_LIMIT as i64) as usize,
    }
}

fn required_query(raw: Option<String>) -> Result<String, ApiError> {
    raw.filter(|query| !query.is_empty()).ok_or_else(|| {
        ApiError::bad_request(
            "Missing query parameter",
            "Please provide a search query using the \"q\" parameter",
        )
    })
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Envelope<Vec<VideoSummary>>>, ApiError> {
    let query = required_query(params.q)?;
    if query.chars().count() < MIN_QUERY_CHARS {
        return Err(ApiError::bad_request(
            "Query too short",
            "Search query must be at least 2 characters long",
        ));
    }

    let limit = parse_limit(params.limit.as_deref());
    let kind = SearchKind::parse(params.kind.as_deref());
    info!("searching for {query:?} (limit: {limit}, type: {})", kind.as_str());

    let results = state
        .backend
        .search(&query, limit, kind)
        .await
        .map_err(|error| {
            warn!("search for {query:?} failed: {error}");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Search failed",
                "Unable to search videos at this time",
            )
            .with_details(state.config.mode, &error)
        })?;

    let summaries = results
        .into_iter()
        .map(VideoSummary::from)
        .collect::<Vec<_>>();
    let message = if summaries.is_empty() {
        "No videos found".to_string()
    } else {
        format!("Found {} videos", summaries.len())
    };
    let count = summaries.len();

    Ok(Json(
        Envelope::success(summaries, message)
            .with_count(count)
            .with_query(query),
    ))
}

pub async fn suggestions(
    State(state): State<AppState>,
    Query(params): Query<SuggestionParams>,
) -> Result<Json<Envelope<Vec<String>>>, ApiError> {
    let query = required_query(params.q)?;

    let suggestions = state.backend.suggestions(&query).await.map_err(|error| {
        warn!("suggestions for {query:?} failed: {error}");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get suggestions",
            "Unable to fetch search suggestions at this time",
        )
        .with_details(state.config.mode, &error)
    })?;
    let count = suggestions.len();

    Ok(Json(
        Envelope::success(suggestions, "Suggestions retrieved successfully")
            .with_count(count)
            .with_query(query),
    ))
}
