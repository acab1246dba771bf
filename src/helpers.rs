use std::{path::Path, sync::LazyLock};

use chrono::{NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;

pub const API_TAG: &str = "video-api v1.0";
pub const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

const DESCRIPTION_PREVIEW_CHARS: usize = 200;

// Strict shapes accepted from clients.
static VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(?:www\.)?(?:youtube\.com/(?:watch\?v=|embed/|v/)|youtu\.be/)[A-Za-z0-9_-]{11}(?:[?&][\w.=%-]*)*$",
    )
    .expect("video url pattern compiles")
});

// Permissive superset: also list/playlist-embedded and path-nested forms.
static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:[^/\s]+/.+/|(?:v|e(?:mbed)?|shorts)/|.*[?&]v=)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
    )
    .expect("video id pattern compiles")
});

static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("bare id pattern compiles"));

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>").expect("script block pattern compiles")
});

pub fn is_valid_video_url(url: &str) -> bool {
    VIDEO_URL.is_match(url)
}

pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

/// Canonical watch URL for a bare id, or `None` when the id is malformed.
pub fn watch_url(video_id: &str) -> Option<String> {
    if !BARE_ID.is_match(video_id) {
        return None;
    }
    let url = format!("{WATCH_URL_PREFIX}{video_id}");
    is_valid_video_url(&url).then_some(url)
}

/// `H:MM:SS` from one hour up, `M:SS` below, `0:00` for zero.
pub fn format_duration(total_seconds: u64) -> String {
    if total_seconds == 0 {
        return "0:00".to_string();
    }

    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Strips script blocks and angle brackets. Not an HTML sanitizer.
pub fn sanitize<'a>(text: impl Into<Option<&'a str>>) -> String {
    let Some(text) = text.into() else {
        return String::new();
    };

    SCRIPT_BLOCK
        .replace_all(text, "")
        .replace(['<', '>'], "")
        .trim()
        .to_string()
}

pub fn truncate_description(text: Option<&str>) -> String {
    let text = text.unwrap_or_default();
    if text.chars().count() <= DESCRIPTION_PREVIEW_CHARS {
        return text.to_string();
    }

    let mut preview = text
        .chars()
        .take(DESCRIPTION_PREVIEW_CHARS)
        .collect::<String>();
    preview.push_str("...");
    preview
}

/// `20240115` becomes `2024-01-15`; anything else is passed through.
pub fn normalize_upload_date(raw: &str) -> String {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Keeps ASCII word characters and whitespace only.
pub fn clean_title(title: &str) -> String {
    let cleaned = title
        .chars()
        .filter(|character| {
            character.is_ascii_alphanumeric() || *character == '_' || character.is_whitespace()
        })
        .collect::<String>();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    pub timestamp: String,
    pub api: &'static str,
}

impl<T> Envelope<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            count: None,
            query: None,
            video_id: None,
            timestamp: timestamp(),
            api: API_TAG,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_video_id(mut self, video_id: impl Into<String>) -> Self {
        self.video_id = Some(video_id.into());
        self
    }
}
