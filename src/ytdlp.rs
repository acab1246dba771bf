//! External collaborators: yt-dlp for metadata, search and byte streams,
//! plus the public suggestion endpoint over HTTP.
//!
//! Handlers only see [`VideoBackend`] and [`BackendError`] kinds; the raw
//! stderr wording of yt-dlp is classified here and nowhere else.

use std::{
    fmt,
    io::{self, ErrorKind},
    pin::Pin,
    process::Stdio,
    task::{Context, Poll, ready},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::config::Config;

const SUGGEST_ENDPOINT: &str = "https://suggestqueries.google.com/complete/search";
const SEARCH_RESULTS_URL: &str = "https://www.youtube.com/results?search_query=";
const SUGGEST_TIMEOUT_SECONDS: u64 = 10;
const FIRST_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unavailable(String),
    Private(String),
    AgeRestricted(String),
    Timeout,
    NotInstalled,
    Failed(String),
}

impl BackendError {
    /// Maps the last meaningful yt-dlp stderr line onto an error kind.
    pub fn from_stderr(stderr: &[u8]) -> Self {
        let message = String::from_utf8_lossy(stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap_or("yt-dlp could not complete the request")
            .to_string();
        Self::classify(message)
    }

    fn classify(message: String) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("private video") || lower.contains("video is private") {
            Self::Private(message)
        } else if lower.contains("confirm your age")
            || lower.contains("age-restricted")
            || lower.contains("inappropriate for some users")
        {
            Self::AgeRestricted(message)
        } else if lower.contains("video unavailable")
            || lower.contains("not available")
            || lower.contains("has been removed")
            || lower.contains("does not exist")
        {
            Self::Unavailable(message)
        } else {
            Self::Failed(message)
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "Video unavailable: {message}"),
            Self::Private(message) => write!(f, "Private video: {message}"),
            Self::AgeRestricted(message) => write!(f, "Age-restricted video: {message}"),
            Self::Timeout => write!(f, "yt-dlp timed out"),
            Self::NotInstalled => write!(f, "yt-dlp is not installed"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for BackendError {}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Thumbnail {
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    #[serde(deserialize_with = "null_as_default")]
    pub format_id: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub format_note: Option<String>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub url: Option<String>,
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        is_codec(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        is_codec(self.acodec.as_deref())
    }

    /// Numeric itag, when the format id carries one (`"251-drc"` -> 251).
    pub fn itag(&self) -> Option<u32> {
        let digits = self
            .format_id
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>();
        digits.parse().ok()
    }

    pub fn quality_label(&self) -> String {
        self.height
            .filter(|height| *height > 0)
            .map(|height| format!("{height}p"))
            .or_else(|| self.format_note.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn audio_quality_label(&self) -> String {
        self.abr
            .filter(|abr| *abr > 0.0)
            .map(|abr| format!("{}kbps", abr.round() as u32))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
            .map(|size| size as u64)
    }

    /// Total bitrate in bits per second.
    pub fn bitrate(&self) -> Option<u64> {
        self.tbr
            .filter(|tbr| *tbr > 0.0)
            .map(|tbr| (tbr * 1000.0).round() as u64)
    }

    pub fn audio_bitrate(&self) -> Option<u32> {
        self.abr.filter(|abr| *abr > 0.0).map(|abr| abr.round() as u32)
    }

    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(width), Some(height)) if self.has_video() => Some(format!("{width}x{height}")),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> Option<String> {
        let ext = self.ext.as_deref()?;
        let kind = if self.has_video() { "video" } else { "audio" };
        let codecs = [self.vcodec.as_deref(), self.acodec.as_deref()]
            .into_iter()
            .filter(|codec| is_codec(*codec))
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");

        if codecs.is_empty() {
            Some(format!("{kind}/{ext}"))
        } else {
            Some(format!("{kind}/{ext}; codecs=\"{codecs}\""))
        }
    }
}

fn is_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if !value.is_empty() && value != "none")
}

pub fn audio_only(formats: &[RawFormat]) -> Vec<&RawFormat> {
    formats
        .iter()
        .filter(|format| format.has_audio() && !format.has_video())
        .collect()
}

pub fn video_and_audio(formats: &[RawFormat]) -> Vec<&RawFormat> {
    formats
        .iter()
        .filter(|format| format.has_audio() && format.has_video())
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelatedVideo {
    pub id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub channel_id: Option<String>,
    pub channel_url: Option<String>,
    pub channel_follower_count: Option<u64>,
    pub channel_is_verified: Option<bool>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub upload_date: Option<String>,
    pub release_date: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    pub is_live: Option<bool>,
    pub availability: Option<String>,
    pub age_limit: Option<u32>,
    pub available_countries: Option<Vec<String>>,
    #[serde(deserialize_with = "null_as_default")]
    pub formats: Vec<RawFormat>,
    #[serde(deserialize_with = "null_as_default")]
    pub related_videos: Vec<RelatedVideo>,
}

impl VideoInfo {
    pub fn author_name(&self) -> Option<&str> {
        self.channel.as_deref().or(self.uploader.as_deref())
    }

    /// Whole seconds, never negative.
    pub fn length_seconds(&self) -> u64 {
        whole_seconds(self.duration)
    }
}

pub fn whole_seconds(duration: Option<f64>) -> u64 {
    duration
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(|seconds| seconds.floor() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchItem {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub url: Option<String>,
    pub channel: Option<String>,
    pub channel_id: Option<String>,
    pub channel_url: Option<String>,
    pub channel_is_verified: Option<bool>,
    pub uploader: Option<String>,
    pub upload_date: Option<String>,
    pub live_status: Option<String>,
    pub ie_key: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
}

impl SearchItem {
    pub fn kind(&self) -> SearchKind {
        let url = self.url.as_deref().unwrap_or_default();
        if url.contains("list=") || url.contains("/playlist") {
            SearchKind::Playlist
        } else if self.ie_key.as_deref() == Some("YoutubeTab")
            || url.contains("/channel/")
            || url.contains("/@")
        {
            SearchKind::Channel
        } else {
            SearchKind::Video
        }
    }

    pub fn is_live(&self) -> bool {
        self.live_status.as_deref() == Some("is_live")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchPage {
    #[serde(deserialize_with = "null_as_default")]
    entries: Vec<SearchItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Video,
    Channel,
    Playlist,
    All,
}

impl SearchKind {
    /// Unknown values search videos, the default kind.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("channel") => Self::Channel,
            Some("playlist") => Self::Playlist,
            Some("all") => Self::All,
            _ => Self::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Channel => "channel",
            Self::Playlist => "playlist",
            Self::All => "all",
        }
    }

    fn results_filter(self) -> Option<&'static str> {
        match self {
            Self::Video => Some("EgIQAQ%3D%3D"),
            Self::Channel => Some("EgIQAg%3D%3D"),
            Self::Playlist => Some("EgIQAw%3D%3D"),
            Self::All => None,
        }
    }
}

pub fn search_results_url(query: &str, kind: SearchKind) -> String {
    let mut url = format!("{SEARCH_RESULTS_URL}{}", urlencoding::encode(query));
    if let Some(filter) = kind.results_filter() {
        url.push_str("&sp=");
        url.push_str(filter);
    }
    url
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamQuality {
    Highest,
    Lowest,
    Itag(u32),
}

impl StreamQuality {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("highest") => Some(Self::Highest),
            Some("lowest") => Some(Self::Lowest),
            Some(other) => other.parse().ok().map(Self::Itag),
        }
    }
}

/// Container the stream endpoint labels its attachment with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamContainer {
    Mp4,
    Webm,
    Mp3,
    M4a,
}

impl StreamContainer {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("mp4") => Some(Self::Mp4),
            Some("webm") => Some(Self::Webm),
            Some("mp3") => Some(Self::Mp3),
            Some("m4a") => Some(Self::M4a),
            Some(_) => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::M4a)
    }

    /// Whether a listed format can be served under this container.
    /// `mp3` takes any audio-only track, yt-dlp does not transcode a pipe.
    pub fn accepts(self, format: &RawFormat) -> bool {
        let ext = format.ext.as_deref();
        match self {
            Self::Mp3 => format.has_audio() && !format.has_video(),
            Self::M4a => format.has_audio() && !format.has_video() && ext == Some("m4a"),
            Self::Mp4 | Self::Webm => {
                format.has_audio() && format.has_video() && ext == Some(self.extension())
            }
        }
    }

    fn selector_filter(self) -> &'static str {
        match self {
            Self::Mp3 => "",
            Self::M4a => "[ext=m4a]",
            Self::Mp4 => "[ext=mp4][vcodec!=none][acodec!=none]",
            Self::Webm => "[ext=webm][vcodec!=none][acodec!=none]",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    pub container: StreamContainer,
    pub quality: StreamQuality,
}

impl StreamSelection {
    /// Itags are passed through as-is; callers check them against the
    /// container before opening a stream.
    pub fn format_selector(&self) -> String {
        let filter = self.container.selector_filter();
        let audio = self.container.is_audio();
        match self.quality {
            StreamQuality::Itag(itag) => itag.to_string(),
            StreamQuality::Highest if audio => format!("bestaudio{filter}"),
            StreamQuality::Lowest if audio => format!("worstaudio{filter}"),
            StreamQuality::Highest => format!("best{filter}"),
            StreamQuality::Lowest => format!("worst{filter}"),
        }
    }
}

pub type MediaStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait VideoBackend: Send + Sync {
    async fn video_info(&self, url: &str) -> Result<VideoInfo, BackendError>;

    async fn search(
        &self,
        query: &str,
        limit: usize,
        kind: SearchKind,
    ) -> Result<Vec<SearchItem>, BackendError>;

    async fn suggestions(&self, query: &str) -> Result<Vec<String>, BackendError>;

    /// Opens the media bytes. Dropping the returned reader releases the
    /// underlying transfer.
    async fn open_stream(
        &self,
        url: &str,
        selection: StreamSelection,
    ) -> Result<MediaStream, BackendError>;
}

pub struct YtDlp {
    binary: String,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl YtDlp {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SUGGEST_TIMEOUT_SECONDS))
            .build()?;

        Ok(Self {
            binary: config.yt_dlp_bin.clone(),
            timeout: config.yt_dlp_timeout,
            http_client,
        })
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, BackendError> {
        debug!("running {} {:?}", self.binary, args);
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    BackendError::NotInstalled
                } else {
                    BackendError::Failed(format!("could not run yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(BackendError::from_stderr(&output.stderr));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl VideoBackend for YtDlp {
    async fn video_info(&self, url: &str) -> Result<VideoInfo, BackendError> {
        let stdout = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                url.to_string(),
            ])
            .await?;

        serde_json::from_slice(&stdout).map_err(|error| {
            warn!("could not parse yt-dlp metadata for {url:?}: {error}");
            BackendError::Failed(format!("invalid yt-dlp metadata: {error}"))
        })
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        kind: SearchKind,
    ) -> Result<Vec<SearchItem>, BackendError> {
        let stdout = self
            .run(vec![
                "-J".to_string(),
                "--flat-playlist".to_string(),
                "--no-warnings".to_string(),
                "--playlist-end".to_string(),
                limit.to_string(),
                search_results_url(query, kind),
            ])
            .await?;

        let page: SearchPage = serde_json::from_slice(&stdout).map_err(|error| {
            warn!("could not parse yt-dlp search results for {query:?}: {error}");
            BackendError::Failed(format!("invalid yt-dlp search results: {error}"))
        })?;

        let mut entries = page.entries;
        entries.truncate(limit);
        Ok(entries)
    }

    async fn suggestions(&self, query: &str) -> Result<Vec<String>, BackendError> {
        let response = self
            .http_client
            .get(SUGGEST_ENDPOINT)
            .query(&[("client", "firefox"), ("ds", "yt"), ("q", query)])
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Failed(format!("suggestion request failed: {error}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(BackendError::Failed(format!(
                "suggestion endpoint answered {}",
                response.status()
            )));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|error| BackendError::Failed(format!("invalid suggestion body: {error}")))?;

        Ok(parse_suggestions(&body))
    }

    async fn open_stream(
        &self,
        url: &str,
        selection: StreamSelection,
    ) -> Result<MediaStream, BackendError> {
        let selector = selection.format_selector();
        debug!("streaming {url:?} with selector {selector:?}");
        let mut child = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--no-warnings",
                "--quiet",
                "-f",
                selector.as_str(),
                "-o",
                "-",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    BackendError::NotInstalled
                } else {
                    BackendError::Failed(format!("could not start yt-dlp: {error}"))
                }
            })?;

        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BackendError::Failed(
                "yt-dlp output was not captured".to_string(),
            ));
        };
        let stderr_task = tokio::spawn(collect_stderr(stderr));

        // Nothing is handed out until yt-dlp either produces bytes or exits.
        let mut first_chunk = vec![0; FIRST_CHUNK_BYTES];
        let read = timeout(self.timeout, stdout.read(&mut first_chunk))
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(|error| BackendError::Failed(format!("could not read yt-dlp output: {error}")))?;

        if read == 0 {
            let status = timeout(self.timeout, child.wait())
                .await
                .map_err(|_| BackendError::Timeout)?
                .map_err(|error| BackendError::Failed(format!("could not wait for yt-dlp: {error}")))?;
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(if status.success() {
                BackendError::Failed("yt-dlp produced no media".to_string())
            } else {
                BackendError::from_stderr(&stderr)
            });
        }

        first_chunk.truncate(read);
        Ok(Box::new(ProcessOutput::new(
            child,
            stdout,
            first_chunk,
            stderr_task,
        )))
    }
}

async fn collect_stderr(mut stderr: ChildStderr) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(error) = stderr.read_to_end(&mut buffer).await {
        debug!("could not read yt-dlp stderr: {error}");
    }
    buffer
}

/// Body `[query, [suggestion, ...]]`; anything else yields no suggestions.
pub fn parse_suggestions(body: &serde_json::Value) -> Vec<String> {
    body.get(1)
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

type ExitCheck = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Stdout of a running yt-dlp. Dropping it kills the process; reaching EOF
/// after a failed exit yields an error instead of a clean end.
struct ProcessOutput {
    first_chunk: Vec<u8>,
    offset: usize,
    stdout: ChildStdout,
    exit: Option<ExitCheck>,
}

impl ProcessOutput {
    fn new(
        mut child: Child,
        stdout: ChildStdout,
        first_chunk: Vec<u8>,
        stderr_task: JoinHandle<Vec<u8>>,
    ) -> Self {
        let exit: ExitCheck = Box::pin(async move {
            let status = child.wait().await?;
            if status.success() {
                return Ok(());
            }
            let stderr = stderr_task.await.unwrap_or_default();
            let error = BackendError::from_stderr(&stderr);
            warn!("yt-dlp stream ended with {status}: {error}");
            Err(io::Error::other(error))
        });

        Self {
            first_chunk,
            offset: 0,
            stdout,
            exit: Some(exit),
        }
    }
}

impl AsyncRead for ProcessOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.offset < this.first_chunk.len() {
            let pending = &this.first_chunk[this.offset..];
            let len = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..len]);
            this.offset += len;
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        match this.exit.as_mut() {
            Some(exit) => {
                let result = ready!(exit.as_mut().poll(cx));
                this.exit = None;
                Poll::Ready(result)
            }
            None => Poll::Ready(Ok(())),
        }
    }
}
