use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_RATE_LIMIT_MAX: usize = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 15 * 60;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Development,
    Production,
}

impl RuntimeMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Upstream error text is only exposed to clients in development.
    pub fn exposes_details(self) -> bool {
        self == Self::Development
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub mode: RuntimeMode,
    pub allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).and_then(|value| non_empty(&value).map(str::to_string));

        let mode = read("APP_ENV")
            .and_then(|value| RuntimeMode::parse(&value))
            .unwrap_or(RuntimeMode::Production);

        let allowed_origins = read("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let rate_limit_max = read("RATE_LIMIT_MAX")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX);
        let rate_limit_window = read("RATE_LIMIT_WINDOW_SECONDS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECONDS);
        let yt_dlp_timeout = read("YT_DLP_TIMEOUT_SECONDS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS);

        Self {
            bind_addr: resolve_bind_addr(read("APP_ADDR"), read("PORT")),
            mode,
            allowed_origins,
            trust_proxy_headers: read("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            rate_limit_max,
            rate_limit_window: Duration::from_secs(rate_limit_window),
            yt_dlp_bin: read("YT_DLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            yt_dlp_timeout: Duration::from_secs(yt_dlp_timeout),
        }
    }
}

fn resolve_bind_addr(addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
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
