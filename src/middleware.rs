use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{
            AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, REFERRER_POLICY, RETRY_AFTER,
            X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
        },
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{ApiError, RetryAfter},
    routes::AppState,
};

const MAX_TRACKED_CLIENTS: usize = 50_000;

type HitMap = HashMap<String, Vec<DateTime<Utc>>>;

/// Fixed-window request counter per client IP, kept for the process lifetime.
#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<Mutex<HitMap>>,
    max_requests: usize,
    window: chrono::Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: std::time::Duration) -> Self {
        Self {
            hits: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }

    /// Records a hit, or returns the seconds until the client may retry.
    pub async fn register(&self, ip: &str, now: DateTime<Utc>) -> Result<(), u64> {
        let window_start = now - self.window;
        let mut hits = self.hits.lock().await;

        if hits.len() > MAX_TRACKED_CLIENTS {
            hits.retain(|_, timestamps| {
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });
        }

        let entries = hits.entry(ip.to_string()).or_default();
        entries.retain(|timestamp| *timestamp > window_start);

        if entries.len() >= self.max_requests {
            let reset_at = entries
                .first()
                .map(|oldest| *oldest + self.window)
                .unwrap_or(now + self.window);
            return Err((reset_at - now).num_seconds().max(1) as u64);
        }

        entries.push(now);
        Ok(())
    }

    fn window_label(&self) -> String {
        let minutes = self.window.num_minutes();
        if minutes >= 1 {
            format!("{minutes} minutes")
        } else {
            format!("{} seconds", self.window.num_seconds())
        }
    }
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = client_ip_for_request(state.config.trust_proxy_headers, request.headers(), peer);

    if let Err(retry_after_seconds) = state.limiter.register(&client_ip, Utc::now()).await {
        warn!("rate limit exceeded for {client_ip}");
        return ApiError::too_many_requests(RetryAfter {
            seconds: retry_after_seconds,
            window: state.limiter.window_label(),
        })
        .into_response();
    }

    next.run(request).await
}

/// Proxy headers consulted in order when proxies are trusted.
const FORWARDING_HEADERS: [&str; 3] = ["x-forwarded-for", "cf-connecting-ip", "x-real-ip"];

/// First parseable address named by a forwarding header.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    FORWARDING_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        value.split(',').next()?.trim().parse::<IpAddr>().ok()
    })
}

fn client_ip_for_request(
    trust_proxy_headers: bool,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> String {
    trust_proxy_headers
        .then(|| forwarded_ip(headers))
        .flatten()
        .or_else(|| peer.map(|addr| addr.ip()))
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:5500"];

pub fn build_cors_layer(config: &Config) -> Result<CorsLayer, ApiError> {
    let configured = if config.allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set, allowing local development origins only");
        DEV_ORIGINS.iter().map(ToString::to_string).collect()
    } else {
        config.allowed_origins.clone()
    };

    let mut origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "ALLOWED_ORIGINS entry {origin:?} is not an http(s) origin such as https://example.com"
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    origins.sort();
    origins.dedup();
    info!("CORS allows {} origin(s): {}", origins.len(), origins.join(", "));

    let allow_list = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| ApiError::internal(format!("origin {origin:?} is not a header value")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Wildcard headers are rejected alongside credentials.
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allow_list))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .expose_headers([CONTENT_DISPOSITION, RETRY_AFTER]))
}

/// Serialized origin of an http(s) URL that names nothing beyond its origin.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value.trim()).ok()?;
    let bare = parsed.path() == "/"
        && parsed.query().is_none()
        && parsed.fragment().is_none()
        && parsed.username().is_empty()
        && parsed.password().is_none();

    (matches!(parsed.scheme(), "http" | "https") && bare)
        .then(|| parsed.origin().ascii_serialization())
}

pub fn with_security_headers(router: Router) -> Router {
    router
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn limiter_blocks_after_max_hits_within_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Utc::now();

        assert!(limiter.register("1.2.3.4", start).await.is_ok());
        assert!(limiter.register("1.2.3.4", start).await.is_ok());
        let retry = limiter.register("1.2.3.4", start).await.unwrap_err();
        assert_eq!(retry, 60);

        assert!(limiter.register("5.6.7.8", start).await.is_ok());

        let later = start + chrono::Duration::seconds(61);
        assert!(limiter.register("1.2.3.4", later).await.is_ok());
    }

    #[test]
    fn window_label_is_human_readable() {
        assert_eq!(
            RateLimiter::new(1, Duration::from_secs(900)).window_label(),
            "15 minutes"
        );
        assert_eq!(
            RateLimiter::new(1, Duration::from_secs(30)).window_label(),
            "30 seconds"
        );
    }

    #[test]
    fn proxy_headers_only_used_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        assert_eq!(client_ip_for_request(true, &headers, Some(peer)), "9.9.9.9");
        assert_eq!(client_ip_for_request(false, &headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_ip_for_request(false, &HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn unparseable_forwarding_headers_fall_back() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        headers.insert("x-real-ip", HeaderValue::from_static("2001:db8::1"));
        assert_eq!(client_ip_for_request(true, &headers, Some(peer)), "2001:db8::1");

        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("garbage"));
        assert_eq!(client_ip_for_request(true, &headers, Some(peer)), "127.0.0.1");
    }

    #[test]
    fn origins_are_normalized() {
        assert_eq!(
            normalize_origin("https://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
        assert_eq!(normalize_origin("https://user@example.com"), None);
        assert_eq!(normalize_origin("https://example.com/?a=1"), None);
    }

    #[test]
    fn invalid_configured_origin_is_rejected() {
        let config = Config::from_lookup(|key| {
            (key == "ALLOWED_ORIGINS").then(|| "not a url".to_string())
        });
        assert!(build_cors_layer(&config).is_err());
    }
}
