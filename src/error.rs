use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::config::RuntimeMode;
use crate::helpers::{API_TAG, timestamp};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<String>,
    timestamp: String,
    api: &'static str,
}

/// Failure envelope returned by every JSON endpoint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub message: String,
    pub details: Option<String>,
    pub retry_after: Option<RetryAfter>,
}

/// When a rate-limited client may come back.
#[derive(Debug, Clone)]
pub struct RetryAfter {
    pub seconds: u64,
    /// Human-readable window, such as `15 minutes`.
    pub window: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            message,
        )
    }

    pub fn too_many_requests(retry_after: RetryAfter) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests",
                "Too many requests from this IP, please try again later.",
            )
        }
    }

    /// Attaches upstream error text, dropped unless running in development.
    pub fn with_details(mut self, mode: RuntimeMode, details: impl ToString) -> Self {
        if mode.exposes_details() {
            self.details = Some(details.to_string());
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let seconds = self.retry_after.as_ref().map(|retry| retry.seconds);
        let body = Json(ErrorBody {
            success: false,
            error: self.error,
            message: self.message,
            details: self.details,
            retry_after: self.retry_after.map(|retry| retry.window),
            timestamp: timestamp(),
            api: API_TAG,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = seconds {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

#[derive(Debug, Serialize)]
struct PlainErrorBody {
    error: String,
    message: String,
}

/// Plain error body for the byte-stream endpoint, which never wraps in an envelope.
#[derive(Debug)]
pub struct StreamError {
    pub status: StatusCode,
    pub error: String,
    pub message: String,
}

impl StreamError {
    pub fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Stream failed".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let body = Json(PlainErrorBody {
            error: self.error,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}
