//! Error taxonomy (§7) and its mapping onto the wire-level "never surface a
//! 5xx, redirect to origin" policy. Every variant carries enough context to
//! reconstruct the origin URL for the redirect; only `UrlParse` has no
//! source URL to fall back to and is the sole variant that reaches the
//! client as anything other than 302.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("url could not be parsed")]
    UrlParse,

    #[error("admission denied for {host}")]
    AdmissionDenied { host: String, source_url: String },

    #[error("origin unreachable: {detail}")]
    OriginUnreachable { detail: String, source_url: String },

    #[error("origin refused: {reason}")]
    OriginRefused { reason: String, source_url: String },

    #[error("not media content")]
    NotMediaContent { source_url: String },

    #[error("size cap exceeded")]
    SizeCapExceeded { source_url: String },

    #[error("infra error: {detail}")]
    InfraError { detail: String, source_url: String },

    #[error("security violation: {detail}")]
    SecurityViolation { detail: String, source_url: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    fn source_url(&self) -> Option<&str> {
        match self {
            PipelineError::UrlParse | PipelineError::Config(_) => None,
            PipelineError::AdmissionDenied { source_url, .. }
            | PipelineError::OriginUnreachable { source_url, .. }
            | PipelineError::OriginRefused { source_url, .. }
            | PipelineError::NotMediaContent { source_url }
            | PipelineError::SizeCapExceeded { source_url }
            | PipelineError::InfraError { source_url, .. }
            | PipelineError::SecurityViolation { source_url, .. } => Some(source_url),
        }
    }

    fn block_reason_header(&self) -> Option<&str> {
        match self {
            PipelineError::OriginRefused { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        warn!(error = %self, "pipeline error, applying redirect-to-origin policy");

        match self {
            PipelineError::UrlParse => (StatusCode::BAD_REQUEST, "bad request").into_response(),
            PipelineError::Config(detail) => {
                warn!(detail = %detail, "configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration error").into_response()
            }
            other => {
                let block_reason = other.block_reason_header().map(|s| s.to_string());
                let source_url = other
                    .source_url()
                    .expect("every redirecting variant carries a source url")
                    .to_string();

                let mut response = (
                    StatusCode::FOUND,
                    [
                        (header::LOCATION, source_url),
                        (
                            header::CACHE_CONTROL,
                            "no-store, no-cache, must-revalidate".to_string(),
                        ),
                    ],
                )
                    .into_response();

                if let Some(reason) = block_reason {
                    if let Ok(value) = axum::http::HeaderValue::from_str(&reason) {
                        response
                            .headers_mut()
                            .insert("x-mediacache-proxy-block-reason", value);
                    }
                }

                response
            }
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
