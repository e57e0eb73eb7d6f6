//! Streaming origin fetch with redirect re-validation and block detection
//! (C5).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::url_validator::{validate_fetch_url, UrlValidationError};

const FORWARDED_CLIENT_HEADERS: &[&str] = &["user-agent", "accept", "accept-language", "referer"];

const NEVER_FORWARD: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
    "host",
    "connection",
    "upgrade",
    "te",
    "transfer-encoding",
];

const MAX_REDIRECTS: u8 = 5;
const HTML_CHALLENGE_THRESHOLD: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Http(u16),
    RateLimited,
    HtmlChallengePage,
    HtmlInsteadOfMedia,
    TextInsteadOfMedia,
    JsonInsteadOfMedia,
}

impl BlockReason {
    pub fn as_str(&self) -> String {
        match self {
            BlockReason::Http(status) => format!("http_{status}"),
            BlockReason::RateLimited => "rate_limited".to_string(),
            BlockReason::HtmlChallengePage => "html_challenge_page".to_string(),
            BlockReason::HtmlInsteadOfMedia => "html_instead_of_media".to_string(),
            BlockReason::TextInsteadOfMedia => "text_instead_of_media".to_string(),
            BlockReason::JsonInsteadOfMedia => "json_instead_of_media".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch url rejected: {0}")]
    UrlRejected(#[from] UrlValidationError),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("redirect target rejected by admission re-check")]
    RedirectAdmissionDenied,
    #[error("origin unreachable: {0}")]
    Unreachable(String),
    #[error("origin timed out")]
    Timeout,
}

pub struct FetchOutcome {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub headers: HeaderMap,
    pub body: Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin>,
    pub blocked: Option<BlockReason>,
    pub final_url: Url,
}

/// Re-validates a redirect hop's host against admission. Boxed rather than
/// generic so it can cross the `OriginFetch` trait-object boundary — the
/// pipeline builds one closure per request over `state.admission`.
pub type RedirectValidator = Box<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Abstracts [`OriginFetcher::fetch_media`] behind a trait object so tests
/// can substitute a scripted origin instead of making real network calls.
#[async_trait]
pub trait OriginFetch: Send + Sync {
    async fn fetch_media(
        &self,
        source_url: &str,
        client_headers: &HeaderMap,
        timeout: Duration,
        forward_client_ip: Option<&str>,
        redirect_validator: RedirectValidator,
    ) -> Result<FetchOutcome, FetchError>;
}

pub struct OriginFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl OriginFetcher {
    pub fn new(user_agent: String) -> Self {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build origin reqwest client");
        Self { client, user_agent }
    }

    /// `redirect_validator` re-runs admission on the final hop whenever a
    /// redirect changes the URL. It is async because admission may consult
    /// the registry. Generic over the validator closure so callers that
    /// already have a concrete closure in hand (rather than a boxed one)
    /// don't pay for the indirection; [`OriginFetch::fetch_media`] is the
    /// trait-object-friendly wrapper around this.
    pub async fn fetch_media_with<F, Fut>(
        &self,
        source_url: &str,
        client_headers: &HeaderMap,
        timeout: Duration,
        forward_client_ip: Option<&str>,
        redirect_validator: F,
    ) -> Result<FetchOutcome, FetchError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut current = Url::parse(source_url).map_err(|_| UrlValidationError::InvalidFetchUrl)?;
        validate_fetch_url(&current)?;

        for hop in 0..=MAX_REDIRECTS {
            let outbound = self.build_headers(client_headers, forward_client_ip);
            let request = self
                .client
                .get(current.clone())
                .headers(outbound)
                .timeout(timeout);

            let response = tokio::time::timeout(timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;

            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return self.finish(response, current).await;
                };
                let next = current
                    .join(location)
                    .map_err(|_| UrlValidationError::InvalidFetchUrl)?;
                if next != current {
                    validate_fetch_url(&next)?;
                    let host = next.host_str().unwrap_or_default().to_ascii_lowercase();
                    if !redirect_validator(host).await {
                        return Err(FetchError::RedirectAdmissionDenied);
                    }
                }
                current = next;
                if hop == MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects);
                }
                continue;
            }

            return self.finish(response, current).await;
        }

        Err(FetchError::TooManyRedirects)
    }

    fn build_headers(&self, client_headers: &HeaderMap, forward_client_ip: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&self.user_agent).unwrap_or_else(|_| HeaderValue::from_static("mediacache-proxy")),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/*, video/*, audio/*, application/vnd.apple.mpegurl, */*;q=0.8"),
        );

        for name in FORWARDED_CLIENT_HEADERS {
            if NEVER_FORWARD.contains(name) {
                continue;
            }
            if let Some(value) = client_headers.get(*name) {
                if let Ok(header_name) = HeaderName::try_from(*name) {
                    headers.insert(header_name, value.clone());
                }
            }
        }

        if let Some(ip) = forward_client_ip {
            if let Ok(value) = HeaderValue::from_str(ip) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        headers
    }

    async fn finish(
        &self,
        response: reqwest::Response,
        final_url: Url,
    ) -> Result<FetchOutcome, FetchError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let blocked = detect_block(status, content_type.as_deref(), content_length);
        if let Some(reason) = &blocked {
            warn!(status, reason = %reason.as_str(), url = %final_url, "origin fetch blocked");
        } else {
            info!(status, url = %final_url, "origin fetch succeeded");
        }

        let body = Box::new(response.bytes_stream());

        Ok(FetchOutcome {
            status,
            content_type,
            content_length,
            headers,
            body,
            blocked,
            final_url,
        })
    }
}

#[async_trait]
impl OriginFetch for OriginFetcher {
    async fn fetch_media(
        &self,
        source_url: &str,
        client_headers: &HeaderMap,
        timeout: Duration,
        forward_client_ip: Option<&str>,
        redirect_validator: RedirectValidator,
    ) -> Result<FetchOutcome, FetchError> {
        self.fetch_media_with(
            source_url,
            client_headers,
            timeout,
            forward_client_ip,
            move |host| redirect_validator(host),
        )
        .await
    }
}

fn detect_block(status: u16, content_type: Option<&str>, content_length: Option<u64>) -> Option<BlockReason> {
    match status {
        401 | 403 => return Some(BlockReason::Http(status)),
        429 => return Some(BlockReason::RateLimited),
        _ => {}
    }

    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|s| s.trim().to_ascii_lowercase());

    match essence.as_deref() {
        Some("text/html") => {
            if content_length.unwrap_or(u64::MAX) < HTML_CHALLENGE_THRESHOLD {
                Some(BlockReason::HtmlChallengePage)
            } else {
                Some(BlockReason::HtmlInsteadOfMedia)
            }
        }
        Some(ct) if ct.starts_with("text/") => Some(BlockReason::TextInsteadOfMedia),
        Some("application/json") => Some(BlockReason::JsonInsteadOfMedia),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_auth_and_rate_limit_blocks() {
        assert_eq!(detect_block(401, None, None), Some(BlockReason::Http(401)));
        assert_eq!(detect_block(403, None, None), Some(BlockReason::Http(403)));
        assert_eq!(detect_block(429, None, None), Some(BlockReason::RateLimited));
    }

    #[test]
    fn detects_html_challenge_vs_html_instead_of_media() {
        assert_eq!(
            detect_block(200, Some("text/html"), Some(1000)),
            Some(BlockReason::HtmlChallengePage)
        );
        assert_eq!(
            detect_block(200, Some("text/html"), Some(100_000)),
            Some(BlockReason::HtmlInsteadOfMedia)
        );
        assert_eq!(
            detect_block(200, Some("text/html"), None),
            Some(BlockReason::HtmlInsteadOfMedia)
        );
    }

    #[test]
    fn detects_text_and_json_blocks() {
        assert_eq!(
            detect_block(200, Some("text/plain"), None),
            Some(BlockReason::TextInsteadOfMedia)
        );
        assert_eq!(
            detect_block(200, Some("application/json"), None),
            Some(BlockReason::JsonInsteadOfMedia)
        );
    }

    #[test]
    fn valid_media_response_is_not_blocked() {
        assert_eq!(detect_block(200, Some("image/jpeg"), Some(1024)), None);
        assert_eq!(detect_block(200, Some("video/mp4"), None), None);
    }

    #[test]
    fn block_reason_header_strings_match_spec_format() {
        assert_eq!(BlockReason::Http(403).as_str(), "http_403");
        assert_eq!(BlockReason::RateLimited.as_str(), "rate_limited");
        assert_eq!(BlockReason::HtmlChallengePage.as_str(), "html_challenge_page");
    }
}
