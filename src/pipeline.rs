//! Request Pipeline (C7): orchestrates admission, cache, origin fetch, and
//! usage accounting per the HEAD/GET control flow.
//!
//! The top-level entry point, [`handle_request`], is the single place that
//! ever returns a non-302 error status to a client; every internal failure
//! funnels through [`crate::error::PipelineError`] so the "never surface an
//! unhandled 5xx" policy holds in one spot.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::cache_port::{CachedMeta, CachedObject};
use crate::content_type::is_media;
use crate::error::PipelineError;
use crate::handlers::AppState;
use crate::origin_fetcher::{FetchError, RedirectValidator};
use crate::range::{is_partial_range_request, is_standard_bounded_range, parse_range, ByteRange};
use crate::registry::TenantStatus;
use crate::stream_util::{collect_tee, tee, ByteCountingStream, SizeLimitedStream};
use crate::url_validator::{decode_request, DecodedRequest, UrlValidationError};

const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";
const CACHE_CONTROL_NO_STORE: &str = "no-store, no-cache, must-revalidate";
const STATUS_HEADER: &str = "x-mediacache-proxy-status";
const CACHED_AT_HEADER: &str = "x-mediacache-proxy-cached-at";
const BLOCK_REASON_HEADER: &str = "x-mediacache-proxy-block-reason";

/// Entry point shared by the GET and HEAD axum routes.
pub async fn handle_request(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    client_ip: Option<String>,
) -> Response {
    let query = uri.query().unwrap_or("");
    let decoded = match decode_request(uri.path(), query) {
        Ok(d) => d,
        Err(UrlValidationError::InvalidHost {
            attempted_source_url,
        }) => {
            return PipelineError::SecurityViolation {
                detail: "host failed domain validation".to_string(),
                source_url: attempted_source_url,
            }
            .into_response();
        }
        Err(_) => return PipelineError::UrlParse.into_response(),
    };

    if decoded.view_flag && state.config.debug {
        return debug_view_response(&decoded);
    }

    let start = std::time::Instant::now();
    let is_get = method == Method::GET;
    let response = match method {
        Method::HEAD => handle_head(state, &decoded).await,
        Method::GET => handle_get(state, &decoded, headers, client_ip).await,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    record_response_metrics(state, &decoded.host, &response, start.elapsed(), is_get);
    response
}

/// Every response carries [`STATUS_HEADER`] (`hit` | `miss`) or, for error
/// responses built by [`crate::error::PipelineError`], none at all — those
/// are recorded as `redirect` since every error path here resolves to a 3xx
/// or a client-facing error rather than served media. Bytes are only
/// recorded for GET: HEAD's Content-Length is informational, not wire bytes.
fn record_response_metrics(
    state: &AppState,
    host: &str,
    response: &Response,
    elapsed: Duration,
    is_get: bool,
) {
    let outcome = response
        .headers()
        .get(STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("redirect");
    state.metrics.record_request(host, outcome, elapsed);
    if !is_get {
        return;
    }
    if let Some(len) = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        state.metrics.record_bytes_served(host, outcome, len);
    }
}

async fn handle_head(state: &AppState, req: &DecodedRequest) -> Response {
    let admission = state.admission.validate(&req.host).await;
    if !admission.allowed {
        return PipelineError::AdmissionDenied {
            host: req.host.clone(),
            source_url: req.source_url.clone(),
        }
        .into_response();
    }
    if req.force_refresh {
        return plain_redirect(&req.source_url);
    }

    match state.cache.head(&req.cache_key).await {
        Ok(Some(meta)) => {
            if !is_media(&meta.content_type) {
                spawn_poison_delete(state.cache.clone(), req.cache_key.clone());
                return PipelineError::NotMediaContent {
                    source_url: req.source_url.clone(),
                }
                .into_response();
            }
            head_response(&meta)
        }
        _ => plain_redirect(&req.source_url),
    }
}

async fn handle_get(
    state: &AppState,
    req: &DecodedRequest,
    client_headers: &HeaderMap,
    client_ip: Option<String>,
) -> Response {
    let range_header = client_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let if_none_match = client_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let speculative_range = range_header
        .as_deref()
        .filter(|h| is_standard_bounded_range(h))
        .and_then(parse_bounded_offsets);

    // Parallel dispatch (§4.7): admission, cache lookup, and a speculative
    // ranged read all launch together rather than sequentially.
    let (admission, head_result, prefetch) = tokio::join!(
        state.admission.validate(&req.host),
        state.cache.head(&req.cache_key),
        speculative_prefetch(state, &req.cache_key, speculative_range),
    );

    if !admission.allowed {
        return PipelineError::AdmissionDenied {
            host: req.host.clone(),
            source_url: req.source_url.clone(),
        }
        .into_response();
    }

    let tenant_ids: Vec<i64> = admission
        .domain_records
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.status == TenantStatus::Active)
        .map(|r| r.tenant_id)
        .collect();

    if !req.force_refresh {
        if let Ok(Some(meta)) = head_result {
            return handle_cache_hit(
                state,
                req,
                meta,
                range_header.as_deref(),
                if_none_match.as_deref(),
                prefetch,
                &tenant_ids,
            )
            .await;
        }
    }

    handle_cache_miss(
        state,
        req,
        range_header.as_deref(),
        client_headers,
        client_ip,
        tenant_ids,
    )
    .await
}

fn parse_bounded_offsets(header: &str) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (a, b) = spec.split_once('-')?;
    let start: u64 = a.parse().ok()?;
    let end: u64 = b.parse().ok()?;
    if start > end {
        return None;
    }
    Some((start, end - start + 1))
}

async fn speculative_prefetch(
    state: &AppState,
    key: &str,
    offsets: Option<(u64, u64)>,
) -> Option<CachedObject> {
    let (offset, length) = offsets?;
    state.cache.get_range(key, offset, length).await.ok().flatten()
}

async fn handle_cache_hit(
    state: &AppState,
    req: &DecodedRequest,
    meta: CachedMeta,
    range_header: Option<&str>,
    if_none_match: Option<&str>,
    prefetch: Option<CachedObject>,
    tenant_ids: &[i64],
) -> Response {
    if !is_media(&meta.content_type) {
        spawn_poison_delete(state.cache.clone(), req.cache_key.clone());
        return PipelineError::NotMediaContent {
            source_url: req.source_url.clone(),
        }
        .into_response();
    }

    if let Some(inm) = if_none_match {
        if inm == meta.etag {
            spawn_usage_records(state.usage.clone(), tenant_ids.to_vec(), req.host.clone(), 0, true);
            return not_modified_response(&meta);
        }
    }

    let total = meta.size;

    if let Some(raw) = range_header {
        let Some(range) = parse_range(Some(raw), total) else {
            return unsatisfiable_range_response(total);
        };

        let body = match prefetch.filter(|obj| obj.size == range.length()) {
            Some(obj) => Some(obj.body),
            None => state
                .cache
                .get_range(&req.cache_key, range.start, range.length())
                .await
                .ok()
                .flatten()
                .map(|obj| obj.body),
        };

        let Some(body) = body else {
            return PipelineError::InfraError {
                detail: "cache range read failed".to_string(),
                source_url: req.source_url.clone(),
            }
            .into_response();
        };

        let stream_body = guarded_hit_body(state, tenant_ids.to_vec(), req.host.clone(), body);
        return partial_response(&meta, &range, stream_body);
    }

    let object = match state.cache.get(&req.cache_key).await {
        Ok(Some(obj)) => obj,
        _ => {
            return PipelineError::InfraError {
                detail: "cache read failed".to_string(),
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
    };

    let stream_body = guarded_hit_body(state, tenant_ids.to_vec(), req.host.clone(), object.body);
    full_hit_response(&meta, stream_body)
}

/// Streams a materialized cache-hit body back out in fixed-size chunks
/// through a [`ByteCountingStream`], wired to the same [`UsageOnDrop`] guard
/// the cache-miss path uses, so a client disconnect mid-transfer is billed
/// for bytes actually delivered rather than the object's declared size.
const HIT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

fn guarded_hit_body(
    state: &AppState,
    tenant_ids: Vec<i64>,
    origin_host: String,
    body: Bytes,
) -> Body {
    let (counting, observed) = ByteCountingStream::new(chunked(body));
    let guard = UsageOnDrop {
        usage: state.usage.clone(),
        tenant_ids,
        origin_host,
        observed,
        cache_hit: true,
    };
    Body::from_stream(GuardedStream {
        inner: counting,
        _guard: guard,
    })
}

/// Splits an already-materialized buffer into fixed-size chunks so it can be
/// fed through the same counting-stream machinery the cache-miss path uses,
/// instead of handing the whole object to the response body at once.
fn chunked(body: Bytes) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send + 'static {
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    let len = body.len();
    if len == 0 {
        chunks.push(Bytes::new());
    } else {
        while offset < len {
            let end = (offset + HIT_STREAM_CHUNK_SIZE).min(len);
            chunks.push(body.slice(offset..end));
            offset = end;
        }
    }
    futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>))
}

async fn handle_cache_miss(
    state: &AppState,
    req: &DecodedRequest,
    range_header: Option<&str>,
    client_headers: &HeaderMap,
    client_ip: Option<String>,
    tenant_ids: Vec<i64>,
) -> Response {
    if let Some(raw) = range_header {
        if is_partial_range_request(raw) {
            // We cannot synthesize a byte range from a body we are about to
            // cache without lying about Content-Range; defer to origin.
            return plain_redirect(&req.source_url);
        }
    }

    let admission = state.admission.clone();
    let redirect_validator: RedirectValidator = Box::new(move |host: String| {
        let admission = admission.clone();
        Box::pin(async move { admission.validate(&host).await.allowed })
    });

    let timeout = Duration::from_millis(state.config.fetch.timeout_ms);
    let forward_ip = if state.config.fetch.forward_client_ip {
        client_ip.as_deref()
    } else {
        None
    };

    let outcome = state
        .origin
        .fetch_media(
            &req.source_url,
            client_headers,
            timeout,
            forward_ip,
            redirect_validator,
        )
        .await;

    let outcome = match outcome {
        Ok(o) => o,
        Err(FetchError::UrlRejected(_) | FetchError::RedirectAdmissionDenied) => {
            return PipelineError::SecurityViolation {
                detail: "redirect target rejected by admission re-check".to_string(),
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
        Err(FetchError::TooManyRedirects) => {
            return PipelineError::OriginUnreachable {
                detail: "too many redirects".to_string(),
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
        Err(FetchError::Timeout) => {
            return PipelineError::OriginUnreachable {
                detail: "origin fetch timed out".to_string(),
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
        Err(FetchError::Unreachable(detail)) => {
            return PipelineError::OriginUnreachable {
                detail,
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
    };

    if let Some(reason) = &outcome.blocked {
        let mut response = PipelineError::OriginRefused {
            reason: reason.as_str(),
            source_url: req.source_url.clone(),
        }
        .into_response();
        if let Ok(value) = HeaderValue::from_str(&reason.as_str()) {
            response.headers_mut().insert(BLOCK_REASON_HEADER, value);
        }
        return response;
    }

    if !(200..300).contains(&outcome.status) {
        return PipelineError::OriginRefused {
            reason: format!("http_{}", outcome.status),
            source_url: req.source_url.clone(),
        }
        .into_response();
    }

    let Some(content_type) = outcome.content_type.clone() else {
        return PipelineError::NotMediaContent {
            source_url: req.source_url.clone(),
        }
        .into_response();
    };
    if !is_media(&content_type) {
        return PipelineError::NotMediaContent {
            source_url: req.source_url.clone(),
        }
        .into_response();
    }

    let max_size = state.config.fetch.max_file_size_bytes;
    if let Some(len) = outcome.content_length {
        if len > max_size {
            return PipelineError::SizeCapExceeded {
                source_url: req.source_url.clone(),
            }
            .into_response();
        }
    }

    let (limited, observed) = SizeLimitedStream::new(outcome.body, max_size);
    let cacheable = outcome.content_length.is_some();

    if !cacheable {
        state.metrics.record_chunked_uncacheable(&req.host);
        let guard = UsageOnDrop {
            usage: state.usage.clone(),
            tenant_ids: tenant_ids.clone(),
            origin_host: req.host.clone(),
            observed: observed.clone(),
            cache_hit: false,
        };
        let body = Body::from_stream(GuardedStream {
            inner: limited,
            _guard: guard,
        });

        return streamed_response(&content_type, None, StatusCode::OK, body);
    }

    let (tapped, rx, poisoned) = tee(limited, 64);
    let (done_tx, done_rx) = oneshot::channel::<bool>();
    let cache = state.cache.clone();
    let key = req.cache_key.clone();
    let origin_host = req.host.clone();
    let source_url = req.source_url.clone();
    let content_type_for_put = content_type.clone();

    tokio::spawn(async move {
        let body = match collect_tee(rx, done_rx, poisoned).await {
            Some(body) if !body.is_empty() => body,
            Some(_) => return,
            None => {
                warn!(key = %key, "tee fell behind the cache-write task, discarding partial object");
                return;
            }
        };
        let metadata = crate::cache_port::ObjectMetadata {
            source_url,
            origin_host,
            cached_at: now_unix(),
            content_length: Some(body.len() as u64),
        };
        if let Err(err) = cache.put(&key, body, content_type_for_put, metadata).await {
            warn!(key = %key, error = %err, "background cache write failed");
        }
    });

    let guard = UsageOnDrop {
        usage: state.usage.clone(),
        tenant_ids,
        origin_host: req.host.clone(),
        observed: observed.clone(),
        cache_hit: false,
    };
    let signalled = DoneSignalStream {
        inner: tapped,
        tx: Some(done_tx),
    };
    let body = Body::from_stream(GuardedStream {
        inner: signalled,
        _guard: guard,
    });

    let status = if range_header.is_some() && outcome.content_length.unwrap_or(0) > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut response = streamed_response(&content_type, outcome.content_length, status, body);
    if status == StatusCode::PARTIAL_CONTENT {
        if let Some(len) = outcome.content_length {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes 0-{}/{}", len - 1, len)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
    }
    info!(host = %req.host, status = %outcome.status, "served cache-miss response");
    response
}

/// Reports observed bytes into the usage aggregator when the client-facing
/// stream it's attached to is dropped, whether by normal completion or by
/// client disconnect (§5, Cancellation).
struct UsageOnDrop {
    usage: Arc<crate::usage::UsageAggregator>,
    tenant_ids: Vec<i64>,
    origin_host: String,
    observed: Arc<std::sync::atomic::AtomicU64>,
    cache_hit: bool,
}

impl Drop for UsageOnDrop {
    fn drop(&mut self) {
        let bytes = self.observed.load(std::sync::atomic::Ordering::Relaxed);
        spawn_usage_records(
            self.usage.clone(),
            std::mem::take(&mut self.tenant_ids),
            self.origin_host.clone(),
            bytes,
            self.cache_hit,
        );
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: UsageOnDrop,
}

impl<S> futures::Stream for GuardedStream<S>
where
    S: futures::Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Sends a one-shot completion signal when dropped, letting a background
/// consumer know the client-facing stream is done (success, error, or
/// client disconnect) without blocking on an explicit end-of-stream chunk.
struct DoneSignalStream<S> {
    inner: S,
    tx: Option<oneshot::Sender<bool>>,
}

impl<S> Drop for DoneSignalStream<S> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl<S> futures::Stream for DoneSignalStream<S>
where
    S: futures::Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn spawn_usage_records(
    usage: Arc<crate::usage::UsageAggregator>,
    tenant_ids: Vec<i64>,
    origin_host: String,
    bytes: u64,
    cache_hit: bool,
) {
    if tenant_ids.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for tenant_id in tenant_ids {
            usage.record(tenant_id, &origin_host, bytes, cache_hit).await;
        }
    });
}

fn spawn_poison_delete(cache: Arc<dyn crate::cache_port::CachePort>, key: String) {
    tokio::spawn(async move {
        if let Err(err) = cache.delete(&key).await {
            warn!(key = %key, error = %err, "failed to delete poisoned cache entry");
        }
    });
}

fn plain_redirect(source_url: &str) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, source_url.to_string()),
            (header::CACHE_CONTROL, CACHE_CONTROL_NO_STORE.to_string()),
        ],
    )
        .into_response()
}

fn iso8601(unix_secs: u64) -> String {
    Utc.timestamp_opt(unix_secs as i64, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn rfc1123(unix_secs: u64) -> String {
    Utc.timestamp_opt(unix_secs as i64, 0)
        .single()
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

fn head_response(meta: &CachedMeta) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, meta.content_type.clone())
        .header(header::CONTENT_LENGTH, meta.size)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, meta.etag.clone())
        .header(header::LAST_MODIFIED, rfc1123(meta.uploaded))
        .header(header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
        .header(STATUS_HEADER, "hit")
        .header(CACHED_AT_HEADER, iso8601(meta.metadata.cached_at))
        .body(Body::empty())
        .unwrap_or_default()
}

fn not_modified_response(meta: &CachedMeta) -> Response {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, meta.etag.clone())
        .header(STATUS_HEADER, "hit")
        .body(Body::empty())
        .unwrap_or_default()
}

fn unsatisfiable_range_response(total: u64) -> Response {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{total}"))
        .body(Body::empty())
        .unwrap_or_default()
}

fn full_hit_response(meta: &CachedMeta, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, meta.content_type.clone())
        .header(header::CONTENT_LENGTH, meta.size)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
        .header(header::ETAG, meta.etag.clone())
        .header(header::LAST_MODIFIED, rfc1123(meta.uploaded))
        .header(STATUS_HEADER, "hit")
        .header(CACHED_AT_HEADER, iso8601(meta.metadata.cached_at))
        .body(body)
        .unwrap_or_default()
}

fn partial_response(meta: &CachedMeta, range: &ByteRange, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, meta.content_type.clone())
        .header(header::CONTENT_LENGTH, range.length())
        .header(header::CONTENT_RANGE, range.content_range_header())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
        .header(header::ETAG, meta.etag.clone())
        .header(header::LAST_MODIFIED, rfc1123(meta.uploaded))
        .header(STATUS_HEADER, "hit")
        .header(CACHED_AT_HEADER, iso8601(meta.metadata.cached_at))
        .body(body)
        .unwrap_or_default()
}

fn streamed_response(
    content_type: &str,
    content_length: Option<u64>,
    status: StatusCode,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
        .header(STATUS_HEADER, "miss");
    if let Some(len) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    builder.body(body).unwrap_or_default()
}

/// Debug-only response gated on `DEBUG=true` and `?view=1`, rendering the
/// already-public decode result as a small inline HTML page. Never reachable
/// in production configurations.
fn debug_view_response(req: &DecodedRequest) -> Response {
    let html = format!(
        "<!doctype html><html><body><pre>host: {}\npath: {}\nsource: {}\ncache_key: {}</pre></body></html>",
        req.host, req.normalized_path, req.source_url, req.cache_key
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
