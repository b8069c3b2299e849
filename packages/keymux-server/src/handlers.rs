//! HTTP wire protocol for the storage engine.
//!
//! Every request path is a key; a trailing `/` or `:` marks a base key
//! (directory-like). `application/octet-stream` in `Accept` /
//! `Content-Type` toggles raw mode. The whole path space belongs to the
//! key namespace, so the router has exactly one fallback handler and no
//! reserved utility routes.
//!
//! | Method   | Path kind | Behavior                                     |
//! |----------|-----------|----------------------------------------------|
//! | `GET`    | leaf      | value (404 if absent), meta headers          |
//! | `GET`    | base      | JSON array of keys, `:` rewritten to `/`     |
//! | `HEAD`   | leaf      | meta headers only                            |
//! | `PUT`    | leaf      | store body, TTL from `X-TTL`                 |
//! | `DELETE` | leaf/base | remove key / clear subtree                   |
//! | other    | any       | 405                                          |

use std::sync::Arc;

use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use keymux_core::key::normalize_key;
use keymux_core::serialize::stringify;
use keymux_core::{Metadata, Options, Storage, StorageError, Value};

use crate::drain::RequestTracker;

/// Content type toggling raw (opaque byte) mode.
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

/// Reserved header carrying a TTL in integer seconds.
pub const TTL_HEADER: &str = "x-ttl";

/// Access mode presented to the authorization hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// GET / HEAD requests.
    Read,
    /// PUT / DELETE requests.
    Write,
}

/// The request context handed to the authorization hook before dispatch.
pub struct AuthCheck<'a> {
    /// Normalized key (or base) the request addresses.
    pub key: &'a str,
    /// Whether the request reads or mutates.
    pub mode: AccessMode,
    /// Request headers, for token extraction.
    pub headers: &'a HeaderMap,
}

/// Authorization hook consulted before every dispatch.
///
/// Rejecting yields the error's own status (401 by default via
/// [`HttpError::unauthorized`]).
pub trait Authorize: Send + Sync {
    /// Allows or rejects the request.
    ///
    /// # Errors
    ///
    /// Returns an [`HttpError`] to reject; its status is sent verbatim.
    fn authorize(&self, check: &AuthCheck<'_>) -> Result<(), HttpError>;
}

/// Hook rewriting a request path into a key path.
pub type PathResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// An HTTP-mapped error: status code plus plain-text message.
#[derive(Debug)]
pub struct HttpError {
    /// Status sent to the client.
    pub status: StatusCode,
    /// Plain-text body.
    pub message: String,
}

impl HttpError {
    /// Creates an error with an explicit status.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 404 Not Found.
    #[must_use]
    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "key not found")
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<StorageError> for HttpError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::InvalidKey(_)
            | StorageError::Serialization(_)
            | StorageError::ReservedValue(_) => StatusCode::BAD_REQUEST,
            StorageError::MissingConfig(_) | StorageError::Io(_) | StorageError::Backend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

/// Shared application state passed to the handler via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// The storage engine behind the wire surface.
    pub storage: Arc<Storage>,
    /// In-flight request tracking for graceful drain.
    pub tracker: Arc<RequestTracker>,
    /// Optional authorization hook.
    pub authorize: Option<Arc<dyn Authorize>>,
    /// Optional request-path rewriting hook.
    pub resolve_path: Option<PathResolver>,
}

/// The single protocol handler; installed as the router's fallback so it
/// owns the whole path space.
pub async fn storage_handler(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = state.tracker.track();
    match dispatch(&state, &method, uri.path(), &headers, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn dispatch(
    state: &AppState,
    method: &Method,
    raw_path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let path = match &state.resolve_path {
        Some(resolve) => resolve(raw_path),
        None => raw_path.to_string(),
    };
    let key = normalize_key(&path);
    let trimmed = path.trim_end_matches(|c| c == '?' || char::is_whitespace(c));
    let is_base = key.is_empty() || trimmed.ends_with('/') || trimmed.ends_with(':');

    let mode = if *method == Method::GET || *method == Method::HEAD {
        AccessMode::Read
    } else if *method == Method::PUT || *method == Method::DELETE {
        AccessMode::Write
    } else {
        return Err(HttpError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    };
    if let Some(authorize) = &state.authorize {
        authorize.authorize(&AuthCheck {
            key: &key,
            mode,
            headers,
        })?;
    }
    debug!(%method, %key, is_base, "dispatching storage request");

    if mode == AccessMode::Read {
        if is_base {
            list_base(state, &key, *method == Method::HEAD).await
        } else if *method == Method::HEAD {
            head_leaf(state, &key).await
        } else {
            get_leaf(state, &key, headers).await
        }
    } else if *method == Method::PUT {
        if is_base {
            Err(HttpError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "cannot write to a base key",
            ))
        } else {
            put_leaf(state, &key, headers, body).await
        }
    } else if is_base {
        state.storage.clear(&key).await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        state
            .storage
            .remove_with(&key, &Options::new().with_remove_meta(true))
            .await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

async fn get_leaf(state: &AppState, key: &str, headers: &HeaderMap) -> Result<Response, HttpError> {
    let meta = state.storage.get_meta(key).await.unwrap_or_default();
    let meta_headers = meta_headers(&meta);

    if wants_raw(headers) {
        let Some(bytes) = state.storage.get_raw(key).await? else {
            return Err(HttpError::not_found());
        };
        let mut response = (meta_headers, bytes).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(RAW_CONTENT_TYPE),
        );
        Ok(response)
    } else {
        let Some(value) = state.storage.get(key).await? else {
            return Err(HttpError::not_found());
        };
        let text = stringify(&value)?;
        Ok((meta_headers, text).into_response())
    }
}

async fn head_leaf(state: &AppState, key: &str) -> Result<Response, HttpError> {
    if !state.storage.has(key).await? {
        return Err(HttpError::not_found());
    }
    let meta = state.storage.get_meta(key).await.unwrap_or_default();
    Ok((meta_headers(&meta), ()).into_response())
}

async fn list_base(state: &AppState, base: &str, head: bool) -> Result<Response, HttpError> {
    let keys = state.storage.list_keys(base).await?;
    if head {
        return Ok(StatusCode::OK.into_response());
    }
    // Colon separators rewritten to slashes for client friendliness.
    let listing: Vec<String> = keys.iter().map(|key| key.replace(':', "/")).collect();
    Ok(axum::Json(listing).into_response())
}

async fn put_leaf(
    state: &AppState,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let mut opts = Options::new();
    if let Some(ttl) = header_ttl(headers) {
        opts = opts.with_ttl(ttl);
    }

    if sends_raw(headers) {
        state
            .storage
            .set_raw_with(key, body.to_vec(), &opts)
            .await?;
    } else {
        let text = String::from_utf8(body.to_vec()).map_err(|_| {
            HttpError::new(
                StatusCode::BAD_REQUEST,
                "request body must be UTF-8 text (or use application/octet-stream)",
            )
        })?;
        state
            .storage
            .set_with(key, Value::String(text), &opts)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Whether the client negotiated a raw-mode response.
fn wants_raw(headers: &HeaderMap) -> bool {
    header_contains(headers, header::ACCEPT, RAW_CONTENT_TYPE)
}

/// Whether the request body is raw bytes.
fn sends_raw(headers: &HeaderMap) -> bool {
    header_contains(headers, header::CONTENT_TYPE, RAW_CONTENT_TYPE)
}

fn header_contains(headers: &HeaderMap, name: HeaderName, needle: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(needle))
}

/// Parses the `X-TTL` request header (integer seconds).
fn header_ttl(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(TTL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Builds the meta response headers: `Last-Modified` from `mtime`, plus
/// `X-TTL` and `Cache-Control: max-age=<ttl>` when a ttl is known.
fn meta_headers(meta: &Metadata) -> HeaderMap {
    let mut out = HeaderMap::new();
    if let Some(mtime) = meta.mtime {
        let formatted = DateTime::<Utc>::from(mtime)
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            out.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Some(ttl) = meta.ttl {
        if let Ok(value) = HeaderValue::from_str(&ttl.to_string()) {
            out.insert(HeaderName::from_static(TTL_HEADER), value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={ttl}")) {
            out.insert(header::CACHE_CONTROL, value);
        }
    }
    out
}
