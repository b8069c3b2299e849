//! Remote [`Driver`] consuming the storage wire protocol over HTTP.
//!
//! The inverse of the server surface: keys become URL paths, raw mode is
//! negotiated with `Accept` / `Content-Type: application/octet-stream`,
//! TTLs travel in the `X-TTL` header, and base-key GETs yield the slash
//! rewritten key listing which is folded back into colon form.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::StatusCode;

use keymux_core::key::normalize_key;
use keymux_core::{Capabilities, Driver, Metadata, Options, Result, StorageError};

use crate::handlers::{RAW_CONTENT_TYPE, TTL_HEADER};

/// Configuration for [`HttpDriver`].
#[derive(Debug, Clone, Default)]
pub struct HttpDriverConfig {
    /// Server endpoint, e.g. `http://127.0.0.1:8080`. Required.
    pub base_url: Option<String>,
    /// Extra headers attached to every request (auth tokens and the
    /// like).
    pub headers: Vec<(String, String)>,
}

impl HttpDriverConfig {
    /// Starts a config pointing at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Attaches a header to every request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// HTTP-backed driver: a remote storage server as a mountable backend.
#[derive(Debug)]
pub struct HttpDriver {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpDriver {
    /// Creates a driver from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingConfig`] when no base URL is
    /// configured, and [`StorageError::Backend`] for unusable headers.
    pub fn new(config: HttpDriverConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .ok_or(StorageError::MissingConfig("base_url"))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        for (name, value) in config.headers {
            let name = name
                .parse::<HeaderName>()
                .map_err(|err| StorageError::Backend(anyhow::anyhow!(err)))?;
            let value = value
                .parse::<HeaderValue>()
                .map_err(|err| StorageError::Backend(anyhow::anyhow!(err)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            headers,
        })
    }

    /// Convenience constructor for the common case.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(HttpDriverConfig::new(base_url))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.replace(':', "/"))
    }

    fn url_for_base(&self, base: &str) -> String {
        let path = base.replace(':', "/");
        format!("{}/{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client.request(method, url).headers(self.headers.clone())
    }
}

/// Folds transport errors into the backend error channel.
fn backend(err: reqwest::Error) -> StorageError {
    StorageError::Backend(anyhow::anyhow!(err))
}

/// Applies the `ttl` option as an `X-TTL` header.
fn apply_ttl(builder: reqwest::RequestBuilder, opts: &Options) -> reqwest::RequestBuilder {
    match opts.ttl() {
        Some(ttl) => builder.header(TTL_HEADER, ttl),
        None => builder,
    }
}

#[async_trait]
impl Driver for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            set: true,
            set_raw: true,
            get_raw: true,
            remove: true,
            get_meta: true,
            clear: true,
            // The server decides what a ttl means; this driver only
            // forwards it.
            native_ttl: true,
            ..Capabilities::default()
        }
    }

    async fn has(&self, key: &str, _opts: &Options) -> Result<bool> {
        let response = self
            .request(reqwest::Method::HEAD, self.url_for(key))
            .send()
            .await
            .map_err(backend)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::Backend(anyhow::anyhow!(
                "HEAD {key} returned {status}"
            ))),
        }
    }

    async fn get(&self, key: &str, _opts: &Options) -> Result<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, self.url_for(key))
            .send()
            .await
            .map_err(backend)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(backend)?;
        Ok(Some(response.text().await.map_err(backend)?))
    }

    async fn get_raw(&self, key: &str, _opts: &Options) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(reqwest::Method::GET, self.url_for(key))
            .header(ACCEPT, RAW_CONTENT_TYPE)
            .send()
            .await
            .map_err(backend)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(backend)?;
        Ok(Some(response.bytes().await.map_err(backend)?.to_vec()))
    }

    async fn set(&self, key: &str, value: String, opts: &Options) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PUT, self.url_for(key))
            .body(value);
        apply_ttl(builder, opts)
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        Ok(())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, opts: &Options) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PUT, self.url_for(key))
            .header(CONTENT_TYPE, RAW_CONTENT_TYPE)
            .body(value);
        apply_ttl(builder, opts)
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, key: &str, _opts: &Options) -> Result<()> {
        self.request(reqwest::Method::DELETE, self.url_for(key))
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        Ok(())
    }

    async fn list_keys(&self, base: &str, _opts: &Options) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, self.url_for_base(base))
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        let listing: Vec<String> = response.json().await.map_err(backend)?;
        Ok(listing.iter().map(|key| normalize_key(key)).collect())
    }

    async fn get_meta(&self, key: &str, _opts: &Options) -> Result<Option<Metadata>> {
        let response = self
            .request(reqwest::Method::HEAD, self.url_for(key))
            .send()
            .await
            .map_err(backend)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(backend)?;

        let mtime = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(std::time::SystemTime::from);
        let ttl = response
            .headers()
            .get(TTL_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());

        Ok(Some(Metadata {
            mtime,
            ttl,
            ..Metadata::default()
        }))
    }

    async fn clear(&self, base: &str, _opts: &Options) -> Result<()> {
        self.request(reqwest::Method::DELETE, self.url_for_base(base))
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        Ok(())
    }
}
