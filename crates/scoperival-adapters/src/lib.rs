//! Content fingerprint source contracts and HTTP-backed implementations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::Html;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "scoperival-adapters";

/// Opaque content hash for a page at one point in time. Compared byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    /// The source answered but could not produce a fingerprint.
    #[error("{0}")]
    Unavailable(String),
    /// Connectivity problem between us and the source.
    #[error("network error: {0}")]
    Network(String),
    #[error("fingerprint request timed out after {0:?}")]
    Timeout(Duration),
}

impl FingerprintError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

#[async_trait]
pub trait FingerprintSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fingerprint(&self, url: &str) -> Result<Fingerprint, FingerprintError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn classify_reqwest_error(err: &reqwest::Error, timeout: Duration) -> FingerprintError {
    if err.is_timeout() {
        FingerprintError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        FingerprintError::Network(err.to_string())
    } else {
        FingerprintError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build()
}

/// JSON body returned by the scraping endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointResponse {
    pub success: bool,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Turn an endpoint reply into a fingerprint. Non-2xx, `success: false` and a
/// missing hash all count as the source being unavailable.
pub fn interpret_endpoint_response(
    status: StatusCode,
    body: &[u8],
) -> Result<Fingerprint, FingerprintError> {
    if !status.is_success() {
        return Err(FingerprintError::Unavailable(format!(
            "monitoring service returned HTTP {}",
            status.as_u16()
        )));
    }
    let parsed: EndpointResponse = serde_json::from_slice(body).map_err(|e| {
        FingerprintError::Unavailable(format!("monitoring service sent an unreadable reply: {e}"))
    })?;
    if !parsed.success {
        return Err(FingerprintError::Unavailable(
            parsed
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "Failed to scrape website".to_string()),
        ));
    }
    match parsed.hash {
        Some(hash) => Ok(Fingerprint { hash }),
        None => Err(FingerprintError::Unavailable(
            "monitoring service reported success without a hash".to_string(),
        )),
    }
}

/// Asks the hosted scraping endpoint for a hash: `GET <endpoint>?url=<target>`.
#[derive(Debug, Clone)]
pub struct EndpointFingerprintSource {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl EndpointFingerprintSource {
    pub fn new(endpoint: impl Into<String>, config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(&config)?,
            endpoint: endpoint.into(),
            timeout: config.timeout,
        })
    }

    /// `GET <endpoint>?url=<target>` with the target form-encoded.
    pub fn build_request(&self, url: &str) -> Result<reqwest::Request, reqwest::Error> {
        self.client
            .get(&self.endpoint)
            .query(&[("url", url)])
            .build()
    }

    async fn request(&self, url: &str) -> Result<Fingerprint, FingerprintError> {
        let request = self
            .build_request(url)
            .map_err(|e| FingerprintError::Unavailable(format!("invalid monitoring endpoint: {e}")))?;
        let resp = self
            .client
            .execute(request)
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;
        debug!(status = status.as_u16(), bytes = body.len(), "endpoint replied");
        interpret_endpoint_response(status, &body)
    }
}

#[async_trait]
impl FingerprintSource for EndpointFingerprintSource {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    async fn fingerprint(&self, url: &str) -> Result<Fingerprint, FingerprintError> {
        let span = info_span!("fingerprint_fetch", source = "endpoint", url);
        self.request(url).instrument(span).await
    }
}

/// Visible text of a document with whitespace collapsed; script and style
/// contents are skipped so tracking snippets do not register as content changes.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut words: Vec<&str> = Vec::new();
    for node in document.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|el| {
                matches!(el.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

pub fn page_fingerprint(html: &str) -> String {
    sha256_hex(visible_text(html).as_bytes())
}

/// Fetches the competitor page itself and hashes its visible text.
#[derive(Debug, Clone)]
pub struct DirectFingerprintSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl DirectFingerprintSource {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(&config)?,
            timeout: config.timeout,
        })
    }

    async fn request(&self, url: &str) -> Result<Fingerprint, FingerprintError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FingerprintError::Unavailable(format!(
                "site returned HTTP {}",
                status.as_u16()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;
        Ok(Fingerprint {
            hash: page_fingerprint(&body),
        })
    }
}

#[async_trait]
impl FingerprintSource for DirectFingerprintSource {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn fingerprint(&self, url: &str) -> Result<Fingerprint, FingerprintError> {
        let span = info_span!("fingerprint_fetch", source = "direct", url);
        self.request(url).instrument(span).await
    }
}
