//! Page retrieval and conversion of markup to plain text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Node};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::FetchConfig;
use crate::error::{ConfigError, FetchError};

/// Elements whose text is never visible on the rendered page.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Status, content type and body of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Request/response transport used to retrieve pages.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawPage, TransportError>;
}

pub type DynTransport = Arc<dyn FetchTransport>;

/// `reqwest` transport with a capped body size.
pub struct HttpTransport {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|err| ConfigError::invalid(format!("failed to create fetch client: {err}")))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawPage, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .header("Accept", "text/html,text/plain;q=0.9,*/*;q=0.5")
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(classify_transport)?;
        let capped = &bytes[..bytes.len().min(self.max_body_bytes)];

        Ok(RawPage {
            status,
            content_type,
            body: String::from_utf8_lossy(capped).into_owned(),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// Retrieves a URL and returns its visible text. Never panics or raises:
/// every outcome is a `Result`.
pub struct ContentFetcher {
    transport: DynTransport,
    timeout: Duration,
}

impl ContentFetcher {
    pub fn new(transport: DynTransport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    #[instrument(name = "fetch", skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let page = match tokio::time::timeout(self.timeout, self.transport.get(url, self.timeout))
            .await
        {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => return Err(FetchError::transport(url, err.to_string())),
            Err(_) => {
                return Err(FetchError::transport(
                    url,
                    format!("no response within {:?}", self.timeout),
                ));
            }
        };

        if !(200..300).contains(&page.status) {
            return Err(FetchError::http_status(url, page.status));
        }

        let text = page_to_text(&page);
        if text.is_empty() {
            return Err(FetchError::no_content(url));
        }

        debug!(chars = text.chars().count(), "page text extracted");
        Ok(text)
    }
}

/// Plain text of a page, parsing markup only for HTML-like bodies.
pub fn page_to_text(page: &RawPage) -> String {
    let declared_html = page
        .content_type
        .as_deref()
        .map(|value| value.to_ascii_lowercase().contains("html"));
    let is_html = declared_html.unwrap_or_else(|| page.body.trim_start().starts_with('<'));

    if is_html {
        html_to_text(&page.body)
    } else {
        collapse_whitespace(&page.body)
    }
}

/// Visible text of an HTML document joined by single spaces.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();

    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| HIDDEN_ELEMENTS.contains(&element.name()))
        });
        if hidden {
            continue;
        }
        parts.extend(text.split_whitespace());
    }

    parts.join(" ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
