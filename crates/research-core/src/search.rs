//! Web search providers returning ordered result URLs.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::{SearchConfig, SearchProviderKind};
use crate::error::{ConfigError, SearchError};
use crate::security::{SecretValue, require_env};

const DUCKDUCKGO_HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";

static RESULT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".result").expect("invalid result selector"));
static RESULT_LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a.result__a").expect("invalid result link selector"));

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Return at most `count` result URLs for `query`, best first.
    async fn search(&self, query: &str, count: usize) -> Result<Vec<String>, SearchError>;

    fn name(&self) -> &'static str;
}

pub type DynSearchProvider = Arc<dyn SearchProvider>;

/// Build the provider selected in configuration.
pub fn build_search_provider(
    config: &SearchConfig,
    user_agent: &str,
) -> Result<DynSearchProvider, ConfigError> {
    match config.provider {
        SearchProviderKind::DuckDuckGo => Ok(Arc::new(DuckDuckGoSearch::new(config, user_agent)?)),
        SearchProviderKind::Serper => {
            let api_key = require_env(&config.api_key_env)?;
            Ok(Arc::new(SerperSearch::new(config, api_key)?))
        }
    }
}

fn build_client(config: &SearchConfig, user_agent: &str) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(user_agent)
        .build()
        .map_err(|err| ConfigError::invalid(format!("failed to create search client: {err}")))
}

fn classify_transport(err: reqwest::Error) -> SearchError {
    if err.is_timeout() {
        SearchError::Timeout
    } else {
        SearchError::Unreachable(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), SearchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SearchError::RateLimited);
    }
    if !status.is_success() {
        return Err(SearchError::Rejected(status.as_u16()));
    }
    Ok(())
}

/// Keyless search against the DuckDuckGo HTML endpoint.
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig, user_agent: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client: build_client(config, user_agent)?,
            endpoint: DUCKDUCKGO_HTML_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    #[instrument(name = "search.duckduckgo", skip(self))]
    async fn search(&self, query: &str, count: usize) -> Result<Vec<String>, SearchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("q", query)])
            .header("Accept", "text/html")
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(response.status())?;

        let body = response.text().await.map_err(classify_transport)?;
        let urls = parse_duckduckgo_results(&body, count);
        debug!(count = urls.len(), "duckduckgo results parsed");
        Ok(urls)
    }

    fn name(&self) -> &'static str {
        "duckduckgo"
    }
}

/// Extract organic result URLs from a DuckDuckGo HTML result page.
pub fn parse_duckduckgo_results(html: &str, max: usize) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut urls = Vec::new();

    for result in doc.select(&RESULT_SELECTOR) {
        if urls.len() >= max {
            break;
        }
        if result.value().classes().any(|class| class == "result--ad") {
            continue;
        }
        let Some(href) = result
            .select(&RESULT_LINK_SELECTOR)
            .next()
            .and_then(|link| link.value().attr("href"))
        else {
            continue;
        };

        let url = resolve_redirect(href);
        if url.starts_with("http://") || url.starts_with("https://") {
            urls.push(url);
        }
    }

    urls
}

/// DuckDuckGo wraps result links in `/l/?uddg=<encoded>` redirects.
fn resolve_redirect(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let start = pos + "uddg=".len();
        let end = href[start..]
            .find('&')
            .map(|offset| start + offset)
            .unwrap_or(href.len());
        let encoded = &href[start..end];
        if !encoded.is_empty() {
            return percent_decode_str(encoded).decode_utf8_lossy().into_owned();
        }
    }

    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    href.to_string()
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    #[serde(default)]
    link: String,
}

/// Google results through the serper.dev API.
pub struct SerperSearch {
    client: reqwest::Client,
    api_key: SecretValue,
    endpoint: String,
}

impl SerperSearch {
    pub fn new(config: &SearchConfig, api_key: SecretValue) -> Result<Self, ConfigError> {
        Ok(Self {
            client: build_client(config, "research-assistant")?,
            api_key,
            endpoint: SERPER_ENDPOINT.to_string(),
        })
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    #[instrument(name = "search.serper", skip(self))]
    async fn search(&self, query: &str, count: usize) -> Result<Vec<String>, SearchError> {
        let body = serde_json::json!({ "q": query, "num": count });
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(response.status())?;

        let data: SerperResponse = response
            .json()
            .await
            .map_err(|err| SearchError::Malformed(err.to_string()))?;

        let urls: Vec<String> = data
            .organic
            .into_iter()
            .map(|result| result.link)
            .filter(|link| !link.is_empty())
            .take(count)
            .collect();
        debug!(count = urls.len(), "serper results parsed");
        Ok(urls)
    }

    fn name(&self) -> &'static str {
        "serper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
        <html><body>
          <div class="result results_links result--ad">
            <a class="result__a" href="https://ads.example/buy">Ad</a>
          </div>
          <div class="result results_links">
            <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fone.example%2Fa%3Fx%3D1&amp;rut=abc">One</a>
          </div>
          <div class="result results_links">
            <a class="result__a" href="https://two.example/b">Two</a>
          </div>
          <div class="result results_links">
            <a class="result__a" href="/relative">Relative</a>
          </div>
          <div class="result results_links">
            <a class="result__a" href="https://three.example/c">Three</a>
          </div>
        </body></html>
    "#;

    #[test]
    fn parses_results_in_order_skipping_ads() {
        let urls = parse_duckduckgo_results(RESULTS_PAGE, 10);
        assert_eq!(
            urls,
            vec![
                "https://one.example/a?x=1",
                "https://two.example/b",
                "https://three.example/c",
            ]
        );
    }

    #[test]
    fn respects_result_limit() {
        let urls = parse_duckduckgo_results(RESULTS_PAGE, 2);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(SearchError::RateLimited)
        );
        assert_eq!(
            check_status(StatusCode::FORBIDDEN),
            Err(SearchError::Rejected(403))
        );
        assert!(check_status(StatusCode::OK).is_ok());
    }

    #[test]
    fn serper_response_decodes_links() {
        let data: SerperResponse = serde_json::from_str(
            r#"{"organic":[{"link":"https://a.example","title":"A"},{"title":"no link"}]}"#,
        )
        .unwrap();
        assert_eq!(data.organic[0].link, "https://a.example");
        assert!(data.organic[1].link.is_empty());
    }
}
