//! Static-HTML extraction strategy using reqwest + scraper.
//!
//! Each configured field maps to a CSS selector. One matching element yields
//! a text field, several yield a list in document order. No JavaScript
//! rendering, so this only suits server-rendered pages.

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ExtractionFailure, MonitorError};
use crate::traits::Extractor;
use crate::types::{FieldSet, FieldValue};

pub struct HttpExtractor {
    client: reqwest::Client,
    /// Field name to CSS selector
    selectors: BTreeMap<String, String>,
}

impl HttpExtractor {
    pub fn new(selectors: BTreeMap<String, String>) -> Result<Self, MonitorError> {
        // Use a browser-like User-Agent to avoid bot detection
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| MonitorError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, selectors })
    }

    pub fn selectors(&self) -> &BTreeMap<String, String> {
        &self.selectors
    }

    async fn fetch_html(&self, url: &Url, timeout: Duration) -> Result<String, ExtractionFailure> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionFailure::Network(format!("HTTP {} for {}", status, url)));
        }

        response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(url, e))
    }
}

fn classify_reqwest_error(url: &Url, err: reqwest::Error) -> ExtractionFailure {
    if err.is_timeout() {
        ExtractionFailure::Timeout(format!("{}: {}", url, err))
    } else if err.is_decode() {
        ExtractionFailure::Parse(format!("{}: {}", url, err))
    } else {
        ExtractionFailure::Network(format!("{}: {}", url, err))
    }
}

/// Apply field selectors to an HTML document.
pub fn extract_fields(
    html: &str,
    selectors: &BTreeMap<String, String>,
) -> Result<FieldSet, ExtractionFailure> {
    let document = Html::parse_document(html);
    let mut fields = FieldSet::new();

    for (field, css) in selectors {
        let selector = Selector::parse(css).map_err(|_| {
            ExtractionFailure::Parse(format!("invalid CSS selector {:?} for field {}", css, field))
        })?;

        let mut texts: Vec<String> = document
            .select(&selector)
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|text| !text.is_empty())
            .collect();

        match texts.len() {
            0 => debug!(field = %field, selector = %css, "Selector matched nothing"),
            1 => fields.insert(field.clone(), FieldValue::Text(texts.remove(0))),
            _ => fields.insert(field.clone(), FieldValue::List(texts)),
        }
    }

    if fields.is_empty() {
        return Err(ExtractionFailure::Parse(
            "no configured field matched the page".to_string(),
        ));
    }
    Ok(fields)
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, url: &Url, timeout: Duration) -> Result<FieldSet, ExtractionFailure> {
        let html = self.fetch_html(url, timeout).await?;
        debug!(url = %url, bytes = html.len(), "Fetched page");
        extract_fields(&html, &self.selectors)
    }
}
