//! Extraction strategies and URL-pattern routing between them.

pub mod http;

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{ExtractionFailure, MonitorError};
use crate::traits::Extractor;
use crate::types::FieldSet;

pub use http::HttpExtractor;

/// Selects a site-specific extractor by URL pattern.
///
/// Routes are tried in registration order; the first pattern that matches
/// the full URL string wins. Without a match the fallback is used, and
/// without a fallback the visit fails as a parse error.
#[derive(Default)]
pub struct StrategyRouter {
    routes: Vec<(Regex, Arc<dyn Extractor>)>,
    fallback: Option<Arc<dyn Extractor>>,
}

impl StrategyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, pattern: &str, extractor: Arc<dyn Extractor>) -> Result<Self, MonitorError> {
        let regex = Regex::new(pattern).map_err(|e| {
            MonitorError::Config(format!("invalid strategy pattern {:?}: {}", pattern, e))
        })?;
        self.routes.push((regex, extractor));
        Ok(self)
    }

    pub fn with_fallback(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.fallback = Some(extractor);
        self
    }

    pub fn select(&self, url: &Url) -> Option<&Arc<dyn Extractor>> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.is_match(url.as_str()))
            .map(|(_, extractor)| extractor)
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl Extractor for StrategyRouter {
    async fn extract(&self, url: &Url, timeout: Duration) -> Result<FieldSet, ExtractionFailure> {
        match self.select(url) {
            Some(extractor) => extractor.extract(url, timeout).await,
            None => Err(ExtractionFailure::Parse(format!(
                "no extraction strategy for {}",
                url
            ))),
        }
    }
}
