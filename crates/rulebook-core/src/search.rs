//! Rule-sheet discovery: finds downloadable rulebooks by game name.

use crate::error::{Result, TutorError};
use bytes::Bytes;
use reqwest::Client;
use rulebook_types::{RuleSearchRequest, RuleSearchResponse};
use std::time::Duration;

pub const DEFAULT_RULE_SEARCH_URL: &str = "https://rule-searcher-xyprdcgeaw.cn-chengdu.fcapp.run";

pub struct RuleSearchClient {
    client: Client,
    endpoint: String,
}

impl RuleSearchClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Candidate PDF URLs for `name`. A blank name returns nothing without a
    /// request.
    pub async fn search(&self, name: &str) -> Result<Vec<String>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&RuleSearchRequest {
                name: name.to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TutorError::Search(format!(
                "search service returned {}",
                response.status()
            )));
        }

        let found: RuleSearchResponse = response.json().await?;
        tracing::info!("Found {} rulebooks for {:?}", found.pdf_urls.len(), name);
        Ok(found.pdf_urls)
    }

    /// Downloads a found rulebook so it can be added to the library.
    pub async fn fetch_document(&self, url: &str) -> Result<Bytes> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }
}

/// A readable name for a search hit: the decoded last path segment. Files
/// from 1j1ju.com carry a three-character prefix that is dropped.
pub fn display_name(url: &str) -> String {
    let segment = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("Unknown File");
    let decoded = urlencoding::decode(segment)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if url.contains("1j1ju.com") {
        decoded.chars().skip(3).collect()
    } else {
        decoded
    }
}
