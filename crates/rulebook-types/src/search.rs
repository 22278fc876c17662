use serde::{Deserialize, Serialize};

/// Body of the rule-sheet search call: `{"name": "<game name>"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSearchRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSearchResponse {
    #[serde(default)]
    pub pdf_urls: Vec<String>,
}
