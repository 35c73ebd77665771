//! Tavily web search, used by the router in `web` mode.

use super::router::{SearchHit, SearchResults, WebSearch};
use super::GenerationError;
use crate::config::ServicesConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_RESULTS: u32 = 5;

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    include_answer: bool,
    include_images: bool,
    include_raw_content: bool,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone)]
pub struct TavilyClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TavilyClient {
    pub fn new(http: reqwest::Client, services: &ServicesConfig) -> Self {
        Self {
            http,
            api_key: services.tavily_api_key.clone(),
            base_url: services.tavily_base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl From<SearchResponse> for SearchResults {
    fn from(response: SearchResponse) -> Self {
        SearchResults {
            answer: response.answer.filter(|a| !a.trim().is_empty()),
            hits: response
                .results
                .into_iter()
                .map(|r| SearchHit {
                    title: r.title,
                    content: r.content,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str) -> Result<SearchResults, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError("TAVILY_API_KEY is not configured".to_string()));
        }

        let request = SearchRequest {
            api_key: &self.api_key,
            query,
            search_depth: "advanced",
            include_answer: true,
            include_images: false,
            include_raw_content: false,
            max_results: MAX_RESULTS,
        };

        let response: SearchResponse = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(results = response.results.len(), "Web search completed");
        Ok(response.into())
    }
}
