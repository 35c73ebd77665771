//! # Query Routing
//!
//! Decides how to answer a transcript and dispatches to the right backend.
//!
//! ## Routes (first match wins, on the lower-cased query):
//! 1. **PublicIp**: mentions "my ip", "public ip" or "ip address"
//! 2. **Document**: `pdf` mode and mentions "pdf", "document" or "file"
//! 3. **WebSearch**: `web` mode
//! 4. **College**: mentions college, university, course, program, faculty or student
//! 5. **General**: everything else
//!
//! Every backend failure surfaces as a `GenerationError`; the turn pipeline
//! turns that into an error reply.

use super::{GenerationError, Responder};
use crate::session::ChatMode;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

const IP_KEYWORDS: [&str; 3] = ["my ip", "public ip", "ip address"];
const DOCUMENT_KEYWORDS: [&str; 3] = ["pdf", "document", "file"];
const COLLEGE_KEYWORDS: [&str; 6] = ["college", "university", "course", "program", "faculty", "student"];

/// Characters of document text handed to the model as context.
const DOCUMENT_CONTEXT_CHARS: usize = 1000;

/// Search hits used as context when the search provider has no direct answer.
const SEARCH_CONTEXT_HITS: usize = 3;

/// Text completion with an optional grounding context.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    pub answer: Option<String>,
    pub hits: Vec<SearchHit>,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults, GenerationError>;
}

/// Looks up the server's public IP address.
#[async_trait]
pub trait IpLookup: Send + Sync {
    async fn public_ip(&self) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PublicIp,
    Document,
    WebSearch,
    College,
    General,
}

/// Pick the route for a transcript in the given chat mode.
pub fn classify_query(query: &str, mode: ChatMode) -> Route {
    let query = query.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| query.contains(k));

    if mentions(&IP_KEYWORDS[..]) {
        Route::PublicIp
    } else if mode == ChatMode::Pdf && mentions(&DOCUMENT_KEYWORDS[..]) {
        Route::Document
    } else if mode == ChatMode::Web {
        Route::WebSearch
    } else if mentions(&COLLEGE_KEYWORDS[..]) {
        Route::College
    } else {
        Route::General
    }
}

pub struct QueryRouter {
    llm: Arc<dyn LanguageModel>,
    search: Arc<dyn WebSearch>,
    ip_lookup: Arc<dyn IpLookup>,
    college_info: String,
}

impl QueryRouter {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn WebSearch>,
        ip_lookup: Arc<dyn IpLookup>,
        college_info: String,
    ) -> Self {
        Self {
            llm,
            search,
            ip_lookup,
            college_info,
        }
    }

    async fn answer_from_web(&self, query: &str) -> Result<String, GenerationError> {
        let results = self.search.search(query).await?;
        if let Some(answer) = results.answer {
            return Ok(answer);
        }

        let mut context = String::from("Web search results:\n");
        for hit in results.hits.iter().take(SEARCH_CONTEXT_HITS) {
            context.push_str(&format!("- {}: {}\n", hit.title, hit.content));
        }
        self.llm.complete(query, Some(&context)).await
    }
}

#[async_trait]
impl Responder for QueryRouter {
    async fn respond(
        &self,
        text: &str,
        mode: ChatMode,
        context: Option<&str>,
    ) -> Result<String, GenerationError> {
        let route = classify_query(text, mode);
        debug!(?route, %mode, "Routing query");

        let answer = match route {
            Route::PublicIp => {
                let ip = self.ip_lookup.public_ip().await?;
                format!("Your public IP address is: {}", ip)
            }
            Route::Document => match context.filter(|c| !c.is_empty()) {
                Some(document) => {
                    let excerpt: String = document.chars().take(DOCUMENT_CONTEXT_CHARS).collect();
                    let context = format!("Answer based on this document context: {}...", excerpt);
                    self.llm.complete(text, Some(&context)).await?
                }
                None => self.llm.complete(text, None).await?,
            },
            Route::WebSearch => self.answer_from_web(text).await?,
            Route::College => {
                let context = format!("College information: {}", self.college_info);
                self.llm.complete(text, Some(&context)).await?
            }
            Route::General => self.llm.complete(text, None).await?,
        };

        info!(?route, chars = answer.len(), "Query answered");
        Ok(answer)
    }
}

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// Public IP lookup against a `{"ip": "..."}` JSON endpoint.
#[derive(Debug, Clone)]
pub struct HttpIpLookup {
    http: reqwest::Client,
    url: String,
}

impl HttpIpLookup {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl IpLookup for HttpIpLookup {
    async fn public_ip(&self) -> Result<String, GenerationError> {
        let response: IpResponse = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.ip)
    }
}
