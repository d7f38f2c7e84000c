//! Stateless HTTP search engines used as cascade secondaries.

use crate::config::{Config, SecondaryEngine};
use deepsurf_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";

fn timeout_from_query(q: &SearchQuery) -> Duration {
    // Requests can hang indefinitely without an explicit timeout.
    Duration::from_millis(q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000))
}

fn limit_from_query(q: &SearchQuery) -> usize {
    q.max_results.unwrap_or(10).clamp(1, 20)
}

fn response(provider: &str, results: Vec<SearchResult>, t0: Instant) -> SearchResponse {
    let mut timings_ms = BTreeMap::new();
    timings_ms.insert("search".to_string(), t0.elapsed().as_millis());
    SearchResponse {
        results,
        provider: provider.to_string(),
        timings_ms,
    }
}

fn link_result(url: String, title: Option<String>, source: &str) -> SearchResult {
    SearchResult {
        url,
        title: title.filter(|t| !t.is_empty()),
        snippet: None,
        source: source.to_string(),
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn html_body(resp: reqwest::Response, engine: &str) -> Result<String> {
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Search(format!("{engine} search HTTP {status}")));
    }
    resp.text().await.map_err(|e| Error::Search(e.to_string()))
}

/// Resolve DuckDuckGo's `/l/?uddg=` redirect links to their target; drop ad redirects.
pub fn resolve_ddg_href(href: &str) -> Option<String> {
    let href = href.trim();
    let abs = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let u = url::Url::parse(&abs).ok()?;
    let host = u.host_str().unwrap_or("");
    if host.ends_with("duckduckgo.com") {
        if u.path() == "/y.js" {
            return None;
        }
        if u.path().starts_with("/l/") {
            return u
                .query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
                .filter(|v| v.starts_with("http"));
        }
        return None;
    }
    matches!(u.scheme(), "http" | "https").then(|| u.to_string())
}

pub fn parse_ddg_html(html: &str, limit: usize) -> Vec<SearchResult> {
    let doc = html_scraper::Html::parse_document(html);
    let Ok(sel) = html_scraper::Selector::parse("h2.result__title a[href], a.result__a[href]") else {
        return Vec::new();
    };
    let mut out: Vec<SearchResult> = Vec::new();
    for a in doc.select(&sel) {
        if out.len() >= limit {
            break;
        }
        let Some(url) = a.value().attr("href").and_then(resolve_ddg_href) else {
            continue;
        };
        if out.iter().any(|r| r.url == url) {
            continue;
        }
        let title = collapse_ws(&a.text().collect::<String>());
        out.push(link_result(url, Some(title), "duckduckgo"));
    }
    out
}

pub fn parse_mojeek_html(html: &str, limit: usize) -> Vec<SearchResult> {
    let doc = html_scraper::Html::parse_document(html);
    let Ok(sel) = html_scraper::Selector::parse("ul.results-standard li a.title[href]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for a in doc.select(&sel).take(limit) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if !href.starts_with("http") {
            continue;
        }
        let title = collapse_ws(&a.text().collect::<String>());
        out.push(link_result(href.to_string(), Some(title), "mojeek"));
    }
    out
}

#[derive(Debug, Clone)]
pub struct DuckDuckGoHtmlProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoHtmlProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, "https://html.duckduckgo.com/html/")
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoHtmlProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::USER_AGENT, BROWSER_UA)
            .form(&[("q", q.query.as_str())])
            .timeout(timeout_from_query(q))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let html = html_body(resp, "duckduckgo").await?;
        Ok(response(
            "duckduckgo",
            parse_ddg_html(&html, limit_from_query(q)),
            t0,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct MojeekProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl MojeekProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, "https://www.mojeek.com/search")
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for MojeekProvider {
    fn name(&self) -> &'static str {
        "mojeek"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let resp = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::USER_AGENT, BROWSER_UA)
            .header(reqwest::header::ACCEPT, "text/html")
            .query(&[("q", q.query.as_str())])
            .timeout(timeout_from_query(q))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let html = html_body(resp, "mojeek").await?;
        Ok(response(
            "mojeek",
            parse_mojeek_html(&html, limit_from_query(q)),
            t0,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct SearxngSearchProvider {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl SearxngSearchProvider {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NotConfigured(
                "missing DEEPSURF_SEARXNG_ENDPOINT (or DEEPSURF_SEARXNG_ENDPOINTS)".to_string(),
            ));
        }
        Ok(Self { client, endpoints })
    }

    fn endpoint_search_for(base_endpoint: &str) -> String {
        // Accept either a base URL or a full /search endpoint.
        let mut base = base_endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }

    /// FNV-1a over the query and hints; stable across runs.
    fn stable_hash64(q: &SearchQuery) -> u64 {
        let mut h: u64 = 1469598103934665603;
        let parts = [
            Some(q.query.as_str()),
            q.language.as_deref(),
            q.country.as_deref(),
        ];
        for part in parts.into_iter().flatten() {
            for b in part.as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(1099511628211);
            }
        }
        h
    }

    fn pick_endpoint_index(&self, q: &SearchQuery) -> usize {
        (Self::stable_hash64(q) as usize) % self.endpoints.len().max(1)
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SearxngSearchProvider {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let base = self
            .endpoints
            .get(self.pick_endpoint_index(q))
            .map(String::as_str)
            .unwrap_or("");
        let mut req = self
            .client
            .get(Self::endpoint_search_for(base))
            .query(&[("q", q.query.as_str()), ("format", "json")]);
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("language", lang)]);
        }
        let resp = req
            .timeout(timeout_from_query(q))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("searxng search HTTP {status}")));
        }
        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let results = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| {
                Some(SearchResult {
                    url: r.url?,
                    title: r.title,
                    snippet: r.content,
                    source: "searxng".to_string(),
                })
            })
            .take(limit_from_query(q))
            .collect();
        Ok(response("searxng", results, t0))
    }
}

#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearchProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            endpoint: "https://api.search.brave.com/res/v1/web/search".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for BraveSearchProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let mut req = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())])
            .query(&[("count", limit_from_query(q).to_string())]);
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("search_lang", lang)]);
        }
        if let Some(country) = q.country.as_deref() {
            req = req.query(&[("country", country)]);
        }
        let resp = req
            .timeout(timeout_from_query(q))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }
        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let results = parsed
            .web
            .and_then(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.description,
                source: "brave".to_string(),
            })
            .collect();
        Ok(response("brave", results, t0))
    }
}

#[derive(Debug, Clone)]
pub struct TavilySearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl TavilySearchProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            endpoint: "https://api.tavily.com/search".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let body = serde_json::json!({
            "query": q.query,
            "max_results": limit_from_query(q),
            "include_answer": false,
            "include_raw_content": false,
            "search_depth": "basic",
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&body)
            .timeout(timeout_from_query(q))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("tavily search HTTP {status}")));
        }
        let parsed: TavilySearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let results = parsed
            .results
            .into_iter()
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.content,
                source: "tavily".to_string(),
            })
            .collect();
        Ok(response("tavily", results, t0))
    }
}

/// Build one configured secondary engine. Engines missing credentials are `NotConfigured`.
pub fn secondary_provider(
    engine: SecondaryEngine,
    cfg: &Config,
    client: reqwest::Client,
) -> Result<Arc<dyn SearchProvider>> {
    Ok(match engine {
        SecondaryEngine::DuckDuckGo => Arc::new(DuckDuckGoHtmlProvider::new(client)),
        SecondaryEngine::Mojeek => Arc::new(MojeekProvider::new(client)),
        SecondaryEngine::Searxng => Arc::new(SearxngSearchProvider::new(
            client,
            cfg.searxng_endpoints.clone(),
        )?),
        SecondaryEngine::Brave => {
            let key = cfg.brave_api_key.clone().ok_or_else(|| {
                Error::NotConfigured("missing DEEPSURF_BRAVE_API_KEY".to_string())
            })?;
            Arc::new(BraveSearchProvider::new(client, key))
        }
        SecondaryEngine::Tavily => {
            let key = cfg.tavily_api_key.clone().ok_or_else(|| {
                Error::NotConfigured("missing DEEPSURF_TAVILY_API_KEY".to_string())
            })?;
            Arc::new(TavilySearchProvider::new(client, key))
        }
    })
}
