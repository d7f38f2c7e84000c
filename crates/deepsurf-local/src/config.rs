//! Runtime configuration from `DEEPSURF_*` environment variables.
//!
//! Blank values are treated the same as unset. Parsing goes through a lookup function so tests can
//! feed a map instead of mutating the process environment.

use deepsurf_core::{Error, Result, RetryPolicy};
use serde::Serialize;
use std::str::FromStr;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The stateless HTTP engines that can follow the pool in the cascade.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryEngine {
    DuckDuckGo,
    Mojeek,
    Searxng,
    Brave,
    Tavily,
}

impl SecondaryEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecondaryEngine::DuckDuckGo => "duckduckgo",
            SecondaryEngine::Mojeek => "mojeek",
            SecondaryEngine::Searxng => "searxng",
            SecondaryEngine::Brave => "brave",
            SecondaryEngine::Tavily => "tavily",
        }
    }
}

impl FromStr for SecondaryEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckduckgo" | "ddg" => Ok(SecondaryEngine::DuckDuckGo),
            "mojeek" => Ok(SecondaryEngine::Mojeek),
            "searxng" => Ok(SecondaryEngine::Searxng),
            "brave" => Ok(SecondaryEngine::Brave),
            "tavily" => Ok(SecondaryEngine::Tavily),
            other => Err(Error::InvalidArgs(format!(
                "unknown secondary engine {other:?} (expected duckduckgo|mojeek|searxng|brave|tavily)"
            ))),
        }
    }
}

pub const DEFAULT_SECONDARY_ENGINES: [SecondaryEngine; 3] = [
    SecondaryEngine::DuckDuckGo,
    SecondaryEngine::Mojeek,
    SecondaryEngine::Searxng,
];

#[derive(Debug, Clone)]
pub struct Config {
    pub port_start: u16,
    pub port_end: u16,
    pub text_agents: usize,
    pub image_agents: usize,
    pub recycle_threshold: u64,
    pub primary_enabled: bool,
    pub secondary_engines: Vec<SecondaryEngine>,
    pub searxng_endpoints: Vec<String>,
    pub brave_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub max_results: usize,
    pub search_timeout_ms: u64,
    pub search_retries: u32,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub llm_timeout_ms: u64,
    pub llm_retries: u32,
    pub max_iterations: usize,
    pub fetch_concurrency: usize,
    pub tool_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub node_bin: String,
    pub node_path: Option<String>,
    pub headless: bool,
    pub youtube_max_chars: usize,
    pub youtube_langs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_start: 9000,
            port_end: 9999,
            text_agents: 2,
            image_agents: 1,
            recycle_threshold: 20,
            primary_enabled: true,
            secondary_engines: DEFAULT_SECONDARY_ENGINES.to_vec(),
            searxng_endpoints: Vec::new(),
            brave_api_key: None,
            tavily_api_key: None,
            max_results: 5,
            search_timeout_ms: 20_000,
            search_retries: 2,
            llm_base_url: None,
            llm_api_key: None,
            llm_model: None,
            llm_timeout_ms: 60_000,
            llm_retries: 3,
            max_iterations: 5,
            fetch_concurrency: 5,
            tool_timeout_ms: 45_000,
            fetch_timeout_ms: 20_000,
            node_bin: "node".to_string(),
            node_path: None,
            headless: true,
            youtube_max_chars: 200_000,
            youtube_langs: vec!["en".to_string(), "en-US".to_string()],
        }
    }
}

fn parse_num<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| Error::InvalidArgs(format!("{key}: expected a number, got {s:?}"))),
    }
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> Result<bool> {
    match raw.map(|s| s.to_ascii_lowercase()) {
        None => Ok(default),
        Some(s) => match s.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::InvalidArgs(format!(
                "{key}: expected a boolean, got {s:?}"
            ))),
        },
    }
}

fn split_list(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in s.split(|c: char| c == ',' || c.is_whitespace()) {
        let t = raw.trim();
        if t.is_empty() {
            continue;
        }
        let t = t.to_string();
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Parse `"9000-9999"` into an inclusive range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let bad = || Error::InvalidArgs(format!("port range must look like 9000-9999, got {s:?}"));
    let (a, b) = s.split_once('-').ok_or_else(bad)?;
    let start: u16 = a.trim().parse().map_err(|_| bad())?;
    let end: u16 = b.trim().parse().map_err(|_| bad())?;
    if start == 0 || start > end {
        return Err(bad());
    }
    Ok((start, end))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env)
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |k: &str| get(k).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let d = Self::default();

        let (port_start, port_end) = match get("DEEPSURF_PORT_RANGE") {
            Some(s) => parse_port_range(&s)?,
            None => (d.port_start, d.port_end),
        };

        let primary_enabled = match get("DEEPSURF_PRIMARY").map(|s| s.to_ascii_lowercase()) {
            None => d.primary_enabled,
            Some(s) if s == "playwright" => true,
            Some(s) if s == "off" || s == "none" => false,
            Some(s) => {
                return Err(Error::InvalidArgs(format!(
                    "DEEPSURF_PRIMARY: expected playwright|off, got {s:?}"
                )))
            }
        };

        let secondary_engines = match get("DEEPSURF_SECONDARY_ENGINES") {
            None => d.secondary_engines,
            Some(s) if s.eq_ignore_ascii_case("none") => Vec::new(),
            Some(s) => {
                let mut out = Vec::new();
                for name in split_list(&s) {
                    let e: SecondaryEngine = name.parse()?;
                    if !out.contains(&e) {
                        out.push(e);
                    }
                }
                out
            }
        };

        let mut searxng_endpoints = get("DEEPSURF_SEARXNG_ENDPOINTS")
            .map(|s| split_list(&s))
            .unwrap_or_default();
        if let Some(one) = get("DEEPSURF_SEARXNG_ENDPOINT") {
            if !searxng_endpoints.contains(&one) {
                searxng_endpoints.push(one);
            }
        }

        let youtube_langs = get("DEEPSURF_YOUTUBE_LANGS")
            .map(|s| split_list(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or(d.youtube_langs);

        let text_agents: usize = parse_num("DEEPSURF_TEXT_AGENTS", get("DEEPSURF_TEXT_AGENTS"), d.text_agents)?;
        let image_agents: usize =
            parse_num("DEEPSURF_IMAGE_AGENTS", get("DEEPSURF_IMAGE_AGENTS"), d.image_agents)?;
        let capacity = usize::from(port_end - port_start) + 1;
        if text_agents + image_agents > capacity {
            return Err(Error::InvalidArgs(format!(
                "{} agents configured but the port range only holds {capacity}",
                text_agents + image_agents
            )));
        }

        Ok(Self {
            port_start,
            port_end,
            text_agents,
            image_agents,
            recycle_threshold: parse_num(
                "DEEPSURF_RECYCLE_THRESHOLD",
                get("DEEPSURF_RECYCLE_THRESHOLD"),
                d.recycle_threshold,
            )?
            .max(1),
            primary_enabled,
            secondary_engines,
            searxng_endpoints,
            brave_api_key: get("DEEPSURF_BRAVE_API_KEY"),
            tavily_api_key: get("DEEPSURF_TAVILY_API_KEY"),
            max_results: parse_num("DEEPSURF_MAX_RESULTS", get("DEEPSURF_MAX_RESULTS"), d.max_results)?
                .clamp(1, 50),
            search_timeout_ms: parse_num(
                "DEEPSURF_SEARCH_TIMEOUT_MS",
                get("DEEPSURF_SEARCH_TIMEOUT_MS"),
                d.search_timeout_ms,
            )?
            .clamp(1_000, 120_000),
            search_retries: parse_num(
                "DEEPSURF_SEARCH_RETRIES",
                get("DEEPSURF_SEARCH_RETRIES"),
                d.search_retries,
            )?,
            llm_base_url: get("DEEPSURF_OPENAI_COMPAT_BASE_URL"),
            llm_api_key: get("DEEPSURF_OPENAI_COMPAT_API_KEY"),
            llm_model: get("DEEPSURF_OPENAI_COMPAT_MODEL"),
            llm_timeout_ms: parse_num(
                "DEEPSURF_LLM_TIMEOUT_MS",
                get("DEEPSURF_LLM_TIMEOUT_MS"),
                d.llm_timeout_ms,
            )?
            .clamp(1_000, 600_000),
            llm_retries: parse_num("DEEPSURF_LLM_RETRIES", get("DEEPSURF_LLM_RETRIES"), d.llm_retries)?,
            max_iterations: parse_num(
                "DEEPSURF_MAX_ITERATIONS",
                get("DEEPSURF_MAX_ITERATIONS"),
                d.max_iterations,
            )?
            .clamp(1, 20),
            fetch_concurrency: parse_num(
                "DEEPSURF_FETCH_CONCURRENCY",
                get("DEEPSURF_FETCH_CONCURRENCY"),
                d.fetch_concurrency,
            )?
            .clamp(1, 10),
            tool_timeout_ms: parse_num(
                "DEEPSURF_TOOL_TIMEOUT_MS",
                get("DEEPSURF_TOOL_TIMEOUT_MS"),
                d.tool_timeout_ms,
            )?
            .clamp(1_000, 600_000),
            fetch_timeout_ms: parse_num(
                "DEEPSURF_FETCH_TIMEOUT_MS",
                get("DEEPSURF_FETCH_TIMEOUT_MS"),
                d.fetch_timeout_ms,
            )?
            .clamp(1_000, 300_000),
            node_bin: get("DEEPSURF_NODE").unwrap_or(d.node_bin),
            node_path: get("DEEPSURF_NODE_PATH"),
            headless: parse_bool("DEEPSURF_HEADLESS", get("DEEPSURF_HEADLESS"), d.headless)?,
            youtube_max_chars: parse_num(
                "DEEPSURF_YOUTUBE_MAX_CHARS",
                get("DEEPSURF_YOUTUBE_MAX_CHARS"),
                d.youtube_max_chars,
            )?
            .clamp(200, 2_000_000),
            youtube_langs,
        })
    }

    pub fn search_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.search_retries,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }

    pub fn llm_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.llm_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn llm_configured(&self) -> bool {
        self.llm_base_url.is_some() && self.llm_model.is_some()
    }

    /// Names of the secondary engines that can actually run with the current credentials.
    pub fn runnable_secondaries(&self) -> Vec<SecondaryEngine> {
        self.secondary_engines
            .iter()
            .copied()
            .filter(|e| match e {
                SecondaryEngine::Searxng => !self.searxng_endpoints.is_empty(),
                SecondaryEngine::Brave => self.brave_api_key.is_some(),
                SecondaryEngine::Tavily => self.tavily_api_key.is_some(),
                SecondaryEngine::DuckDuckGo | SecondaryEngine::Mojeek => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> Result<Config> {
        let m: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| m.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let c = cfg(&[]).unwrap();
        assert_eq!((c.port_start, c.port_end), (9000, 9999));
        assert_eq!(c.recycle_threshold, 20);
        assert_eq!(c.secondary_engines, DEFAULT_SECONDARY_ENGINES.to_vec());
        assert!(c.primary_enabled);
        assert!(!c.llm_configured());
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let c = cfg(&[
            ("DEEPSURF_BRAVE_API_KEY", "   "),
            ("DEEPSURF_MAX_RESULTS", ""),
        ])
        .unwrap();
        assert!(c.brave_api_key.is_none());
        assert_eq!(c.max_results, 5);
    }

    #[test]
    fn secondary_order_is_taken_verbatim_and_deduped() {
        let c = cfg(&[("DEEPSURF_SECONDARY_ENGINES", "mojeek, brave duckduckgo,mojeek")]).unwrap();
        assert_eq!(
            c.secondary_engines,
            vec![
                SecondaryEngine::Mojeek,
                SecondaryEngine::Brave,
                SecondaryEngine::DuckDuckGo
            ]
        );
        // No brave key: skipped at build time, order otherwise kept.
        assert_eq!(
            c.runnable_secondaries(),
            vec![SecondaryEngine::Mojeek, SecondaryEngine::DuckDuckGo]
        );
    }

    #[test]
    fn unknown_engine_is_rejected() {
        assert!(cfg(&[("DEEPSURF_SECONDARY_ENGINES", "altavista")]).is_err());
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("9000-9010").unwrap(), (9000, 9010));
        assert_eq!(parse_port_range(" 10 - 10 ").unwrap(), (10, 10));
        assert!(parse_port_range("9010-9000").is_err());
        assert!(parse_port_range("9000").is_err());
        assert!(parse_port_range("0-5").is_err());
    }

    #[test]
    fn agents_must_fit_in_port_range() {
        let err = cfg(&[
            ("DEEPSURF_PORT_RANGE", "9000-9001"),
            ("DEEPSURF_TEXT_AGENTS", "2"),
            ("DEEPSURF_IMAGE_AGENTS", "1"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
    }

    #[test]
    fn fetch_concurrency_is_clamped() {
        let c = cfg(&[("DEEPSURF_FETCH_CONCURRENCY", "64")]).unwrap();
        assert_eq!(c.fetch_concurrency, 10);
        let c = cfg(&[("DEEPSURF_FETCH_CONCURRENCY", "0")]).unwrap();
        assert_eq!(c.fetch_concurrency, 1);
    }

    #[test]
    fn primary_can_be_turned_off() {
        let c = cfg(&[("DEEPSURF_PRIMARY", "off"), ("DEEPSURF_HEADLESS", "no")]).unwrap();
        assert!(!c.primary_enabled);
        assert!(!c.headless);
    }
}
