//! Primary-then-secondaries search cascade.

use crate::retry::{retry, with_timeout};
use deepsurf_core::{Error, RetryPolicy, SearchProvider, SearchQuery};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

struct Engine {
    provider: Arc<dyn SearchProvider>,
    policy: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Results { count: usize },
    Empty,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineAttempt {
    pub engine: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeTrace {
    pub urls: Vec<String>,
    /// Engine that produced `urls`, if any did.
    pub engine: Option<String>,
    pub attempts: Vec<EngineAttempt>,
}

/// Tries engines in a fixed order until one returns at least one URL.
///
/// No engine result is ever an error for the caller: when every engine fails or comes back empty
/// the cascade returns an empty list.
pub struct FallbackSearchService {
    engines: Vec<Engine>,
    max_results: usize,
    timeout_ms: u64,
}

impl FallbackSearchService {
    pub fn new(max_results: usize, timeout_ms: u64) -> Self {
        Self {
            engines: Vec::new(),
            max_results: max_results.max(1),
            timeout_ms,
        }
    }

    /// The primary engine runs once per search; the pool behind it has its own recovery.
    pub fn with_primary(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.engines.insert(
            0,
            Engine {
                provider,
                policy: RetryPolicy::once(),
            },
        );
        self
    }

    pub fn with_secondary(mut self, provider: Arc<dyn SearchProvider>, policy: RetryPolicy) -> Self {
        self.engines.push(Engine { provider, policy });
        self
    }

    pub fn engine_names(&self) -> Vec<&'static str> {
        self.engines.iter().map(|e| e.provider.name()).collect()
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub async fn search(&self, query: &str) -> Vec<String> {
        self.search_with_trace(query, &CancellationToken::new())
            .await
            .urls
    }

    pub async fn search_with_trace(&self, query: &str, cancel: &CancellationToken) -> CascadeTrace {
        let mut trace = CascadeTrace::default();
        let q = SearchQuery {
            timeout_ms: Some(self.timeout_ms),
            ..SearchQuery::new(query, self.max_results)
        };

        for engine in &self.engines {
            if cancel.is_cancelled() {
                tracing::debug!(query, "cascade cancelled");
                break;
            }
            let name = engine.provider.name();
            let provider = &engine.provider;
            let q = &q;
            let timeout_ms = self.timeout_ms;
            let t0 = Instant::now();
            let r = retry(&engine.policy, cancel, name, move |_| {
                with_timeout(timeout_ms, name, provider.search(q))
            })
            .await;
            let elapsed_ms = t0.elapsed().as_millis();

            let outcome = match r {
                Ok(resp) => {
                    let mut urls = resp.urls();
                    urls.truncate(self.max_results);
                    if urls.is_empty() {
                        tracing::info!(engine = name, query, "engine returned nothing; falling back");
                        AttemptOutcome::Empty
                    } else {
                        tracing::info!(engine = name, query, results = urls.len(), "engine answered");
                        trace.attempts.push(EngineAttempt {
                            engine: name.to_string(),
                            outcome: AttemptOutcome::Results { count: urls.len() },
                            elapsed_ms,
                        });
                        trace.urls = urls;
                        trace.engine = Some(name.to_string());
                        return trace;
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    tracing::warn!(engine = name, query, error = %e, "engine failed; falling back");
                    AttemptOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            trace.attempts.push(EngineAttempt {
                engine: name.to_string(),
                outcome,
                elapsed_ms,
            });
        }

        tracing::info!(query, "no engine returned results");
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepsurf_core::{Result, SearchResponse, SearchResult};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Urls(Vec<&'static str>),
        Fail,
        FailThen(usize, Vec<&'static str>),
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn response(name: &str, urls: &[&str]) -> SearchResponse {
        SearchResponse {
            results: urls
                .iter()
                .map(|u| SearchResult {
                    url: u.to_string(),
                    title: None,
                    snippet: None,
                    source: name.to_string(),
                })
                .collect(),
            provider: name.to_string(),
            timings_ms: BTreeMap::new(),
        }
    }

    #[async_trait::async_trait]
    impl SearchProvider for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, _q: &SearchQuery) -> Result<SearchResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Urls(u) => Ok(response(self.name, u)),
                Behaviour::Fail => Err(Error::Search(format!("{} is down", self.name))),
                Behaviour::FailThen(k, u) if n >= *k => Ok(response(self.name, u)),
                Behaviour::FailThen(..) => Err(Error::Search("flaky".into())),
            }
        }
    }

    fn quick(n: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: n,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn first_non_empty_engine_wins_and_later_ones_are_skipped() {
        let primary = Scripted::new("browser", Behaviour::Urls(vec![]));
        let s1 = Scripted::new("s1", Behaviour::Urls(vec!["https://a"]));
        let s2 = Scripted::new("s2", Behaviour::Urls(vec!["https://b"]));
        let s3 = Scripted::new("s3", Behaviour::Urls(vec!["https://c"]));
        let svc = FallbackSearchService::new(5, 1_000)
            .with_primary(primary.clone())
            .with_secondary(s1.clone(), quick(2))
            .with_secondary(s2.clone(), quick(2))
            .with_secondary(s3.clone(), quick(2));

        assert_eq!(svc.search("q").await, vec!["https://a"]);
        assert_eq!(primary.calls(), 1);
        assert_eq!(s1.calls(), 1);
        assert_eq!(s2.calls(), 0);
        assert_eq!(s3.calls(), 0);
    }

    #[tokio::test]
    async fn all_engines_failing_is_an_empty_answer() {
        let svc = FallbackSearchService::new(5, 1_000)
            .with_primary(Scripted::new("browser", Behaviour::Fail))
            .with_secondary(Scripted::new("s1", Behaviour::Urls(vec![])), quick(1))
            .with_secondary(Scripted::new("s2", Behaviour::Fail), quick(2))
            .with_secondary(Scripted::new("s3", Behaviour::Urls(vec![])), quick(1));
        let trace = svc.search_with_trace("q", &CancellationToken::new()).await;
        assert!(trace.urls.is_empty());
        assert!(trace.engine.is_none());
        let names: Vec<_> = trace.attempts.iter().map(|a| a.engine.as_str()).collect();
        assert_eq!(names, vec!["browser", "s1", "s2", "s3"]);
        assert!(matches!(trace.attempts[2].outcome, AttemptOutcome::Failed { .. }));
        assert_eq!(trace.attempts[1].outcome, AttemptOutcome::Empty);
    }

    #[tokio::test]
    async fn primary_is_tried_once_but_secondaries_retry() {
        let primary = Scripted::new("browser", Behaviour::Fail);
        let s1 = Scripted::new("s1", Behaviour::FailThen(1, vec!["https://x", "https://y"]));
        let svc = FallbackSearchService::new(1, 1_000)
            .with_primary(primary.clone())
            .with_secondary(s1.clone(), quick(3));
        let trace = svc.search_with_trace("q", &CancellationToken::new()).await;
        assert_eq!(trace.urls, vec!["https://x"]);
        assert_eq!(trace.engine.as_deref(), Some("s1"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(s1.calls(), 2);
    }

    #[tokio::test]
    async fn empty_results_are_not_retried() {
        let s1 = Scripted::new("s1", Behaviour::Urls(vec![]));
        let svc = FallbackSearchService::new(5, 1_000).with_secondary(s1.clone(), quick(3));
        assert!(svc.search("q").await.is_empty());
        assert_eq!(s1.calls(), 1);
    }

    #[tokio::test]
    async fn order_is_fixed_across_calls() {
        let s1 = Scripted::new("s1", Behaviour::Fail);
        let s2 = Scripted::new("s2", Behaviour::Urls(vec!["https://b"]));
        let svc = FallbackSearchService::new(5, 1_000)
            .with_secondary(s1.clone(), quick(1))
            .with_secondary(s2.clone(), quick(1));
        for _ in 0..3 {
            assert_eq!(svc.search("q").await, vec!["https://b"]);
        }
        // The failing engine is still asked first every time.
        assert_eq!(s1.calls(), 3);
        assert_eq!(svc.engine_names(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn cancelled_cascade_stops_without_calling_engines() {
        let s1 = Scripted::new("s1", Behaviour::Urls(vec!["https://a"]));
        let svc = FallbackSearchService::new(5, 1_000).with_secondary(s1.clone(), quick(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let trace = svc.search_with_trace("q", &cancel).await;
        assert!(trace.urls.is_empty());
        assert_eq!(s1.calls(), 0);
    }
}
