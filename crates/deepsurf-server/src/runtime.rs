//! Process-wide services built once from [`Config`] and shared by every request.

use crate::research::{ResearchOrchestrator, ToolBox};
use deepsurf_core::{Error, ImageSearchProvider, Result};
use deepsurf_local::extract::{ExtractorConfig, LocalExtractor};
use deepsurf_local::openai_compat::OpenAiCompatClient;
use deepsurf_local::playwright::PlaywrightLauncher;
use deepsurf_local::pool::{PoolImageSearch, PoolSearchProvider};
use deepsurf_local::search::secondary_provider;
use deepsurf_local::youtube::YtDlpTranscripts;
use deepsurf_local::{AgentPool, Config, FallbackSearchService, PoolConfig, PoolStatus, PortAllocator};
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    config: Config,
    pool: Option<Arc<AgentPool>>,
    search: Arc<FallbackSearchService>,
    images: Option<Arc<dyn ImageSearchProvider>>,
    orchestrator: Option<Arc<ResearchOrchestrator>>,
}

fn http_client(cfg: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("deepsurf/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_millis(cfg.search_timeout_ms.max(cfg.llm_timeout_ms)))
        .build()
        .map_err(|e| Error::NotConfigured(format!("http client: {e}")))
}

impl Runtime {
    pub fn build(config: Config) -> Result<Self> {
        let client = http_client(&config)?;

        let mut search = FallbackSearchService::new(config.max_results, config.search_timeout_ms);
        let mut pool = None;
        let mut images: Option<Arc<dyn ImageSearchProvider>> = None;
        if config.primary_enabled {
            let ports = Arc::new(PortAllocator::new(config.port_start, config.port_end)?);
            let launcher = Arc::new(PlaywrightLauncher::from_config(&config));
            let p = Arc::new(AgentPool::new(PoolConfig::from(&config), ports, launcher));
            search = search.with_primary(Arc::new(PoolSearchProvider::new(
                p.clone(),
                config.max_results,
            )));
            images = Some(Arc::new(PoolImageSearch::new(p.clone())));
            pool = Some(p);
        }
        for engine in config.runnable_secondaries() {
            let provider = secondary_provider(engine, &config, client.clone())?;
            search = search.with_secondary(provider, config.search_policy());
        }
        tracing::info!(engines = ?search.engine_names(), "search cascade ready");
        let search = Arc::new(search);

        let extractor = Arc::new(LocalExtractor::new(ExtractorConfig {
            timeout_ms: config.fetch_timeout_ms,
            ..ExtractorConfig::default()
        })?);
        let transcripts = Arc::new(YtDlpTranscripts::new(
            Duration::from_millis(config.tool_timeout_ms),
            config.youtube_max_chars,
            config.youtube_langs.clone(),
        ));
        let planner = if config.llm_configured() {
            Some(Arc::new(OpenAiCompatClient::from_config(client, &config)?))
        } else {
            None
        };

        let mut tools = ToolBox::new(search.clone(), extractor, transcripts)
            .with_fetch_concurrency(config.fetch_concurrency)
            .with_timeout_ms(config.tool_timeout_ms);
        if let Some(i) = &images {
            tools = tools.with_images(i.clone());
        }
        if let Some(p) = &planner {
            tools = tools.with_vision(p.clone());
        }

        let orchestrator = match planner {
            Some(p) => Some(Arc::new(
                ResearchOrchestrator::new(p, Arc::new(tools))
                    .with_max_iterations(config.max_iterations),
            )),
            None => {
                tracing::warn!("no planning service configured; research is disabled");
                None
            }
        };

        Ok(Self {
            config,
            pool,
            search,
            images,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn search(&self) -> &Arc<FallbackSearchService> {
        &self.search
    }

    pub fn images(&self) -> Result<&Arc<dyn ImageSearchProvider>> {
        self.images
            .as_ref()
            .ok_or_else(|| Error::NotConfigured("image search needs DEEPSURF_PRIMARY=playwright".to_string()))
    }

    pub fn orchestrator(&self) -> Result<&Arc<ResearchOrchestrator>> {
        self.orchestrator.as_ref().ok_or_else(|| {
            Error::NotConfigured(
                "research needs DEEPSURF_OPENAI_COMPAT_BASE_URL and DEEPSURF_OPENAI_COMPAT_MODEL"
                    .to_string(),
            )
        })
    }

    pub async fn pool_status(&self) -> Option<PoolStatus> {
        match &self.pool {
            Some(p) => Some(p.status().await),
            None => None,
        }
    }

    /// Close every pooled worker and release its port.
    pub async fn shutdown(&self) {
        if let Some(p) = &self.pool {
            p.shutdown().await;
        }
    }
}
