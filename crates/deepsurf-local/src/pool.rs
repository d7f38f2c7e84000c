//! Bounded pool of search workers, one slot list per modality.

use crate::ports::{PortAllocator, PortReservation};
use crate::session::SessionLauncher;
use crate::worker::SearchWorker;
use deepsurf_core::{
    Error, ImageHits, ImageSearchProvider, Modality, Result, SearchProvider, SearchQuery,
    SearchResponse, SearchResult,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub text_agents: usize,
    pub image_agents: usize,
    /// A slot whose worker has done this many units is recycled on its next acquire.
    pub recycle_threshold: u64,
    pub call_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            text_agents: 2,
            image_agents: 1,
            recycle_threshold: 20,
            call_timeout_ms: 20_000,
        }
    }
}

impl From<&crate::config::Config> for PoolConfig {
    fn from(c: &crate::config::Config) -> Self {
        Self {
            text_agents: c.text_agents,
            image_agents: c.image_agents,
            recycle_threshold: c.recycle_threshold,
            call_timeout_ms: c.search_timeout_ms,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    port: Option<u16>,
    worker: Option<Arc<SearchWorker>>,
    work_units: u64,
    /// Bumped every time the slot gets a new worker.
    generation: u64,
}

#[derive(Debug, Default)]
struct ModalityState {
    initialized: bool,
    slots: Vec<Slot>,
}

/// A checked-out slot. The worker stays shared: other callers may pick the same slot while this
/// lease is in use.
#[derive(Debug, Clone)]
pub struct Lease {
    pub modality: Modality,
    pub index: usize,
    pub generation: u64,
    pub worker: Arc<SearchWorker>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModalityStatus {
    pub initialized: bool,
    pub count: usize,
    pub work_units: Vec<u64>,
    pub ports: Vec<Option<u16>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub port_range: (u16, u16),
    pub ports_in_use: usize,
    pub recycle_threshold: u64,
    pub modalities: BTreeMap<Modality, ModalityStatus>,
}

pub struct AgentPool {
    config: PoolConfig,
    ports: Arc<PortAllocator>,
    launcher: Arc<dyn SessionLauncher>,
    text: Mutex<ModalityState>,
    image: Mutex<ModalityState>,
    closed: AtomicBool,
}

impl AgentPool {
    pub fn new(
        config: PoolConfig,
        ports: Arc<PortAllocator>,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Self {
        Self {
            config,
            ports,
            launcher,
            text: Mutex::new(ModalityState::default()),
            image: Mutex::new(ModalityState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn state(&self, m: Modality) -> &Mutex<ModalityState> {
        match m {
            Modality::Text => &self.text,
            Modality::Image => &self.image,
        }
    }

    fn slot_count(&self, m: Modality) -> usize {
        match m {
            Modality::Text => self.config.text_agents,
            Modality::Image => self.config.image_agents,
        }
    }

    /// Pick the least-used slot, recycling or starting its worker first when needed.
    ///
    /// Serialized per modality: text and image acquires never wait on each other.
    pub async fn acquire(&self, modality: Modality) -> Result<Lease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Session("agent pool is shut down".to_string()));
        }
        let mut st = self.state(modality).lock().await;
        if !st.initialized {
            let n = self.slot_count(modality);
            st.slots = (0..n).map(|_| Slot::default()).collect();
            st.initialized = true;
            tracing::info!(%modality, slots = n, "agent slots initialized");
        }

        let Some(index) = st
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.work_units)
            .map(|(i, _)| i)
        else {
            return Err(Error::NotConfigured(format!("no {modality} agents configured")));
        };
        let slot = &mut st.slots[index];

        let mut reserved: Option<PortReservation> = None;
        if slot.worker.is_some() && slot.work_units >= self.config.recycle_threshold {
            // Reserve the replacement port while the old one is still held, so the new worker
            // cannot land on the port it replaces. The slot is emptied before any await: an
            // abandoned acquire leaves a clean slot and drops the reservation.
            reserved = self.ports.reserve().ok();
            let old = slot.worker.take();
            let old_port = slot.port.take();
            tracing::info!(
                %modality,
                slot = index,
                port = old_port,
                work_units = slot.work_units,
                "recycling worker"
            );
            slot.work_units = 0;
            slot.generation += 1;
            if let Some(old) = old {
                // Close errors are logged by the worker and otherwise ignored.
                let _ = old.close().await;
            }
        }

        if slot.worker.is_none() {
            let started = match reserved {
                Some(r) => {
                    SearchWorker::start_with_port(
                        self.launcher.as_ref(),
                        r,
                        modality,
                        self.config.call_timeout_ms,
                    )
                    .await
                }
                None => {
                    SearchWorker::start(
                        self.launcher.as_ref(),
                        self.ports.clone(),
                        modality,
                        self.config.call_timeout_ms,
                    )
                    .await
                }
            };
            let worker = started?;
            slot.port = Some(worker.port());
            slot.worker = Some(Arc::new(worker));
            slot.work_units = 0;
            slot.generation += 1;
        }

        let worker = slot
            .worker
            .clone()
            .ok_or_else(|| Error::Session("slot has no worker".to_string()))?;
        Ok(Lease {
            modality,
            index,
            generation: slot.generation,
            worker,
        })
    }

    /// Count one completed unit of work against the lease's slot.
    ///
    /// Ignored when the slot has been recycled since the lease was taken.
    pub async fn record_use(&self, lease: &Lease) {
        let mut st = self.state(lease.modality).lock().await;
        match st.slots.get_mut(lease.index) {
            Some(slot) if slot.generation == lease.generation => slot.work_units += 1,
            _ => tracing::debug!(
                modality = %lease.modality,
                slot = lease.index,
                "stale lease; use not recorded"
            ),
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let mut modalities = BTreeMap::new();
        for m in Modality::ALL {
            let st = self.state(m).lock().await;
            modalities.insert(
                m,
                ModalityStatus {
                    initialized: st.initialized,
                    count: st.slots.len(),
                    work_units: st.slots.iter().map(|s| s.work_units).collect(),
                    ports: st.slots.iter().map(|s| s.port).collect(),
                },
            );
        }
        PoolStatus {
            port_range: self.ports.range(),
            ports_in_use: self.ports.in_use(),
            recycle_threshold: self.config.recycle_threshold,
            modalities,
        }
    }

    /// Close every worker and refuse further acquires.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for m in Modality::ALL {
            let mut st = self.state(m).lock().await;
            for slot in st.slots.iter_mut() {
                if let Some(w) = slot.worker.take() {
                    let _ = w.close().await;
                }
                slot.port = None;
            }
            st.slots.clear();
            st.initialized = false;
        }
        tracing::info!("agent pool shut down");
    }

    pub async fn search_text(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let lease = self.acquire(Modality::Text).await?;
        let out = lease.worker.search_text(query, limit).await.into_result()?;
        self.record_use(&lease).await;
        Ok(out)
    }

    pub async fn search_images(&self, query: &str, limit: usize) -> Result<ImageHits> {
        let lease = self.acquire(Modality::Image).await?;
        let out = lease.worker.search_images(query, limit).await.into_result()?;
        self.record_use(&lease).await;
        Ok(out)
    }
}

/// The pool as the primary engine of a search cascade.
pub struct PoolSearchProvider {
    pool: Arc<AgentPool>,
    default_limit: usize,
}

impl PoolSearchProvider {
    pub fn new(pool: Arc<AgentPool>, default_limit: usize) -> Self {
        Self {
            pool,
            default_limit,
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for PoolSearchProvider {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let limit = q.max_results.unwrap_or(self.default_limit);
        let urls = self.pool.search_text(&q.query, limit).await?;
        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());
        Ok(SearchResponse {
            results: urls
                .into_iter()
                .map(|url| SearchResult {
                    url,
                    title: None,
                    snippet: None,
                    source: "browser".to_string(),
                })
                .collect(),
            provider: "browser".to_string(),
            timings_ms,
        })
    }
}

pub struct PoolImageSearch {
    pool: Arc<AgentPool>,
}

impl PoolImageSearch {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ImageSearchProvider for PoolImageSearch {
    async fn search_images(&self, query: &str, max_images: usize) -> Result<ImageHits> {
        self.pool.search_images(query, max_images).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FakeLauncher, Script};
    use crate::session::{BrowserSession, ImageLink};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Launches once, then refuses.
    struct FlakyLauncher {
        inner: FakeLauncher,
        launches: AtomicU64,
    }

    #[async_trait::async_trait]
    impl SessionLauncher for FlakyLauncher {
        async fn launch(&self, port: u16, modality: Modality) -> Result<Arc<dyn BrowserSession>> {
            if self.launches.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::Session(format!("cannot relaunch on {port}")));
            }
            self.inner.launch(port, modality).await
        }
    }

    fn pool_with(
        text: usize,
        image: usize,
        threshold: u64,
        script: Script,
    ) -> (Arc<AgentPool>, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(script));
        let ports = Arc::new(PortAllocator::with_seed(9200, 9263, 11).unwrap());
        let pool = AgentPool::new(
            PoolConfig {
                text_agents: text,
                image_agents: image,
                recycle_threshold: threshold,
                call_timeout_ms: 1_000,
            },
            ports,
            launcher.clone(),
        );
        (Arc::new(pool), launcher)
    }

    fn links() -> Script {
        Script {
            links: vec!["https://a.example".into()],
            images: vec![ImageLink {
                source: "https://s.example".into(),
                image: "https://s.example/1.png".into(),
            }],
            ..Script::default()
        }
    }

    #[tokio::test]
    async fn slots_are_created_lazily() {
        let (pool, launcher) = pool_with(2, 1, 20, links());
        let st = pool.status().await;
        assert!(!st.modalities[&Modality::Text].initialized);
        assert!(launcher.journal.launched().is_empty());

        pool.acquire(Modality::Text).await.unwrap();
        let st = pool.status().await;
        assert_eq!(st.modalities[&Modality::Text].count, 2);
        assert!(!st.modalities[&Modality::Image].initialized);
        assert_eq!(launcher.journal.launched().len(), 1);
    }

    #[tokio::test]
    async fn least_loaded_slot_is_picked() {
        let (pool, _launcher) = pool_with(2, 0, 20, links());
        let a = pool.acquire(Modality::Text).await.unwrap();
        assert_eq!(a.index, 0);
        pool.record_use(&a).await;
        let b = pool.acquire(Modality::Text).await.unwrap();
        assert_eq!(b.index, 1);
        pool.record_use(&b).await;
        pool.record_use(&b).await;
        let c = pool.acquire(Modality::Text).await.unwrap();
        assert_eq!(c.index, 0);
        assert_eq!(pool.status().await.modalities[&Modality::Text].work_units, vec![1, 2]);
    }

    #[tokio::test]
    async fn recycle_after_threshold_yields_a_new_port() {
        let (pool, launcher) = pool_with(1, 0, 2, links());

        let first = pool.acquire(Modality::Text).await.unwrap();
        let p1 = first.worker.port();
        assert_eq!(pool.search_text("q1", 5).await.unwrap(), vec!["https://a.example"]);
        let second = pool.acquire(Modality::Text).await.unwrap();
        assert_eq!(second.worker.port(), p1);
        pool.search_text("q2", 5).await.unwrap();
        assert_eq!(pool.status().await.modalities[&Modality::Text].work_units, vec![2]);

        pool.search_text("q3", 5).await.unwrap();
        let launched = launcher.journal.launched();
        assert_eq!(launched.len(), 2);
        assert_ne!(launched[1], p1);
        assert_eq!(launcher.journal.shut_down(), vec![p1]);
        assert!(!pool.ports().is_held(p1));
        // q3 ran on the fresh worker.
        assert_eq!(pool.status().await.modalities[&Modality::Text].work_units, vec![1]);
    }

    #[tokio::test]
    async fn stale_lease_does_not_count_against_new_worker() {
        let (pool, _launcher) = pool_with(1, 0, 1, links());
        let old = pool.acquire(Modality::Text).await.unwrap();
        pool.record_use(&old).await;
        let fresh = pool.acquire(Modality::Text).await.unwrap();
        assert_ne!(fresh.generation, old.generation);
        pool.record_use(&old).await;
        assert_eq!(pool.status().await.modalities[&Modality::Text].work_units, vec![0]);
    }

    #[tokio::test]
    async fn abandoned_recycle_leaks_no_port_and_leaves_a_clean_slot() {
        let (pool, launcher) = pool_with(
            1,
            0,
            1,
            Script {
                shutdown_delay: Some(Duration::from_secs(10)),
                ..links()
            },
        );
        pool.search_text("a", 1).await.unwrap();
        assert_eq!(pool.ports().in_use(), 1);

        let second = tokio::time::timeout(Duration::from_millis(50), pool.search_text("b", 1)).await;
        assert!(second.is_err());
        assert_eq!(pool.ports().in_use(), 0);
        let st = pool.status().await.modalities[&Modality::Text].clone();
        assert_eq!(st.work_units, vec![0]);
        assert_eq!(st.ports, vec![None]);

        // The next acquire starts a fresh worker in the emptied slot.
        let lease = pool.acquire(Modality::Text).await.unwrap();
        assert_eq!(launcher.journal.launched().len(), 2);
        assert_eq!(pool.ports().in_use(), 1);
        assert_eq!(pool.status().await.modalities[&Modality::Text].ports, vec![Some(lease.worker.port())]);
    }

    #[tokio::test]
    async fn leases_on_a_recycled_worker_stop_counting_even_if_restart_fails() {
        let launcher = Arc::new(FlakyLauncher {
            inner: FakeLauncher::new(links()),
            launches: AtomicU64::new(0),
        });
        let pool = AgentPool::new(
            PoolConfig {
                text_agents: 1,
                image_agents: 0,
                recycle_threshold: 1,
                call_timeout_ms: 1_000,
            },
            Arc::new(PortAllocator::with_seed(9500, 9509, 5).unwrap()),
            launcher,
        );
        let old = pool.acquire(Modality::Text).await.unwrap();
        pool.record_use(&old).await;
        assert!(pool.acquire(Modality::Text).await.is_err());
        pool.record_use(&old).await;
        let st = pool.status().await.modalities[&Modality::Text].clone();
        assert_eq!(st.work_units, vec![0]);
        assert_eq!(st.ports, vec![None]);
        assert_eq!(pool.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn failed_work_is_not_recorded() {
        let (pool, _launcher) = pool_with(
            1,
            0,
            20,
            Script {
                fail_search: true,
                ..Script::default()
            },
        );
        assert!(pool.search_text("q", 5).await.is_err());
        assert_eq!(pool.status().await.modalities[&Modality::Text].work_units, vec![0]);
    }

    #[tokio::test]
    async fn launch_failure_surfaces_to_acquire_only() {
        let (pool, _launcher) = pool_with(
            1,
            1,
            20,
            Script {
                fail_launch: true,
                ..Script::default()
            },
        );
        assert!(matches!(
            pool.acquire(Modality::Text).await,
            Err(Error::Session(_))
        ));
        assert_eq!(pool.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn exhausted_port_range_fails_the_acquire() {
        let launcher = Arc::new(FakeLauncher::new(links()));
        let ports = Arc::new(PortAllocator::with_seed(9300, 9300, 1).unwrap());
        let pool = AgentPool::new(
            PoolConfig {
                text_agents: 1,
                image_agents: 1,
                recycle_threshold: 20,
                call_timeout_ms: 1_000,
            },
            ports,
            launcher,
        );
        pool.acquire(Modality::Text).await.unwrap();
        assert!(matches!(
            pool.acquire(Modality::Image).await,
            Err(Error::Exhausted(_))
        ));
        // Text keeps working.
        assert!(pool.acquire(Modality::Text).await.is_ok());
    }

    #[tokio::test]
    async fn recycle_with_a_full_range_reuses_the_freed_port() {
        let launcher = Arc::new(FakeLauncher::new(links()));
        let ports = Arc::new(PortAllocator::with_seed(9400, 9400, 1).unwrap());
        let pool = AgentPool::new(
            PoolConfig {
                text_agents: 1,
                image_agents: 0,
                recycle_threshold: 1,
                call_timeout_ms: 1_000,
            },
            ports,
            launcher.clone(),
        );
        pool.search_text("a", 1).await.unwrap();
        pool.search_text("b", 1).await.unwrap();
        assert_eq!(launcher.journal.launched(), vec![9400, 9400]);
    }

    #[tokio::test]
    async fn image_searches_use_their_own_slots() {
        let (pool, _launcher) = pool_with(1, 1, 20, links());
        let hits = pool.search_images("cats", 4).await.unwrap();
        assert_eq!(hits["https://s.example"], vec!["https://s.example/1.png"]);
        let st = pool.status().await;
        assert_eq!(st.modalities[&Modality::Image].work_units, vec![1]);
        assert!(!st.modalities[&Modality::Text].initialized);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_slots_without_extra_workers() {
        let (pool, launcher) = pool_with(2, 0, 100, links());
        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.search_text(&format!("q{i}"), 3).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert!(launcher.journal.launched().len() <= 2);
        let units: u64 = pool.status().await.modalities[&Modality::Text]
            .work_units
            .iter()
            .sum();
        assert_eq!(units, 16);
    }

    #[tokio::test]
    async fn shutdown_closes_workers_and_releases_ports() {
        let (pool, launcher) = pool_with(2, 1, 20, links());
        pool.search_text("a", 1).await.unwrap();
        pool.search_images("b", 1).await.unwrap();
        assert_eq!(pool.ports().in_use(), 2);
        pool.shutdown().await;
        assert_eq!(pool.ports().in_use(), 0);
        assert_eq!(launcher.journal.shut_down().len(), 2);
        assert!(pool.acquire(Modality::Text).await.is_err());
    }

    #[tokio::test]
    async fn pool_provider_reports_browser_results() {
        let (pool, _launcher) = pool_with(1, 0, 20, links());
        let p = PoolSearchProvider::new(pool, 5);
        let r = p.search(&SearchQuery::new("x", 5)).await.unwrap();
        assert_eq!(r.provider, "browser");
        assert_eq!(r.urls(), vec!["https://a.example"]);
    }
}
