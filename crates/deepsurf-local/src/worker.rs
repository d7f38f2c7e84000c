//! One search worker: a browser session that owns one allocated port.

use crate::ports::{PortAllocator, PortReservation};
use crate::retry::with_timeout;
use crate::session::{BrowserSession, ImageLink, SessionLauncher, Tab};
use deepsurf_core::{Error, ImageHits, Modality, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Substrings of result links that never point at content.
pub const DENYLIST: &[&str] = &[
    "search.yahoo.com/preferences",
    "yahoo.com/account",
    "login.yahoo.com",
    "maps.google.",
    "support.google.",
    "accounts.google.",
    "policies.google.",
    "images.google.",
    "google.com/preferences",
    "instagram.com/reel",
    "instagram.com/p/",
    "facebook.com",
    "youtube.com/shorts",
    "youtube.com/live",
];

pub fn is_denied(url: &str) -> bool {
    let u = url.to_ascii_lowercase();
    DENYLIST.iter().any(|bad| u.contains(bad))
}

/// Keep absolute http(s) links that are not denylisted, first occurrence only, up to `limit`.
pub fn filter_links(candidates: Vec<String>, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in candidates {
        if out.len() >= limit {
            break;
        }
        let c = c.trim().to_string();
        if !(c.starts_with("http://") || c.starts_with("https://")) || is_denied(&c) {
            continue;
        }
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

/// Group image hits by source page, dropping duplicates and capping the total image count.
pub fn group_images(links: Vec<ImageLink>, limit: usize) -> ImageHits {
    let mut out = ImageHits::new();
    let mut total = 0usize;
    for l in links {
        if total >= limit {
            break;
        }
        if !l.image.starts_with("http") || !l.source.starts_with("http") || is_denied(&l.source) {
            continue;
        }
        let imgs = out.entry(l.source).or_default();
        if !imgs.contains(&l.image) {
            imgs.push(l.image);
            total += 1;
        }
    }
    out
}

/// Result of one unit of work. Failures come back as an empty value plus the error.
#[derive(Debug)]
pub struct WorkOutcome<T> {
    pub value: T,
    pub error: Option<Error>,
}

impl<T> WorkOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self.error {
            None => Ok(self.value),
            Some(e) => Err(e),
        }
    }
}

pub struct SearchWorker {
    modality: Modality,
    port: u16,
    ports: Arc<PortAllocator>,
    session: Mutex<Option<Arc<dyn BrowserSession>>>,
    tabs: AtomicU64,
    released: AtomicBool,
    call_timeout_ms: u64,
}

impl std::fmt::Debug for SearchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchWorker")
            .field("modality", &self.modality)
            .field("port", &self.port)
            .field("tabs", &self.tabs.load(Ordering::Relaxed))
            .finish()
    }
}

impl SearchWorker {
    pub async fn start(
        launcher: &dyn SessionLauncher,
        ports: Arc<PortAllocator>,
        modality: Modality,
        call_timeout_ms: u64,
    ) -> Result<Self> {
        let reservation = ports.reserve()?;
        Self::start_with_port(launcher, reservation, modality, call_timeout_ms).await
    }

    /// Start on a reserved port. The worker owns it from here on, including when the launch
    /// fails or the start is abandoned mid-launch.
    pub async fn start_with_port(
        launcher: &dyn SessionLauncher,
        reservation: PortReservation,
        modality: Modality,
        call_timeout_ms: u64,
    ) -> Result<Self> {
        let ports = reservation.allocator().clone();
        let port = reservation.into_port();
        let worker = Self {
            modality,
            port,
            ports,
            session: Mutex::new(None),
            tabs: AtomicU64::new(0),
            released: AtomicBool::new(false),
            call_timeout_ms,
        };
        match launcher.launch(port, modality).await {
            Ok(session) => {
                *worker.lock_session() = Some(session);
                tracing::info!(port, %modality, "search worker started");
                Ok(worker)
            }
            Err(e) => {
                tracing::warn!(port, %modality, error = %e, "search worker failed to start");
                let _ = worker.close().await;
                Err(e)
            }
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn BrowserSession>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Result<Arc<dyn BrowserSession>> {
        self.lock_session()
            .clone()
            .ok_or_else(|| Error::Session(format!("worker on port {} is closed", self.port)))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn tabs_opened(&self) -> u64 {
        self.tabs.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.lock_session().is_some()
    }

    async fn text_in_tab(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let tab = Tab::open(self.session()?).await?;
        let raw = tab.search_text(query, limit).await?;
        Ok(filter_links(raw, limit))
    }

    async fn images_in_tab(&self, query: &str, limit: usize) -> Result<ImageHits> {
        let tab = Tab::open(self.session()?).await?;
        let raw = tab.search_images(query, limit).await?;
        Ok(group_images(raw, limit))
    }

    pub async fn search_text(&self, query: &str, limit: usize) -> WorkOutcome<Vec<String>> {
        let tab_no = self.tabs.fetch_add(1, Ordering::Relaxed) + 1;
        let r = with_timeout(
            self.call_timeout_ms,
            "text search",
            self.text_in_tab(query, limit),
        )
        .await;
        match r {
            Ok(value) => {
                tracing::debug!(port = self.port, tab = tab_no, results = value.len(), "text search done");
                WorkOutcome { value, error: None }
            }
            Err(e) => {
                tracing::warn!(port = self.port, tab = tab_no, error = %e, "text search failed");
                WorkOutcome {
                    value: Vec::new(),
                    error: Some(e),
                }
            }
        }
    }

    pub async fn search_images(&self, query: &str, limit: usize) -> WorkOutcome<ImageHits> {
        let tab_no = self.tabs.fetch_add(1, Ordering::Relaxed) + 1;
        let r = with_timeout(
            self.call_timeout_ms,
            "image search",
            self.images_in_tab(query, limit),
        )
        .await;
        match r {
            Ok(value) => WorkOutcome { value, error: None },
            Err(e) => {
                tracing::warn!(port = self.port, tab = tab_no, error = %e, "image search failed");
                WorkOutcome {
                    value: ImageHits::new(),
                    error: Some(e),
                }
            }
        }
    }

    fn release_port(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.ports.release(self.port);
        }
    }

    /// Shut the session down and give the port back. Safe to call more than once, and after a
    /// failed start. The port is released even when shutdown fails.
    pub async fn close(&self) -> Result<()> {
        let session = self.lock_session().take();
        let r = match session {
            Some(s) => s.shutdown().await,
            None => Ok(()),
        };
        self.release_port();
        match &r {
            Ok(()) => tracing::info!(port = self.port, modality = %self.modality, "search worker closed"),
            Err(e) => tracing::warn!(port = self.port, error = %e, "search worker close failed"),
        }
        r
    }
}

impl Drop for SearchWorker {
    fn drop(&mut self) {
        self.release_port();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FakeLauncher, Script};
    use std::time::Duration;

    fn ports() -> Arc<PortAllocator> {
        Arc::new(PortAllocator::with_seed(9100, 9109, 3).unwrap())
    }

    #[test]
    fn filter_drops_denylisted_and_relative_links() {
        let got = filter_links(
            vec![
                "https://login.yahoo.com/x".into(),
                "/relative".into(),
                "https://a.example/1".into(),
                "https://www.youtube.com/shorts/abc".into(),
                "https://a.example/1".into(),
                "https://b.example/2".into(),
                "https://c.example/3".into(),
            ],
            2,
        );
        assert_eq!(got, vec!["https://a.example/1", "https://b.example/2"]);
    }

    #[test]
    fn images_group_by_source_without_duplicates() {
        let l = |s: &str, i: &str| ImageLink {
            source: s.into(),
            image: i.into(),
        };
        let hits = group_images(
            vec![
                l("https://s1", "https://i/1.jpg"),
                l("https://s1", "https://i/1.jpg"),
                l("https://s1", "https://i/2.jpg"),
                l("https://s2", "data:image/png;base64,xx"),
                l("https://s2", "https://i/3.jpg"),
            ],
            10,
        );
        assert_eq!(hits["https://s1"], vec!["https://i/1.jpg", "https://i/2.jpg"]);
        assert_eq!(hits["https://s2"], vec!["https://i/3.jpg"]);
    }

    #[tokio::test]
    async fn successful_search_closes_its_tab() {
        let launcher = FakeLauncher::new(Script {
            links: vec!["https://a.example".into(), "https://accounts.google.com/x".into()],
            ..Script::default()
        });
        let p = ports();
        let w = SearchWorker::start(&launcher, p.clone(), Modality::Text, 1_000)
            .await
            .unwrap();
        assert!(p.is_held(w.port()));

        let out = w.search_text("rust", 5).await;
        assert!(out.error.is_none());
        assert_eq!(out.value, vec!["https://a.example"]);
        assert_eq!(launcher.journal.open_tab_count(), 0);
        assert_eq!(w.tabs_opened(), 1);
    }

    #[tokio::test]
    async fn failed_search_returns_empty_plus_error_and_closes_tab() {
        let launcher = FakeLauncher::new(Script {
            fail_search: true,
            ..Script::default()
        });
        let w = SearchWorker::start(&launcher, ports(), Modality::Text, 1_000)
            .await
            .unwrap();
        let out = w.search_text("rust", 5).await;
        assert!(out.value.is_empty());
        assert!(matches!(out.error, Some(Error::Session(_))));
        assert_eq!(launcher.journal.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_search_still_closes_its_tab() {
        let launcher = FakeLauncher::new(Script {
            delay: Some(Duration::from_secs(5)),
            ..Script::default()
        });
        let w = SearchWorker::start(&launcher, ports(), Modality::Text, 20)
            .await
            .unwrap();
        let out = w.search_text("slow", 5).await;
        assert!(matches!(out.error, Some(Error::Timeout(_))));
        assert_eq!(launcher.journal.tabs_opened.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.journal.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_port_once() {
        let launcher = FakeLauncher::new(Script::default());
        let p = ports();
        let w = SearchWorker::start(&launcher, p.clone(), Modality::Image, 1_000)
            .await
            .unwrap();
        let port = w.port();
        w.close().await.unwrap();
        w.close().await.unwrap();
        assert!(!p.is_held(port));
        assert_eq!(launcher.journal.shut_down(), vec![port]);

        let out = w.search_images("cats", 3).await;
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn failed_start_gives_the_port_back() {
        let launcher = FakeLauncher::new(Script {
            fail_launch: true,
            ..Script::default()
        });
        let p = ports();
        let err = SearchWorker::start(&launcher, p.clone(), Modality::Text, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        assert_eq!(p.in_use(), 0);
    }

    #[tokio::test]
    async fn abandoned_start_releases_the_reserved_port() {
        let launcher = FakeLauncher::new(Script {
            launch_delay: Some(Duration::from_secs(10)),
            ..Script::default()
        });
        let p = ports();
        let r = p.reserve().unwrap();
        let start = SearchWorker::start_with_port(&launcher, r, Modality::Text, 1_000);
        let res = tokio::time::timeout(Duration::from_millis(20), start).await;
        assert!(res.is_err());
        assert_eq!(p.in_use(), 0);
    }

    #[tokio::test]
    async fn dropping_an_unclosed_worker_releases_its_port() {
        let launcher = FakeLauncher::new(Script::default());
        let p = ports();
        let w = SearchWorker::start(&launcher, p.clone(), Modality::Text, 1_000)
            .await
            .unwrap();
        assert_eq!(p.in_use(), 1);
        drop(w);
        assert_eq!(p.in_use(), 0);
    }
}
