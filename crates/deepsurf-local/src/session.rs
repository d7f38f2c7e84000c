//! Browser session seam used by search workers.

use deepsurf_core::{Modality, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type TabId = u64;

/// One image hit as the browser sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageLink {
    pub source: String,
    pub image: String,
}

/// A long-lived browser session bound to one debugging port.
///
/// Tabs are the per-call sub-contexts. `close_tab` is synchronous so it can run from `Drop`;
/// implementations queue the close and return immediately.
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    fn port(&self) -> u16;
    async fn open_tab(&self) -> Result<TabId>;
    /// Raw result links in page order. Filtering and limits are applied by the caller.
    async fn search_text(&self, tab: TabId, query: &str, limit: usize) -> Result<Vec<String>>;
    async fn search_images(&self, tab: TabId, query: &str, limit: usize) -> Result<Vec<ImageLink>>;
    fn close_tab(&self, tab: TabId);
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, port: u16, modality: Modality) -> Result<Arc<dyn BrowserSession>>;
}

/// An open tab. Dropping it closes the tab, whichever way the owning call ends.
pub struct Tab {
    id: TabId,
    session: Arc<dyn BrowserSession>,
}

impl Tab {
    pub async fn open(session: Arc<dyn BrowserSession>) -> Result<Self> {
        let id = session.open_tab().await?;
        Ok(Self { id, session })
    }

    pub fn id(&self) -> TabId {
        self.id
    }

    pub async fn search_text(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.session.search_text(self.id, query, limit).await
    }

    pub async fn search_images(&self, query: &str, limit: usize) -> Result<Vec<ImageLink>> {
        self.session.search_images(self.id, query, limit).await
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        self.session.close_tab(self.id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sessions for pool and worker tests.

    use super::*;
    use deepsurf_core::Error;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Script {
        pub links: Vec<String>,
        pub images: Vec<ImageLink>,
        pub fail_search: bool,
        pub fail_launch: bool,
        pub delay: Option<Duration>,
        pub launch_delay: Option<Duration>,
        pub shutdown_delay: Option<Duration>,
    }

    #[derive(Debug, Default)]
    pub struct Journal {
        pub launched: Mutex<Vec<u16>>,
        pub shut_down: Mutex<Vec<u16>>,
        pub open_tabs: Mutex<HashSet<(u16, TabId)>>,
        pub tabs_opened: AtomicU64,
        pub tabs_closed: AtomicU64,
    }

    impl Journal {
        pub fn launched(&self) -> Vec<u16> {
            self.launched.lock().unwrap().clone()
        }
        pub fn shut_down(&self) -> Vec<u16> {
            self.shut_down.lock().unwrap().clone()
        }
        pub fn open_tab_count(&self) -> usize {
            self.open_tabs.lock().unwrap().len()
        }
    }

    pub struct FakeSession {
        port: u16,
        script: Script,
        journal: Arc<Journal>,
        next_tab: AtomicU64,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BrowserSession for FakeSession {
        fn port(&self) -> u16 {
            self.port
        }

        async fn open_tab(&self) -> Result<TabId> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Session("session is shut down".into()));
            }
            let id = self.next_tab.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.tabs_opened.fetch_add(1, Ordering::SeqCst);
            self.journal.open_tabs.lock().unwrap().insert((self.port, id));
            Ok(id)
        }

        async fn search_text(&self, _tab: TabId, query: &str, _limit: usize) -> Result<Vec<String>> {
            if let Some(d) = self.script.delay {
                tokio::time::sleep(d).await;
            }
            if self.script.fail_search {
                return Err(Error::Session(format!("scripted failure for {query}")));
            }
            Ok(self.script.links.clone())
        }

        async fn search_images(
            &self,
            _tab: TabId,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<ImageLink>> {
            if let Some(d) = self.script.delay {
                tokio::time::sleep(d).await;
            }
            if self.script.fail_search {
                return Err(Error::Session("scripted image failure".into()));
            }
            Ok(self.script.images.clone())
        }

        fn close_tab(&self, tab: TabId) {
            self.journal.tabs_closed.fetch_add(1, Ordering::SeqCst);
            self.journal.open_tabs.lock().unwrap().remove(&(self.port, tab));
        }

        async fn shutdown(&self) -> Result<()> {
            self.down.store(true, Ordering::SeqCst);
            if let Some(d) = self.script.shutdown_delay {
                tokio::time::sleep(d).await;
            }
            self.journal.shut_down.lock().unwrap().push(self.port);
            Ok(())
        }
    }

    pub struct FakeLauncher {
        pub script: Script,
        pub journal: Arc<Journal>,
    }

    impl FakeLauncher {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                journal: Arc::new(Journal::default()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionLauncher for FakeLauncher {
        async fn launch(&self, port: u16, _modality: Modality) -> Result<Arc<dyn BrowserSession>> {
            if let Some(d) = self.script.launch_delay {
                tokio::time::sleep(d).await;
            }
            if self.script.fail_launch {
                return Err(Error::Session(format!("cannot launch on {port}")));
            }
            self.journal.launched.lock().unwrap().push(port);
            Ok(Arc::new(FakeSession {
                port,
                script: self.script.clone(),
                journal: self.journal.clone(),
                next_tab: AtomicU64::new(0),
                down: AtomicBool::new(false),
            }))
        }
    }
}
