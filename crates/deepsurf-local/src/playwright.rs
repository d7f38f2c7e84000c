//! Browser sessions backed by a long-lived Node.js + Playwright child process.
//!
//! One child per worker. It launches a persistent Chromium context bound to
//! `--remote-debugging-port=<port>` and answers newline-delimited JSON requests on stdin:
//! `{"id":1,"op":"search_text","tab":3,"query":"...","limit":10}`. Every reply carries the
//! request id and either `"ok":true,"result":...` or `"ok":false,"error":{code,message}`.

use crate::session::{BrowserSession, ImageLink, SessionLauncher, TabId};
use deepsurf_core::{Error, Modality, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

const SCRIPT: &str = r#"
const readline = require('readline');

function send(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }
function fail(id, code, message) { send({ id, ok: false, error: { code, message } }); }

let pw;
try { pw = require('playwright'); } catch (e) {
  fail(0, 'not_configured', 'Playwright is not installed for Node.js: npm i -g playwright && npx playwright install chromium');
  process.exit(0);
}

const cfg = JSON.parse(process.argv[2] || '{}');
const UAS = [
  'Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36',
  'Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15',
  'Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/113.0.0.0 Safari/537.36',
];

const ready = pw.chromium.launchPersistentContext(cfg.profile_dir, {
  headless: cfg.headless !== false,
  userAgent: UAS[Math.floor(Math.random() * UAS.length)],
  args: [
    `--remote-debugging-port=${cfg.port}`,
    '--disable-blink-features=AutomationControlled',
    '--no-first-run', '--disable-default-apps', '--disable-sync', '--no-sandbox',
  ],
}).then(async (ctx) => {
  await ctx.addInitScript("Object.defineProperty(navigator, 'webdriver', {get: () => undefined})");
  return ctx;
});

const tabs = new Map();
let nextTab = 0;

async function searchText(page, query, limit) {
  await page.goto('https://search.yahoo.com/search?p=' + encodeURIComponent(query), { timeout: cfg.nav_timeout_ms });
  await page.waitForSelector('h3.title a', { timeout: 15000 });
  const hrefs = await page.$$eval('h3.title a', (as) => as.map((a) => a.href));
  return hrefs.slice(0, Math.max(limit * 3, limit));
}

async function searchImages(page, query, limit) {
  await page.goto('https://images.search.yahoo.com/search/images?p=' + encodeURIComponent(query), { timeout: cfg.nav_timeout_ms });
  await page.waitForSelector('li img', { timeout: 15000 });
  return await page.$$eval('li', (items) => items.map((li) => {
    const img = li.querySelector('img');
    const a = li.querySelector('a');
    let source = '';
    try {
      const href = a ? new URL(a.href) : null;
      source = href ? (href.searchParams.get('rurl') || href.href) : '';
    } catch (_) {}
    return { source, image: img ? (img.getAttribute('data-src') || img.getAttribute('src') || '') : '' };
  }).filter((x) => x.image.startsWith('http')).slice(0, limit * 2));
}

async function handle(msg) {
  const ctx = await ready;
  switch (msg.op) {
    case 'ready': return true;
    case 'open_tab': { const id = ++nextTab; tabs.set(id, await ctx.newPage()); return id; }
    case 'close_tab': { const p = tabs.get(msg.tab); tabs.delete(msg.tab); if (p) await p.close(); return true; }
    case 'search_text': return await searchText(tabs.get(msg.tab), String(msg.query), Number(msg.limit || 10));
    case 'search_images': return await searchImages(tabs.get(msg.tab), String(msg.query), Number(msg.limit || 10));
    case 'shutdown': await ctx.close(); setTimeout(() => process.exit(0), 10); return true;
    default: throw Object.assign(new Error('unknown op ' + msg.op), { code: 'invalid_params' });
  }
}

readline.createInterface({ input: process.stdin }).on('line', (line) => {
  let msg;
  try { msg = JSON.parse(line); } catch (_) { return; }
  handle(msg).then(
    (result) => send({ id: msg.id, ok: true, result }),
    (e) => fail(msg.id, e.code || 'session_failed', String(e && e.message ? e.message : e)),
  );
});
ready.catch((e) => { fail(0, 'launch_failed', String(e && e.message ? e.message : e)); process.exit(1); });
"#;

fn node_path_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".npm-global").join("lib").join("node_modules"));
    }
    out.push(PathBuf::from("/opt/homebrew/lib/node_modules"));
    out.push(PathBuf::from("/usr/local/lib/node_modules"));
    out.push(PathBuf::from("/usr/lib/node_modules"));
    out
}

/// `NODE_PATH` to hand the child: the configured one, or a global root that has Playwright.
pub fn detect_node_path(configured: Option<&str>) -> Option<String> {
    if let Some(p) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        return Some(p.to_string());
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if existing
        .split(':')
        .any(|p| !p.trim().is_empty() && PathBuf::from(p.trim()).join("playwright").is_dir())
    {
        return None;
    }
    let found = node_path_candidates()
        .into_iter()
        .find(|root| root.join("playwright").is_dir())?;
    let found = found.to_string_lossy().to_string();
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

pub fn profile_dir_for(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("deepsurf-profile-{port}"))
}

fn error_from_reply(v: &serde_json::Value) -> Error {
    let code = v.pointer("/error/code").and_then(|x| x.as_str()).unwrap_or("");
    let message = v
        .pointer("/error/message")
        .and_then(|x| x.as_str())
        .unwrap_or("browser session failed")
        .to_string();
    match code {
        "not_configured" => Error::NotConfigured(message),
        "invalid_params" => Error::InvalidArgs(message),
        _ => Error::Session(message),
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

fn lock_pending(p: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>> {
    p.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    pub node_bin: String,
    pub node_path: Option<String>,
    pub headless: bool,
    pub nav_timeout_ms: u64,
    pub launch_timeout_ms: u64,
}

impl PlaywrightLauncher {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            node_bin: cfg.node_bin.clone(),
            node_path: cfg.node_path.clone(),
            headless: cfg.headless,
            nav_timeout_ms: cfg.search_timeout_ms,
            launch_timeout_ms: 30_000,
        }
    }
}

#[async_trait::async_trait]
impl SessionLauncher for PlaywrightLauncher {
    async fn launch(&self, port: u16, modality: Modality) -> Result<Arc<dyn BrowserSession>> {
        let profile_dir = profile_dir_for(port);
        let args = serde_json::json!({
            "port": port,
            "profile_dir": profile_dir.to_string_lossy(),
            "headless": self.headless,
            "nav_timeout_ms": self.nav_timeout_ms,
        })
        .to_string();

        let mut cmd = tokio::process::Command::new(&self.node_bin);
        if let Some(np) = detect_node_path(self.node_path.as_deref()) {
            cmd.env("NODE_PATH", np);
        }
        let mut child = cmd
            .arg("-e")
            .arg(SCRIPT)
            .arg(args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "browser sessions need Node.js (`{}`) and the Playwright npm package: {e}",
                    self.node_bin
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Session("missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Session("missing stdout pipe".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (launch_err_tx, launch_err_rx) = oneshot::channel::<Error>();
        {
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut launch_err_tx = Some(launch_err_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    let id = v.get("id").and_then(|x| x.as_u64()).unwrap_or(0);
                    let ok = v.get("ok").and_then(|x| x.as_bool()) == Some(true);
                    if id == 0 {
                        if let Some(tx) = launch_err_tx.take() {
                            let _ = tx.send(error_from_reply(&v));
                        }
                        continue;
                    }
                    let Some(waiter) = lock_pending(&pending).remove(&id) else {
                        continue;
                    };
                    let reply = if ok {
                        Ok(v.get("result").cloned().unwrap_or(serde_json::Value::Null))
                    } else {
                        Err(error_from_reply(&v))
                    };
                    let _ = waiter.send(reply);
                }
                // Child is gone: fail everything still waiting.
                for (_, waiter) in lock_pending(&pending).drain() {
                    let _ = waiter.send(Err(Error::Session("browser process exited".to_string())));
                }
            });
        }

        let session = Arc::new(PlaywrightSession {
            port,
            modality,
            profile_dir,
            tx,
            pending,
            next_id: AtomicU64::new(1),
            child: tokio::sync::Mutex::new(Some(child)),
            request_timeout: Duration::from_millis(self.nav_timeout_ms.saturating_add(20_000)),
            closed: AtomicBool::new(false),
        });

        let ready = tokio::select! {
            r = session.request("ready", serde_json::json!({}), Duration::from_millis(self.launch_timeout_ms)) => r.map(|_| ()),
            Ok(e) = launch_err_rx => Err(e),
        };
        if let Err(e) = ready {
            let _ = session.shutdown().await;
            return Err(e);
        }
        Ok(session)
    }
}

pub struct PlaywrightSession {
    port: u16,
    modality: Modality,
    profile_dir: PathBuf,
    tx: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicU64,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl PlaywrightSession {
    fn envelope(&self, op: &str, mut body: serde_json::Value) -> (u64, serde_json::Value) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("id".to_string(), id.into());
            obj.insert("op".to_string(), op.into());
        }
        (id, body)
    }

    async fn request(
        &self,
        op: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Session(format!("session on port {} is closed", self.port)));
        }
        let (id, msg) = self.envelope(op, body);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        if self.tx.send(msg.to_string()).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(Error::Session("browser process is not accepting input".to_string()));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(Error::Session("browser reply channel dropped".to_string())),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(Error::Timeout(format!(
                    "browser {op} after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl BrowserSession for PlaywrightSession {
    fn port(&self) -> u16 {
        self.port
    }

    async fn open_tab(&self) -> Result<TabId> {
        let v = self
            .request("open_tab", serde_json::json!({}), self.request_timeout)
            .await?;
        v.as_u64()
            .ok_or_else(|| Error::Session("open_tab returned no tab id".to_string()))
    }

    async fn search_text(&self, tab: TabId, query: &str, limit: usize) -> Result<Vec<String>> {
        let v = self
            .request(
                "search_text",
                serde_json::json!({"tab": tab, "query": query, "limit": limit}),
                self.request_timeout,
            )
            .await?;
        serde_json::from_value(v).map_err(|e| Error::Session(format!("bad search_text reply: {e}")))
    }

    async fn search_images(&self, tab: TabId, query: &str, limit: usize) -> Result<Vec<ImageLink>> {
        let v = self
            .request(
                "search_images",
                serde_json::json!({"tab": tab, "query": query, "limit": limit}),
                self.request_timeout,
            )
            .await?;
        serde_json::from_value(v)
            .map_err(|e| Error::Session(format!("bad search_images reply: {e}")))
    }

    fn close_tab(&self, tab: TabId) {
        // Fire and forget; the reply, if any, has no waiter.
        let (_, msg) = self.envelope("close_tab", serde_json::json!({ "tab": tab }));
        let _ = self.tx.send(msg.to_string());
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let polite = self
            .request("shutdown", serde_json::json!({}), Duration::from_secs(5))
            .await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
        match tokio::fs::remove_dir_all(&self.profile_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(port = self.port, error = %e, "could not remove browser profile"),
        }
        tracing::debug!(port = self.port, modality = %self.modality, "browser session shut down");
        // A session that already died is still considered shut down.
        match polite {
            Err(Error::Timeout(m)) => Err(Error::Timeout(m)),
            _ => Ok(()),
        }
    }
}
