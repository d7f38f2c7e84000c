//! Full-text extraction over plain HTTP.

use crate::retry::with_timeout;
use deepsurf_core::{Error, ExtractedPage, Result, TextExtractor};
use futures_util::StreamExt;
use std::io::Cursor;
use std::time::Duration;

/// Convert HTML to readable plain text.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_boilerplate_container(el: &html_scraper::ElementRef) -> bool {
    let s = class_or_id_lc(el);
    !s.is_empty()
        && [
            "nav", "menu", "sidebar", "footer", "header", "banner", "cookie", "consent", "advert",
            "promo", "newsletter", "subscribe",
        ]
        .iter()
        .any(|bad| s.contains(bad))
}

fn text_chars(el: &html_scraper::ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn link_text_chars(el: &html_scraper::ElementRef, links: &html_scraper::Selector) -> usize {
    el.select(links).map(|a| text_chars(&a)).sum()
}

/// Text of the densest article-like block, scored by non-link text with tag bonuses.
pub fn main_text(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    let blocks = html_scraper::Selector::parse("article, main, section, div").ok()?;
    let links = html_scraper::Selector::parse("a").ok()?;
    let skip = html_scraper::Selector::parse("script, style, noscript").ok()?;

    let mut best: Option<(i64, String)> = None;
    for el in doc.select(&blocks).take(20_000) {
        if is_boilerplate_container(&el) {
            continue;
        }
        let scripts: usize = el.select(&skip).map(|s| text_chars(&s)).sum();
        let txt = text_chars(&el).saturating_sub(scripts);
        if txt < 20 {
            continue;
        }
        let link_txt = link_text_chars(&el, &links);
        let mut score = txt as i64 - 2 * link_txt as i64;
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ => {}
        }
        if link_txt > txt / 2 {
            score -= 500;
        }
        if best.as_ref().map_or(score > 0, |(b, _)| score > *b) {
            let t: String = el
                .text()
                .filter(|t| !t.trim().is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            best = Some((score, norm_ws(&t)));
        }
    }
    best.map(|(_, t)| t).filter(|t| !t.is_empty())
}

fn looks_like_tracking_pixel(src: &str) -> bool {
    let s = src.to_ascii_lowercase();
    s.contains("pixel") || s.contains("spacer") || s.contains("1x1") || s.ends_with(".svg")
}

/// Absolute `img[src]` URLs, skipping data URIs and obvious trackers.
pub fn image_urls(html: &str, base: &url::Url, max: usize) -> Vec<String> {
    let doc = html_scraper::Html::parse_document(html);
    let Ok(sel) = html_scraper::Selector::parse("img") else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for img in doc.select(&sel) {
        if out.len() >= max {
            break;
        }
        let src = img
            .value()
            .attr("src")
            .or_else(|| img.value().attr("data-src"))
            .unwrap_or("")
            .trim();
        if src.is_empty() || src.starts_with("data:") || looks_like_tracking_pixel(src) {
            continue;
        }
        let Ok(abs) = base.join(src) else { continue };
        if !matches!(abs.scheme(), "http" | "https") {
            continue;
        }
        let abs = abs.to_string();
        if !out.contains(&abs) {
            out.push(abs);
        }
    }
    out
}

fn truncate_words(s: &str, max_words: usize) -> String {
    s.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub timeout_ms: u64,
    pub max_bytes: usize,
    pub max_words: usize,
    pub max_images: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            max_bytes: 4_000_000,
            max_words: 3_000,
            max_images: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalExtractor {
    client: reqwest::Client,
    cfg: ExtractorConfig,
}

impl LocalExtractor {
    pub fn new(cfg: ExtractorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("deepsurf/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    async fn fetch_html(&self, url: &url::Url) -> Result<Option<(url::Url, String)>> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status} for {url}")));
        }
        let final_url = resp.url().clone();
        let ct = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !ct.is_empty() && !ct.contains("html") {
            tracing::debug!(%url, content_type = %ct, "skipping non-HTML body");
            return Ok(None);
        }

        let mut bytes: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            let room = self.cfg.max_bytes.saturating_sub(bytes.len());
            if chunk.len() >= room {
                bytes.extend_from_slice(&chunk[..room]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Some((final_url, String::from_utf8_lossy(&bytes).into_owned())))
    }
}

#[async_trait::async_trait]
impl TextExtractor for LocalExtractor {
    async fn fetch(&self, url: &str) -> Result<ExtractedPage> {
        let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("unsupported scheme in {url}")));
        }
        let fetched = with_timeout(self.cfg.timeout_ms, "fetch", self.fetch_html(&parsed)).await?;
        let Some((final_url, html)) = fetched else {
            return Ok(ExtractedPage {
                url: url.to_string(),
                ..ExtractedPage::default()
            });
        };
        let text = main_text(&html).unwrap_or_else(|| norm_ws(&html_to_text(&html, 120)));
        Ok(ExtractedPage {
            url: url.to_string(),
            text: truncate_words(&text, self.cfg.max_words),
            images: image_urls(&html, &final_url, self.cfg.max_images),
        })
    }
}
