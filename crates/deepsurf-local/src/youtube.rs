//! YouTube metadata and transcripts through `yt-dlp`.

use crate::shellout;
use deepsurf_core::{Error, Result, TranscriptService, VideoMetadata};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub fn is_youtube_host(host: &str) -> bool {
    let h = host.to_ascii_lowercase();
    h == "youtube.com" || h == "youtu.be" || h.ends_with(".youtube.com")
}

pub fn youtube_video_id(u: &url::Url) -> Option<String> {
    let host = u.host_str()?;
    if !is_youtube_host(host) {
        return None;
    }

    // youtu.be/<id>
    if host.eq_ignore_ascii_case("youtu.be") {
        let seg = u.path_segments()?.next()?.trim();
        return (!seg.is_empty()).then(|| seg.to_string());
    }

    // youtube.com/watch?v=<id>
    if u.path().starts_with("/watch") {
        if let Some((_, v)) = u.query_pairs().find(|(k, _)| k == "v") {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    // youtube.com/shorts/<id>, /embed/<id>, /live/<id>
    let mut segs = u.path_segments()?;
    let a = segs.next().unwrap_or("");
    let b = segs.next().unwrap_or("").trim();
    if matches!(a, "shorts" | "embed" | "live") && !b.is_empty() {
        return Some(b.to_string());
    }
    None
}

/// Every YouTube URL appearing in free text, in order, without duplicates.
pub fn youtube_urls_in(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tok in text.split_whitespace() {
        let tok = tok.trim_matches(|c: char| matches!(c, '(' | ')' | '<' | '>' | ',' | '"' | '\''));
        let Ok(u) = url::Url::parse(tok) else { continue };
        if youtube_video_id(&u).is_some() && !out.iter().any(|s| s == tok) {
            out.push(tok.to_string());
        }
    }
    out
}

/// Drop the WEBVTT header, cue numbers, and timing lines; keep cue text.
pub fn vtt_to_text(vtt: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut last_line = String::new();
    for line in vtt.lines() {
        let l = line.trim();
        if l.is_empty()
            || l.eq_ignore_ascii_case("webvtt")
            || l.starts_with("Kind:")
            || l.starts_with("Language:")
            || l.contains("-->")
            || l.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        let cleaned = strip_inline_tags(l);
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        // Auto captions repeat each line in the next cue.
        if cleaned.is_empty() || cleaned == last_line {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&cleaned);
        last_line = cleaned;
        if out.chars().count() >= max_chars {
            break;
        }
    }
    out.chars().take(max_chars).collect()
}

fn strip_inline_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
    upload_date: Option<String>,
    view_count: Option<u64>,
    description: Option<String>,
}

fn metadata_from_json(url: &str, raw: &[u8]) -> Result<VideoMetadata> {
    let info: YtDlpInfo = serde_json::from_slice(raw)
        .map_err(|e| Error::Fetch(format!("yt-dlp returned invalid JSON: {e}")))?;
    Ok(VideoMetadata {
        url: url.to_string(),
        title: info.title,
        duration_s: info.duration.filter(|d| *d >= 0.0).map(|d| d.round() as u64),
        channel: info.channel.or(info.uploader),
        upload_date: info.upload_date,
        view_count: info.view_count,
        description: info.description.map(|d| d.chars().take(1_000).collect()),
    })
}

#[derive(Debug, Clone)]
pub struct YtDlpTranscripts {
    bin: String,
    timeout: Duration,
    max_chars: usize,
    langs: Vec<String>,
}

impl YtDlpTranscripts {
    pub fn new(timeout: Duration, max_chars: usize, langs: Vec<String>) -> Self {
        Self {
            bin: "yt-dlp".to_string(),
            timeout,
            max_chars,
            langs,
        }
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    fn check(url: &str) -> Result<()> {
        let u = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        if youtube_video_id(&u).is_none() {
            return Err(Error::InvalidUrl(format!("not a YouTube video URL: {url}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TranscriptService for YtDlpTranscripts {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata> {
        Self::check(url)?;
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("--dump-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(url);
        let out = shellout::run_stdout_bounded(cmd, self.timeout, 8_000_000).await?;
        metadata_from_json(url, &out)
    }

    async fn fetch_transcript(&self, url: &str) -> Result<String> {
        Self::check(url)?;
        let tmpdir = tempfile::tempdir().map_err(|e| Error::Fetch(format!("tempdir: {e}")))?;
        let out_tmpl = tmpdir.path().join("%(id)s.%(ext)s");
        let langs = if self.langs.is_empty() {
            "en,en-US".to_string()
        } else {
            self.langs.join(",")
        };

        // Human and auto subs; yt-dlp writes whichever exists.
        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("--skip-download")
            .arg("--write-sub")
            .arg("--write-auto-sub")
            .arg("--sub-lang")
            .arg(&langs)
            .arg("--sub-format")
            .arg("vtt")
            .arg("-o")
            .arg(out_tmpl.to_string_lossy().to_string())
            .arg("--no-warnings")
            .arg(url);
        shellout::run_stdout_bounded(cmd, self.timeout, 64_000).await?;

        let mut vtt_path: Option<PathBuf> = None;
        let mut rd = tokio::fs::read_dir(tmpdir.path())
            .await
            .map_err(|e| Error::Fetch(format!("read captions dir: {e}")))?;
        while let Ok(Some(ent)) = rd.next_entry().await {
            let p = ent.path();
            if p.extension().and_then(|s| s.to_str()) == Some("vtt") {
                vtt_path = Some(p);
                break;
            }
        }
        let p = vtt_path.ok_or_else(|| Error::Fetch(format!("no captions found for {url}")))?;
        let vtt = tokio::fs::read_to_string(&p)
            .await
            .map_err(|e| Error::Fetch(format!("read captions: {e}")))?;
        Ok(vtt_to_text(&vtt, self.max_chars))
    }
}
