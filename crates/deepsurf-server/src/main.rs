use anyhow::Result;
use clap::{Parser, Subcommand};
use deepsurf::research::ResearchRequest;
use deepsurf::runtime::Runtime;
use deepsurf_core::{Event, EventKind};
use deepsurf_local::shellout;
use deepsurf_local::Config;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "deepsurf")]
#[command(about = "Deep research over a pooled browser search backend", long_about = None)]
struct Cli {
    /// Log at info level (RUST_LOG still wins when set). Logs go to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API (`/research` event stream, `/search`, `/status`, `/health`).
    Serve(ServeCmd),
    /// Run one research request and stream event frames to stdout.
    Research(ResearchCmd),
    /// Run one cascade search (or image search) and print JSON.
    Search(SearchCmd),
    /// Diagnose configuration and local tool availability (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Listen address.
    #[arg(long, env = "DEEPSURF_ADDR", default_value = "127.0.0.1:8787")]
    addr: std::net::SocketAddr,
}

#[derive(clap::Args, Debug)]
struct ResearchCmd {
    /// The research question. May be empty when `--image` is given.
    #[arg(long, default_value = "")]
    query: String,
    /// Optional image URL to research alongside (or instead of) the query.
    #[arg(long)]
    image: Option<String>,
    /// Override DEEPSURF_MAX_ITERATIONS for this run.
    #[arg(long)]
    max_iterations: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    #[arg(long)]
    query: String,
    /// Search images through the browser pool instead of pages.
    #[arg(long, default_value_t = false)]
    images: bool,
    /// Max results (pages) or images.
    #[arg(long)]
    max: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Load `KEY=VALUE` lines from `DEEPSURF_ENV_FILE` without overriding the process env.
fn load_env_file() {
    let Ok(p) = std::env::var("DEEPSURF_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if !k.is_empty() && std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn doctor_payload(t0: std::time::Instant) -> serde_json::Value {
    let mut checks: Vec<serde_json::Value> = Vec::new();
    let cfg = Config::from_env();
    checks.push(serde_json::json!({
        "name": "config_valid",
        "ok": cfg.is_ok(),
        "skipped": false,
        "error": cfg.as_ref().err().map(|e| e.to_string()),
        "hint": if cfg.is_ok() { "" } else { "Fix the DEEPSURF_* variable named in the error." },
    }));
    let cfg = cfg.unwrap_or_default();

    let node_ok = shellout::has(&cfg.node_bin);
    checks.push(serde_json::json!({
        "name": "node_available",
        "ok": !cfg.primary_enabled || node_ok,
        "skipped": !cfg.primary_enabled,
        "hint": if node_ok || !cfg.primary_enabled {
            ""
        } else {
            "Install Node.js and `npm i -g playwright && npx playwright install chromium`, or set DEEPSURF_PRIMARY=off."
        },
    }));
    let ytdlp_ok = shellout::has("yt-dlp");
    checks.push(serde_json::json!({
        "name": "yt_dlp_available",
        "ok": ytdlp_ok,
        "skipped": false,
        "hint": if ytdlp_ok { "" } else { "Install yt-dlp to enable YouTube metadata and transcripts." },
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let secondaries: Vec<&str> = cfg
        .runnable_secondaries()
        .iter()
        .map(|e| e.as_str())
        .collect();
    serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "name": "deepsurf",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": {
            "primary": cfg.primary_enabled,
            "port_range": format!("{}-{}", cfg.port_start, cfg.port_end),
            "agents": { "text": cfg.text_agents, "image": cfg.image_agents },
            "recycle_threshold": cfg.recycle_threshold,
            "secondary_engines": secondaries,
            "providers": {
                "brave": cfg.brave_api_key.is_some(),
                "tavily": cfg.tavily_api_key.is_some(),
                "searxng": !cfg.searxng_endpoints.is_empty(),
            },
            "llm": {
                "openai_compat": cfg.llm_configured(),
                "api_key": cfg.llm_api_key.is_some(),
                "model": cfg.llm_model,
            },
        },
        "checks": checks,
    })
}

async fn run_research(rt: Arc<Runtime>, args: ResearchCmd) -> Result<()> {
    let orch = rt.orchestrator()?.clone();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(32);
    let cancel = CancellationToken::new();
    let req = ResearchRequest {
        query: args.query,
        image_url: args.image,
    };
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.run(req, tx, cancel).await })
    };

    let mut failed = false;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                failed |= ev.kind == EventKind::Error;
                stdout.write_all(ev.to_sse().as_bytes())?;
                stdout.flush()?;
            }
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            }
        }
    }
    task.await?;
    rt.shutdown().await;
    if failed {
        anyhow::bail!("research did not complete");
    }
    Ok(())
}

async fn run_search(rt: Arc<Runtime>, args: SearchCmd) -> Result<()> {
    let out = if args.images {
        let max = args.max.unwrap_or(10).clamp(1, 30);
        let hits = rt.images()?.search_images(&args.query, max).await;
        rt.shutdown().await;
        let hits = hits?;
        serde_json::json!({ "ok": true, "query": args.query, "images": hits })
    } else {
        let trace = rt
            .search()
            .search_with_trace(&args.query, &CancellationToken::new())
            .await;
        rt.shutdown().await;
        let mut urls = trace.urls;
        if let Some(n) = args.max {
            urls.truncate(n);
        }
        serde_json::json!({
            "ok": true,
            "query": args.query,
            "engine": trace.engine,
            "urls": urls,
            "attempts": trace.attempts,
        })
    };
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve(args) => {
            let rt = Arc::new(Runtime::build(Config::from_env()?)?);
            deepsurf::http::serve(rt, args.addr).await?;
        }
        Commands::Research(args) => {
            let mut cfg = Config::from_env()?;
            if let Some(n) = args.max_iterations {
                cfg.max_iterations = n.max(1);
            }
            let rt = Arc::new(Runtime::build(cfg)?);
            run_research(rt, args).await?;
        }
        Commands::Search(args) => {
            let rt = Arc::new(Runtime::build(Config::from_env()?)?);
            run_search(rt, args).await?;
        }
        Commands::Doctor(args) => {
            let payload = doctor_payload(std::time::Instant::now());
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!(
                        "deepsurf {} (ok={})",
                        env!("CARGO_PKG_VERSION"),
                        payload["ok"].as_bool().unwrap_or(false)
                    );
                    println!(
                        "secondary engines: {}",
                        payload["configured"]["secondary_engines"]
                    );
                    println!("checks:");
                    if let Some(arr) = payload["checks"].as_array() {
                        for c in arr {
                            let name = c["name"].as_str().unwrap_or("?");
                            if c["skipped"].as_bool().unwrap_or(false) {
                                println!("- {name}: skipped");
                            } else if c["ok"].as_bool().unwrap_or(false) {
                                println!("- {name}: ok");
                            } else {
                                println!("- {name}: fail");
                            }
                        }
                    }
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "deepsurf",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("deepsurf {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
