use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use genqueue_api::{build_state, router, select_backend, start};
use genqueue_common::config::AppConfig;
use genqueue_core::checkpoint::{download_target, hub_url};
use genqueue_obs::{check_requirements, HostProfile};
use tokio::io::AsyncWriteExt;
use opentelemetry_otlp::WithExportConfig;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PROMPT: &str = "Simply put, the theory of relativity states that ";

#[derive(Parser, Debug)]
#[command(name = "genqueue", version, about = "Open LLaMA text generation behind a task queue")]
struct Cli {
    /// YAML app config; defaults apply when absent
    #[arg(long, global = true, env = "GENQUEUE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP task queue
    Serve(ServeArgs),
    /// Generate once in-process and print the text
    Run(RunArgs),
    /// Download a checkpoint into the model cache volume
    Pull(PullArgs),
    /// Host resources against the declared runtime
    Stats,
    /// Print the effective configuration
    Config,
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, default_value = DEFAULT_PROMPT)]
    prompt: String,
    /// Also copy the generated text here
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PullArgs {
    /// File inside the model repository, e.g. open_llama_7b.Q4_0.gguf
    #[arg(short, long)]
    file: Option<String>,
    #[arg(short, long)]
    revision: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let result = match cli.command {
        Commands::Serve(args) => serve(cfg, args).await,
        Commands::Run(args) => run_local(cfg, args).await,
        Commands::Pull(args) => pull_model(cfg, args).await,
        Commands::Stats => stats(&cfg),
        Commands::Config => {
            print!("{}", cfg.to_yaml()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };
    opentelemetry::global::shutdown_tracer_provider();
    result
}

async fn serve(mut cfg: AppConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }
    warn_on_shortfalls(&cfg);
    let bind = cfg.server.bind.clone();
    let state = start(cfg)?;
    let queue = state.queue().clone();
    let app: Router = router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    queue.shutdown().await;
    tracing::info!("task queue drained");
    Ok(())
}

async fn run_local(cfg: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let backend = select_backend(cfg.model.backend);
    let state = build_state(cfg, backend)?;
    let (record, outcome) = state.queue().run_now(args.prompt).await?;
    println!("{}", outcome.text);
    for name in &outcome.outputs {
        let path = state.queue().worker().sink().path(&record.task_id, name)?;
        tracing::info!("wrote {}", path.display());
    }
    if let Some(path) = args.output {
        write_atomic(&path, outcome.text.as_bytes()).await?;
    }
    Ok(())
}

fn stats(cfg: &AppConfig) -> anyhow::Result<()> {
    let host = HostProfile::detect();
    println!("CPU: {} cores, {:.1}% busy", host.cpus, host.cpu_usage_percent);
    println!(
        "Memory: {} / {} MiB",
        host.memory_used_bytes / 1024 / 1024,
        host.memory_total_bytes / 1024 / 1024
    );
    match &host.gpu {
        Some(gpu) => println!("GPU: {} ({} MiB)", gpu.name, gpu.memory_total_bytes / 1024 / 1024),
        None => println!("GPU: none detected"),
    }
    let shortfalls = check_requirements(&cfg.runtime, &host)?;
    if shortfalls.is_empty() {
        println!("host satisfies the declared runtime");
    }
    for s in shortfalls {
        println!("warning: {s}");
    }
    Ok(())
}

fn warn_on_shortfalls(cfg: &AppConfig) {
    match check_requirements(&cfg.runtime, &HostProfile::detect()) {
        Ok(shortfalls) => {
            for s in shortfalls {
                tracing::warn!("{s}");
            }
        }
        Err(e) => tracing::warn!("runtime check skipped: {e}"),
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn pull_model(cfg: AppConfig, args: PullArgs) -> anyhow::Result<()> {
    let file = match args.file.or_else(|| cfg.model.checkpoint_file.clone()) {
        Some(file) => file,
        None => bail!("no checkpoint file given; pass --file or set model.checkpoint_file"),
    };
    let revision = args.revision.unwrap_or_else(|| cfg.model.revision.clone());
    let url = hub_url(&cfg.model.base_model, &file, &revision)?;
    let target = download_target(cfg.cache_dir()?, &cfg.model.base_model, &file);
    if target.exists() {
        println!("already cached at {}", target.display());
        return Ok(());
    }
    if let Some(dir) = target.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    println!("Downloading {url}");
    println!("        to {}", target.display());

    let mut resp = reqwest::get(&url).await?;
    if !resp.status().is_success() {
        bail!("download failed: status {}", resp.status());
    }
    let partial = partial_path(&target);
    let mut out = tokio::fs::File::create(&partial).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = resp.chunk().await? {
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.sync_all().await?;
    drop(out);
    tokio::fs::rename(&partial, &target).await?;
    println!("Saved {} MiB", written / 1024 / 1024);
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let partial = partial_path(path);
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
