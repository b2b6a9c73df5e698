//! scenebox: convert untrusted 3D scene documents into portable artifacts.

mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use scenebox_config::SceneboxConfig;
use scenebox_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use scenebox_sandbox::{
    normalize, ConversionResult, ConvertOptions, ExecutionMode, NetworkTransport,
    OfflineTransport, SandboxConfig, SceneSandbox,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::http::HttpTransport;

#[derive(Parser)]
#[command(name = "scenebox", version, about = "Sandboxed 3D scene document converter")]
struct Cli {
    /// Config file (defaults to $SCENEBOX_CONFIG, then ./scenebox.toml).
    #[arg(long, global = true, env = "SCENEBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a document and write its scene snapshot, bundle and thumbnail.
    Convert(ConvertArgs),
    /// Print the normalized form of a policy candidate.
    Policy {
        /// Policy candidate as JSON.
        candidate: String,
    },
}

#[derive(Args)]
struct ConvertArgs {
    /// The HTML document to convert.
    file: PathBuf,

    /// Output directory (defaults to the document's directory).
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Policy candidate as JSON, overriding the config file's [policy].
    #[arg(long)]
    policy: Option<String>,

    /// Origin that the `self` endpoint resolves to.
    #[arg(long)]
    origin: Option<String>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Perform admitted requests over HTTP. Without it only `data:` URLs load.
    #[arg(long)]
    online: bool,

    /// Print the result summary as JSON.
    #[arg(long)]
    json: bool,

    /// Write Prometheus text-format metrics for the run to this file.
    #[cfg(feature = "metrics")]
    #[arg(long)]
    metrics: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Isolate,
    Process,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Isolate => ExecutionMode::Isolate,
            ModeArg::Process => ExecutionMode::Process,
        }
    }
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &scenebox_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(mode) = overrides.execution_mode.as_deref() {
        config.execution_mode = match mode {
            "process" => ExecutionMode::Process,
            _ => ExecutionMode::Isolate,
        };
    }
    if let Some(kb) = overrides.max_document_kb {
        config.max_document_size = kb * 1024;
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(entries) = overrides.max_log_entries {
        config.max_log_entries = entries;
    }
    if let Some(tail) = overrides.error_log_tail {
        config.error_log_tail = tail;
    }
    config
}

/// Locate the config file: explicit flag or env, then `./scenebox.toml`.
fn find_config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    let cwd = PathBuf::from("scenebox.toml");
    cwd.exists().then_some(cwd)
}

fn load_config(explicit: Option<PathBuf>) -> Result<SceneboxConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            SceneboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => Ok(SceneboxConfig::default()),
    }
}

async fn audit_logger(config: &SceneboxConfig) -> Result<Option<Arc<dyn AuditLogger>>> {
    if let Some(path) = &config.audit.jsonl_path {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        return Ok(Some(Arc::new(JsonLinesAuditLogger::new(file))));
    }
    if config.audit.tracing {
        return Ok(Some(Arc::new(TracingAuditLogger)));
    }
    Ok(None)
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{label} is not valid JSON"))
}

/// Write the snapshot, bundle and thumbnail next to each other.
fn write_outputs(result: &ConversionResult, out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let mut written = Vec::new();
    let mut write = |name: String, bytes: &[u8]| -> Result<()> {
        let path = out_dir.join(name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
        Ok(())
    };

    for file in &result.files {
        write(file.name.clone(), file.contents.as_bytes())?;
    }
    let stem = result
        .files
        .first()
        .and_then(|f| f.name.strip_suffix(".scene.json"))
        .unwrap_or("scene")
        .to_string();
    if let Some(bundle) = &result.artifacts.binary_bundle {
        write(format!("{stem}.glb"), bundle)?;
    }
    if let Some(thumb) = &result.artifacts.thumbnail {
        write(
            format!("{stem}.thumbnail.pam"),
            &encode_pam(&thumb.data, thumb.width, thumb.height),
        )?;
    }
    Ok(written)
}

/// Netpbm PAM with an RGB_ALPHA tuple type.
fn encode_pam(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let header = format!(
        "P7\nWIDTH {width}\nHEIGHT {height}\nDEPTH 4\nMAXVAL 255\nTUPLTYPE RGB_ALPHA\nENDHDR\n"
    );
    let mut out = Vec::with_capacity(header.len() + rgba.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(rgba);
    out
}

#[cfg(feature = "metrics")]
fn write_metrics(registry: &prometheus_client::registry::Registry, path: &Path) -> Result<()> {
    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, registry)
        .context("failed to encode metrics")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

async fn convert(config: SceneboxConfig, args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        file,
        out,
        policy,
        origin,
        mode,
        online,
        json,
        ..
    } = args;
    let mut sandbox_config = build_sandbox_config(&config.sandbox);
    if let Some(mode) = mode {
        sandbox_config.execution_mode = mode.into();
    }

    let policy = match policy {
        Some(raw) => parse_json("--policy", &raw)?,
        None => config.policy.to_candidate(),
    };
    let normalized = normalize(&policy);

    let transport: Arc<dyn NetworkTransport> = if online {
        Arc::new(HttpTransport::new(normalized.max_execution())?)
    } else {
        Arc::new(OfflineTransport)
    };
    let mut sandbox = SceneSandbox::with_transport(sandbox_config, transport);
    if let Some(logger) = audit_logger(&config).await? {
        sandbox = sandbox.with_audit_logger(logger);
    }
    #[cfg(feature = "metrics")]
    let mut registry = prometheus_client::registry::Registry::default();
    #[cfg(feature = "metrics")]
    if args.metrics.is_some() {
        let metrics = scenebox_sandbox::metrics::SceneboxMetrics::new(&mut registry);
        sandbox = sandbox.with_metrics(Arc::new(metrics));
    }

    let content = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("scene.html")
        .to_string();
    let mut options = ConvertOptions::new(file_name).with_policy(policy);
    if let Some(origin) = origin {
        options = options.with_origin(origin);
    }

    let outcome = sandbox.convert(&content, options).await;
    #[cfg(feature = "metrics")]
    if let Some(path) = &args.metrics {
        write_metrics(&registry, path)?;
    }

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&e.to_structured_error())?);
            } else {
                for entry in &e.logs {
                    eprintln!("  [{:>6}ms] {:?}: {}", entry.elapsed_ms, entry.level, entry.message);
                }
            }
            anyhow::bail!("conversion failed: {e}");
        }
    };

    let out_dir = out.unwrap_or_else(|| {
        file.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let written = write_outputs(&result, &out_dir)?;

    if json {
        let report = serde_json::json!({
            "summary": result.summary,
            "policy": result.policy,
            "files": written,
            "logs": result.logs,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "exported {} objects ({}) in {}ms",
            result.summary.object_count,
            result.summary.reason.as_str(),
            result.summary.duration_ms
        );
        for path in written {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Convert(args) => {
            let config = load_config(cli.config)?;
            convert(config, args).await
        }
        Commands::Policy { candidate } => {
            let policy = normalize(&parse_json("candidate", &candidate)?);
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(())
        }
    }
}
