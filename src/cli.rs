use crate::{
    config::Config,
    job::{JobId, JobOutcome},
    payload::PayloadAsset,
    pipeline::Pipeline,
    probe::probe_apk,
    service::{self, AppState},
    sign::{self, ApkSigner, SigningCredential},
    transform::{CommandTransformer, Transformer},
    util::{ensure_dir, write_output},
    workspace::WorkspaceManager,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "apkpatch")]
#[command(about = "Inject a payload class into APKs and re-sign them")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./apkpatch.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP service.
    Serve {
        /// Overrides server.bind (and $PORT).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Patch a single APK without the HTTP layer.
    Patch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Report availability of the external tools.
    Doctor {},
    /// Remove workspaces left behind by a crashed process.
    Sweep {},
}

pub fn dispatch(args: Args) -> Result<()> {
    let mut cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    cfg.apply_env();

    let _guard = init_logging(&args, &cfg)?;

    if cfg.debug.dump_effective_config {
        info!("effective config:\n{}", toml::to_string(&cfg).unwrap_or_default());
    }

    match args.cmd {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            serve(&cfg)
        }
        Command::Patch { input, output } => patch(&cfg, &input, &output),
        Command::Doctor {} => doctor(&cfg),
        Command::Sweep {} => sweep(&cfg),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["apkpatch.toml", "apkpatch.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let file_path = resolve_log_path(cfg);
    let (file_layer, guard) = if let Some(path) = file_path.as_deref() {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.scratch_root).join("apkpatch.log"))
}

/// Loads the process-wide payload and signing credential and wires up the
/// pipeline around them.
fn build_pipeline(cfg: &Config) -> Result<Pipeline<CommandTransformer, ApkSigner>> {
    let payload = PayloadAsset::load(Path::new(&cfg.paths.payload_smali), &cfg.injection.initializer)?;
    info!(
        class = payload.class_descriptor(),
        sha256 = payload.sha256(),
        "payload loaded"
    );

    let credential = SigningCredential::load(&cfg.signing)?;
    info!(
        keystore = %credential.keystore().display(),
        alias = credential.alias(),
        fingerprint = credential.fingerprint(),
        "signing credential loaded"
    );

    let transformer = CommandTransformer::new(cfg);
    let signer = ApkSigner::new(cfg, Arc::new(credential));
    Ok(Pipeline::new(cfg, transformer, signer, Arc::new(payload)))
}

fn serve(cfg: &Config) -> Result<()> {
    let pipeline = build_pipeline(cfg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(serve_locked(cfg, pipeline))
}

async fn serve_locked(cfg: &Config, pipeline: Pipeline<CommandTransformer, ApkSigner>) -> Result<()> {
    // Nothing is swept until this process owns both the port and the
    // scratch root.
    let listener = service::bind(cfg).await?;
    let workspaces = pipeline.workspaces();
    let lock = workspaces.lock()?.ok_or_else(|| {
        anyhow!(
            "scratch root {} is in use by another apkpatch process",
            workspaces.root().display()
        )
    })?;
    let removed = workspaces.sweep_stale(&lock)?;
    info!(removed, root = %workspaces.root().display(), "startup workspace sweep");

    let state = AppState::new(cfg, pipeline);
    let served = service::serve(listener, state).await;
    drop(lock);
    served
}

fn sweep(cfg: &Config) -> Result<()> {
    let workspaces = WorkspaceManager::new(&cfg.paths.scratch_root);
    let lock = workspaces.lock()?.ok_or_else(|| {
        anyhow!(
            "refusing to sweep {}: a running apkpatch service holds it",
            workspaces.root().display()
        )
    })?;
    let removed = workspaces.sweep_stale(&lock)?;
    println!("{}", serde_json::json!({ "removed": removed }));
    Ok(())
}

fn patch(cfg: &Config, input: &Path, output: &Path) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading input: {}", input.display()))?;
    probe_apk(&bytes, cfg.server.max_upload_bytes)?;

    let pipeline = build_pipeline(cfg)?;
    // Held so a service starting meanwhile cannot sweep this job's workspace.
    let _lock = pipeline.workspaces().lock()?;
    let run = pipeline.run_job(JobId::new(), &bytes, &CancellationToken::new());

    match run.outcome {
        JobOutcome::Done(apk) => {
            write_output(output, &apk.bytes)
                .with_context(|| format!("writing output: {}", output.display()))?;
            println!("{}", serde_json::to_string_pretty(&run.report)?);
            Ok(())
        }
        JobOutcome::Failed(failure) => {
            println!("{}", serde_json::to_string_pretty(&run.report)?);
            Err(anyhow!(
                "job failed at {} ({}): {}",
                failure.stage,
                failure.error.kind(),
                failure.error
            ))
        }
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    let mut tools = vec![CommandTransformer::new(cfg).doctor()];
    tools.extend(sign::doctor_tools(&cfg.signing));
    let payload = match PayloadAsset::load(Path::new(&cfg.paths.payload_smali), &cfg.injection.initializer) {
        Ok(p) => serde_json::json!({ "ok": true, "class": p.class_descriptor(), "sha256": p.sha256() }),
        Err(e) => serde_json::json!({ "ok": false, "error": format!("{e:#}") }),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "tools": tools,
            "payload": payload,
            "keystore_present": Path::new(&cfg.signing.keystore).is_file(),
        }))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_come_from_the_command_line_only() {
        let args = Args::try_parse_from([
            "apkpatch",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
            "patch",
            "--input",
            "in.apk",
            "--output",
            "out.apk",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some(Path::new("custom.toml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(matches!(args.cmd, Command::Patch { .. }));

        assert!(Args::try_parse_from(["apkpatch", "patch", "--input", "in.apk"]).is_err());
    }
}
