// crates/server/src/main.rs
//! hindsight engine binary.
//!
//! `start` runs the whole engine in the foreground: transcript indexer,
//! shadow-commit workers, and the JSON-RPC surface on stdin/stdout (logs
//! go to stderr so the protocol stream stays clean). The other subcommands
//! are the shadow-commit control plane.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hindsight_db::{RepoSettings, Store};
use hindsight_git::{run_git, GitCommand, RepoResolver};
use hindsight_server::{AppState, TranscriptIndexer};
use hindsight_shadow::{Correlator, Gate, NotificationSink, ShadowEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hindsight", version, about = "Conversation memory and shadow-commit engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine in the foreground (indexer + shadow workers + RPC).
    Start {
        /// Skip repository auto-detection.
        #[arg(long)]
        no_auto_detect: bool,
        /// Transcript directory (default: ~/.claude/projects).
        #[arg(long)]
        transcripts: Option<PathBuf>,
        /// Additional repositories to monitor.
        #[arg(long)]
        repo: Vec<PathBuf>,
    },
    /// Signal a running engine to shut down.
    Stop,
    /// Register a repository for shadow commits.
    Add {
        path: PathBuf,
        /// Per-file throttle in milliseconds.
        #[arg(long)]
        throttle: Option<u64>,
        /// Extra exclusion globs.
        #[arg(long)]
        exclude: Vec<String>,
        /// Register without enabling.
        #[arg(long)]
        no_enable: bool,
    },
    /// Unregister a repository.
    Remove { path: PathBuf },
    /// List registered repositories.
    List,
    /// Show store statistics and engine liveness.
    Status,
    /// Run the commit gate against one file and print the verdict.
    Test { file: PathBuf },
    /// Run only the shadow engine, logging every event decision.
    Watch {
        /// Repository to watch (default: all registered).
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

fn init_tracing(default: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn transcripts_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var("HINDSIGHT_TRANSCRIPTS") {
        return Ok(PathBuf::from(dir));
    }
    hindsight_core::paths::transcripts_dir().context("home directory not found")
}

async fn open_store() -> Result<Store> {
    if let Ok(path) = std::env::var("HINDSIGHT_DB") {
        return Ok(Store::open(Path::new(&path)).await?);
    }
    Ok(Store::open_default().await?)
}

fn write_pid_file() -> Result<Option<PathBuf>> {
    let Some(path) = hindsight_core::paths::pid_path() else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(Some(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            no_auto_detect,
            transcripts,
            repo,
        } => {
            // RPC owns stdout; logs stay on stderr and default quiet.
            init_tracing("warn");
            run_engine(no_auto_detect, transcripts_dir(transcripts)?, repo, false).await
        }
        Commands::Watch { repo } => {
            init_tracing("debug");
            run_engine(true, transcripts_dir(None)?, repo.into_iter().collect(), true).await
        }
        Commands::Stop => {
            init_tracing("info");
            stop_engine()
        }
        Commands::Add {
            path,
            throttle,
            exclude,
            no_enable,
        } => {
            init_tracing("info");
            add_repository(path, throttle, exclude, no_enable).await
        }
        Commands::Remove { path } => {
            init_tracing("info");
            remove_repository(path).await
        }
        Commands::List => {
            init_tracing("info");
            list_repositories().await
        }
        Commands::Status => {
            init_tracing("info");
            show_status().await
        }
        Commands::Test { file } => {
            init_tracing("info");
            test_gate(file).await
        }
    }
}

/// Shared engine runner for `start` (full engine + RPC) and `watch`
/// (shadow only, verbose).
async fn run_engine(
    no_auto_detect: bool,
    transcripts: PathBuf,
    extra_repos: Vec<PathBuf>,
    watch_only: bool,
) -> Result<()> {
    let store = open_store().await?;
    let resolver = Arc::new(RepoResolver::new());
    let correlator = Arc::new(Correlator::new(transcripts.clone()));
    let engine = ShadowEngine::new(
        store.clone(),
        resolver.clone(),
        correlator,
        NotificationSink::default_sink(),
    );

    let pid_file = write_pid_file()?;

    // Repositories: stored settings first, then flags, then auto-detection.
    let mut roots: Vec<PathBuf> = store
        .list_repo_settings()
        .await?
        .into_iter()
        .filter(|s| s.enabled)
        .map(|s| PathBuf::from(s.root))
        .collect();
    roots.extend(extra_repos);
    if !no_auto_detect {
        if let Some(home) = dirs::home_dir() {
            roots.extend(hindsight_server::autodetect::detect_under_home(&home));
        }
        roots.extend(hindsight_server::autodetect::detect_from_transcripts(&transcripts).await);
    }
    roots.sort();
    roots.dedup();

    for root in roots {
        match engine.add_repository(&root).await {
            Ok(settings) => {
                tracing::info!(repo = %root.display(), enabled = settings.enabled, "repository registered")
            }
            Err(e) => tracing::warn!(repo = %root.display(), error = %e, "repository skipped"),
        }
    }

    let indexer = if watch_only {
        None
    } else {
        Some(TranscriptIndexer::start(store.clone(), transcripts.clone()).await?)
    };

    if watch_only {
        eprintln!("watching {} repositories (ctrl-c to stop)", engine.monitored_roots().await.len());
        tokio::signal::ctrl_c().await?;
    } else {
        let state = AppState::new(store.clone(), resolver, transcripts);
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();

        tokio::select! {
            result = hindsight_server::rpc::serve(state, stdin, stdout) => { result?; }
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    // Watchers stop first; queues drain; any in-flight commit finishes its
    // restore step inside the engine's drain ceiling.
    if let Some(indexer) = &indexer {
        indexer.stop();
    }
    engine.shutdown().await;
    if let Some(pid_file) = pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    Ok(())
}

fn stop_engine() -> Result<()> {
    let path = hindsight_core::paths::pid_path().context("home directory not found")?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| "engine does not appear to be running (no pid file)")?;
    let pid: i32 = raw.trim().parse().context("pid file is malformed")?;

    // SIGTERM triggers the engine's graceful shutdown path.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let _ = std::fs::remove_file(&path);
        bail!("no process with pid {pid}; removed stale pid file");
    }
    println!("sent stop signal to pid {pid}");
    Ok(())
}

async fn add_repository(
    path: PathBuf,
    throttle_ms: Option<u64>,
    exclude: Vec<String>,
    no_enable: bool,
) -> Result<()> {
    let store = open_store().await?;
    let resolver = RepoResolver::new();
    let resolved = resolver
        .resolve(&path)
        .await
        .context("path is not inside a git repository")?;

    let root = resolved.root.to_string_lossy().to_string();
    let mut settings = store
        .repo_settings(&root)
        .await?
        .unwrap_or_else(|| RepoSettings::defaults_for(root.clone()));
    if let Some(ms) = throttle_ms {
        settings.throttle_secs = (ms / 1000).max(1) as i64;
    }
    for glob in exclude {
        if !settings.excludes.contains(&glob) {
            settings.excludes.push(glob);
        }
    }
    settings.enabled = !no_enable;

    store
        .upsert_repository(hindsight_db::RepositoryRecord {
            root: root.clone(),
            remote_url: resolved.remote_url,
            default_branch: resolved.current_branch,
            is_monorepo_subdirectory: resolved.is_monorepo_subdirectory,
            subdirectory: resolved
                .is_monorepo_subdirectory
                .then_some(resolved.subdirectory),
        })
        .await?;
    store.put_repo_settings(settings.clone()).await?;

    println!(
        "registered {} (enabled: {}, throttle: {}s)",
        root, settings.enabled, settings.throttle_secs
    );
    Ok(())
}

async fn remove_repository(path: PathBuf) -> Result<()> {
    let store = open_store().await?;
    let resolver = RepoResolver::new();
    let root = match resolver.resolve(&path).await {
        Ok(resolved) => resolved.root.to_string_lossy().to_string(),
        // Allow removing a repository that no longer exists on disk.
        Err(_) => path.to_string_lossy().to_string(),
    };

    if store.remove_repo_settings(&root).await? {
        println!("removed {root}");
        Ok(())
    } else {
        bail!("{root} is not registered");
    }
}

async fn list_repositories() -> Result<()> {
    let store = open_store().await?;
    let all = store.list_repo_settings().await?;
    if all.is_empty() {
        println!("no repositories registered");
        return Ok(());
    }
    for settings in all {
        println!(
            "{}  enabled={} throttle={}s max={}MiB prefix={} excludes={}",
            settings.root,
            settings.enabled,
            settings.throttle_secs,
            settings.max_file_mb,
            settings.branch_prefix,
            settings.excludes.len(),
        );
    }
    Ok(())
}

async fn show_status() -> Result<()> {
    let store = open_store().await?;
    let stats = store.stats().await?;

    let running = hindsight_core::paths::pid_path()
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .map(|pid| unsafe { libc::kill(pid, 0) } == 0)
        .unwrap_or(false);

    println!("engine running: {running}");
    println!("integrity: {}", store.integrity().as_str());
    println!("conversations: {}", stats.conversations);
    println!("messages: {}", stats.messages);
    println!("shadow commits: {}", stats.shadow_commits);
    println!("restore points: {}", stats.restore_points);
    println!(
        "database size: {:.2} MiB",
        store.db_size_bytes() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

async fn test_gate(file: PathBuf) -> Result<()> {
    let store = open_store().await?;
    let resolver = RepoResolver::new();
    let resolved = resolver
        .resolve(&file)
        .await
        .context("file is not inside a git repository")?;
    let root = resolved.root.clone();
    let root_str = root.to_string_lossy().to_string();

    let settings = store
        .repo_settings(&root_str)
        .await?
        .unwrap_or_else(|| RepoSettings::defaults_for(root_str.clone()));

    let abs = if file.is_absolute() {
        file.clone()
    } else {
        std::env::current_dir()?.join(&file)
    };
    let rel = abs
        .strip_prefix(&root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file.clone());

    let gate = Gate::new(&settings);
    // Evaluate as a modify event, so the tracking step gets exercised too.
    let tracked = || async {
        match run_git(
            &root,
            &GitCommand::StatusPorcelain {
                pathspec: Some(rel.to_string_lossy().to_string()),
            },
        )
        .await
        {
            Ok(status) => !status.starts_with("??"),
            Err(_) => false,
        }
    };
    match gate.evaluate(&rel, &abs, false, tracked).await {
        Some(reason) => {
            println!("would skip: {}", reason.as_str());
        }
        None => {
            println!("would commit: {} (throttle {}s)", rel.display(), settings.throttle_secs);
        }
    }
    Ok(())
}
