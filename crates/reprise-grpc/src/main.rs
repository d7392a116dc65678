//! Reprise replay server
//!
//! Serves replay sessions over gRPC, or replays a single exported archive
//! and exits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use reprise::monitor::{CleanupMode, CleanupMonitor, ProcessLiveness, ProcessMonitorSpawner};
use reprise::resource::{ResourceCacheConfig, select_cache};
use reprise::{HostClass, ManifestContext, MemoryArena, MemorySizeCandidates, Orchestrator};
use reprise_grpc::ReplayServer;

/// Reprise - replay captured program states for connected clients
#[derive(Parser, Debug)]
#[command(name = "reprise", version)]
#[command(about = "gRPC server replaying captured program states")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Port to listen on; 0 picks a free port
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// File holding the token clients must send in `auth-token` metadata
    #[arg(long)]
    auth_token_file: Option<PathBuf>,

    /// Cache resources on disk instead of in memory
    #[arg(long)]
    enable_disk_cache: bool,

    /// On-disk cache directory (a fresh temp directory when unset)
    #[arg(long, requires = "enable_disk_cache")]
    disk_cache_path: Option<PathBuf>,

    /// Delete the on-disk cache files once the server exits
    #[arg(long, requires = "enable_disk_cache")]
    cleanup_disk_cache: bool,

    /// Shut down after this many seconds without client messages; 0 disables
    #[arg(long, default_value_t = 0)]
    idle_timeout_sec: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Replay the archive in this directory and exit instead of serving
    #[arg(
        long,
        conflicts_with_all = [
            "port",
            "auth_token_file",
            "enable_disk_cache",
            "idle_timeout_sec",
        ]
    )]
    replay_archive: Option<PathBuf>,

    /// Where archive replay postbacks are written (default: current directory)
    #[arg(long, requires = "replay_archive")]
    postback_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for a server process to exit, then delete its cache files
    #[command(hide = true)]
    CleanupMonitor {
        /// Process to wait for
        #[arg(long)]
        parent_pid: u32,
        /// Directory to clean up
        #[arg(long)]
        path: PathBuf,
        /// What to delete
        #[arg(long)]
        mode: CleanupMode,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&args.log_level))
                .context("invalid --log-level")?,
        )
        .init();

    if let Some(Command::CleanupMonitor {
        parent_pid,
        path,
        mode,
    }) = args.command
    {
        let report = tokio::task::spawn_blocking(move || {
            CleanupMonitor::new(path, mode).run(&mut ProcessLiveness::new(parent_pid))
        })
        .await
        .context("cleanup monitor panicked")?;
        tracing::info!(?report, "cleanup monitor finished");
        return Ok(());
    }

    // Launchers remove the token file shortly after start, so read it first.
    let auth_token = args
        .auth_token_file
        .as_deref()
        .map(read_auth_token)
        .transpose()?;

    let arena = MemoryArena::reserve(&MemorySizeCandidates::for_host(HostClass::current()))
        .context("reserving replay memory")?;
    let context = ManifestContext::new(arena);

    if let Some(archive) = &args.replay_archive {
        return replay_archive(archive, args.postback_dir.as_deref(), context).await;
    }

    let cache_config = ResourceCacheConfig {
        enabled: args.enable_disk_cache,
        cleanup_on_exit: args.cleanup_disk_cache,
        path: args.disk_cache_path.clone(),
    };
    let spawner = ProcessMonitorSpawner::current_exe()
        .context("locating the server binary for the cleanup monitor")?;
    let selection = select_cache(&cache_config, context.arena().capacity(), &spawner);
    tracing::info!(cache = %selection.kind(), dir = ?selection.dir, "resource cache selected");

    let orchestrator = Orchestrator::builder(context)
        .cache(selection.cache)
        .build();

    let mut server = ReplayServer::new(orchestrator)
        .idle_timeout(Duration::from_secs(args.idle_timeout_sec));
    if let Some(token) = auth_token {
        server = server.auth_token(token);
    }

    let bound = server
        .bind(args.port)
        .await
        .with_context(|| format!("binding port {}", args.port))?;
    // Launchers parse this line to find the port.
    println!("Bound on port '{}'", bound.local_addr().port());

    bound.serve().await?;
    Ok(())
}

fn read_auth_token(path: &Path) -> anyhow::Result<String> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("reading auth token from {}", path.display()))?;
    Ok(token.trim_end_matches(['\r', '\n']).to_string())
}

async fn replay_archive(
    archive: &Path,
    postback_dir: Option<&Path>,
    mut context: ManifestContext,
) -> anyhow::Result<()> {
    let postback_dir = match postback_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    tokio::fs::create_dir_all(&postback_dir)
        .await
        .with_context(|| format!("creating {}", postback_dir.display()))?;

    let ok = reprise::replay_archive(archive, &postback_dir, &mut context)
        .await
        .with_context(|| format!("replaying archive {}", archive.display()))?;
    ensure!(ok, "archive replay failed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_version_flag() {
        let err = Args::try_parse_from(["reprise", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_read_auth_token_trims_line_ending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "secret\r\n").unwrap();
        assert_eq!(read_auth_token(&path).unwrap(), "secret");
    }

    #[test]
    fn test_read_auth_token_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_auth_token(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("reading auth token"));
    }
}
