use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tunfilter::config::{ConfigError, Configuration};
use tunfilter::filter::{FsSourceOpener, RebuildTask, RuleDatabase, RuleError, RuleSource, spawn_rebuild};
use tunfilter::tunnel::{FdInterfaceProvider, InterfaceProvider, STATUS_CAPACITY, TunnelHandle, TunnelOptions};

#[derive(Parser)]
#[command(name = "tunfilter")]
#[command(about = "DNS ad blocker running behind a tun interface", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Filter DNS traffic arriving on an already configured tun descriptor
    Run(RunArgs),
    /// Load the configured host lists and report what would be blocked
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON configuration file
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Open tun descriptor inherited from the parent process
    #[arg(long, value_name = "FD")]
    tun_fd: RawFd,

    /// Directory holding downloaded host lists
    #[arg(long, value_name = "PATH", default_value = "/var/cache/tunfilter")]
    cache_dir: PathBuf,

    /// Forward queries to the address the client used instead of mapping aliases
    #[arg(long)]
    no_translation: bool,

    /// Routing mark applied to upstream sockets
    #[arg(long, value_name = "MARK")]
    fwmark: Option<u32>,
}

#[derive(Args)]
struct CheckArgs {
    /// JSON configuration file
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Directory holding downloaded host lists
    #[arg(long, value_name = "PATH", default_value = "/var/cache/tunfilter")]
    cache_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Rules(#[from] RuleError),

    #[error("invalid tun descriptor {0}")]
    InvalidDescriptor(RawFd),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Check(args) => check(args),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("TUNFILTER_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

/// Sources to load for `config`; none when host filtering is off.
fn host_sources(config: &Configuration) -> Vec<RuleSource> {
    if !config.hosts.enabled {
        return Vec::new();
    }
    config.hosts.items.iter().map(RuleSource::from).collect()
}

fn start_rebuild(rules: &Arc<RuleDatabase>, config: &Configuration, cache_dir: &Path) -> RebuildTask {
    spawn_rebuild(Arc::clone(rules), host_sources(config), FsSourceOpener::new(cache_dir))
}

fn report_rebuild(task: RebuildTask) {
    match task.join() {
        Ok(report) => {
            info!(hosts = report.hosts, "block list loaded");
            for err in report.errors {
                warn!(error = %err, "skipped host source");
            }
        }
        Err(RuleError::Interrupted) => info!("block list reload interrupted"),
        Err(err) => error!(error = %err, "cannot load block list"),
    }
}

fn lock<P: InterfaceProvider>(tunnel: &Mutex<TunnelHandle<P>>) -> MutexGuard<'_, TunnelHandle<P>> {
    tunnel.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Restart the worker with `config` on the blocking pool, since stopping
/// the old worker waits for its thread.
fn spawn_reconnect<P: InterfaceProvider>(
    tunnel: &Arc<Mutex<TunnelHandle<P>>>,
    config: Configuration,
) -> tokio::task::JoinHandle<()> {
    let tunnel = Arc::clone(tunnel);
    tokio::task::spawn_blocking(move || {
        let mut tunnel = lock(&tunnel);
        tunnel.set_config(config);
        tunnel.reconnect();
    })
}

fn run(args: RunArgs) -> Result<(), CliError> {
    if args.tun_fd < 0 {
        return Err(CliError::InvalidDescriptor(args.tun_fd));
    }
    let mut config = Configuration::load(&args.config)?;

    let rules = Arc::new(RuleDatabase::new());
    let mut rebuild = Some(start_rebuild(&rules, &config, &args.cache_dir));

    // SAFETY: the descriptor is handed to us by the parent and owned from here on.
    let fd = unsafe { OwnedFd::from_raw_fd(args.tun_fd) };
    let provider = FdInterfaceProvider::new(fd).with_fwmark(args.fwmark);

    let (status_tx, mut status_rx) = mpsc::channel(STATUS_CAPACITY);
    let mut handle = TunnelHandle::new(provider, config.clone(), Arc::clone(&rules), status_tx)
        .with_options(TunnelOptions {
            translate: !args.no_translation,
        });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    handle.start();
    let tunnel = Arc::new(Mutex::new(handle));
    let result = runtime.block_on(async {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Some(status) = status_rx.recv() => info!(%status, "tunnel status"),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    info!("terminated, shutting down");
                    break;
                }
                _ = hangup.recv() => {
                    info!(path = %args.config.display(), "reloading configuration");
                    match Configuration::load(&args.config) {
                        Ok(next) => config = next,
                        Err(err) => {
                            error!(error = %err, "keeping previous configuration");
                            continue;
                        }
                    }
                    if let Some(previous) = rebuild.take() {
                        previous.cancel();
                    }
                    rebuild = Some(start_rebuild(&rules, &config, &args.cache_dir));
                    let _ = spawn_reconnect(&tunnel, config.clone());
                }
                _ = tick.tick() => {
                    if rebuild.as_ref().is_some_and(RebuildTask::is_finished) {
                        if let Some(task) = rebuild.take() {
                            report_rebuild(task);
                        }
                    }
                }
            }
        }
        Ok::<(), CliError>(())
    });

    if !lock(&tunnel).stop() {
        warn!("tunnel thread did not exit in time");
    }
    if let Some(task) = rebuild.take() {
        task.cancel();
        report_rebuild(task);
    }
    result
}

fn check(args: CheckArgs) -> Result<(), CliError> {
    let config = Configuration::load(&args.config)?;
    let rules = RuleDatabase::new();
    let opener = FsSourceOpener::new(&args.cache_dir);

    let report = rules.rebuild_from_config(&config, &opener, &AtomicBool::new(false))?;
    println!("{} blocked hosts", report.hosts);
    for err in &report.errors {
        println!("skipped: {err}");
    }

    let servers: Vec<&str> = config.allowed_dns_servers().map(|item| item.location.as_str()).collect();
    if !servers.is_empty() {
        println!("custom DNS servers: {}", servers.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunfilter::tunnel::{ChannelDevice, ChannelProvider, TunnelStatus};

    async fn wait_for(status_rx: &mut mpsc::Receiver<TunnelStatus>, wanted: TunnelStatus) -> Vec<TunnelStatus> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = status_rx.recv().await {
                seen.push(status);
                if status == wanted {
                    return;
                }
            }
        })
        .await
        .expect("status never arrived");
        seen
    }

    #[test]
    fn host_sources_follow_enabled_flag() {
        let mut config = Configuration::default();
        config.hosts.items = vec![tunfilter::config::Item::new(
            "ads",
            "ads.example.com",
            tunfilter::config::ItemState::Deny,
        )];

        assert!(host_sources(&config).is_empty());
        config.hosts.enabled = true;
        assert_eq!(host_sources(&config).len(), 1);
    }

    #[tokio::test]
    async fn reconnect_leaves_status_loop_responsive() {
        let (device, _peer) = ChannelDevice::pair(4);
        let provider = ChannelProvider::new(device, vec!["127.0.0.1".parse().unwrap()]);
        let (status_tx, mut status_rx) = mpsc::channel(STATUS_CAPACITY);
        let mut handle = TunnelHandle::new(provider, Configuration::default(), Arc::new(RuleDatabase::new()), status_tx);
        handle.start();
        let tunnel = Arc::new(Mutex::new(handle));
        wait_for(&mut status_rx, TunnelStatus::Running).await;

        let reconnect = spawn_reconnect(&tunnel, Configuration::default());

        // statuses are received while the old worker is being joined
        let seen = wait_for(&mut status_rx, TunnelStatus::Stopped).await;
        assert!(seen.contains(&TunnelStatus::Reconnecting));
        tokio::time::timeout(Duration::from_secs(5), reconnect)
            .await
            .unwrap()
            .unwrap();
        assert!(lock(&tunnel).is_running());
        assert!(lock(&tunnel).stop());
    }
}
