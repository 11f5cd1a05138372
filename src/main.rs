mod cli;

use anyhow::{bail, Context, Result};
use cli::{Cli, Commands};
use handoff::network::Bind;
use handoff::pairing::PairingCode;
use handoff::store::{DirStore, TransferFilter};
use handoff::{DestinationSession, SessionState, SourceSession, TransferConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let bind = match cli.address {
        Some(ip) => Bind::Address(ip),
        None => config.bind(),
    };

    let state = match cli.command {
        Commands::Send {
            store,
            user,
            conversations,
            since,
        } => {
            let filter = TransferFilter {
                conversations: (!conversations.is_empty())
                    .then(|| conversations.into_iter().collect()),
                earliest_created_at: since,
            };
            send(store, user, filter, bind, config).await?
        }
        Commands::Receive {
            store,
            user,
            host,
            port,
            code,
        } => receive(store, user, host, port, code, bind, config).await?,
    };

    match state {
        SessionState::Closed => Ok(()),
        SessionState::Failed(reason) => bail!("transfer failed: {reason}"),
        other => bail!("session stopped while {other}"),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "handoff=debug" } else { "handoff=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<TransferConfig> {
    let mut config = match &cli.config {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TransferConfig::default(),
    };
    if let Some(after) = cli.slow_consumer_after {
        config.slow_consumer_after = after;
    }
    if let Some(name) = &cli.interface {
        config.interface = Some(name.clone());
    }
    config.validate().context("invalid transfer settings")?;
    Ok(config)
}

fn open_store(path: &Path) -> Result<Arc<DirStore>> {
    let store = DirStore::open(path)
        .with_context(|| format!("failed to open store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn send(
    store: PathBuf,
    user: String,
    filter: TransferFilter,
    bind: Bind,
    config: TransferConfig,
) -> Result<SessionState> {
    let store = open_store(&store)?;
    let mut session = SourceSession::new(user, store, config).with_filter(filter);
    let states = session.subscribe();
    let advert = session
        .prepare(&bind)
        .await
        .context("failed to start listening")?;

    println!("Handoff - Send Account");
    println!("═══════════════════════════════════════");
    println!("Host:         {}", advert.addr.ip());
    println!("Port:         {}", advert.addr.port());
    println!("Pairing code: \x1b[1;32m{}\x1b[0m", advert.code);
    println!("Waiting for the other device...");
    println!();

    let follower = follow(states);
    let state = session.run().await;
    let _ = follower.await;
    Ok(state)
}

async fn receive(
    store: PathBuf,
    user: String,
    host: IpAddr,
    port: u16,
    code: u32,
    bind: Bind,
    config: TransferConfig,
) -> Result<SessionState> {
    let store = open_store(&store)?;
    let remote = SocketAddr::new(host, port);

    println!("Handoff - Receive Account");
    println!("═══════════════════════════════════════");
    println!("Connecting to {remote}...");
    println!();

    let mut session = DestinationSession::new(user, PairingCode::from(code), remote, store, config);
    let states = session.subscribe();
    session
        .prepare(&bind)
        .context("failed to prepare connection")?;

    let follower = follow(states);
    let state = session.run().await;
    let _ = follower.await;
    Ok(state)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Render session state until it becomes terminal
fn follow(mut states: watch::Receiver<SessionState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(0);
        pb.set_style(bar_style());
        pb.enable_steady_tick(Duration::from_millis(100));
        loop {
            let state = states.borrow_and_update().clone();
            match state {
                SessionState::Preparing | SessionState::Ready => pb.set_message("waiting for peer"),
                SessionState::Connected => pb.set_message("pairing"),
                SessionState::Transporting { processed, total } => {
                    pb.set_message("transferring");
                    pb.set_length(total);
                    pb.set_position(processed);
                }
                SessionState::Closed => {
                    pb.finish_with_message("✓ transfer complete");
                    return;
                }
                SessionState::Failed(reason) => {
                    pb.abandon_with_message(format!("✗ {reason}"));
                    return;
                }
            }
            if states.changed().await.is_err() {
                pb.abandon();
                return;
            }
        }
    })
}
