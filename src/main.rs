//! peerdock - remote container hosts over peer-to-peer links
//!
//! Saved Connections live in the bookmark store. `ps`, `exec` and `attach`
//! take either a topic key or the id/alias of a saved Connection, join it
//! through the relay and talk to whichever host answers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerdock::{
    config::ClientConfig,
    correlator::{CommandOptions, Expect},
    events::ClientEvent,
    manager::ConnectionManager,
    protocol::BroadcastKind,
    registry::{connection_id_for, validate_alias, validate_topic_key},
    remote::Remote,
    session::{EmulatorFactory, NullEmulatorFactory, SessionState},
    store::{Bookmark, BookmarkStore},
    terminal,
    transport::ws::RelayDiscovery,
};

/// Byte that ends an `attach` session locally (Ctrl-]).
const DETACH_KEY: u8 = 0x1d;

#[derive(ClapParser, Debug)]
#[command(name = "peerdock", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $XDG_CONFIG_HOME/peerdock/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// WebSocket relay base URL
    #[arg(long, global = true, env = "PEERDOCK_RELAY")]
    relay: Option<String>,

    /// Seconds to wait for a host to answer on the topic
    #[arg(long, global = true, default_value_t = 30)]
    connect_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List saved connections
    Bookmarks,

    /// Save a connection
    Add {
        /// Hex topic key
        topic: String,

        #[arg(long)]
        alias: Option<String>,
    },

    /// Forget a saved connection by id or alias
    Remove { target: String },

    /// List containers on a host
    Ps {
        /// Topic key, or id/alias of a saved connection
        target: String,

        /// Include stopped containers
        #[arg(short, long)]
        all: bool,
    },

    /// Run one command and print the correlated response
    Exec {
        target: String,

        /// Command name, e.g. startContainer
        command: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Resolve on the first response containing this text
        #[arg(long, conflicts_with = "expect_type")]
        expect: Option<String>,

        /// Resolve on the first typed envelope of this kind
        #[arg(long)]
        expect_type: Option<String>,

        /// Deadline in milliseconds (defaults to the configured long timeout)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Attach the local terminal to a container shell (Ctrl-] detaches)
    Attach {
        target: String,

        /// Container or exec id
        container: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // stdout belongs to command output (and to the remote shell in attach).
    init_tracing_stderr();

    let mut config = ClientConfig::load_or_default(cli.config.as_deref())?;
    if let Some(relay) = cli.relay.clone() {
        config.relay = Some(relay);
    }
    let connect_timeout = Duration::from_secs(cli.connect_timeout);

    match cli.command {
        Commands::Bookmarks => list_bookmarks(&config),
        Commands::Add { topic, alias } => add_bookmark(&config, &topic, alias.as_deref()),
        Commands::Remove { target } => remove_bookmark(&config, &target),
        Commands::Ps { target, all } => {
            let (manager, remote) =
                connect(&config, &target, Arc::new(NullEmulatorFactory), connect_timeout).await?;
            let result = run_ps(&remote, all, connect_timeout).await;
            manager.shutdown();
            result
        }
        Commands::Exec {
            target,
            command,
            args,
            expect,
            expect_type,
            timeout_ms,
        } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;
            let expect = match (expect, expect_type) {
                (Some(fragment), _) => Expect::Fragment(fragment),
                (None, Some(kind)) => Expect::Type(kind),
                (None, None) => Expect::Any,
            };
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(config.long_timeout_ms));
            let (manager, _remote) =
                connect(&config, &target, Arc::new(NullEmulatorFactory), connect_timeout).await?;
            let result = manager
                .execute(&command, args, CommandOptions::new(expect, timeout))
                .await;
            manager.shutdown();
            let response = result.map_err(|e| anyhow!("{} ({})", e, e.code()))?;
            match response.message() {
                Some(message) if response.envelope.data.is_null() => println!("{message}"),
                _ => println!("{}", serde_json::to_string_pretty(&response.envelope)?),
            }
            Ok(())
        }
        Commands::Attach { target, container } => {
            let (manager, remote) = connect(
                &config,
                &target,
                Arc::new(terminal::StdoutEmulatorFactory),
                connect_timeout,
            )
            .await?;
            let result = run_attach(&manager, &remote, &container).await;
            manager.shutdown();
            result
        }
    }
}

/// Initialize tracing with stderr output.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "peerdock=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn bookmark_store(config: &ClientConfig) -> anyhow::Result<BookmarkStore> {
    let dir = config
        .resolved_data_dir()
        .ok_or_else(|| anyhow!("no data directory; set data_dir in the config file"))?;
    Ok(BookmarkStore::on_disk(&dir, config.bookmark_inline_limit))
}

// ── Bookmarks ──────────────────────────────────────────────────────

fn list_bookmarks(config: &ClientConfig) -> anyhow::Result<()> {
    let bookmarks = bookmark_store(config)?.load()?;
    if bookmarks.is_empty() {
        println!("no saved connections");
        return Ok(());
    }
    println!("{:<14} {}", "ID", "ALIAS");
    for bookmark in bookmarks {
        println!(
            "{:<14} {}",
            connection_id_for(&bookmark.topic_key),
            bookmark.alias.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn add_bookmark(config: &ClientConfig, topic: &str, alias: Option<&str>) -> anyhow::Result<()> {
    validate_topic_key(topic).map_err(|e| anyhow!(e))?;
    if let Some(alias) = alias {
        validate_alias(alias).map_err(|e| anyhow!(e))?;
    }
    let store = bookmark_store(config)?;
    let mut bookmarks = store.load()?;
    let id = connection_id_for(topic);
    if bookmarks.iter().any(|b| connection_id_for(&b.topic_key) == id) {
        bail!("connection {id} is already saved");
    }
    bookmarks.push(Bookmark::new(&topic.to_lowercase(), alias));
    store.save(&bookmarks)?;
    println!("{id}");
    Ok(())
}

fn remove_bookmark(config: &ClientConfig, target: &str) -> anyhow::Result<()> {
    let store = bookmark_store(config)?;
    let mut bookmarks = store.load()?;
    let before = bookmarks.len();
    bookmarks.retain(|b| !matches_bookmark(b, target));
    if bookmarks.len() == before {
        bail!("no saved connection matches {target}");
    }
    store.save(&bookmarks)?;
    Ok(())
}

fn matches_bookmark(bookmark: &Bookmark, target: &str) -> bool {
    connection_id_for(&bookmark.topic_key) == target.to_lowercase()
        || bookmark.alias.as_deref() == Some(target)
}

/// A raw topic key, or the topic of the saved connection named by `target`.
fn resolve_target(config: &ClientConfig, target: &str) -> anyhow::Result<(String, Option<String>)> {
    if let Ok(store) = bookmark_store(config) {
        if let Some(bookmark) = store
            .load()
            .unwrap_or_default()
            .into_iter()
            .find(|b| matches_bookmark(b, target))
        {
            return Ok((bookmark.topic_key, bookmark.alias));
        }
    }
    validate_topic_key(target).map_err(|e| anyhow!("{target}: not a saved connection and {e}"))?;
    Ok((target.to_string(), None))
}

// ── Live commands ──────────────────────────────────────────────────

/// Join the target's topic and wait for a host to become the active peer.
async fn connect(
    config: &ClientConfig,
    target: &str,
    emulators: Arc<dyn EmulatorFactory>,
    wait: Duration,
) -> anyhow::Result<(ConnectionManager, Arc<Remote>)> {
    let relay = config
        .relay
        .as_deref()
        .ok_or_else(|| anyhow!("no relay configured; pass --relay or set PEERDOCK_RELAY"))?;
    let discovery = RelayDiscovery::new(relay).map_err(|e| anyhow!(e))?;
    let (topic, alias) = resolve_target(config, target)?;

    let manager = ConnectionManager::builder(Arc::new(discovery))
        .settings(config.manager_settings())
        .emulators(emulators)
        .build();

    let mut events = manager.subscribe();
    let id = manager.add_connection(&topic, alias.as_deref())?;
    tracing::info!(connection = %id, "waiting for host");

    tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connected { connection_id }) if connection_id == id => return Ok(()),
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(anyhow!(e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no host answered on {id} within {}s", wait.as_secs()))??;

    let remote = manager
        .remote(&id)
        .ok_or_else(|| anyhow!("connection {id} vanished"))?;
    Ok((manager, remote))
}

async fn run_ps(remote: &Remote, all: bool, wait: Duration) -> anyhow::Result<()> {
    let listings = remote.listings();
    // The manager requested a listing on connect; wait for it.
    listings
        .wait_for(&BroadcastKind::Containers, wait)
        .await
        .ok_or_else(|| anyhow!("host sent no container listing"))?;

    println!("{:<14} {:<24} {:<28} {}", "CONTAINER", "NAME", "IMAGE", "STATUS");
    for c in listings.containers().into_iter().filter(|c| all || c.is_running()) {
        let short: String = c.id.chars().take(12).collect();
        println!(
            "{:<14} {:<24} {:<28} {}",
            short,
            c.name.as_deref().unwrap_or("-"),
            c.image.as_deref().unwrap_or("-"),
            c.status.as_deref().or(c.state.as_deref()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_attach(manager: &ConnectionManager, remote: &Remote, container: &str) -> anyhow::Result<()> {
    let mux = remote.mux();
    let mut events = manager.subscribe();
    let _raw = terminal::RawModeGuard::new()?;

    mux.open(container, container)?;
    if let Ok(size) = terminal::terminal_size() {
        mux.resize(container, size)?;
    }

    // Channel for stdin data from the blocking reader
    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut sigwinch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    loop {
        tokio::select! {
            data = stdin_rx.recv() => {
                let Some(data) = data else { break };
                if let Some(pos) = data.iter().position(|&b| b == DETACH_KEY) {
                    if pos > 0 {
                        mux.input(container, &data[..pos])?;
                    }
                    break;
                }
                mux.input(container, &data)?;
            }
            _ = sigwinch.recv() => {
                if let Ok(size) = terminal::terminal_size() {
                    mux.resize(container, size)?;
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::SessionChanged { session_id, state: SessionState::Closed, .. })
                    if session_id == container => break,
                Ok(ClientEvent::Disconnected { connection_id })
                    if connection_id == remote.connection_id() => break,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            },
        }
    }

    mux.kill(container);
    Ok(())
}
