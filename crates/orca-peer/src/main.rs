//! Orca - P2P file sharing node

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orca_core::{ContentKey, TcpTransport};
use orca_dht::Overlay;
use orca_peer::{network, server, Config, ConfirmationGate, NameIndex, ServerState, TransferClient, Wallet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "orca")]
#[command(about = "Peer-to-peer file sharing node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.orca/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Overlay bootstrap peer, host:port (overrides config, repeatable)
    #[arg(short, long, global = true)]
    bootstrap: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the data directory
    Init,

    /// Join the overlay and serve files to peers
    Serve {
        /// HTTP transfer address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Overlay RPC address (overrides config)
        #[arg(long)]
        listen_addr: Option<String>,

        /// Accept every transfer without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Request a file from a peer
    Get {
        /// Peer HTTP address, host:port
        addr: String,
        /// File name or hex content key
        name: String,
        /// Ask the peer for framed chunks of this size
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Ask a peer to store a file
    Store {
        /// Peer HTTP address, host:port
        addr: String,
        /// Local file to send
        path: PathBuf,
    },

    /// Locate content in the overlay, pick the cheapest holder and fetch it
    Fetch {
        /// Hex content key
        key: String,
        /// Seconds to wait for holders to answer
        #[arg(short, long, default_value = "5")]
        wait: u64,
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Publish a raw value in the overlay
    PutKey { key: String, value: String },

    /// Print every value found under a key
    GetKey {
        key: String,
        #[arg(short, long, default_value = "5")]
        wait: u64,
    },

    /// Pay a peer
    Send {
        /// Peer HTTP address, host:port
        addr: String,
        price: f64,
        /// Receiving wallet id
        receiver: String,
    },

    /// Print the content key of a file
    Hash { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if !cli.bootstrap.is_empty() {
        config.overlay.bootstrap_nodes = cli.bootstrap.clone();
    }

    match cli.command {
        Commands::Init => init(&config, &config_path)?,
        Commands::Serve {
            http_addr,
            listen_addr,
            yes,
        } => {
            if let Some(addr) = http_addr {
                config.transfer.http_addr = addr;
            }
            if let Some(addr) = listen_addr {
                config.overlay.listen_addr = addr;
            }
            serve(&config, yes).await?;
        }
        Commands::Get {
            addr,
            name,
            chunk_size,
        } => {
            let client = transfer_client(&config)?;
            let path = client.request_file(&addr, &name, chunk_size).await?;
            println!("Saved: {}", path.display());
        }
        Commands::Store { addr, path } => {
            let client = transfer_client(&config)?;
            let key = client.store_file(&addr, &path).await?;
            println!("Stored: {}", key);
        }
        Commands::Fetch {
            key,
            wait,
            chunk_size,
        } => fetch(&config, &key, Duration::from_secs(wait), chunk_size).await?,
        Commands::PutKey { key, value } => {
            let overlay = join_transient(&config).await?;
            overlay.put_value(&key, &value).await?;
            println!("Published {} = {} ({} peers known)", key, value, overlay.peer_count());
        }
        Commands::GetKey { key, wait } => {
            let overlay = join_transient(&config).await?;
            let values = overlay
                .search_value(&key)
                .collect_within(Duration::from_secs(wait))
                .await;
            if values.is_empty() {
                println!("No values found for '{}'", key);
            }
            for value in values {
                println!("{}", value);
            }
        }
        Commands::Send {
            addr,
            price,
            receiver,
        } => {
            ensure_data_dir(&config)?;
            let wallet = Wallet::load_or_generate(&config.wallet_key_path())?;
            let client = transfer_client(&config)?;
            let status = client.send_transaction(&addr, &wallet, price, &receiver).await?;
            println!("Transaction {}", status.status);
        }
        Commands::Hash { path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            println!("{}", ContentKey::of(&bytes));
        }
    }

    Ok(())
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn ensure_data_dir(config: &Config) -> Result<()> {
    for dir in [
        config.data_dir(),
        config.store_dir(),
        config.transactions_dir(),
        config.requested_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

fn init(config: &Config, config_path: &Path) -> Result<()> {
    ensure_data_dir(config)?;

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
    } else {
        config.save(config_path)?;
        println!("Wrote config: {}", config_path.display());
    }

    let wallet = Wallet::load_or_generate(&config.wallet_key_path())?;
    orca_core::Keypair::load_or_generate(&config.node_key_path())?;

    println!("Initialized Orca at: {}", config.data_dir().display());
    println!("Wallet id: {}", wallet.id());
    Ok(())
}

fn transfer_client(config: &Config) -> Result<TransferClient> {
    ensure_data_dir(config)?;
    let names = NameIndex::open(&config.names_db())?;
    Ok(TransferClient::new(
        &config.requested_dir(),
        names,
        config.request_timeout(),
    )?)
}

/// Join the overlay for a one-shot command
///
/// Uses an ephemeral port and identity so it can run next to `orca serve`.
async fn join_transient(config: &Config) -> Result<Overlay> {
    let mut overlay_config = config.overlay_config()?;
    overlay_config.listen_addr = "0.0.0.0:0".parse()?;
    overlay_config.advertise_addr = None;
    overlay_config.identity_path = None;

    if overlay_config.bootstrap_nodes.is_empty() {
        tracing::warn!("No bootstrap peers configured, only local records are visible");
    }
    let (overlay, _discovery) = Overlay::join(overlay_config, Arc::new(TcpTransport::new())).await?;
    Ok(overlay)
}

async fn fetch(config: &Config, key: &str, wait: Duration, chunk_size: Option<usize>) -> Result<()> {
    let key: ContentKey = key.parse()?;
    let overlay = join_transient(config).await?;

    let holders = network::locate_content(&overlay, &key, wait).await;
    if holders.is_empty() {
        bail!("No holders found for {}", key);
    }
    println!("Found {} holder(s)", holders.len());

    let client = Arc::new(transfer_client(config)?);
    let quotes = network::collect_quotes(client.clone(), key, holders);
    let Some(quote) = network::select_quote(quotes).await else {
        bail!("No holder of {} answered with a quote", key);
    };
    println!(
        "Best quote: {} for {} bytes from {}",
        quote.price, quote.size, quote.address
    );

    let path = client
        .request_file(&quote.address, &key.to_hex(), chunk_size)
        .await?;
    println!("Saved: {}", path.display());
    Ok(())
}

async fn serve(config: &Config, auto_accept: bool) -> Result<()> {
    ensure_data_dir(config)?;

    let (gate, requests) = ConfirmationGate::new(config.confirm_timeout());
    let gate = Arc::new(gate);
    if auto_accept {
        gate.auto_answer(requests, true);
    } else {
        tokio::spawn(operator_loop(gate.clone(), requests));
    }

    let (stored_tx, mut stored_rx) = mpsc::unbounded_channel();
    let mut state = ServerState::open(config, gate)?;
    state.on_stored = Some(stored_tx);
    let state = Arc::new(state);

    let (bound, _server) = server::spawn(&config.transfer.http_addr, state.clone()).await?;
    let public = state.public_addr();
    if bound.ip().is_unspecified() {
        tracing::warn!("Advertising {} for wildcard bind {}", public, bound);
    }

    let (overlay, discovery) =
        Overlay::join(config.overlay_config()?, Arc::new(TcpTransport::new())).await?;

    let keys: Vec<ContentKey> = state.store.list().into_iter().map(|(key, _)| key).collect();
    network::publish_all(&overlay, &keys, &public).await;

    println!("Serving files on {} (overlay {})", public, overlay.address());
    println!("Wallet id: {}", state.wallet.id());
    println!("Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(key) = stored_rx.recv() => {
                if let Err(e) = network::publish_content(&overlay, &key, &public).await {
                    tracing::warn!("Failed to publish {}: {}", key, e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    discovery.shutdown().await;
    Ok(())
}

/// Print confirmation prompts and answer them from stdin
///
/// A line is `yes`/`no` for the oldest pending request, or `<id> yes`/`<id> no`.
async fn operator_loop(
    gate: Arc<ConfirmationGate>,
    mut requests: mpsc::UnboundedReceiver<orca_peer::ConfirmationRequest>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(request) = requests.recv() => println!("{}", request),
            line = lines.next_line() => match line {
                Ok(Some(line)) => answer_line(&gate, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }
    tracing::warn!("Operator input closed, further transfers will be declined");
}

fn answer_line(gate: &ConfirmationGate, line: &str) {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (id, word) = match words.as_slice() {
        [] => return,
        [word] => match gate.pending().first() {
            Some(request) => (request.id, *word),
            None => {
                println!("Nothing is waiting for an answer");
                return;
            }
        },
        [id, word, ..] => match id.trim_start_matches('[').trim_end_matches(']').parse() {
            Ok(id) => (id, *word),
            Err(_) => {
                println!("Expected '<id> yes' or '<id> no'");
                return;
            }
        },
    };

    let accept = match word.to_ascii_lowercase().as_str() {
        "yes" | "y" => true,
        "no" | "n" => false,
        _ => {
            println!("Please answer yes or no");
            return;
        }
    };
    if !gate.answer(id, accept) {
        println!("Request {} is no longer pending", id);
    }
}
