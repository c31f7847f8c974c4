use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use peerledger::client::LedgerClient;
use peerledger::config::NodeConfig;
use peerledger::gateway::{self, GatewayState};
use peerledger::network::TcpHost;
use peerledger::node::Node;
use peerledger::reconcile::sync_new_entries;
use peerledger::seeds::SeedRegistry;
use peerledger::storage::open_with_retry;
use peerledger::types::Transaction;

#[derive(Parser)]
#[command(name = "peerledger", about = "Peer-to-peer account ledger node and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node until interrupted
    Node {
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        master: Option<PathBuf>,
        #[arg(long)]
        seed_file: Option<PathBuf>,
        #[arg(long)]
        keep_local_store: bool,
    },
    /// Ask a node to create a new zero-balance account
    CreateAccount {
        #[arg(long)]
        peer: String,
    },
    /// Query the balance of an address
    Balance {
        #[arg(long)]
        peer: String,
        address: String,
    },
    /// Transfer funds between two accounts
    Send {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: Decimal,
        /// Sender's secret key, carried as the transaction signature
        #[arg(long)]
        secret: String,
    },
    /// Look up a transaction by hash
    GetTrans {
        #[arg(long)]
        peer: String,
        hash: String,
    },
    /// Serve the HTTP gateway, forwarding to one node
    Gateway {
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Node to forward to; a random active seed node when omitted
        #[arg(long)]
        peer: Option<String>,
        #[arg(long)]
        seed_file: Option<PathBuf>,
    },
    /// Merge the master's account list into a local store
    Reconcile {
        #[arg(long)]
        master: PathBuf,
        #[arg(long)]
        local: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::from_env();
    let host = TcpHost::new(config.connect_timeout);

    match cli.command {
        Command::Node {
            listen,
            data_dir,
            master,
            seed_file,
            keep_local_store,
        } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(master) = master {
                config.master_path = master;
            }
            if let Some(seed_file) = seed_file {
                config.seed_file = seed_file;
            }
            config.keep_local_store |= keep_local_store;

            let node = Node::start(config).await?;
            if let Some(key) = node.funded_account() {
                println!("Genesis account {} funded; secret key {}", key.address, key.secret_hex);
            }
            println!("Node {} listening on {}", node.node_id(), node.local_addr());
            node.run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
            })
            .await?;
        }
        Command::CreateAccount { peer } => {
            let account = LedgerClient::new(&host, peer).create_account().await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Command::Balance { peer, address } => {
            let balance = LedgerClient::new(&host, peer).balance(&address).await?;
            println!("{address}: {balance}");
        }
        Command::Send {
            peer,
            from,
            to,
            amount,
            secret,
        } => {
            let tx = Transaction::new(from, to, amount, secret);
            LedgerClient::new(&host, peer).send(&tx).await?;
            println!("Transaction {} accepted", tx.hash);
        }
        Command::GetTrans { peer, hash } => {
            let tx = LedgerClient::new(&host, peer).transaction(&hash).await?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
        }
        Command::Gateway {
            listen,
            peer,
            seed_file,
        } => {
            let peer = match peer {
                Some(peer) => peer,
                None => {
                    let seeds = SeedRegistry::new(
                        seed_file.unwrap_or(config.seed_file),
                        config.max_seed_nodes,
                    );
                    gateway::choose_peer(&host, &seeds).await?
                }
            };
            let state = Arc::new(GatewayState::new(Arc::new(host), peer));
            gateway::serve(listen.unwrap_or(config.gateway_addr), state).await?;
        }
        Command::Reconcile { master, local } => {
            let master = open_with_retry(&master, config.store_retry_interval).await?;
            let local = open_with_retry(&local, config.store_retry_interval).await?;
            let merged = sync_new_entries(&master, &local)?;
            println!("Local store now lists {merged} accounts");
        }
    }

    Ok(())
}
