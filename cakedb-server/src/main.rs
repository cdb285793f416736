//! CakeDB peer server
//!
//! Hosts a revision store that CakeDB instances replicate with over HTTP.

use anyhow::{Context, Result, anyhow};
use cakedb_core::{RevisionStore, SqliteRevisionStore};
use cakedb_peer::{PeerAuth, PeerServer};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cakedb-server")]
#[command(version = "0.1.0")]
#[command(about = "Revision store endpoint for CakeDB replication", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:5984)
        #[arg(short, long, default_value = "0.0.0.0:5984")]
        addr: String,

        /// Revision store file served to peers
        #[arg(short, long, default_value = "./data/peer.db")]
        store: PathBuf,

        /// Require HTTP basic auth as user:password
        #[arg(long)]
        auth: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { addr, store, auth, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let auth = match auth {
                Some(credentials) => Some(
                    PeerAuth::parse(&credentials).ok_or_else(|| anyhow!("--auth must be user:password"))?,
                ),
                None => None,
            };

            let revision_store = SqliteRevisionStore::open(&store)
                .with_context(|| format!("Failed to open revision store {:?}", store))?;
            info!(
                "Serving revision store {:?} (uuid {}, {} revisions)",
                store,
                revision_store.uuid().await?,
                revision_store.last_seq().await?
            );
            let revision_store = Arc::new(revision_store);
            let server = Arc::new(PeerServer::new(revision_store.clone(), auth));

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;

            let (stop, stopped) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    stop.send_replace(true);
                }
            });

            server.serve(listener, stopped).await?;
            revision_store.close().await?;
        }
    }

    Ok(())
}
