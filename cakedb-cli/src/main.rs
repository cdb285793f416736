//! cakedb: operator tool for CakeDB databases.
//!
//! # Usage
//!
//! ```bash
//! # Run the startup sequence (sync, recover, migrate) and exit
//! cakedb init --config cakedb.json
//!
//! # Execute one statement through the captured path
//! cakedb exec --config cakedb.json --sql "insert into todo (title) values (?)" --param hello
//!
//! # One-shot replication with every configured peer
//! cakedb sync --config cakedb.json
//!
//! # Inspect the revision log (with --config, the checkpoint is marked)
//! cakedb log --revision-db revision.db --since 1700000000000
//! cakedb log --config cakedb.json
//!
//! # Show the recovery checkpoint
//! cakedb checkpoint --config cakedb.json
//!
//! # Todo demo: concurrent inserts
//! cakedb demo --config cakedb.json --rows 100
//! ```

mod revision_log;

use anyhow::{Context, Result, bail};
use cakedb_core::{CakeConfig, CakeDb, Revision, RevisionLog};
use clap::{Parser, Subcommand};
use rusqlite::types::Value;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "cakedb")]
#[command(version = "0.1.0")]
#[command(about = "Recoverable, replicated SQLite via a revision log")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the database, run the startup sequence, then close
    Init {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Execute one statement through the captured path
    Exec {
        #[arg(short, long)]
        config: PathBuf,
        /// SQL with `?` placeholders
        #[arg(long)]
        sql: String,
        /// Text values bound to the placeholders, in order
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// One-shot replication with every configured peer
    Sync {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print committed revisions
    Log {
        /// Revision store file
        #[arg(long, conflicts_with = "config", required_unless_present = "config")]
        revision_db: Option<PathBuf>,
        /// Read the log and checkpoint of a configured database instead
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Only revisions committed after this time (ms since epoch)
        #[arg(long, default_value_t = 1)]
        since: i64,
    },

    /// Print the current recovery checkpoint
    Checkpoint {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Insert demo rows into the `todo` table concurrently
    Demo {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 100)]
        rows: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive("cakedb=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Init { config } => cmd_init(&config).await,
        Commands::Exec { config, sql, params } => cmd_exec(&config, &sql, params).await,
        Commands::Sync { config } => cmd_sync(&config).await,
        Commands::Log { revision_db, config, since } => {
            cmd_log(revision_db.as_deref(), config.as_deref(), since).await
        }
        Commands::Checkpoint { config } => cmd_checkpoint(&config).await,
        Commands::Demo { config, rows } => cmd_demo(&config, rows).await,
    }
}

async fn open(config_path: &Path) -> Result<CakeDb> {
    let config = CakeConfig::load(config_path)
        .with_context(|| format!("Failed to load config {:?}", config_path))?;
    Ok(CakeDb::open(config).await?)
}

/// Open and initialize; the handle is closed again if startup fails.
async fn open_live(config_path: &Path) -> Result<CakeDb> {
    let cake = open(config_path).await?;
    if let Err(e) = cake.init().await {
        let _ = cake.close().await;
        return Err(e).context("Startup failed");
    }
    Ok(cake)
}

async fn cmd_init(config_path: &Path) -> Result<()> {
    let cake = open(config_path).await?;
    let report = match cake.init().await {
        Ok(r) => r,
        Err(e) => {
            let _ = cake.close().await;
            return Err(e).context("Startup failed");
        }
    };

    println!("Startup complete:");
    println!(
        "  Initial sync: {}",
        if report.synced { "ok" } else { "failed (continued with local log)" }
    );
    match &report.recovery {
        Some(r) => println!("  Recovery:     {} revisions replayed", r.replayed.len()),
        None => println!("  Recovery:     disabled"),
    }
    println!("  Migrations:   {} applied", report.migrations.len());
    for name in &report.migrations {
        println!("    {}", name);
    }
    println!("  Checkpoint:   {}", cake.checkpoint().await?.unwrap_or_else(|| "(none)".into()));

    cake.close().await?;
    Ok(())
}

async fn cmd_exec(config_path: &Path, sql: &str, params: Vec<String>) -> Result<()> {
    let cake = open_live(config_path).await?;
    let params = params.into_iter().map(Value::Text).collect();

    let result = cake.db().execute(sql, params).await;
    cake.settle().await;
    cake.close().await?;

    let affected = result.with_context(|| format!("Failed to execute {:?}", sql))?;
    println!("{} rows affected", affected);
    Ok(())
}

async fn cmd_sync(config_path: &Path) -> Result<()> {
    let cake = open(config_path).await?;
    let peers: Vec<String> = cake
        .peer_sync()
        .peers()
        .iter()
        .map(|p| p.url().to_string())
        .collect();
    if peers.is_empty() {
        cake.close().await?;
        bail!("No remotes configured in {:?}", config_path);
    }

    println!("Syncing with {} peer(s)...", peers.len());
    let result = cake.peer_sync().sync_once().await;
    cake.close().await?;

    let summaries = result.context("Sync failed")?;
    for (url, summary) in peers.iter().zip(summaries) {
        println!("  {}: pushed {}, pulled {}", url, summary.pushed, summary.pulled);
    }
    Ok(())
}

/// Committed revisions of a configured database, with its checkpoint.
async fn load_log(config_path: &Path, since: i64) -> Result<(Vec<Revision>, Option<String>)> {
    let cake = open(config_path).await?;
    let checkpoint = match cake.checkpoint().await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Cannot read checkpoint: {}", e);
            None
        }
    };
    let revisions = cake.log().find_committed_since(since).await;
    cake.close().await?;
    Ok((revisions?, checkpoint))
}

async fn cmd_log(revision_db: Option<&Path>, config_path: Option<&Path>, since: i64) -> Result<()> {
    let (revisions, checkpoint) = match (config_path, revision_db) {
        (Some(config_path), _) => load_log(config_path, since).await?,
        (None, Some(revision_db)) => {
            if !revision_db.exists() {
                bail!("Revision store {:?} does not exist", revision_db);
            }
            let log = RevisionLog::open(revision_db)?;
            let revisions = log.find_committed_since(since).await?;
            log.close().await?;
            (revisions, None)
        }
        (None, None) => bail!("Either --revision-db or --config is required"),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    revision_log::print_revisions(&revisions, checkpoint.as_deref(), &mut out)
}

async fn cmd_checkpoint(config_path: &Path) -> Result<()> {
    let cake = open(config_path).await?;
    let checkpoint = cake.checkpoint().await;

    let outcome = match checkpoint {
        Ok(Some(id)) => match cake.log().get(&id).await {
            Ok(revision) => {
                println!("{}", revision_log::format_revision(&revision));
                Ok(())
            }
            Err(e) => Err(anyhow::Error::from(e).context(format!("Checkpoint {} is not in the log", id))),
        },
        Ok(None) => {
            println!("No checkpoint recorded.");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::from(e).context("Failed to read checkpoint")),
    };

    cake.close().await?;
    outcome
}

async fn cmd_demo(config_path: &Path, rows: usize) -> Result<()> {
    let cake = open_live(config_path).await?;

    let inserts = (0..rows).map(|i| {
        cake.db().execute(
            "insert into todo (title, content) values (?, ?)",
            vec![
                Value::Text(format!("title_{}", i)),
                Value::Text(format!("content_{}", i)),
            ],
        )
    });
    let results = futures::future::join_all(inserts).await;
    let failed = results.iter().filter(|r| r.is_err()).count();

    cake.settle().await;
    let checkpoint = cake.checkpoint().await?;
    let live = cake.is_live();
    cake.close().await?;

    println!("Inserted {} rows ({} failed)", rows - failed, failed);
    println!("Checkpoint: {}", checkpoint.unwrap_or_else(|| "(none)".into()));
    println!("Peer live:  {}", live);
    if failed > 0 {
        if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
            return Err(e).context("Demo inserts failed");
        }
    }
    Ok(())
}
