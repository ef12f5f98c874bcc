use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use logkv::config::ServerConfig;
use logkv::raft::types::{LogEntry, Operation, ServerId};
use logkv::server::Server;
use logkv::storage::WriteAheadLog;
use logkv::store::KvStore;

#[derive(Parser)]
#[command(name = "logkv", about = "Replicated key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cluster server
    Server {
        /// TCP port to listen on
        listen_port: u16,
        /// Unique id of this server
        server_id: ServerId,
        /// Peer addresses, host:port
        peers: Vec<String>,
    },
    /// Interactive single-process mode over stdin
    Repl {
        /// Where the local WAL lives
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            listen_port,
            server_id,
            peers,
        } => run_server(listen_port, server_id, peers).await,
        Command::Repl { data_dir } => run_repl(data_dir),
    }
}

async fn run_server(listen_port: u16, server_id: ServerId, peers: Vec<String>) -> anyhow::Result<()> {
    let config = ServerConfig::from_args(listen_port, server_id, peers);
    let handle = Server::start(config)
        .await
        .context("failed to start server")?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            handle.shutdown();
            Ok(())
        }
        stopped = handle.wait() => stopped.map_err(Into::into),
    };
    handle.join().await;
    result
}

/// Stdin loop over a local store with a durable log, no cluster.
fn run_repl(data_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&data_dir)?;
    let wal = WriteAheadLog::open(data_dir.join("wal_repl.log"), data_dir.join("wal_repl.meta"))?;
    let store = KvStore::new();
    for entry in wal.entries_from(1) {
        if entry.op == Operation::Put {
            store.put(entry.key, entry.value);
        }
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("PUT") => match (tokens.next(), tokens.next()) {
                (Some(key), Some(value)) => {
                    let (last_index, last_term) = wal.last_info();
                    wal.append(LogEntry::put(last_index + 1, last_term, key, value))?;
                    store.put(key, value);
                    println!("OK");
                }
                _ => println!("ERROR"),
            },
            Some("GET") => match tokens.next() {
                Some(key) => match store.get(key) {
                    Some(value) => println!("{}", value),
                    None => println!("NOT_FOUND"),
                },
                None => println!("ERROR"),
            },
            Some("EXIT") => break,
            _ => println!("UNKNOWN_COMMAND"),
        }
    }

    Ok(())
}
