//! docsync: relay server and terminal client for collaborative documents.

use anyhow::Result;
use clap::{Parser, Subcommand};
use docsync_core::{DocId, UserName};
use docsync_daemon::{client, ClientConfig, Daemon, FileStore, ServerConfig, WebSocketServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Collaborative document relay server and terminal client")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to listen on for client connections
        #[arg(short, long, env = "DOCSYNC_LISTEN", default_value = "127.0.0.1:3001")]
        listen: String,

        /// Directory to store documents in
        #[arg(short, long, env = "DOCSYNC_DATA_DIR", default_value = "documents")]
        data_dir: PathBuf,

        /// Milliseconds between saves of changed documents
        #[arg(long, default_value_t = 2000)]
        save_interval_ms: u64,
    },

    /// Open a document from the terminal
    Open {
        /// Document to open (a new one is created if omitted)
        doc: Option<DocId>,

        /// Name shown to other participants
        #[arg(short, long)]
        user: UserName,

        /// Relay server endpoint
        #[arg(short, long, env = "DOCSYNC_SERVER", default_value = "ws://127.0.0.1:3001")]
        server: String,

        /// Web app address used for share links
        #[arg(long, env = "DOCSYNC_APP_URL", default_value = "http://localhost:3000")]
        app_url: String,

        /// Session cookie sent when connecting
        #[arg(long, env = "DOCSYNC_COOKIE")]
        cookie: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,docsync_daemon=debug,docsync_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve {
            listen,
            data_dir,
            save_interval_ms,
        } => {
            let config = ServerConfig {
                listen,
                data_dir,
                save_interval: Duration::from_millis(save_interval_ms),
            };
            info!("Starting docsync relay");
            info!("Data directory: {:?}", config.data_dir);

            let store = Arc::new(FileStore::new(config.data_dir.clone()));
            let listener = WebSocketServer::bind(&config.listen).await?;
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };

            info!("Relay running. Press Ctrl+C to stop.");
            Daemon::new(store).run(listener, &config, shutdown).await
        }
        Command::Open {
            doc,
            user,
            server,
            app_url,
            cookie,
        } => {
            let config = ClientConfig {
                server_url: server,
                app_url,
                cookie,
                ..ClientConfig::default()
            };
            client::run(config, doc, user).await
        }
    }
}
