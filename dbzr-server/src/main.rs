//! DBzr Server - smart protocol server for dbzr branches

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbzr_core::{InitializeOptions, LocalTransport, RepositoryFormat, Transport, initialize_ex};
use dbzr_server::{ServerConfig, serve};
use dbzr_smart::SmartServerHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dbzr-server")]
#[command(author = "DBzr Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Smart protocol server for dbzr branches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address (e.g., 0.0.0.0:4155)
        #[arg(short, long)]
        addr: Option<String>,

        /// Directory to serve
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Answer this verb with UnknownMethod (repeatable)
        #[arg(long = "disable-verb")]
        disable_verbs: Vec<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Create a shared repository at the root of a directory to serve
    Init {
        path: PathBuf,

        /// Record serializer of the repository
        #[arg(long, default_value = "bincode-v1")]
        serializer: String,
    },
}

fn init_logging(debug: bool) {
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dbzr=info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            addr,
            root,
            disable_verbs,
            debug,
        } => {
            init_logging(debug);
            let mut config = ServerConfig::load_or_default(config.as_deref())?;
            if let Some(addr) = addr {
                config.listen = addr;
            }
            if let Some(root) = root {
                config.root = root;
            }
            config.disabled_verbs.extend(disable_verbs);

            let root: Arc<dyn Transport> = Arc::new(LocalTransport::new(&config.root));
            let handler = Arc::new(SmartServerHandler::new(root).with_disabled_verbs(&config.disabled_verbs));
            let listener = TcpListener::bind(&config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;

            info!("serving {} on {}", config.root.display(), listener.local_addr()?);
            if !config.disabled_verbs.is_empty() {
                info!("disabled verbs: {}", config.disabled_verbs.join(", "));
            }
            serve(listener, handler, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }

        Commands::Init { path, serializer } => {
            init_logging(false);
            std::fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
            let options = InitializeOptions {
                repository_format: Some(RepositoryFormat::new(&serializer)?),
                use_existing_dir: true,
                ..Default::default()
            };
            initialize_ex(Arc::new(LocalTransport::new(&path)), &options)
                .with_context(|| format!("failed to initialize {}", path.display()))?;
            println!("Initialized shared repository at {}", path.display());
        }
    }

    Ok(())
}
