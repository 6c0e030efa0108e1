//! Family Points Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start the API with a config file
//! family-points --config /path/to/config.toml
//!
//! # Start on a custom port and data directory
//! JWT_SECRET=... family-points --http-port 8096 --storage-dir /data/points
//!
//! # Local development with the built-in secret
//! family-points --dev-mode
//!
//! # Issue a bearer token for a user
//! family-points --dev-mode token --user mom
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use family_points::auth::TokenInput;
use family_points::services::events::spawn_logging_listener;
use family_points::{Config, HttpServer, JwtValidator, LedgerDb, RetryPolicy, Services};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "family-points")]
#[command(about = "Behavior points ledger for families")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// JWT signing secret
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Development mode (built-in JWT secret)
    #[arg(long, env = "DEV_MODE")]
    dev_mode: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Print a bearer token for a user
    Token {
        /// User id placed in the token subject
        #[arg(long)]
        user: String,
        /// Optional display name
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("family_points=info".parse()?);
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(secret) = args.jwt_secret {
        config.jwt_secret = Some(secret);
    }
    if args.dev_mode {
        config.dev_mode = true;
    }

    config.validate()?;
    let jwt = JwtValidator::from_config(&config)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Token { user, name } => {
            let token = jwt.generate_token(TokenInput { user_id: user, name })?;
            println!("{}", token);
            Ok(())
        }
        Command::Serve => serve(config, jwt).await,
    }
}

async fn serve(config: Config, jwt: JwtValidator) -> anyhow::Result<()> {
    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        dev_mode = config.dev_mode,
        "Starting family-points"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist; secrets stay out of the file
    let config_path = config.config_path();
    if !config_path.exists() {
        let mut on_disk = config.clone();
        on_disk.jwt_secret = None;
        on_disk.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(LedgerDb::open(&config.db_path(), config.busy_timeout())?);
    let stats = db.stats()?;
    info!(
        families = stats.family_count,
        children = stats.child_count,
        ledger_entries = stats.ledger_entry_count,
        "Ledger opened"
    );

    let services = Arc::new(Services::new(db, config.default_policy));
    let _listener = spawn_logging_listener(&services.events);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let server = Arc::new(HttpServer::new(
        services,
        jwt,
        RetryPolicy::from_config(&config),
        bind_addr,
    ));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server stopped");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
