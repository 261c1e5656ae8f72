//! Delver CLI - serve the deep-research agent

use clap::{Parser, Subcommand};
use std::sync::Arc;

use delver::database::Database;
use delver::gateway::{HttpModelGateway, RoleModels};
use delver::kv::SqliteKv;
use delver::search::{HttpFetcher, HttpSearchProvider};
use delver::{AppState, Config};

#[derive(Parser)]
#[command(name = "delver", version, about = "Deep-research agent service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Bind port
        #[arg(long, default_value_t = 3100)]
        port: u16,
    },
    /// Initialize the database (run migrations) and exit
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    let _ = dotenv::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://delver.db".to_string());
    let db = Database::new(&database_url)?;
    db.initialize().await?;

    match cli.command {
        Commands::InitDb => {
            println!("Database initialized at {}", database_url);
            Ok(())
        }
        Commands::Serve { host, port } => {
            delver::observability::init(delver::observability::ObservabilityConfig::default())?;

            let config = Config::from_env()?;

            let gateway = Arc::new(HttpModelGateway::new(
                config.upstream.gateway_url.clone(),
                config.upstream.gateway_secret.clone(),
                RoleModels::from_env(),
            ));
            let provider = Arc::new(HttpSearchProvider::new(
                config.upstream.search_url.clone(),
                config.upstream.search_api_key.clone(),
            ));
            let fetcher = Arc::new(HttpFetcher::new(config.upstream.scraper_url.clone()));
            let kv = Arc::new(SqliteKv::new(db.pool().clone()));

            let state = AppState::new(db.pool().clone(), gateway, provider, fetcher, kv, config);

            delver::server::run(state, &host, port).await?;
            Ok(())
        }
    }
}
