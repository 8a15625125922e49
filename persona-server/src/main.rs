use clap::Parser;
use persona_core::store::PgVectorStore;
use persona_core::PersonaConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use persona_server::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "persona.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config; a missing file falls back to defaults so the server
    // can run against the in-memory store with only env credentials.
    let config = match PersonaConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            if std::path::Path::new(&args.config).exists() {
                eprintln!("Failed to load config from {}: {}", args.config, e);
                std::process::exit(1);
            }
            tracing::warn!(path = %args.config, "Config file not found, using defaults");
            PersonaConfig::default()
        }
    };

    if args.health {
        match PgVectorStore::connect(&config.database, config.store.delete_batch_size).await {
            Ok(store) => match store.ensure_schema(config.embedding.dimensions).await {
                Ok(()) => println!("✅ PostgreSQL connected, schema ready"),
                Err(e) => {
                    println!("❌ Schema check failed: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Persona DB health check passed");
        return Ok(());
    }

    // The pgvector backend owns its schema; create it before serving.
    if config.store.backend == "pgvector" {
        let store =
            PgVectorStore::connect(&config.database, config.store.delete_batch_size).await?;
        store.ensure_schema(config.embedding.dimensions).await?;
    }

    let state = match AppState::from_config(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialize server state: {}", e);
            std::process::exit(1);
        }
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    persona_server::http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
