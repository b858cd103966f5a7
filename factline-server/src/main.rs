use clap::Parser;
use factline_core::config::BackendKind;
use factline_core::{FactlineConfig, TemporalMemory};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use factline_server::server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "factline.toml")]
    config: String,

    /// Use the in-memory backend regardless of the config file.
    #[arg(long)]
    memory: bool,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is a dev convenience; production sets real env vars
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match FactlineConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if args.memory {
        config.storage.backend = BackendKind::Memory;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let memory = match TemporalMemory::from_config(&config).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to initialise storage: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match memory.health().await {
            Ok(v) => println!("✅ Storage connected: {}", v),
            Err(e) => {
                println!("❌ Storage check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Factline health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.http.enabled {
        let http_memory = memory.clone();
        let http_config = config.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) =
                factline_server::http::start_http_server(http_memory, http_config, http_shutdown).await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = config.service.socket_path.clone();
    server::run_unix_server(&socket_path, memory, tx.subscribe()).await?;

    Ok(())
}
