use clap::Parser;
use session_core::SessionStoreConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use session_server::{server, SessionService};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "session-store.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Compare the live schema against the expected tables and indexes, then exit.
    #[arg(long)]
    verify_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match SessionStoreConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.health {
        let pool = match session_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                println!("❌ MySQL connection failed: {}", e);
                std::process::exit(1);
            }
        };
        match session_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ MySQL connected: {}", v),
            Err(e) => {
                println!("❌ MySQL health check failed: {}", e);
                std::process::exit(1);
            }
        }
        pool.close().await;
        return Ok(());
    }

    let socket_path = config.service.socket_path.clone();
    let service = match SessionService::builder(config).build().await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to start session service: {}", e);
            std::process::exit(1);
        }
    };

    if args.verify_schema {
        let report = service.verify_schema().await?;
        for warning in &report.warnings {
            println!("⚠️  {}", warning);
        }
        for suggestion in &report.suggestions {
            println!("   {}", suggestion);
        }
        if report.is_clean() {
            println!("✅ Schema matches");
        }
        service.close().await?;
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let served = server::run_unix_server(&socket_path, service.clone(), tx.subscribe()).await;
    service.close().await?;
    served
}
