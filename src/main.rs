use axum::Router;
use imageserver::cache::Janitor;
use imageserver::{config::ServerConfig, router};
use std::net::SocketAddr;

/// Image server entry point.
///
/// Initializes tracing, loads and validates configuration, starts the
/// janitor, then serves derivative requests until Ctrl-C.
///
/// # Configuration
/// Environment variables:
/// - `PORT`: HTTP listen port (default: 3000)
/// - `IMAGESERVER_ROOT`: folder of image folders (default: `./images`)
/// - `IMAGESERVER_RETENTION_SECS`: derivative lifetime (default: 3600)
/// - `IMAGESERVER_SWEEP_INTERVAL_SECS`: janitor period (default: 300)
/// - `IMAGESERVER_MAX_DIMENSION`: clamp for `w`/`h` (default: 1000)
/// - `IMAGESERVER_MAX_UPLOAD_BYTES`, `IMAGESERVER_QUALITY`
/// - `RUST_LOG`: Logging verbosity (default: "imageserver=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imageserver=debug,tower_http=debug".into())
        )
        .init();

    tracing::info!("Starting image server");

    let cfg = ServerConfig::from_env()?;
    cfg.validate()?;
    tokio::fs::create_dir_all(&cfg.images_dir).await?;

    let janitor = Janitor::new(cfg.images_dir.clone(), cfg.retention, cfg.sweep_interval).spawn();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = Router::new().merge(router(cfg));

    tracing::info!("Server listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Shutting down");
    janitor.shutdown().await;
    Ok(())
}
