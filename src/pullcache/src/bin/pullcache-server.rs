use pullcache::{start_server, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path);
            Config::from_file(&path)?
        }
        None => {
            tracing::info!("Using built-in default configuration");
            Config::default()
        }
    };

    let (addr, handle) = start_server(config).await?;
    tracing::info!("  API: http://{}/v2/", addr);
    tracing::info!("Press Ctrl+C to stop the server.");

    tokio::select! {
        result = handle => {
            if let Err(e) = result {
                tracing::error!("Server task failed: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}
