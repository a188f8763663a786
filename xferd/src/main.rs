use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xferd::{Config, Daemon};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xferd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting xferd daemon");

    let config = Config::load().await?;
    let daemon = Daemon::new(config).await?;

    if let Err(e) = daemon.run().await {
        error!("Daemon error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
