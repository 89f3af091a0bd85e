use embeddit::{config, server};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Setup logging
    tracing_subscriber::fmt::init();

    info!("Starting embeddit media backend");

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    info!("Running in {} mode", if config.is_dev { "DEV" } else { "PROD" });
    if config.oauth.is_none() {
        info!("OAuth is disabled; using the anonymous public API");
        warn!(
            "The public API is rate-limited and blocks many commercial VPS IPs; \
             configure OAuth credentials for production use"
        );
    }

    if let Err(e) = server::start(config).await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }
}
