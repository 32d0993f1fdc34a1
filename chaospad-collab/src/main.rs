use std::sync::Arc;

use chaospad_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from_env();
    log::info!("Starting ChaosPad relay...");

    let server = match RelayServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
