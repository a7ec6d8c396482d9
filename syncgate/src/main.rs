use std::process;

use syncgate::{GateConfig, GateServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match GateConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };
    log::info!("Starting sync gateway with {config:?}");

    if let Err(e) = GateServer::new(config).run().await {
        log::error!("Sync gateway failed: {e}");
        process::exit(1);
    }
}
