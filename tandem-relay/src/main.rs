//! Tandem relay: room-scoped WebSocket fan-out for signaling and document
//! frames.
//!
//! ```text
//! tandem-relay [bind-addr]        # or TANDEM_RELAY_ADDR, default 127.0.0.1:9090
//! ```

use log::{error, info};
use tandem_collab::{RelayConfig, RelayServer};

fn bind_addr() -> Option<String> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TANDEM_RELAY_ADDR").ok())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = bind_addr() {
        config.bind_addr = addr;
    }
    info!("Starting Tandem relay on {}...", config.bind_addr);

    let relay = RelayServer::new(config);
    if let Err(e) = relay.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
