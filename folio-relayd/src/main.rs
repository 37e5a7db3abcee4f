//! folio-relayd — standalone change relay for Folio.
//!
//! Hosts a [`RelayServer`] that fans document edits out between connected
//! editors. The daemon holds no document state: persistence is each
//! client's job, and a relay restart costs nothing but a reconnect.
//!
//! Bind address comes from the first argument, then `FOLIO_RELAY_ADDR`,
//! then the default `127.0.0.1:9090`.

use log::info;

use folio_collab::server::{RelayServer, RelayServerConfig};

fn bind_addr() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FOLIO_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayServerConfig {
        bind_addr: bind_addr(),
        ..RelayServerConfig::default()
    };
    info!("starting folio-relayd on {}", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("relay server failed: {e}");
        std::process::exit(1);
    }
}
