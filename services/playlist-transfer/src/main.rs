//!
//! src/main.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Entry point of the transfer service. Wires the Spotify client, the
//! progress bus and the connection registry into the http server.
//!
//!

mod config;
mod errors;
mod logging;
mod types;

mod fetch;
mod lookup;
mod scheduler;
mod playlist;
mod orchestrator;

mod bus;
mod registry;

mod csv_input;
mod store;
mod server;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::bus::ProgressBus;
use crate::errors::TransferError;
use crate::fetch::SpotifyApi;
use crate::registry::ConnectionRegistry;
use crate::store::CredentialStore;

#[tokio::main]
async fn main() -> Result<(), TransferError> {
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service = cfgs.logging.service,
        version = %env!("CARGO_PKG_VERSION"),
        market = %cfgs.spotify.market,
        batch_size = cfgs.transfer.batch_size,
        "starting"
    );

    let api: Arc<dyn SpotifyApi> = Arc::new(fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?);
    let (bus, subscription) = ProgressBus::channel();
    let registry = Arc::new(ConnectionRegistry::new());

    tokio::spawn(registry::run_delivery(registry.clone(), subscription));

    let state = server::AppState {
        registry,
        bus,
        store: Arc::new(CredentialStore::new()),
        api,
        transfer: cfgs.transfer.clone(),
        market: cfgs.spotify.market.clone(),
        connection_capacity: cfgs.bus.connection_capacity
    };

    server::serve(state, &cfgs.server).await
}
