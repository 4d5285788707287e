//! fabric-store-server: authoritative store host
//!
//! Owns one event bus, seeds the configured stores and serves store sync
//! channels so that galactic replicas in other processes stay consistent
//! with the stores held here.
//!
//! ## Architecture
//! ```text
//! [replica bus] --(openStore/updateStore/closeStore)--> [sync channel]
//!                                                            |
//!                                                            v
//!                                                   [StoreSyncService] --> [BusStore]
//! ```
//!
//! ## Configuration
//! - FABRIC_CONFIG: Path to a YAML config file (optional)
//! - FABRIC_LOG: Log filter (default: info)
//! - FABRIC__BUS__SYNC_CHANNEL_PREFIX etc.: Overrides for individual settings

use std::sync::Arc;

use tracing::info;

use fabric_bus::bus::EventBus;
use fabric_bus::config::Config;
use fabric_bus::services::StoreSyncService;
use fabric_bus::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let bus = Arc::new(EventBus::new(&config.bus));
    let service = StoreSyncService::new(Arc::clone(&bus));
    let monitor_task = service.start();

    for seed in &config.stores {
        let store = bus.store_manager().create_store(&seed.name).await;
        store.populate(seed.items.clone()).await?;
        info!(store = %seed.name, items = seed.items.len(), "Store seeded");
    }

    info!(
        bus = %bus.id(),
        stores = config.stores.len(),
        sync_prefix = %config.bus.sync_channel_prefix,
        "fabric-store-server started"
    );

    shutdown_signal().await;
    monitor_task.abort();
    info!("fabric-store-server stopped");
    Ok(())
}
