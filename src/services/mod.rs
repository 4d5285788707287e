//! Long-running services hosted on a bus.

pub mod store_sync;

pub use store_sync::StoreSyncService;
