//! Interface tests for the bus store using Cucumber.
//!
//! These tests describe the contract every local `BusStore` honors:
//! versioning, removal, change-stream filtering and readiness.
//!
//! ```bash
//! cargo test --test interfaces
//! ```

mod steps;

use cucumber::World;
use steps::bus_store::BusStoreWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running BusStore Interface Tests ===\n");
    BusStoreWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/bus_store.feature")
        .await;
}
