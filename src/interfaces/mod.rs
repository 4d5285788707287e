//! Abstract interfaces for fabric-bus collaborators.
//!
//! These traits define the contracts for:
//! - Broker connections (galactic channel bridging)
//! - Broker subscriptions (inbound frames for one destination)

pub mod broker;

pub use broker::{BrokerConnection, BrokerError, BrokerSubscription};
