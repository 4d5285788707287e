//! Fabric bus - in-process event bus with galactic bridging.
//!
//! Components exchange request/response/error messages over named channels
//! that are either local or bridged to a remote broker, share state through
//! versioned stores that may be replicated across processes, and group
//! several requests into one transaction.

pub mod bus;
pub mod config;
pub mod interfaces;
pub mod services;
pub mod store;
pub mod transaction;
pub mod utils;
