//! Step definitions for interface tests.

pub mod bus_store;
