//! Shared helpers for fabric-bus binaries.

pub mod bootstrap;
