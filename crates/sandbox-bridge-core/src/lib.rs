//! Core types, config, errors, and transport ports for the sandbox bridge.

pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod transport;
pub mod types;
