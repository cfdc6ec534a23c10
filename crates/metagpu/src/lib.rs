//! Fractional GPU device plugin.
//!
//! Exposes every physical GPU of a node as a configurable number of
//! metagpu units, attributes running compute processes to their pods, and
//! serves a visibility gated management API over that data.

pub mod allocation;
pub mod app;
pub mod auth;
pub mod config;
pub mod inventory;
pub mod plugin;
pub mod registry;
pub mod service;
pub mod signal;
pub mod telemetry;
pub mod topology;
pub mod uds;
pub mod workload;

#[cfg(test)]
mod testing;
