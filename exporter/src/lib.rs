//! DCGM metrics exporter.
//!
//! Samples GPU, NVSwitch, and Grace CPU counters from the DCGM host engine,
//! attributes them to Kubernetes pods, and serves Prometheus exposition
//! text. See `counters` for the catalogue format, `pipeline` for the scrape
//! path, and `kubernetes` for pod attribution.

pub mod collectors;
pub mod config;
pub mod counters;
pub mod devices;
pub mod error;
pub mod kubernetes;
pub mod metrics;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod watchlist;
