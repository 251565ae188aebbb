//! Tower - a development-time supervisor and front proxy for locally
//! built HTTP services.
//!
//! This library provides a reload supervisor that:
//! - Watches project sources (or externally dropped binaries) for changes
//! - Rebuilds the application and launches each generation on a port drawn
//!   from a rotating pool
//! - Fronts all traffic through one stable proxy port, swapping the
//!   upstream only after the new generation dials ready
//! - Retires prior generations and their binaries in the background
//! - Surfaces build failures and runtime panics as developer error pages

pub mod build;
pub mod config;
pub mod flight;
pub mod pages;
pub mod ports;
pub mod proxy;
pub mod supervisor;
pub mod watcher;
