//! Collection Service (collectsrv)
//!
//! Orchestration core of the EdgeLink gateway. Polls field devices through
//! per-protocol drivers, transforms and publishes the results, executes inbound
//! write commands, and hot-reloads the device configuration.
//!
//! # Layout
//!
//! - `core::driver`: transport strategies, the generic protocol driver and the
//!   driver registry (Modbus TCP/RTU, HTTP API, SQLite, simulator)
//! - `core::queue`: write-before-read coordination per transport
//! - `core::transform`: point value transform stage
//! - `core::scheduler`: protocol task manager (one polling loop per protocol)
//! - `core::monitor`: configuration revision monitor
//! - `core::bus` / `core::store`: publish/subscribe and configuration store collaborators

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod error;

// Test utilities (for use in test code only)
pub mod test_utils;

pub use error::{CollectError, Result};
