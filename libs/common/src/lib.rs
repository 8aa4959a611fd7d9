//! EdgeLink common library
//!
//! Shared service plumbing:
//! - logging (console + daily rolling file, runtime level reload)
//! - startup banner and logging bootstrap
//! - command-line arguments
//! - graceful shutdown

pub mod bootstrap_args;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use service_bootstrap::{LoggingOptions, ServiceInfo};

// Re-export common dependencies
pub use anyhow;
pub use tokio;

#[cfg(feature = "cli")]
pub use clap;

#[cfg(feature = "cli")]
pub use clap::Parser;
