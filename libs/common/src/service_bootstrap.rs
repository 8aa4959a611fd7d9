//! Service bootstrap utilities
//!
//! Startup banner and logging initialization shared by EdgeLink services.

use std::path::PathBuf;

use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "collectsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ███████╗██████╗  ██████╗ ███████╗██╗     ██╗███╗   ██╗██╗  ██╗
 ██╔════╝██╔══██╗██╔════╝ ██╔════╝██║     ██║████╗  ██║██║ ██╔╝
 █████╗  ██║  ██║██║  ███╗█████╗  ██║     ██║██╔██╗ ██║█████╔╝
 ██╔══╝  ██║  ██║██║   ██║██╔══╝  ██║     ██║██║╚██╗██║██╔═██╗
 ███████╗██████╔╝╚██████╔╝███████╗███████╗██║██║ ╚████║██║  ██╗
 ╚══════╝╚═════╝  ╚═════╝ ╚══════╝╚══════╝╚═╝╚═╝  ╚═══╝╚═╝  ╚═╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Logging options resolved from CLI and service configuration
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub level: String,
    pub dir: PathBuf,
    pub json: bool,
    pub ansi: bool,
    pub file: bool,
}

/// Initialize logging for a service
///
/// `EDGELINK_LOG_DIR` overrides the configured directory.
pub fn init_logging(service: &ServiceInfo, options: LoggingOptions) -> anyhow::Result<()> {
    let log_dir = std::env::var("EDGELINK_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or(options.dir);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir,
        level: options.level,
        enable_json: options.json,
        ansi: options.ansi,
        enable_file: options.file,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_service_info_creation() {
        let service = ServiceInfo::new("collectsrv", "0.1.0", "Collection service");
        assert_eq!(service.name, "collectsrv");
        assert_eq!(service.version, "0.1.0");
    }
}
