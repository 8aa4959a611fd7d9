//! Common command-line arguments for EdgeLink services

#[cfg(feature = "cli")]
use clap::Parser;

/// Common service startup arguments
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cli", derive(Parser))]
#[cfg_attr(feature = "cli", clap(author, version, about))]
pub struct ServiceArgs {
    /// Service configuration file (YAML)
    #[cfg_attr(
        feature = "cli",
        clap(short = 'c', long, default_value = "config/collectsrv.yaml", env = "COLLECTSRV_CONFIG")
    )]
    pub config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[cfg_attr(feature = "cli", clap(short = 'l', long))]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[cfg_attr(feature = "cli", clap(long))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", clap(long))]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            config: "config/collectsrv.yaml".to_string(),
            log_level: None,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// CLI level when given, else the configured one
    pub fn effective_log_level(&self, configured: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| configured.to_string())
    }
}
