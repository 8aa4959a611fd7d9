//! EdgeLink collection service

use clap::Parser;
use tracing::info;

use collectsrv::bootstrap::{self, Service};
use collectsrv::config::ServiceConfig;
use common::ServiceArgs;
use errors::GatewayResult;

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let args = ServiceArgs::parse();

    // Logging settings live in the config file, so it is read first
    let config = ServiceConfig::load(&args.config)?;
    bootstrap::initialize_logging(&args, &config)?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&bootstrap::service_info(&config));
    }
    info!("Configuration loaded from {}", args.config);

    if args.validate {
        bootstrap::validate_configuration(&config).await?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let service = Service::build(&config).await?;
    let shutdown = common::shutdown::shutdown_token();
    service.run(shutdown).await;
    Ok(())
}
