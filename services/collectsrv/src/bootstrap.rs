//! Service bootstrap
//!
//! Wires the collaborators together: driver registry, publisher, task
//! manager, configuration store, monitor and bus handlers.

use std::sync::Arc;

use common::service_bootstrap::{self, LoggingOptions, ServiceInfo};
use common::ServiceArgs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BusKind, ServiceConfig};
use crate::core::bus::{parse_write_command, Payload, RedisSubscriber, SubscriptionRegistry};
use crate::core::driver::DriverRegistry;
use crate::core::monitor::ConfigMonitor;
use crate::core::scheduler::ProtocolTaskManager;
use crate::error::Result;

pub fn service_info(config: &ServiceConfig) -> ServiceInfo {
    ServiceInfo::new(
        config.service.name.clone(),
        env!("CARGO_PKG_VERSION"),
        "EdgeLink collection service - device polling, writes and config hot reload",
    )
}

/// Console + daily file logging; `--log-level` and `--no-color` win over the file
pub fn initialize_logging(args: &ServiceArgs, config: &ServiceConfig) -> anyhow::Result<()> {
    let options = LoggingOptions {
        level: args.effective_log_level(&config.logging.level),
        dir: config.logging.dir.clone(),
        json: config.logging.json,
        ansi: !args.no_color,
        file: config.logging.file,
    };
    service_bootstrap::init_logging(&service_info(config), options)?;
    debug!("Log filter: {}", common::logging::get_log_level());
    Ok(())
}

/// Load the current workstation and check it without starting anything
pub async fn validate_configuration(config: &ServiceConfig) -> Result<()> {
    let store = config.store.open().await?;
    let snapshot = store.latest().await?;
    snapshot.workstation.validate()?;

    let registry = DriverRegistry::with_builtin();
    info!(
        "Workstation {} revision {}: {} protocol(s)",
        snapshot.workstation.id,
        snapshot.revision,
        snapshot.workstation.protocols.len()
    );
    for protocol in &snapshot.workstation.protocols {
        if registry.contains(&protocol.protocol_type) {
            info!(
                "  Proto{} ({}): {} equipment(s), {} point(s)",
                protocol.id,
                protocol.protocol_type,
                protocol.equipments.len(),
                protocol.point_count()
            );
        } else {
            warn!(
                "  Proto{}: no driver for type {}, it will be skipped",
                protocol.id, protocol.protocol_type
            );
        }
    }
    Ok(())
}

/// Fully wired service, ready to run
pub struct Service {
    manager: Arc<ProtocolTaskManager>,
    monitor: Arc<ConfigMonitor>,
    subscriber: Option<RedisSubscriber>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("monitor", &self.monitor)
            .field("subscribed", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub async fn build(config: &ServiceConfig) -> Result<Self> {
        let registry = Arc::new(DriverRegistry::with_builtin());
        debug!("Drivers: {:?}", registry.registered_types());

        let publisher = config.bus.publisher()?;
        let manager = Arc::new(ProtocolTaskManager::new(
            registry,
            publisher,
            config.bus.topics.clone(),
        ));

        let store = config.store.open().await?;
        let monitor = Arc::new(ConfigMonitor::new(
            store,
            manager.clone(),
            config.monitor.interval(),
        ));

        let subscriptions = Arc::new(SubscriptionRegistry::new());
        register_handlers(&subscriptions, config, &manager, &monitor);

        let subscriber = match config.bus.kind {
            BusKind::Redis => Some(RedisSubscriber::new(&config.bus.url, subscriptions)?),
            BusKind::Log => None,
        };

        Ok(Self {
            manager,
            monitor,
            subscriber,
        })
    }

    pub fn manager(&self) -> &Arc<ProtocolTaskManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<ConfigMonitor> {
        &self.monitor
    }

    /// Run until `shutdown` is cancelled, then stop every protocol
    pub async fn run(self, shutdown: CancellationToken) {
        let subscriber = self.subscriber.map(|subscriber| {
            let cancel = shutdown.child_token();
            tokio::spawn(async move { subscriber.run(cancel).await })
        });

        self.monitor.run(shutdown.child_token()).await;

        info!("Stopping {} protocol(s)", self.manager.running_count());
        for status in self.manager.statuses() {
            debug!(
                "Proto{} {} {:?} last cycle {:?}",
                status.id, status.connection, status.state, status.last_cycle
            );
        }
        self.manager.stop_all().await;

        if let Some(handle) = subscriber {
            if let Err(e) = handle.await {
                warn!("Subscriber task failed: {}", e);
            }
        }
        info!("Service stopped");
    }
}

/// Inbound write commands go to the task manager; config-changed
/// notifications wake the monitor
pub fn register_handlers(
    subscriptions: &SubscriptionRegistry,
    config: &ServiceConfig,
    manager: &Arc<ProtocolTaskManager>,
    monitor: &Arc<ConfigMonitor>,
) {
    let topics = &config.bus.topics;

    let manager = manager.clone();
    subscriptions.register(
        topics.write_command.clone(),
        Arc::new(move |payload: Payload| match parse_write_command(&payload) {
            Ok(task) => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.submit_write(task).await;
                });
            },
            Err(e) => warn!("Write command rejected: {}", e),
        }),
    );

    let monitor = monitor.clone();
    subscriptions.register(
        topics.config_changed.clone(),
        Arc::new(move |_: Payload| monitor.request_check()),
    );

    subscriptions.register(
        topics.log_level.clone(),
        Arc::new(|payload: Payload| {
            let level = String::from_utf8_lossy(payload.as_bytes()).trim().to_string();
            if let Err(e) = common::logging::set_log_level(&level) {
                warn!("Log level change rejected: {}", e);
            }
        }),
    );
}
