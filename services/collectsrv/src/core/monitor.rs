//! Config Monitor
//!
//! Polls the configuration store on a fixed interval (or on request) and,
//! when the revision differs from the running one, restarts the driver set
//! through `ProtocolControl`. The running revision only advances after a
//! successful start; a rejected or failed configuration is retried on the
//! next check while the last good one keeps running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgelink_model::Workstation;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::scheduler::{ProtocolTaskManager, StartReport};
use crate::core::store::{ConfigSnapshot, ConfigStore};
use crate::error::Result;

/// The part of the task manager the monitor drives
#[async_trait]
pub trait ProtocolControl: Send + Sync {
    async fn stop_all(&self);

    async fn start_all(&self, workstation: &Workstation) -> StartReport;
}

#[async_trait]
impl ProtocolControl for ProtocolTaskManager {
    async fn stop_all(&self) {
        ProtocolTaskManager::stop_all(self).await
    }

    async fn start_all(&self, workstation: &Workstation) -> StartReport {
        ProtocolTaskManager::start_all(self, workstation).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Store revision equals the running one
    Unchanged,
    /// New configuration running
    Applied { revision: String, report: StartReport },
    /// Failed validation; nothing was touched
    Rejected { revision: String, reason: String },
    /// Start failed; the previous configuration was started again
    RolledBack { revision: String, reason: String },
}

pub struct ConfigMonitor {
    store: Arc<dyn ConfigStore>,
    control: Arc<dyn ProtocolControl>,
    interval: Duration,
    current: Mutex<Option<ConfigSnapshot>>,
    wake: Notify,
    checking: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConfigMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMonitor")
            .field("interval", &self.interval)
            .field("revision", &self.current_revision())
            .finish_non_exhaustive()
    }
}

impl ConfigMonitor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        control: Arc<dyn ProtocolControl>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            control,
            interval,
            current: Mutex::new(None),
            wake: Notify::new(),
            checking: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current_revision(&self) -> Option<String> {
        self.current.lock().as_ref().map(|s| s.revision.clone())
    }

    /// Ask the running loop to check now
    pub fn request_check(&self) {
        self.wake.notify_one();
    }

    /// Compare the store against the running revision and apply on change
    pub async fn check_once(&self) -> Result<CheckOutcome> {
        let _guard = self.checking.lock().await;
        let snapshot = self.store.latest().await?;
        let previous = self.current.lock().clone();

        if previous
            .as_ref()
            .is_some_and(|p| p.revision == snapshot.revision)
        {
            return Ok(CheckOutcome::Unchanged);
        }

        if let Err(e) = snapshot.workstation.validate() {
            warn!("Config revision {} rejected: {}", snapshot.revision, e);
            return Ok(CheckOutcome::Rejected {
                revision: snapshot.revision,
                reason: e.to_string(),
            });
        }

        info!(
            "Config revision {} -> {}",
            previous.as_ref().map_or("none", |p| p.revision.as_str()),
            snapshot.revision
        );
        self.control.stop_all().await;
        let report = self.control.start_all(&snapshot.workstation).await;

        if !snapshot.workstation.protocols.is_empty() && report.started.is_empty() {
            let reason = format!(
                "No protocol of revision {} could be started ({} skipped)",
                snapshot.revision,
                report.skipped.len()
            );
            error!("{}", reason);
            self.control.stop_all().await;
            if let Some(previous) = &previous {
                warn!("Falling back to revision {}", previous.revision);
                self.control.start_all(&previous.workstation).await;
            }
            return Ok(CheckOutcome::RolledBack {
                revision: snapshot.revision,
                reason,
            });
        }

        let revision = snapshot.revision.clone();
        *self.current.lock() = Some(snapshot);
        Ok(CheckOutcome::Applied { revision, report })
    }

    /// Check immediately, then on every interval tick or request until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Config monitor checking every {:?}", self.interval);
        loop {
            match self.check_once().await {
                Ok(CheckOutcome::Unchanged) => debug!("Config unchanged"),
                Ok(outcome) => debug!("Config check: {:?}", outcome),
                Err(e) => warn!("Config check failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {},
                _ = self.wake.notified() => debug!("Config check requested"),
            }
        }
        info!("Config monitor stopped");
    }
}
