//! Protocol Task Manager
//!
//! Owns the running protocols: one polling task per protocol id, each with
//! its own driver and cancellation token. The map from protocol id to entry
//! is a `DashMap`, so polling loops and write submission read it while
//! start/stop/restart mutate it; structural changes are additionally
//! serialized by a lifecycle lock so two restarts never interleave.
//!
//! Per-protocol lifecycle: `Starting → Running → Stopping → Stopped`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edgelink_model::{Protocol, ProtocolResult, ProtocolValidator, Workstation, WriteTask};
use errors::GatewayErrorTrait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::bus::{BusTopics, Payload, Publisher};
use crate::core::driver::{ConnectionState, Driver, DriverRegistry};
use crate::core::transform;
use crate::error::{CollectError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Summary of the last completed cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub elapsed_ms: u64,
    pub point_total: usize,
    pub point_failed: usize,
    pub error: Option<String>,
}

impl CycleSummary {
    fn of(result: &ProtocolResult) -> Self {
        Self {
            finished_at: result.end_time,
            success: result.success,
            elapsed_ms: result.elapsed_ms,
            point_total: result.point_total,
            point_failed: result.point_failed,
            error: result.error.clone(),
        }
    }
}

/// Diagnostics snapshot of one protocol
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStatus {
    pub id: String,
    pub protocol_type: String,
    pub state: TaskState,
    pub connection: ConnectionState,
    pub last_cycle: Option<CycleSummary>,
}

/// Outcome of `start_all`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: Vec<String>,
    /// Protocol id and reason
    pub skipped: Vec<(String, String)>,
}

impl StartReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.skipped.is_empty()
    }
}

struct ProtocolEntry {
    protocol: Arc<Protocol>,
    /// Replaced when a faulted driver is recreated
    driver: RwLock<Arc<dyn Driver>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: RwLock<TaskState>,
    last_cycle: RwLock<Option<CycleSummary>>,
}

impl ProtocolEntry {
    fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.driver.read())
    }

    fn set_state(&self, state: TaskState) {
        *self.state.write() = state;
    }

    fn accepts_writes(&self) -> bool {
        matches!(*self.state.read(), TaskState::Starting | TaskState::Running)
    }
}

/// Shared by the manager and every polling task
struct Shared {
    registry: Arc<DriverRegistry>,
    publisher: Arc<dyn Publisher>,
    topics: BusTopics,
}

impl Shared {
    async fn publish_result(&self, result: &ProtocolResult, cancel: &CancellationToken) {
        match Payload::json(result) {
            Ok(payload) => {
                let topic = self.topics.data_topic(&result.protocol_id);
                if !self.publisher.publish(&topic, payload, cancel).await {
                    warn!("Proto{} result not published", result.protocol_id);
                }
            },
            Err(e) => error!("Proto{} result serialization: {}", result.protocol_id, e),
        }
    }

    /// Write notifications go out even while the protocol is stopping
    async fn publish_writes(&self, writes: Vec<WriteTask>) {
        let cancel = CancellationToken::new();
        for task in writes {
            match Payload::json(&task) {
                Ok(payload) => {
                    if !self
                        .publisher
                        .publish(&self.topics.write_result, payload, &cancel)
                        .await
                    {
                        warn!("Write result {} not published", task.id);
                    }
                },
                Err(e) => error!("Write result {} serialization: {}", task.id, e),
            }
        }
    }
}

pub struct ProtocolTaskManager {
    shared: Arc<Shared>,
    entries: DashMap<String, Arc<ProtocolEntry>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ProtocolTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolTaskManager")
            .field("protocols", &self.protocol_ids())
            .finish_non_exhaustive()
    }
}

impl ProtocolTaskManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        publisher: Arc<dyn Publisher>,
        topics: BusTopics,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                publisher,
                topics,
            }),
            entries: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn protocol_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Start every protocol of the workstation. Unknown protocol types and
    /// invalid protocols are skipped and reported; an id that is already
    /// running is restarted with the new configuration.
    pub async fn start_all(&self, workstation: &Workstation) -> StartReport {
        let _guard = self.lifecycle.lock().await;
        let mut report = StartReport::default();

        for protocol in &workstation.protocols {
            match self.start_locked(Arc::new(protocol.clone())).await {
                Ok(()) => report.started.push(protocol.id.clone()),
                Err(e) => {
                    warn!("Proto{} skipped: {}", protocol.id, e);
                    report.skipped.push((protocol.id.clone(), e.to_string()));
                },
            }
        }

        info!(
            "Started {} protocol(s), skipped {}",
            report.started.len(),
            report.skipped.len()
        );
        report
    }

    /// Stop one protocol: cancel its loop and dispose its driver
    pub async fn stop_protocol(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some((_, entry)) = self.entries.remove(id) else {
            return Err(CollectError::protocol_not_found(id));
        };
        let pending = self.shutdown_entry(&entry).await;
        self.cancel_writes(pending, id).await;
        Ok(())
    }

    /// Replace a protocol's configuration. The old driver is disposed before
    /// the new one opens its transport.
    pub async fn restart_protocol(&self, protocol: Protocol) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(Arc::new(protocol)).await
    }

    /// Stop every protocol concurrently
    pub async fn stop_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let ids = self.protocol_ids();
        let entries: Vec<(String, Arc<ProtocolEntry>)> = ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();
        if entries.is_empty() {
            return;
        }

        let stopped = join_all(entries.iter().map(|(id, entry)| async move {
            let pending = self.shutdown_entry(entry).await;
            (id.clone(), pending)
        }))
        .await;
        for (id, pending) in stopped {
            self.cancel_writes(pending, &id).await;
        }
        info!("Stopped {} protocol(s)", entries.len());
    }

    /// Route a write to the protocol's queue. Unknown or stopped protocols
    /// complete the task with an error and publish the notification.
    pub async fn submit_write(&self, mut task: WriteTask) -> bool {
        let entry = self
            .entries
            .get(&task.protocol_id)
            .map(|e| Arc::clone(e.value()));
        match entry {
            Some(entry) if entry.accepts_writes() => {
                // Enqueue under the read lock so a driver swap cannot lose it
                let driver = entry.driver.read();
                debug!("Proto{} write queued: {}/{}", task.protocol_id, task.equipment_id, task.label);
                driver.enqueue_write(task);
                true
            },
            _ => {
                task.fail(format!("Protocol {} is not running", task.protocol_id));
                warn!("Write {} rejected: protocol {} not running", task.id, task.protocol_id);
                self.shared.publish_writes(vec![task]).await;
                false
            },
        }
    }

    pub fn statuses(&self) -> Vec<ProtocolStatus> {
        let mut statuses: Vec<ProtocolStatus> = self
            .entries
            .iter()
            .map(|e| {
                let entry = e.value();
                ProtocolStatus {
                    id: entry.protocol.id.clone(),
                    protocol_type: entry.protocol.protocol_type.clone(),
                    state: *entry.state.read(),
                    connection: entry.driver().state(),
                    last_cycle: entry.last_cycle.read().clone(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn status(&self, id: &str) -> Option<ProtocolStatus> {
        self.statuses().into_iter().find(|s| s.id == id)
    }

    /// Caller holds the lifecycle lock
    async fn start_locked(&self, protocol: Arc<Protocol>) -> Result<()> {
        ProtocolValidator::validate(&protocol)?;
        // Drivers open lazily, so creating one does not touch the transport yet
        let driver = self.shared.registry.create(Arc::clone(&protocol))?;

        let entry = Arc::new(ProtocolEntry {
            protocol: Arc::clone(&protocol),
            driver: RwLock::new(driver),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            state: RwLock::new(TaskState::Starting),
            last_cycle: RwLock::new(None),
        });

        // Atomic replacement: readers see the old entry or the new one
        if let Some(old) = self.entries.insert(protocol.id.clone(), Arc::clone(&entry)) {
            info!("Proto{} restarting", protocol.id);
            let pending = self.shutdown_entry(&old).await;
            let driver = entry.driver();
            for task in pending {
                driver.enqueue_write(task);
            }
        }

        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), Arc::clone(&entry)));
        *entry.handle.lock() = Some(handle);
        debug!("Proto{} scheduled every {}ms", protocol.id, protocol.cycle_ms);
        Ok(())
    }

    /// Cancel the loop, wait for it and dispose the driver. Returns the
    /// writes that never ran.
    async fn shutdown_entry(&self, entry: &ProtocolEntry) -> Vec<WriteTask> {
        entry.set_state(TaskState::Stopping);
        entry.cancel.cancel();

        let handle = entry.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Proto{} poll task ended abnormally: {}", entry.protocol.id, e);
            }
        }

        let driver = entry.driver();
        let pending = driver.take_pending_writes();
        driver.dispose().await;
        entry.set_state(TaskState::Stopped);
        info!("Proto{} stopped", entry.protocol.id);
        pending
    }

    async fn cancel_writes(&self, pending: Vec<WriteTask>, id: &str) {
        if pending.is_empty() {
            return;
        }
        let cancelled = pending
            .into_iter()
            .map(|mut task| {
                task.cancel(format!("Protocol {} stopped", id));
                task
            })
            .collect();
        self.shared.publish_writes(cancelled).await;
    }
}

/// Dispose a faulted driver and install a fresh one. Queued writes move
/// across; the slot write lock keeps submitters out meanwhile.
async fn replace_faulted(shared: &Shared, entry: &ProtocolEntry) -> Result<Arc<dyn Driver>> {
    let current = entry.driver();
    if current.state() != ConnectionState::Faulted {
        return Ok(current);
    }

    // Old transport is already closed by the fault; dispose before opening anew
    current.dispose().await;
    let fresh = shared.registry.create(Arc::clone(&entry.protocol))?;
    {
        let mut slot = entry.driver.write();
        for task in slot.take_pending_writes() {
            fresh.enqueue_write(task);
        }
        *slot = Arc::clone(&fresh);
    }
    info!("Proto{} driver recreated after fault", entry.protocol.id);
    Ok(fresh)
}

async fn poll_loop(shared: Arc<Shared>, entry: Arc<ProtocolEntry>) {
    let protocol = Arc::clone(&entry.protocol);
    let cancel = entry.cancel.clone();
    let cycle = Duration::from_millis(protocol.cycle_ms.max(1));
    entry.set_state(TaskState::Running);
    info!("Proto{} ({}) running", protocol.id, protocol.protocol_type);

    let mut held = transform::HeldValues::default();

    'cycles: while !cancel.is_cancelled() {
        let cycle_start = Instant::now();

        let driver = match replace_faulted(&shared, &entry).await {
            Ok(driver) => driver,
            Err(e) => {
                error!(
                    "Proto{} driver recreation failed [{}]: {}",
                    protocol.id,
                    e.error_code(),
                    e
                );
                let mut failed = ProtocolResult::begin(&protocol);
                failed.set_fault(e.to_string());
                failed.finish();
                *entry.last_cycle.write() = Some(CycleSummary::of(&failed));
                shared.publish_result(&failed, &cancel).await;
                tokio::select! {
                    _ = cancel.cancelled() => break 'cycles,
                    _ = tokio::time::sleep_until(cycle_start + cycle) => continue 'cycles,
                }
            },
        };

        let outcome = driver.poll(&cancel).await;
        shared.publish_writes(outcome.writes).await;
        if cancel.is_cancelled() {
            break;
        }

        let result = transform::apply(&protocol, outcome.result, &mut held);
        if !result.success {
            debug!(
                "Proto{} cycle failed: {}",
                protocol.id,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        *entry.last_cycle.write() = Some(CycleSummary::of(&result));
        shared.publish_result(&result, &cancel).await;

        // Period measured start-to-start; writes are drained early meanwhile
        let deadline = cycle_start + cycle;
        let notify = driver.write_notifier();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'cycles,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = notify.notified() => {
                    let writes = driver.drain_writes(&cancel).await;
                    shared.publish_writes(writes).await;
                },
            }
        }
    }

    debug!("Proto{} poll loop exited", protocol.id);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::test_utils::{mock_registry, sample_protocol, MemoryPublisher, MockControl};
    use edgelink_model::WriteStatus;

    fn manager(control: &MockControl) -> (ProtocolTaskManager, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let manager = ProtocolTaskManager::new(
            mock_registry(control),
            publisher.clone(),
            BusTopics::default(),
        );
        (manager, publisher)
    }

    fn workstation(ids: &[&str]) -> Workstation {
        Workstation {
            id: "ws".into(),
            name: "ws".into(),
            protocols: ids.iter().copied().map(sample_protocol).collect(),
        }
    }

    #[tokio::test]
    async fn test_start_all_skips_unknown_types() {
        let control = MockControl::new();
        let (manager, publisher) = manager(&control);
        let mut ws = workstation(&["p1", "p2"]);
        ws.protocols[1].protocol_type = "S7".into();

        let report = manager.start_all(&ws).await;
        assert_eq!(report.started, vec!["p1".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "p2");

        publisher.wait_for("edgelink:data:p1", 1).await;
        manager.stop_all().await;
        assert_eq!(manager.running_count(), 0);
        assert_eq!(control.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_one_transport() {
        let control = MockControl::new();
        let (manager, publisher) = manager(&control);
        manager.start_all(&workstation(&["p1"])).await;
        publisher.wait_for("edgelink:data:p1", 1).await;

        let mut changed = sample_protocol("p1");
        changed.cycle_ms = 50;
        manager.restart_protocol(changed.clone()).await.unwrap();
        manager.restart_protocol(changed).await.unwrap();
        publisher.wait_for("edgelink:data:p1", 3).await;

        assert_eq!(control.open_handles(), 1);
        assert!(control.max_open_handles() <= 1);
        manager.stop_all().await;
        assert_eq!(control.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_protocol() {
        let control = MockControl::new();
        let (manager, _) = manager(&control);
        assert!(matches!(
            manager.stop_protocol("nope").await.unwrap_err(),
            CollectError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_write_to_unknown_protocol_is_reported() {
        let control = MockControl::new();
        let (manager, publisher) = manager(&control);
        let accepted = manager
            .submit_write(WriteTask::new("ghost", "e1", "a", "1"))
            .await;
        assert!(!accepted);

        let notes = publisher.write_results();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status, WriteStatus::Error);
    }

    #[tokio::test]
    async fn test_write_runs_before_next_cycle() {
        let control = MockControl::new();
        let (manager, publisher) = manager(&control);
        let mut ws = workstation(&["p1"]);
        ws.protocols[0].cycle_ms = 60_000;
        manager.start_all(&ws).await;
        publisher.wait_for("edgelink:data:p1", 1).await;

        assert!(manager.submit_write(WriteTask::new("p1", "e1", "a", "9")).await);
        publisher.wait_for("edgelink:write:result", 1).await;
        let notes = publisher.write_results();
        assert_eq!(notes[0].status, WriteStatus::Completed);
        assert_eq!(control.writes(), vec![("40001".to_string(), vec![9])]);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_faulted_driver_is_recreated() {
        let control = MockControl::new();
        control.fail_reads_with(Some(CollectError::connection("line down")));
        let (manager, publisher) = manager(&control);
        let mut ws = workstation(&["p1"]);
        ws.protocols[0].cycle_ms = 20;
        manager.start_all(&ws).await;

        publisher.wait_for("edgelink:data:p1", 1).await;
        control.fail_reads_with(None);
        publisher.wait_for("edgelink:data:p1", 4).await;

        let status = manager.status("p1").unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert!(control.open_attempts() >= 2);
        assert!(status.last_cycle.unwrap().success);
        manager.stop_all().await;
        assert_eq!(control.open_handles(), 0);
    }
}
