//! Protocol driver abstraction
//!
//! One `ProtocolDriver` binds to exactly one `Protocol` for its lifetime. It
//! owns the transport (a `TransportStrategy` supplied by a codec binding),
//! serializes every operation against it, and owns the write-priority queue
//! for that transport.
//!
//! Connection state machine:
//!
//! ```text
//! Unconnected → Connecting → Open → Closed   (dispose)
//!                    │         └──→ Faulted  (I/O error, timeout, cancellation)
//!                    └──────────→ Faulted    (open failed)
//! ```
//!
//! A faulted driver never reconnects by itself; the task manager disposes it
//! and builds a fresh one at the next cycle boundary.

pub mod database;
pub mod http_api;
pub mod modbus;
pub mod registry;
pub mod simulator;
pub mod value;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use edgelink_model::{
    ByteOrder, DataType, EquipmentResult, Point, PointResult, Protocol, ProtocolResult, WriteTask,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::queue::{Work, WritePriorityQueue};
use crate::core::transform;
use crate::error::{CollectError, Result};

pub use registry::{register_builtin_drivers, DriverFactory, DriverRegistry};
pub use value::{NativeValue, RawValue};

// ============================================================================
// Transport strategy (codec seam)
// ============================================================================

/// Per-operation link settings; one transport may serve points on several stations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub station: u8,
    pub byte_order: ByteOrder,
}

impl LinkSettings {
    pub fn for_point(point: &Point) -> Self {
        Self {
            station: point.station,
            byte_order: point.byte_order,
        }
    }
}

/// What to read
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    pub equipment_id: &'a str,
    pub address: &'a str,
    pub data_type: &'a DataType,
    /// Registers occupied by the value (codecs without registers ignore it)
    pub registers: u16,
    pub zero_based: bool,
}

/// What to write; `registers` is the value laid out in the point's byte order
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub equipment_id: &'a str,
    pub address: &'a str,
    pub data_type: &'a DataType,
    pub zero_based: bool,
    pub value: NativeValue,
    pub registers: Vec<u16>,
}

/// Open/close plus read/write primitives of one protocol family.
///
/// Implementations are not required to be safe for concurrent use; the driver
/// guarantees one in-flight call at a time.
#[async_trait]
pub trait TransportStrategy: Send + 'static {
    async fn open(&mut self, protocol: &Protocol) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Apply station / byte order before an operation
    fn configure(&mut self, settings: LinkSettings);

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue>;

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()>;
}

/// Builds an unopened transport for a protocol
pub type TransportFactory<T> = Arc<dyn Fn(&Protocol) -> Result<T> + Send + Sync>;

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Closed,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of one poll step
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub result: ProtocolResult,
    /// Writes executed during this step, with final status
    pub writes: Vec<WriteTask>,
}

// ============================================================================
// Driver (object-safe surface used by the task manager)
// ============================================================================

#[async_trait]
pub trait Driver: Send + Sync {
    fn protocol(&self) -> &Arc<Protocol>;

    fn state(&self) -> ConnectionState;

    /// Read one point; every failure is reported in the returned result
    async fn read(
        &self,
        equipment_id: &str,
        point: &Point,
        cancel: &CancellationToken,
    ) -> PointResult;

    /// Execute one write; `false` on any failure including unparseable values
    async fn write(&self, task: &WriteTask, cancel: &CancellationToken) -> bool;

    /// Queue a write for the next poll step (non-blocking)
    fn enqueue_write(&self, task: WriteTask);

    /// Signalled whenever a write is queued
    fn write_notifier(&self) -> Arc<Notify>;

    fn pending_writes(&self) -> usize;

    /// Remove queued writes without executing them
    fn take_pending_writes(&self) -> Vec<WriteTask>;

    /// Execute queued writes only
    async fn drain_writes(&self, cancel: &CancellationToken) -> Vec<WriteTask>;

    /// One poll step: drain writes, then read every equipment in order
    async fn poll(&self, cancel: &CancellationToken) -> PollOutcome;

    /// Release the transport; idempotent
    async fn dispose(&self);
}

// ============================================================================
// Generic protocol driver
// ============================================================================

/// Read batch: index of an equipment in the protocol configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadBatch(usize);

struct Link<T> {
    transport: Option<T>,
}

pub struct ProtocolDriver<T: TransportStrategy> {
    protocol: Arc<Protocol>,
    factory: TransportFactory<T>,
    /// Held for the duration of every transport call
    link: tokio::sync::Mutex<Link<T>>,
    state: RwLock<ConnectionState>,
    queue: Mutex<WritePriorityQueue<ReadBatch, WriteTask>>,
    write_notify: Arc<Notify>,
    /// Last read time of points carrying a cycle override
    last_read: Mutex<HashMap<(String, String), Instant>>,
    disposed: AtomicBool,
}

impl<T: TransportStrategy> fmt::Debug for ProtocolDriver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDriver")
            .field("protocol", &self.protocol.id)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl<T: TransportStrategy> ProtocolDriver<T> {
    pub fn new(protocol: Arc<Protocol>, factory: TransportFactory<T>) -> Self {
        Self {
            protocol,
            factory,
            link: tokio::sync::Mutex::new(Link { transport: None }),
            state: RwLock::new(ConnectionState::Unconnected),
            queue: Mutex::new(WritePriorityQueue::new()),
            write_notify: Arc::new(Notify::new()),
            last_read: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Proto{} {} -> {}", self.protocol.id, *current, state);
            *current = state;
        }
    }

    fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.receive_timeout_ms.max(1))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.connect_timeout_ms.max(1))
    }

    /// Lazily create and open the transport. Caller holds the link lock.
    async fn ensure_open(&self, link: &mut Link<T>, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CollectError::state(format!(
                "Driver for {} is disposed",
                self.protocol.id
            )));
        }
        match *self.state.read() {
            ConnectionState::Open if link.transport.is_some() => return Ok(()),
            ConnectionState::Faulted => {
                return Err(CollectError::connection(format!(
                    "Driver for {} is faulted",
                    self.protocol.id
                )))
            },
            _ => {},
        }

        self.set_state(ConnectionState::Connecting);
        let mut transport = match (self.factory)(&*self.protocol) {
            Ok(t) => t,
            Err(e) => {
                self.set_state(ConnectionState::Faulted);
                return Err(e.into_driver_error());
            },
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(CollectError::Cancelled("open".to_string())),
            r = tokio::time::timeout(self.connect_timeout(), transport.open(&*self.protocol)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(CollectError::connection(format!(
                    "Open timed out after {}ms",
                    self.protocol.connect_timeout_ms
                ))),
            },
        };

        match opened {
            Ok(()) => {
                link.transport = Some(transport);
                self.set_state(ConnectionState::Open);
                info!("Proto{} connected", self.protocol.id);
                Ok(())
            },
            Err(e) => {
                // Release whatever the half-open attempt acquired
                let _ = transport.close().await;
                self.set_state(ConnectionState::Faulted);
                warn!("Proto{} open failed: {}", self.protocol.id, e);
                Err(match e {
                    CollectError::Cancelled(_) => e,
                    other => CollectError::connection(other.to_string()),
                })
            },
        }
    }

    /// Run one transport call under timeout and cancellation
    async fn bounded<R>(
        &self,
        cancel: &CancellationToken,
        op: impl std::future::Future<Output = Result<R>>,
    ) -> Result<R> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CollectError::Cancelled(format!("Proto{} operation", self.protocol.id))),
            r = tokio::time::timeout(self.receive_timeout(), op) => match r {
                Ok(inner) => inner.map_err(CollectError::into_driver_error),
                Err(_) => Err(CollectError::connection(format!(
                    "No response within {}ms",
                    self.protocol.receive_timeout_ms
                ))),
            },
        }
    }

    /// A timeout, a cancellation or a connection error faults the driver and
    /// closes the transport, so it is left either Open or Faulted.
    async fn settle<R>(&self, link: &mut Link<T>, outcome: Result<R>) -> Result<R> {
        if let Err(e) = &outcome {
            if e.faults_transport() || matches!(e, CollectError::Cancelled(_)) {
                self.fault(link, e).await;
            }
        }
        outcome
    }

    async fn fault(&self, link: &mut Link<T>, cause: &CollectError) {
        warn!("Proto{} faulted: {}", self.protocol.id, cause);
        self.set_state(ConnectionState::Faulted);
        if let Some(mut transport) = link.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Proto{} close after fault: {}", self.protocol.id, e);
            }
        }
    }

    async fn read_value(
        &self,
        equipment_id: &str,
        point: &Point,
        cancel: &CancellationToken,
    ) -> Result<NativeValue> {
        if let DataType::Unknown(tag) = &point.data_type {
            return Err(CollectError::unsupported(tag));
        }

        let mut link = self.link.lock().await;
        self.ensure_open(&mut link, cancel).await?;

        let Some(transport) = link.transport.as_mut() else {
            return Err(CollectError::NullTransport(self.protocol.id.clone()));
        };
        transport.configure(LinkSettings::for_point(point));

        let request = ReadRequest {
            equipment_id,
            address: &point.address,
            data_type: &point.data_type,
            registers: point.data_type.register_count(point.length),
            zero_based: point.zero_based,
        };
        let outcome = self.bounded(cancel, transport.read(request)).await;
        let raw = self.settle(&mut link, outcome).await?;
        drop(link);

        value::decode(raw, &point.data_type, point.byte_order, point.length)
    }

    async fn execute_write(&self, mut task: WriteTask, cancel: &CancellationToken) -> WriteTask {
        match self.write_value(&task, cancel).await {
            Ok(()) => {
                debug!("Proto{} wrote {}/{} = {}", self.protocol.id, task.equipment_id, task.label, task.value);
                task.complete();
            },
            Err(CollectError::Cancelled(reason)) => task.cancel(reason),
            Err(e) => {
                warn!("Proto{} write {}/{} failed: {}", self.protocol.id, task.equipment_id, task.label, e);
                task.fail(e.to_string());
            },
        }
        task
    }

    async fn write_value(&self, task: &WriteTask, cancel: &CancellationToken) -> Result<()> {
        let point = self
            .protocol
            .point(&task.equipment_id, &task.label)
            .ok_or_else(|| {
                CollectError::NotFound(format!("Point {}/{}", task.equipment_id, task.label))
            })?;
        if point.is_virtual() {
            return Err(CollectError::validation(format!(
                "Virtual point {} is not writable",
                point.label
            )));
        }
        if let DataType::Unknown(tag) = &point.data_type {
            return Err(CollectError::unsupported(tag));
        }

        let raw = transform::prepare_write(point, &task.value)?;
        let native = value::parse_native(&point.data_type, &raw).ok_or_else(|| {
            CollectError::validation(format!(
                "Value '{}' does not parse as {}",
                task.value, point.data_type
            ))
        })?;

        let mut link = self.link.lock().await;
        self.ensure_open(&mut link, cancel).await?;
        let Some(transport) = link.transport.as_mut() else {
            return Err(CollectError::NullTransport(self.protocol.id.clone()));
        };
        transport.configure(LinkSettings::for_point(point));

        let request = WriteRequest {
            equipment_id: &task.equipment_id,
            address: &point.address,
            data_type: &point.data_type,
            zero_based: point.zero_based,
            registers: native.to_registers(point.byte_order),
            value: native,
        };
        let outcome = self.bounded(cancel, transport.write(request)).await;
        self.settle(&mut link, outcome).await
    }

    /// Whether a point with a cycle override is due in this cycle
    fn is_due(&self, equipment_id: &str, point: &Point, now: Instant) -> bool {
        let Some(cycle_ms) = point.cycle_ms else {
            return true;
        };
        let key = (equipment_id.to_string(), point.label.clone());
        match self.last_read.lock().get(&key) {
            Some(at) => now.duration_since(*at) >= Duration::from_millis(cycle_ms),
            None => true,
        }
    }

    /// Start a new override interval; failed reads are retried next cycle
    fn mark_read(&self, equipment_id: &str, point: &Point, at: Instant) {
        if point.cycle_ms.is_some() {
            self.last_read
                .lock()
                .insert((equipment_id.to_string(), point.label.clone()), at);
        }
    }

    /// Read one equipment; returns the connection error that aborted it, if any
    async fn read_equipment(
        &self,
        index: usize,
        cancel: &CancellationToken,
    ) -> (EquipmentResult, Option<CollectError>) {
        let equipment = &self.protocol.equipments[index];
        let mut result = EquipmentResult::begin(equipment);
        let now = Instant::now();

        for point in &equipment.points {
            // Virtual points are resolved by the transform stage
            if point.is_virtual() || !self.is_due(&equipment.id, point, now) {
                continue;
            }
            let started = Utc::now();
            match self.read_value(&equipment.id, point, cancel).await {
                Ok(v) => {
                    self.mark_read(&equipment.id, point, now);
                    result.points.push(PointResult::ok(point, v.into(), started));
                },
                Err(e) => {
                    let aborts = e.faults_transport() || matches!(e, CollectError::Cancelled(_));
                    result.points.push(PointResult::failed(point, e.to_string(), started));
                    if aborts {
                        result.set_fault(e.to_string());
                        result.finish();
                        return (result, Some(e));
                    }
                },
            }
        }

        result.finish();
        (result, None)
    }
}

#[async_trait]
impl<T: TransportStrategy> Driver for ProtocolDriver<T> {
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn read(
        &self,
        equipment_id: &str,
        point: &Point,
        cancel: &CancellationToken,
    ) -> PointResult {
        let started = Utc::now();
        match self.read_value(equipment_id, point, cancel).await {
            Ok(v) => PointResult::ok(point, v.into(), started),
            Err(e) => PointResult::failed(point, e.to_string(), started),
        }
    }

    async fn write(&self, task: &WriteTask, cancel: &CancellationToken) -> bool {
        self.write_value(task, cancel).await.is_ok()
    }

    fn enqueue_write(&self, task: WriteTask) {
        self.queue.lock().enqueue_write(task);
        self.write_notify.notify_one();
    }

    fn write_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.write_notify)
    }

    fn pending_writes(&self) -> usize {
        self.queue.lock().pending_writes()
    }

    fn take_pending_writes(&self) -> Vec<WriteTask> {
        self.queue.lock().drain_writes()
    }

    async fn drain_writes(&self, cancel: &CancellationToken) -> Vec<WriteTask> {
        let mut done = Vec::new();
        loop {
            let next = self.queue.lock().try_dequeue_write();
            let Some(task) = next else { break };
            done.push(self.execute_write(task, cancel).await);
        }
        done
    }

    async fn poll(&self, cancel: &CancellationToken) -> PollOutcome {
        let mut result = ProtocolResult::begin(&self.protocol);
        let mut writes = Vec::new();

        {
            let mut queue = self.queue.lock();
            queue.clear_reads();
            for index in 0..self.protocol.equipments.len() {
                queue.enqueue_read(ReadBatch(index));
            }
        }

        loop {
            let next = self.queue.lock().next_work();
            match next {
                None => break,
                Some(Work::Write(task)) => writes.push(self.execute_write(task, cancel).await),
                Some(Work::Read(ReadBatch(index))) => {
                    let (equipment, abort) = self.read_equipment(index, cancel).await;
                    result.equipments.push(equipment);
                    if let Some(e) = abort {
                        // Whole cycle failed; queued writes are still executed (and fail fast)
                        result.set_fault(e.to_string());
                        self.queue.lock().clear_reads();
                    }
                },
            }
        }

        result.finish();
        PollOutcome { result, writes }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut link = self.link.lock().await;
        if let Some(mut transport) = link.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Proto{} close failed: {}", self.protocol.id, e);
            }
        }
        self.set_state(ConnectionState::Closed);
        info!("Proto{} disposed", self.protocol.id);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::transform::{apply, HeldValues};
    use crate::test_utils::{mock_driver, point, sample_protocol, MockControl};
    use edgelink_model::{CalcValue, WriteStatus, VIRTUAL_POINT_ADDRESS};

    #[tokio::test]
    async fn test_lazy_open_and_read() {
        let control = MockControl::new();
        control.set_words("40001", vec![1234]);
        let driver = mock_driver(sample_protocol("p1"), &control);
        assert_eq!(driver.state(), ConnectionState::Unconnected);
        assert_eq!(control.open_count(), 0);

        let protocol = Arc::clone(driver.protocol());
        let point = protocol.point("e1", "a").unwrap();
        let r = driver.read("e1", point, &CancellationToken::new()).await;
        assert!(r.success, "{:?}", r.error);
        assert_eq!(r.raw, Some(CalcValue::Number(1234.0)));
        assert_eq!(driver.state(), ConnectionState::Open);
        assert_eq!(control.open_count(), 1);
        assert_eq!(control.settings().last().unwrap().station, point.station);
    }

    #[tokio::test]
    async fn test_open_failure_faults_without_reconnect() {
        let control = MockControl::new();
        control.fail_open(true);
        let driver = mock_driver(sample_protocol("p1"), &control);
        let protocol = Arc::clone(driver.protocol());
        let point = protocol.point("e1", "a").unwrap();

        let r = driver.read("e1", point, &CancellationToken::new()).await;
        assert!(!r.success);
        assert!(r.error.unwrap().starts_with("Connection failed"));
        assert_eq!(driver.state(), ConnectionState::Faulted);

        control.fail_open(false);
        let r = driver.read("e1", point, &CancellationToken::new()).await;
        assert!(!r.success);
        assert_eq!(control.open_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_type_fails_point_only() {
        let control = MockControl::new();
        let mut proto = sample_protocol("p1");
        proto.equipments[0].points[1].data_type = DataType::Unknown("bcd".into());
        let driver = mock_driver(proto, &control);

        let outcome = driver.poll(&CancellationToken::new()).await;
        let eq = &outcome.result.equipments[0];
        assert_eq!(eq.failed_count, 1);
        assert!(eq.points[1].error.as_ref().unwrap().contains("Unsupported data type"));
        assert_eq!(driver.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_io_error_faults_cycle() {
        let control = MockControl::new();
        control.fail_reads_with(Some(CollectError::connection("socket closed")));
        let driver = mock_driver(sample_protocol("p1"), &control);

        let outcome = driver.poll(&CancellationToken::new()).await;
        assert!(!outcome.result.success);
        assert!(outcome.result.error.unwrap().contains("socket closed"));
        assert_eq!(driver.state(), ConnectionState::Faulted);
        assert_eq!(control.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_is_wrapped() {
        let control = MockControl::new();
        control.fail_reads_with(Some(CollectError::storage("weird codec state")));
        let driver = mock_driver(sample_protocol("p1"), &control);
        let protocol = Arc::clone(driver.protocol());
        let point = protocol.point("e1", "a").unwrap();

        let r = driver.read("e1", point, &CancellationToken::new()).await;
        assert!(r.error.unwrap().starts_with("Protocol operation failed"));
        assert_eq!(driver.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_write_parse_failure_returns_false() {
        let control = MockControl::new();
        let driver = mock_driver(sample_protocol("p1"), &control);
        let task = WriteTask::new("p1", "e1", "a", "not-a-number");
        assert!(!driver.write(&task, &CancellationToken::new()).await);
        assert!(control.writes().is_empty());

        let task = WriteTask::new("p1", "e1", "a", "42");
        assert!(driver.write(&task, &CancellationToken::new()).await);
        assert_eq!(control.writes(), vec![("40001".to_string(), vec![42])]);
    }

    #[tokio::test]
    async fn test_queued_writes_run_before_reads() {
        let control = MockControl::new();
        let driver = mock_driver(sample_protocol("p1"), &control);
        driver.enqueue_write(WriteTask::new("p1", "e1", "a", "1"));
        driver.enqueue_write(WriteTask::new("p1", "e1", "b", "2"));

        let outcome = driver.poll(&CancellationToken::new()).await;
        assert_eq!(outcome.writes.len(), 2);
        assert!(outcome
            .writes
            .iter()
            .all(|w| w.status == WriteStatus::Completed));

        let log = control.op_log();
        let first_read = log.iter().position(|op| op.starts_with("read")).unwrap();
        let last_write = log.iter().rposition(|op| op.starts_with("write")).unwrap();
        assert!(last_write < first_read, "{:?}", log);
    }

    #[tokio::test]
    async fn test_cancel_mid_read_leaves_faulted_and_closed() {
        let control = MockControl::new();
        control.set_read_delay(Duration::from_millis(500));
        let driver = mock_driver(sample_protocol("p1"), &control);
        let protocol = Arc::clone(driver.protocol());
        let point = protocol.point("e1", "a").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let r = driver.read("e1", point, &cancel).await;
        assert!(!r.success);
        assert_eq!(driver.state(), ConnectionState::Faulted);
        assert_eq!(control.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let control = MockControl::new();
        let driver = mock_driver(sample_protocol("p1"), &control);
        driver.poll(&CancellationToken::new()).await;
        assert_eq!(control.open_handles(), 1);

        driver.dispose().await;
        driver.dispose().await;
        assert_eq!(control.open_handles(), 0);
        assert_eq!(control.close_count(), 1);
        assert_eq!(driver.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_cycle_override_skips_point() {
        let control = MockControl::new();
        let mut proto = sample_protocol("p1");
        proto.equipments[0].points[2].cycle_ms = Some(60_000);
        let driver = mock_driver(proto, &control);

        let first = driver.poll(&CancellationToken::new()).await;
        assert_eq!(first.result.equipments[0].total, 3);
        let second = driver.poll(&CancellationToken::new()).await;
        assert_eq!(second.result.equipments[0].total, 2);
    }

    #[tokio::test]
    async fn test_failed_override_read_is_retried() {
        let control = MockControl::new();
        let mut proto = sample_protocol("p1");
        proto.equipments[0].points[2].cycle_ms = Some(60_000);
        let driver = mock_driver(proto, &control);

        control.fail_reads_with(Some(CollectError::protocol("illegal data address")));
        let first = driver.poll(&CancellationToken::new()).await;
        assert_eq!(first.result.equipments[0].total, 3);
        assert_eq!(first.result.equipments[0].failed_count, 3);

        control.fail_reads_with(None);
        let second = driver.poll(&CancellationToken::new()).await;
        let eq = &second.result.equipments[0];
        assert_eq!(eq.total, 3);
        assert!(eq.points.iter().any(|p| p.label == "c" && p.success));

        let third = driver.poll(&CancellationToken::new()).await;
        assert_eq!(third.result.equipments[0].total, 2);
    }

    #[tokio::test]
    async fn test_virtual_point_uses_held_value_of_skipped_source() {
        let control = MockControl::new();
        control.set_words("40001", vec![21]);
        let mut proto = sample_protocol("p1");
        proto.equipments[0].points[0].cycle_ms = Some(60_000);
        let mut v = point("v", VIRTUAL_POINT_ADDRESS, DataType::Double);
        v.expression = "a * 2".into();
        proto.equipments[0].points.push(v);
        let driver = mock_driver(proto, &control);
        let protocol = Arc::clone(driver.protocol());
        let mut held = HeldValues::default();
        assert!(held.is_empty());

        for cycle in 0..2 {
            let outcome = driver.poll(&CancellationToken::new()).await;
            let result = apply(&protocol, outcome.result, &mut held);
            assert!(result.success, "cycle {}: {:?}", cycle, result.error);
            let eq = &result.equipments[0];
            let v = eq.points.iter().find(|p| p.label == "v").unwrap();
            assert!(v.success, "cycle {}: {:?}", cycle, v.error);
            assert_eq!(v.value, Some(CalcValue::Number(42.0)));
            // The skipped source itself is not reported again
            let reads_of_a = eq.points.iter().filter(|p| p.label == "a").count();
            assert_eq!(reads_of_a, if cycle == 0 { 1 } else { 0 });
        }
        assert_eq!(held.get("e1", "a"), Some(21.0));
        assert_eq!(held.len(), 1);
    }
}
