//! Test utilities for collectsrv
//!
//! Shared by unit tests and the integration tests under `tests/`: a sample
//! protocol, a scriptable mock transport that counts open handles, an
//! in-memory publisher and an in-memory configuration store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgelink_model::{
    ByteOrder, DataType, Equipment, EquipmentKind, InterfaceConfig, Point, Protocol,
    ProtocolResult, Workstation, WriteTask,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::bus::{BusTopics, Payload, Publisher};
use crate::core::driver::registry::{DriverFactory, DriverRegistry};
use crate::core::driver::{
    Driver, LinkSettings, ProtocolDriver, RawValue, ReadRequest, TransportStrategy, WriteRequest,
};
use crate::core::store::{ConfigSnapshot, ConfigStore};
use crate::error::{CollectError, Result};

// ==================== Sample configuration ====================

pub fn point(label: &str, address: &str, data_type: DataType) -> Point {
    Point {
        label: label.to_string(),
        name: label.to_string(),
        address: address.to_string(),
        data_type,
        length: 0,
        byte_order: ByteOrder::ABCD,
        zero_based: false,
        station: 1,
        instrument_type: None,
        cycle_ms: None,
        expression: String::new(),
        min: None,
        max: None,
        default_value: None,
    }
}

/// Protocol of type `Mock` with one equipment `e1` holding three ushort
/// points `a`, `b`, `c` at 40001..40003
pub fn sample_protocol(id: &str) -> Protocol {
    Protocol {
        id: id.to_string(),
        name: format!("Protocol {}", id),
        protocol_type: "Mock".to_string(),
        cycle_ms: 100,
        receive_timeout_ms: 3000,
        connect_timeout_ms: 3000,
        interface: InterfaceConfig::Lan {
            ip: "127.0.0.1".to_string(),
            port: 502,
        },
        equipments: vec![Equipment {
            id: "e1".to_string(),
            name: "Meter".to_string(),
            kind: EquipmentKind::Device,
            points: vec![
                point("a", "40001", DataType::UShort),
                point("b", "40002", DataType::UShort),
                point("c", "40003", DataType::UShort),
            ],
        }],
    }
}

pub fn sample_workstation(ids: &[&str]) -> Workstation {
    Workstation {
        id: "ws".to_string(),
        name: "Test plant".to_string(),
        protocols: ids.iter().copied().map(sample_protocol).collect(),
    }
}

// ==================== Mock transport ====================

#[derive(Default)]
struct MockState {
    words: HashMap<String, Vec<u16>>,
    fail_open: bool,
    fail_reads: Option<CollectError>,
    read_delay: Option<Duration>,
    settings: Vec<LinkSettings>,
    writes: Vec<(String, Vec<u16>)>,
    op_log: Vec<String>,
}

#[derive(Default)]
struct MockInner {
    state: Mutex<MockState>,
    open_attempts: AtomicUsize,
    open_count: AtomicUsize,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
    close_count: AtomicUsize,
}

/// Script and observe every `MockTransport` created from it
#[derive(Clone, Default)]
pub struct MockControl {
    inner: Arc<MockInner>,
}

impl MockControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_words(&self, address: &str, words: Vec<u16>) {
        self.inner.state.lock().words.insert(address.to_string(), words);
    }

    pub fn fail_open(&self, fail: bool) {
        self.inner.state.lock().fail_open = fail;
    }

    pub fn fail_reads_with(&self, error: Option<CollectError>) {
        self.inner.state.lock().fail_reads = error;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.inner.state.lock().read_delay = Some(delay);
    }

    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    /// Transports currently open
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    pub fn max_open_handles(&self) -> usize {
        self.inner.max_open_handles.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> Vec<LinkSettings> {
        self.inner.state.lock().settings.clone()
    }

    pub fn writes(&self) -> Vec<(String, Vec<u16>)> {
        self.inner.state.lock().writes.clone()
    }

    /// `open`, `close`, `read <address>`, `write <address>` in call order
    pub fn op_log(&self) -> Vec<String> {
        self.inner.state.lock().op_log.clone()
    }

    fn log(&self, op: String) {
        self.inner.state.lock().op_log.push(op);
    }
}

pub struct MockTransport {
    control: MockControl,
    open: bool,
}

impl MockTransport {
    pub fn new(control: MockControl) -> Self {
        Self {
            control,
            open: false,
        }
    }
}

#[async_trait]
impl TransportStrategy for MockTransport {
    async fn open(&mut self, _protocol: &Protocol) -> Result<()> {
        let inner = &self.control.inner;
        inner.open_attempts.fetch_add(1, Ordering::SeqCst);
        if inner.state.lock().fail_open {
            return Err(CollectError::connection("refused"));
        }
        self.open = true;
        inner.open_count.fetch_add(1, Ordering::SeqCst);
        let handles = inner.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_open_handles.fetch_max(handles, Ordering::SeqCst);
        self.control.log("open".to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.control.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
            self.control.inner.close_count.fetch_add(1, Ordering::SeqCst);
            self.control.log("close".to_string());
        }
        Ok(())
    }

    fn configure(&mut self, settings: LinkSettings) {
        self.control.inner.state.lock().settings.push(settings);
    }

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue> {
        self.control.log(format!("read {}", request.address));
        let (delay, failure, words) = {
            let state = self.control.inner.state.lock();
            (
                state.read_delay,
                state.fail_reads.clone(),
                state.words.get(request.address).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(RawValue::Words(words.unwrap_or_else(|| {
            vec![0; usize::from(request.registers.max(1))]
        })))
    }

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()> {
        self.control.log(format!("write {}", request.address));
        let mut state = self.control.inner.state.lock();
        state.words.insert(request.address.to_string(), request.registers.clone());
        state.writes.push((request.address.to_string(), request.registers));
        Ok(())
    }
}

pub fn mock_driver(protocol: Protocol, control: &MockControl) -> Arc<ProtocolDriver<MockTransport>> {
    let control = control.clone();
    Arc::new(ProtocolDriver::new(
        Arc::new(protocol),
        Arc::new(move |_: &Protocol| Ok(MockTransport::new(control.clone()))),
    ))
}

struct MockFactory {
    control: MockControl,
}

impl DriverFactory for MockFactory {
    fn protocol_types(&self) -> &'static [&'static str] {
        &["Mock"]
    }

    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        let control = self.control.clone();
        Ok(Arc::new(ProtocolDriver::new(
            protocol,
            Arc::new(move |_: &Protocol| Ok(MockTransport::new(control.clone()))),
        )))
    }
}

/// Built-in drivers plus `Mock` bound to `control`
pub fn mock_registry(control: &MockControl) -> Arc<DriverRegistry> {
    let registry = DriverRegistry::with_builtin();
    registry.register(Arc::new(MockFactory {
        control: control.clone(),
    }));
    Arc::new(registry)
}

// ==================== Memory publisher ====================

/// Records every publish call
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, Payload)>>,
    topics: BusTopics,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, topic: &str) -> Vec<Payload> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.messages.lock().iter().filter(|(t, _)| t == topic).count()
    }

    pub fn results(&self, protocol_id: &str) -> Vec<ProtocolResult> {
        self.messages(&self.topics.data_topic(protocol_id))
            .iter()
            .filter_map(|p| serde_json::from_slice(p.as_bytes()).ok())
            .collect()
    }

    pub fn write_results(&self) -> Vec<WriteTask> {
        self.messages(&self.topics.write_result)
            .iter()
            .filter_map(|p| serde_json::from_slice(p.as_bytes()).ok())
            .collect()
    }

    /// Wait until `topic` has seen at least `n` messages; panics after 5s
    pub async fn wait_for(&self, topic: &str, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.count(topic) < n {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} messages on {}", n, topic);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Payload, _cancel: &CancellationToken) -> bool {
        self.messages.lock().push((topic.to_string(), payload));
        true
    }
}

// ==================== Memory store ====================

/// Configuration store whose content tests swap at will
pub struct MemoryStore {
    snapshot: Mutex<ConfigSnapshot>,
    fail_next: Mutex<Option<CollectError>>,
}

impl MemoryStore {
    pub fn new(workstation: Workstation, revision: &str) -> Self {
        Self {
            snapshot: Mutex::new(ConfigSnapshot {
                workstation,
                revision: revision.to_string(),
            }),
            fail_next: Mutex::new(None),
        }
    }

    pub fn set(&self, workstation: Workstation, revision: &str) {
        *self.snapshot.lock() = ConfigSnapshot {
            workstation,
            revision: revision.to_string(),
        };
    }

    pub fn fail_next(&self, error: CollectError) {
        *self.fail_next.lock() = Some(error);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn latest(&self) -> Result<ConfigSnapshot> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        Ok(self.snapshot.lock().clone())
    }
}
