//! Core orchestration modules

pub mod bus;
pub mod driver;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod transform;

pub use driver::{ConnectionState, Driver, DriverRegistry, ProtocolDriver, TransportStrategy};
pub use monitor::{CheckOutcome, ConfigMonitor, ProtocolControl};
pub use queue::{Work, WritePriorityQueue};
pub use scheduler::{ProtocolStatus, ProtocolTaskManager, StartReport, TaskState};
