//! edgelink-model - Data model for EdgeLink
//!
//! Pure, serde-serializable types shared by the collection service:
//!
//! - `types`: Workstation → Protocol → Equipment → Point configuration tree
//! - `result`: the per-cycle read result tree with roll-up counts
//! - `write`: inbound write tasks and their status
//! - `validation`: interface rules a protocol must satisfy before a driver is built
//!
//! # Example
//!
//! ```
//! use edgelink_model::{DataType, ByteOrder};
//!
//! assert_eq!("UInt16".parse::<DataType>().unwrap(), DataType::UShort);
//! assert_eq!(ByteOrder::CDAB.to_bytes(&[0x5678, 0x1234]), vec![0x12, 0x34, 0x56, 0x78]);
//! ```

pub mod error;
pub mod result;
pub mod types;
pub mod validation;
pub mod write;

// Re-exports for convenience
pub use edgelink_calc::CalcValue;
pub use error::{ModelError, Result};
pub use result::{EquipmentResult, PointResult, ProtocolResult};
pub use types::{
    ApiAuth, ByteOrder, DataType, Equipment, EquipmentKind, HttpMethod, InterfaceConfig,
    InterfaceKind, Parity, Point, Protocol, StopBits, Workstation, VIRTUAL_POINT_ADDRESS,
};
pub use validation::ProtocolValidator;
pub use write::{WriteKind, WriteStatus, WriteTask};
