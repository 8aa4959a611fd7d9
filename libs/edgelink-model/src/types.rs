//! Configuration tree: Workstation → Protocol → Equipment → Point
//!
//! A `Workstation` is loaded from the configuration store as a whole and never
//! mutated afterwards; a new revision produces a new instance.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::validation::ProtocolValidator;

/// Address marking a point as computed rather than read from a device
pub const VIRTUAL_POINT_ADDRESS: &str = "VirtualPoint";

fn default_cycle_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_station() -> u8 {
    1
}

// ============================================================================
// Workstation
// ============================================================================

/// Root configuration unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workstation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

impl Workstation {
    /// Look up a protocol by id
    pub fn protocol(&self, id: &str) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.id == id)
    }

    /// Structural validation of the whole tree.
    ///
    /// Protocol ids must be unique; every protocol must pass
    /// [`ProtocolValidator::validate`]; point labels must be unique per equipment.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for protocol in &self.protocols {
            if !ids.insert(protocol.id.as_str()) {
                return Err(ModelError::DuplicateProtocol(protocol.id.clone()));
            }
            ProtocolValidator::validate(protocol)?;
        }
        Ok(())
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// One physical or logical connection serving one or more equipments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Tag resolved by the driver registry (e.g. `ModbusTcp`)
    pub protocol_type: String,
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub equipments: Vec<Equipment>,
}

impl Protocol {
    pub fn interface_kind(&self) -> InterfaceKind {
        self.interface.kind()
    }

    pub fn equipment(&self, id: &str) -> Option<&Equipment> {
        self.equipments.iter().find(|e| e.id == id)
    }

    /// Find the point targeted by a write
    pub fn point(&self, equipment_id: &str, label: &str) -> Option<&Point> {
        self.equipment(equipment_id)
            .and_then(|e| e.points.iter().find(|p| p.label == label))
    }

    pub fn point_count(&self) -> usize {
        self.equipments.iter().map(|e| e.points.len()).sum()
    }
}

/// Transport parameters, one variant per interface kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InterfaceConfig {
    Lan {
        ip: String,
        port: u16,
    },
    Serial {
        port: String,
        baud_rate: u32,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stop_bits")]
        stop_bits: String,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
    },
    Api {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        auth: Option<ApiAuth>,
    },
    Database {
        connection_string: String,
        query: String,
    },
}

fn default_parity() -> String {
    "None".to_string()
}

fn default_stop_bits() -> String {
    "1".to_string()
}

fn default_data_bits() -> u8 {
    8
}

fn default_method() -> String {
    "GET".to_string()
}

impl InterfaceConfig {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            Self::Lan { .. } => InterfaceKind::Lan,
            Self::Serial { .. } => InterfaceKind::Serial,
            Self::Api { .. } => InterfaceKind::Api,
            Self::Database { .. } => InterfaceKind::Database,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    Lan,
    Serial,
    Api,
    Database,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lan => "Lan",
            Self::Serial => "Serial",
            Self::Api => "Api",
            Self::Database => "Database",
        };
        f.write_str(s)
    }
}

/// HTTP authentication for API interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApiAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl FromStr for HttpMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            other => Err(ModelError::Parse(format!("unknown HTTP method '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl FromStr for Parity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            "mark" | "m" => Ok(Self::Mark),
            "space" | "s" => Ok(Self::Space),
            other => Err(ModelError::Parse(format!("unknown parity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl FromStr for StopBits {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "one" => Ok(Self::One),
            "1.5" | "onepointfive" => Ok(Self::OnePointFive),
            "2" | "two" => Ok(Self::Two),
            other => Err(ModelError::Parse(format!("unknown stop bits '{}'", other))),
        }
    }
}

// ============================================================================
// Equipment / Point
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentKind {
    #[default]
    Device,
    Instrument,
}

/// One device or instrument polled under a protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: EquipmentKind,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Equipment {
    pub(crate) fn validate(&self) -> Result<()> {
        let mut labels = HashSet::new();
        for point in &self.points {
            if !labels.insert(point.label.as_str()) {
                return Err(ModelError::DuplicateLabel {
                    equipment: self.id.clone(),
                    label: point.label.clone(),
                });
            }
            if point.is_virtual() && point.expression.trim().is_empty() {
                return Err(ModelError::validation(format!(
                    "virtual point {} in equipment {} has no expression",
                    point.label, self.id
                )));
            }
        }
        Ok(())
    }
}

/// One addressable value (a "parameter") on an equipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub label: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub data_type: DataType,
    /// Character count for strings
    #[serde(default)]
    pub length: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub zero_based: bool,
    /// Station / slave number
    #[serde(default = "default_station")]
    pub station: u8,
    #[serde(default)]
    pub instrument_type: Option<String>,
    /// Per-point poll interval; read less often than the protocol cycle
    #[serde(default)]
    pub cycle_ms: Option<u64>,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl Point {
    pub fn is_virtual(&self) -> bool {
        self.address == VIRTUAL_POINT_ADDRESS
    }

    /// True when `value` lies within the configured bounds
    pub fn in_range(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

// ============================================================================
// DataType
// ============================================================================

/// Declared data type of a point.
///
/// Unknown tags are kept verbatim so the driver can fail that point alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Bool,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    #[default]
    Float,
    Double,
    String,
    Unknown(String),
}

impl DataType {
    /// Number of 16-bit registers occupied; `length` is the string character count
    pub fn register_count(&self, length: u16) -> u16 {
        match self {
            Self::Bool | Self::Short | Self::UShort => 1,
            Self::Int | Self::UInt | Self::Float => 2,
            Self::Long | Self::ULong | Self::Double => 4,
            Self::String => length.max(1).div_ceil(2),
            Self::Unknown(_) => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Bool => "bool",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Unknown(tag) => tag,
        }
    }
}

impl FromStr for DataType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" | "bit" => Self::Bool,
            "short" | "int16" => Self::Short,
            "ushort" | "uint16" | "word" => Self::UShort,
            "int" | "int32" => Self::Int,
            "uint" | "uint32" | "dword" => Self::UInt,
            "long" | "int64" => Self::Long,
            "ulong" | "uint64" => Self::ULong,
            "float" | "single" | "float32" => Self::Float,
            "double" | "float64" => Self::Double,
            "string" => Self::String,
            _ => Self::Unknown(s.to_string()),
        })
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<DataType> for String {
    fn from(t: DataType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ByteOrder
// ============================================================================

/// Byte order of multi-register values, named by where bytes `A B C D` of a
/// big-endian value land on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum ByteOrder {
    #[default]
    ABCD,
    BADC,
    CDAB,
    DCBA,
}

impl ByteOrder {
    fn swaps_words(self) -> bool {
        matches!(self, Self::CDAB | Self::DCBA)
    }

    fn swaps_bytes(self) -> bool {
        matches!(self, Self::BADC | Self::DCBA)
    }

    /// Registers as read from the device → big-endian bytes
    pub fn to_bytes(self, registers: &[u16]) -> Vec<u8> {
        let mut words = registers.to_vec();
        if self.swaps_words() {
            words.reverse();
        }
        words
            .into_iter()
            .flat_map(|w| {
                if self.swaps_bytes() {
                    w.to_le_bytes()
                } else {
                    w.to_be_bytes()
                }
            })
            .collect()
    }

    /// Big-endian bytes → registers to send to the device
    pub fn to_registers(self, bytes: &[u8]) -> Vec<u16> {
        let mut words: Vec<u16> = bytes
            .chunks(2)
            .map(|c| {
                let pair = [c[0], c.get(1).copied().unwrap_or(0)];
                if self.swaps_bytes() {
                    u16::from_le_bytes(pair)
                } else {
                    u16::from_be_bytes(pair)
                }
            })
            .collect();
        if self.swaps_words() {
            words.reverse();
        }
        words
    }
}

impl FromStr for ByteOrder {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABCD" => Ok(Self::ABCD),
            "BADC" => Ok(Self::BADC),
            "CDAB" => Ok(Self::CDAB),
            "DCBA" => Ok(Self::DCBA),
            other => Err(ModelError::Parse(format!("unknown byte order '{}'", other))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const WORKSTATION_YAML: &str = r#"
id: ws-01
name: Pump house
protocols:
  - id: p1
    protocol_type: ModbusTcp
    cycle_ms: 500
    interface:
      kind: Lan
      ip: 192.168.1.10
      port: 502
    equipments:
      - id: pump1
        name: Pump 1
        points:
          - label: speed
            address: "40001"
            data_type: UInt16
            expression: "x * 0.1"
          - label: temp
            address: "40003"
            data_type: float
            byte_order: CDAB
            min: -40
            max: 120
          - label: power
            address: VirtualPoint
            expression: "speed * 2"
  - id: p2
    protocol_type: ModbusRtu
    interface:
      kind: Serial
      port: /dev/ttyUSB0
      baud_rate: 9600
      parity: Even
    equipments: []
"#;

    #[test]
    fn test_workstation_from_yaml() {
        let ws: Workstation = serde_yaml::from_str(WORKSTATION_YAML).unwrap();
        assert_eq!(ws.protocols.len(), 2);

        let p1 = ws.protocol("p1").unwrap();
        assert_eq!(p1.cycle_ms, 500);
        assert_eq!(p1.receive_timeout_ms, 3000);
        assert_eq!(p1.interface_kind(), InterfaceKind::Lan);
        assert_eq!(p1.point_count(), 3);

        let speed = p1.point("pump1", "speed").unwrap();
        assert_eq!(speed.data_type, DataType::UShort);
        assert_eq!(speed.station, 1);
        assert!(!speed.is_virtual());
        assert!(p1.point("pump1", "power").unwrap().is_virtual());

        let temp = p1.point("pump1", "temp").unwrap();
        assert_eq!(temp.byte_order, ByteOrder::CDAB);
        assert!(temp.in_range(20.0));
        assert!(!temp.in_range(150.0));

        let p2 = ws.protocol("p2").unwrap();
        match &p2.interface {
            InterfaceConfig::Serial {
                parity,
                stop_bits,
                data_bits,
                ..
            } => {
                assert_eq!(parity, "Even");
                assert_eq!(stop_bits, "1");
                assert_eq!(*data_bits, 8);
            },
            other => panic!("unexpected interface {:?}", other),
        }

        ws.validate().unwrap();
    }

    #[test]
    fn test_duplicate_protocol_rejected() {
        let mut ws: Workstation = serde_yaml::from_str(WORKSTATION_YAML).unwrap();
        let copy = ws.protocols[0].clone();
        ws.protocols.push(copy);
        assert_eq!(
            ws.validate(),
            Err(ModelError::DuplicateProtocol("p1".to_string()))
        );
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut ws: Workstation = serde_yaml::from_str(WORKSTATION_YAML).unwrap();
        let dup = ws.protocols[0].equipments[0].points[0].clone();
        ws.protocols[0].equipments[0].points.push(dup);
        assert!(matches!(
            ws.validate(),
            Err(ModelError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn test_data_type_aliases() {
        assert_eq!("INT16".parse::<DataType>().unwrap(), DataType::Short);
        assert_eq!("uint32".parse::<DataType>().unwrap(), DataType::UInt);
        assert_eq!("Single".parse::<DataType>().unwrap(), DataType::Float);
        assert_eq!("Boolean".parse::<DataType>().unwrap(), DataType::Bool);
        assert_eq!(
            "bcd".parse::<DataType>().unwrap(),
            DataType::Unknown("bcd".to_string())
        );
        assert_eq!(DataType::String.register_count(5), 3);
        assert_eq!(DataType::Double.register_count(0), 4);
    }

    #[test]
    fn test_byte_order_layouts() {
        // 0x12345678 as four wire layouts
        let be = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(ByteOrder::ABCD.to_bytes(&[0x1234, 0x5678]), be);
        assert_eq!(ByteOrder::BADC.to_bytes(&[0x3412, 0x7856]), be);
        assert_eq!(ByteOrder::CDAB.to_bytes(&[0x5678, 0x1234]), be);
        assert_eq!(ByteOrder::DCBA.to_bytes(&[0x7856, 0x3412]), be);

        for order in [
            ByteOrder::ABCD,
            ByteOrder::BADC,
            ByteOrder::CDAB,
            ByteOrder::DCBA,
        ] {
            let regs = order.to_registers(&be);
            assert_eq!(order.to_bytes(&regs), be);
        }
    }

    #[test]
    fn test_serial_enums() {
        assert_eq!("even".parse::<Parity>().unwrap(), Parity::Even);
        assert!("bogus".parse::<Parity>().is_err());
        assert_eq!("1.5".parse::<StopBits>().unwrap(), StopBits::OnePointFive);
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
    }
}
