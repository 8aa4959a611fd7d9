//! Modbus TCP / RTU codec binding
//!
//! Wire encoding is delegated to `voltage_modbus`; this module maps points to
//! function codes. Addresses follow the Modicon convention:
//!
//! | Address | Area | Read | Write |
//! |---------|------|------|-------|
//! | `0xxxx` | coil | 0x01 | 0x05 |
//! | `1xxxx` | discrete input | 0x02 | - |
//! | `3xxxx` | input register | 0x04 | - |
//! | `4xxxx` | holding register | 0x03 | 0x06 / 0x10 |
//!
//! Anything shorter than five digits is a bare offset into the holding
//! registers (or the coils, for bool points). Without `zero_based` the
//! offset is 1-based, as printed in device manuals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgelink_model::{DataType, InterfaceConfig, Parity, Protocol, StopBits};
use tracing::debug;
use voltage_modbus::{ModbusClient, ModbusError, ModbusRtuClient, ModbusTcpClient};

use super::registry::{DriverFactory, DriverRegistry};
use super::{
    Driver, LinkSettings, NativeValue, ProtocolDriver, RawValue, ReadRequest, TransportStrategy,
    WriteRequest,
};
use crate::error::{CollectError, ErrorExt, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl Area {
    fn is_writable(self) -> bool {
        matches!(self, Area::Coil | Area::HoldingRegister)
    }
}

/// Resolve a point address to its area and protocol (0-based) offset
pub fn parse_address(address: &str, data_type: &DataType, zero_based: bool) -> Result<(Area, u16)> {
    let address = address.trim();
    if address.is_empty() || !address.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CollectError::config(format!("Invalid Modbus address '{}'", address)));
    }

    let (area, digits) = if address.len() >= 5 {
        let area = match &address[..1] {
            "0" => Area::Coil,
            "1" => Area::DiscreteInput,
            "3" => Area::InputRegister,
            "4" => Area::HoldingRegister,
            _ => {
                return Err(CollectError::config(format!(
                    "Invalid Modbus area in address '{}'",
                    address
                )))
            },
        };
        (area, &address[1..])
    } else if *data_type == DataType::Bool {
        (Area::Coil, address)
    } else {
        (Area::HoldingRegister, address)
    };

    let number: u32 = digits
        .parse()
        .map_err(|_| CollectError::config(format!("Invalid Modbus address '{}'", address)))?;
    let offset = if zero_based {
        number
    } else {
        number.checked_sub(1).ok_or_else(|| {
            CollectError::config(format!("Address '{}' is 1-based and cannot be 0", address))
        })?
    };
    let offset = u16::try_from(offset)
        .map_err(|_| CollectError::config(format!("Address '{}' out of range", address)))?;
    Ok((area, offset))
}

/// Classify a codec failure: malformed requests and device exceptions are
/// protocol errors, everything else means the link is gone
fn map_modbus_error(err: ModbusError) -> CollectError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("exception") || lower.contains("invalid") {
        CollectError::protocol(message)
    } else {
        CollectError::connection(message)
    }
}

fn serial_parity(parity: Parity) -> Result<tokio_serial::Parity> {
    match parity {
        Parity::None => Ok(tokio_serial::Parity::None),
        Parity::Odd => Ok(tokio_serial::Parity::Odd),
        Parity::Even => Ok(tokio_serial::Parity::Even),
        other => Err(CollectError::config(format!(
            "Parity {:?} is not supported by the serial driver",
            other
        ))),
    }
}

fn serial_stop_bits(stop_bits: StopBits) -> Result<tokio_serial::StopBits> {
    match stop_bits {
        StopBits::One => Ok(tokio_serial::StopBits::One),
        StopBits::Two => Ok(tokio_serial::StopBits::Two),
        StopBits::OnePointFive => Err(CollectError::config(
            "1.5 stop bits are not supported by the serial driver",
        )),
    }
}

fn serial_data_bits(bits: u8) -> Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(CollectError::config(format!("Invalid data bits {}", other))),
    }
}

enum Client {
    Tcp(ModbusTcpClient),
    Rtu(ModbusRtuClient),
}

async fn read_area<C: ModbusClient>(
    client: &mut C,
    station: u8,
    area: Area,
    offset: u16,
    registers: u16,
) -> Result<RawValue> {
    let quantity = registers.max(1);
    let raw = match area {
        Area::Coil => RawValue::Bits(client.read_01(station, offset, 1).await.map_err(map_modbus_error)?),
        Area::DiscreteInput => {
            RawValue::Bits(client.read_02(station, offset, 1).await.map_err(map_modbus_error)?)
        },
        Area::HoldingRegister => RawValue::Words(
            client
                .read_03(station, offset, quantity)
                .await
                .map_err(map_modbus_error)?,
        ),
        Area::InputRegister => RawValue::Words(
            client
                .read_04(station, offset, quantity)
                .await
                .map_err(map_modbus_error)?,
        ),
    };
    Ok(raw)
}

async fn write_area<C: ModbusClient>(
    client: &mut C,
    station: u8,
    area: Area,
    offset: u16,
    value: &NativeValue,
    registers: &[u16],
) -> Result<()> {
    let written = match area {
        Area::Coil => {
            let on = value.as_f64().is_some_and(|v| v != 0.0);
            client.write_05(station, offset, on).await
        },
        _ => match registers {
            [single] => client.write_06(station, offset, *single).await,
            many => client.write_10(station, offset, many).await,
        },
    };
    written.map_err(map_modbus_error)
}

pub struct ModbusTransport {
    client: Option<Client>,
    settings: LinkSettings,
}

impl ModbusTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            settings: LinkSettings {
                station: 1,
                byte_order: Default::default(),
            },
        }
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| CollectError::NullTransport("modbus".to_string()))
    }
}

impl Default for ModbusTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportStrategy for ModbusTransport {
    async fn open(&mut self, protocol: &Protocol) -> Result<()> {
        let timeout = Duration::from_millis(protocol.receive_timeout_ms);
        let client = match &protocol.interface {
            InterfaceConfig::Lan { ip, port } => {
                let address = format!("{}:{}", ip, port);
                debug!("Proto{} connecting Modbus TCP {}", protocol.id, address);
                Client::Tcp(
                    ModbusTcpClient::from_address(&address, timeout)
                        .await
                        .connection_error(&address)?,
                )
            },
            InterfaceConfig::Serial {
                port,
                baud_rate,
                parity,
                stop_bits,
                data_bits,
            } => {
                let parity = serial_parity(parity.parse()?)?;
                let stop_bits = serial_stop_bits(stop_bits.parse()?)?;
                let data_bits = serial_data_bits(*data_bits)?;
                debug!("Proto{} opening Modbus RTU {}@{}", protocol.id, port, baud_rate);
                Client::Rtu(
                    ModbusRtuClient::with_config_and_logging(
                        port, *baud_rate, data_bits, stop_bits, parity, timeout, None,
                    )
                    .connection_error(port)?,
                )
            },
            other => {
                return Err(CollectError::config(format!(
                    "Modbus needs a Lan or Serial interface, got {}",
                    other.kind()
                )))
            },
        };
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some(Client::Tcp(mut c)) => c.close().await.map_err(map_modbus_error),
            Some(Client::Rtu(mut c)) => c.close().await.map_err(map_modbus_error),
            None => Ok(()),
        }
    }

    fn configure(&mut self, settings: LinkSettings) {
        self.settings = settings;
    }

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue> {
        let (area, offset) = parse_address(request.address, request.data_type, request.zero_based)?;
        let station = self.settings.station;
        match self.client()? {
            Client::Tcp(c) => read_area(c, station, area, offset, request.registers).await,
            Client::Rtu(c) => read_area(c, station, area, offset, request.registers).await,
        }
    }

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()> {
        let (area, offset) = parse_address(request.address, request.data_type, request.zero_based)?;
        if !area.is_writable() {
            return Err(CollectError::protocol(format!(
                "Address {} is read-only",
                request.address
            )));
        }
        let station = self.settings.station;
        let value = &request.value;
        let registers = &request.registers;
        match self.client()? {
            Client::Tcp(c) => write_area(c, station, area, offset, value, registers).await,
            Client::Rtu(c) => write_area(c, station, area, offset, value, registers).await,
        }
    }
}

struct ModbusFactory;

impl DriverFactory for ModbusFactory {
    fn protocol_types(&self) -> &'static [&'static str] {
        &["ModbusTcp", "ModbusRtu", "modbus_tcp", "modbus_rtu"]
    }

    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(ProtocolDriver::new(
            protocol,
            Arc::new(|_: &Protocol| Ok(ModbusTransport::new())),
        )))
    }
}

pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(ModbusFactory));
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_modicon_addresses() {
        let f = DataType::Float;
        assert_eq!(parse_address("40001", &f, false).unwrap(), (Area::HoldingRegister, 0));
        assert_eq!(parse_address("30010", &f, false).unwrap(), (Area::InputRegister, 9));
        assert_eq!(parse_address("10001", &DataType::Bool, false).unwrap(), (Area::DiscreteInput, 0));
        assert_eq!(parse_address("00005", &DataType::Bool, false).unwrap(), (Area::Coil, 4));
        assert_eq!(parse_address("400100", &f, false).unwrap(), (Area::HoldingRegister, 99));
    }

    #[test]
    fn test_zero_based_and_bare() {
        assert_eq!(
            parse_address("40001", &DataType::UShort, true).unwrap(),
            (Area::HoldingRegister, 1)
        );
        assert_eq!(parse_address("100", &DataType::UShort, false).unwrap(), (Area::HoldingRegister, 99));
        assert_eq!(parse_address("0", &DataType::Bool, true).unwrap(), (Area::Coil, 0));
        assert!(parse_address("0", &DataType::UShort, false).is_err());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(parse_address("", &DataType::Float, false).is_err());
        assert!(parse_address("4x001", &DataType::Float, false).is_err());
        assert!(parse_address("20001", &DataType::Float, false).is_err());
        assert!(parse_address("4700000", &DataType::Float, true).is_err());
    }

    #[test]
    fn test_serial_mapping() {
        assert_eq!(serial_parity(Parity::Even).unwrap(), tokio_serial::Parity::Even);
        assert!(serial_parity(Parity::Mark).is_err());
        assert_eq!(serial_stop_bits(StopBits::Two).unwrap(), tokio_serial::StopBits::Two);
        assert!(serial_stop_bits(StopBits::OnePointFive).is_err());
        assert_eq!(serial_data_bits(7).unwrap(), tokio_serial::DataBits::Seven);
        assert!(serial_data_bits(9).is_err());
    }

    #[tokio::test]
    async fn test_wrong_interface_is_config_error() {
        let mut protocol = crate::test_utils::sample_protocol("p1");
        protocol.interface = InterfaceConfig::Database {
            connection_string: "sqlite::memory:".into(),
            query: "select 1".into(),
        };
        let mut transport = ModbusTransport::new();
        let err = transport.open(&protocol).await.unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
    }

    #[tokio::test]
    async fn test_read_without_open_is_null_transport() {
        let mut transport = ModbusTransport::new();
        let err = transport
            .read(ReadRequest {
                equipment_id: "e1",
                address: "40001",
                data_type: &DataType::UShort,
                registers: 1,
                zero_based: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::NullTransport(_)));
    }
}
