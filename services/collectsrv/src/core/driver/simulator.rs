//! In-memory simulator codec
//!
//! Serves any interface kind from a register bank keyed by
//! `(equipment, address)`, seeded from point default values when the
//! transport opens. Writes land in the bank and are visible to later reads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use edgelink_model::{DataType, Protocol};
use tracing::debug;

use super::registry::{DriverFactory, DriverRegistry};
use super::value::{business_value, parse_native};
use super::{
    Driver, LinkSettings, NativeValue, ProtocolDriver, RawValue, ReadRequest, TransportStrategy,
    WriteRequest,
};
use crate::error::{CollectError, Result};

type Bank = HashMap<(String, String), RawValue>;

fn stored(value: &NativeValue, registers: Vec<u16>) -> RawValue {
    match value {
        NativeValue::Bool(b) => RawValue::Bits(vec![*b]),
        NativeValue::Text(s) => RawValue::Text(s.clone()),
        _ => RawValue::Words(registers),
    }
}

fn blank(data_type: &DataType, registers: u16) -> RawValue {
    match data_type {
        DataType::Bool => RawValue::Bits(vec![false]),
        DataType::String => RawValue::Text(String::new()),
        _ => RawValue::Words(vec![0; usize::from(registers.max(1))]),
    }
}

#[derive(Default)]
pub struct SimulatorTransport {
    bank: Option<Bank>,
}

impl SimulatorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&mut self) -> Result<&mut Bank> {
        self.bank
            .as_mut()
            .ok_or_else(|| CollectError::NullTransport("simulator".to_string()))
    }
}

#[async_trait]
impl TransportStrategy for SimulatorTransport {
    async fn open(&mut self, protocol: &Protocol) -> Result<()> {
        let mut bank = Bank::new();
        for equipment in &protocol.equipments {
            for point in equipment.points.iter().filter(|p| !p.is_virtual()) {
                let Some(default) = point.default_value.as_deref() else {
                    continue;
                };
                match parse_native(&point.data_type, &business_value(default)) {
                    Some(native) => {
                        let registers = native.to_registers(point.byte_order);
                        bank.insert(
                            (equipment.id.clone(), point.address.clone()),
                            stored(&native, registers),
                        );
                    },
                    None => debug!(
                        "Proto{} default '{}' for {} does not fit {}",
                        protocol.id, default, point.label, point.data_type
                    ),
                }
            }
        }
        debug!("Proto{} simulator seeded {} values", protocol.id, bank.len());
        self.bank = Some(bank);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.bank = None;
        Ok(())
    }

    fn configure(&mut self, _settings: LinkSettings) {}

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue> {
        let key = (request.equipment_id.to_string(), request.address.to_string());
        Ok(self
            .bank()?
            .get(&key)
            .cloned()
            .unwrap_or_else(|| blank(request.data_type, request.registers)))
    }

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()> {
        let key = (request.equipment_id.to_string(), request.address.to_string());
        let value = stored(&request.value, request.registers);
        self.bank()?.insert(key, value);
        Ok(())
    }
}

struct SimulatorFactory;

impl DriverFactory for SimulatorFactory {
    fn protocol_types(&self) -> &'static [&'static str] {
        &["Simulator", "Virtual"]
    }

    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(ProtocolDriver::new(
            protocol,
            Arc::new(|_: &Protocol| Ok(SimulatorTransport::new())),
        )))
    }
}

pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(SimulatorFactory));
}
