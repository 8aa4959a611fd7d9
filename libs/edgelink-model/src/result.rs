//! Read result tree produced by one poll cycle
//!
//! `ProtocolResult` → `EquipmentResult` → `PointResult`. Each level carries a
//! success flag, an error message, timing and roll-up counts over its children.
//! Counts are (re)computed by `finish`/`recount` rather than maintained
//! incrementally, so the transform stage can flip point outcomes and re-roll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DataType, Equipment, Point, Protocol};
use edgelink_calc::CalcValue;

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

// ============================================================================
// PointResult
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResult {
    pub label: String,
    pub address: String,
    pub data_type: DataType,
    /// Value as read from the device (or computed, for virtual points)
    pub raw: Option<CalcValue>,
    /// Value after the transform stage
    pub value: Option<CalcValue>,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl PointResult {
    /// Successful read started at `started`
    pub fn ok(point: &Point, raw: CalcValue, started: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            label: point.label.clone(),
            address: point.address.clone(),
            data_type: point.data_type.clone(),
            raw: Some(raw),
            value: None,
            success: true,
            error: None,
            elapsed_ms: elapsed_ms(started, now),
            start_time: started,
            end_time: now,
        }
    }

    /// Failed read started at `started`
    pub fn failed(point: &Point, error: impl Into<String>, started: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            label: point.label.clone(),
            address: point.address.clone(),
            data_type: point.data_type.clone(),
            raw: None,
            value: None,
            success: false,
            error: Some(error.into()),
            elapsed_ms: elapsed_ms(started, now),
            start_time: started,
            end_time: now,
        }
    }

    /// Mark this point failed, keeping whatever values it already carries
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }
}

// ============================================================================
// EquipmentResult
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentResult {
    pub equipment_id: String,
    pub name: String,
    pub points: Vec<PointResult>,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Equipment-level failure, independent of point outcomes
    #[serde(skip)]
    fault: Option<String>,
}

impl EquipmentResult {
    pub fn begin(equipment: &Equipment) -> Self {
        let now = Utc::now();
        Self {
            equipment_id: equipment.id.clone(),
            name: equipment.name.clone(),
            points: Vec::with_capacity(equipment.points.len()),
            success: false,
            error: None,
            elapsed_ms: 0,
            start_time: now,
            end_time: now,
            total: 0,
            success_count: 0,
            failed_count: 0,
            fault: None,
        }
    }

    pub fn set_fault(&mut self, error: impl Into<String>) {
        self.fault = Some(error.into());
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn point(&self, label: &str) -> Option<&PointResult> {
        self.points.iter().find(|p| p.label == label)
    }

    /// Stamp the end time and roll up the point outcomes
    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.elapsed_ms = elapsed_ms(self.start_time, self.end_time);
        self.recount();
    }

    /// Roll up point outcomes without touching the timing
    pub fn recount(&mut self) {
        self.total = self.points.len();
        self.success_count = self.points.iter().filter(|p| p.success).count();
        self.failed_count = self.total - self.success_count;
        self.success = self.fault.is_none() && self.failed_count == 0;
        self.error = match (&self.fault, self.failed_count) {
            (Some(fault), _) => Some(fault.clone()),
            (None, 0) => None,
            (None, failed) => Some(format!("{}/{} points failed", failed, self.total)),
        };
    }
}

// ============================================================================
// ProtocolResult
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResult {
    pub protocol_id: String,
    pub protocol_type: String,
    pub equipments: Vec<EquipmentResult>,
    /// Every equipment succeeded and the cycle itself did not fail
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub point_total: usize,
    pub point_failed: usize,
    #[serde(skip)]
    fault: Option<String>,
}

impl ProtocolResult {
    pub fn begin(protocol: &Protocol) -> Self {
        let now = Utc::now();
        Self {
            protocol_id: protocol.id.clone(),
            protocol_type: protocol.protocol_type.clone(),
            equipments: Vec::with_capacity(protocol.equipments.len()),
            success: false,
            error: None,
            elapsed_ms: 0,
            start_time: now,
            end_time: now,
            total: 0,
            success_count: 0,
            failed_count: 0,
            point_total: 0,
            point_failed: 0,
            fault: None,
        }
    }

    /// Mark the whole cycle failed (e.g. the transport could not be opened)
    pub fn set_fault(&mut self, error: impl Into<String>) {
        self.fault = Some(error.into());
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn equipment(&self, id: &str) -> Option<&EquipmentResult> {
        self.equipments.iter().find(|e| e.equipment_id == id)
    }

    /// Same as `success`, under the name operators know from the result payload
    pub fn read_is_success(&self) -> bool {
        self.success
    }

    pub fn finish(&mut self) {
        self.end_time = Utc::now();
        self.elapsed_ms = elapsed_ms(self.start_time, self.end_time);
        self.recount();
    }

    pub fn recount(&mut self) {
        for equipment in &mut self.equipments {
            equipment.recount();
        }
        self.total = self.equipments.len();
        self.success_count = self.equipments.iter().filter(|e| e.success).count();
        self.failed_count = self.total - self.success_count;
        self.point_total = self.equipments.iter().map(|e| e.total).sum();
        self.point_failed = self.equipments.iter().map(|e| e.failed_count).sum();
        self.success = self.fault.is_none() && self.failed_count == 0;
        self.error = match (&self.fault, self.failed_count) {
            (Some(fault), _) => Some(fault.clone()),
            (None, 0) => None,
            (None, failed) => Some(format!(
                "{}/{} equipments failed ({} points)",
                failed, self.total, self.point_failed
            )),
        };
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::{ByteOrder, InterfaceConfig};

    fn point(label: &str) -> Point {
        Point {
            label: label.to_string(),
            name: String::new(),
            address: "40001".to_string(),
            data_type: DataType::UShort,
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

    fn protocol() -> Protocol {
        Protocol {
            id: "p1".to_string(),
            name: String::new(),
            protocol_type: "Simulator".to_string(),
            cycle_ms: 1000,
            receive_timeout_ms: 3000,
            connect_timeout_ms: 3000,
            interface: InterfaceConfig::Lan {
                ip: "127.0.0.1".to_string(),
                port: 502,
            },
            equipments: vec![Equipment {
                id: "e1".to_string(),
                name: "E1".to_string(),
                kind: Default::default(),
                points: vec![point("a"), point("b"), point("c")],
            }],
        }
    }

    #[test]
    fn test_rollup_with_one_failed_point() {
        let proto = protocol();
        let started = Utc::now();
        let mut result = ProtocolResult::begin(&proto);
        let mut eq = EquipmentResult::begin(&proto.equipments[0]);
        let pts = &proto.equipments[0].points;
        eq.points.push(PointResult::ok(&pts[0], 1.0.into(), started));
        eq.points
            .push(PointResult::failed(&pts[1], "illegal address", started));
        eq.points.push(PointResult::ok(&pts[2], 3.0.into(), started));
        eq.finish();
        result.equipments.push(eq);
        result.finish();

        let eq = result.equipment("e1").unwrap();
        assert_eq!(eq.total, 3);
        assert_eq!(eq.success_count, 2);
        assert_eq!(eq.failed_count, 1);
        assert!(!eq.success);
        assert_eq!(eq.error.as_deref(), Some("1/3 points failed"));
        assert!(!result.read_is_success());
        assert_eq!(result.point_failed, 1);
    }

    #[test]
    fn test_recount_after_point_flip() {
        let proto = protocol();
        let started = Utc::now();
        let mut result = ProtocolResult::begin(&proto);
        let mut eq = EquipmentResult::begin(&proto.equipments[0]);
        for p in &proto.equipments[0].points {
            eq.points.push(PointResult::ok(p, 1.0.into(), started));
        }
        result.equipments.push(eq);
        result.finish();
        assert!(result.success);
        assert!(result.error.is_none());

        result.equipments[0].points[2].fail("out of range");
        result.recount();
        assert!(!result.success);
        assert_eq!(result.equipments[0].failed_count, 1);
        assert_eq!(
            result.equipments[0].points[2].raw,
            Some(CalcValue::Number(1.0))
        );
    }

    #[test]
    fn test_protocol_fault() {
        let mut result = ProtocolResult::begin(&protocol());
        result.set_fault("Connection failed: refused");
        result.finish();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Connection failed: refused"));
        assert_eq!(result.total, 0);
    }
}
