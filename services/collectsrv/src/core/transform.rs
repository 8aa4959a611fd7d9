//! Transform stage
//!
//! Turns the raw result tree of one poll into business values: applies each
//! point's forward expression, checks bounds, then resolves the equipment's
//! virtual points. Counts are re-rolled afterwards because points can flip
//! to failed here.
//!
//! Points with a cycle override are absent from the cycles where they are
//! not due. Their last good value is held per polling loop and stands in for
//! them when a virtual point references them.

use std::collections::HashMap;

use chrono::Utc;
use edgelink_calc::{forward, inverse, resolve_virtual_points, CalcValue};
use edgelink_model::{Equipment, EquipmentResult, Point, PointResult, Protocol, ProtocolResult};
use tracing::debug;

use crate::core::driver::value::business_value;
use crate::error::{CollectError, Result};

/// Last good business value of every point read on its own cycle,
/// keyed by (equipment id, label)
#[derive(Debug, Default)]
pub struct HeldValues {
    values: HashMap<(String, String), f64>,
}

impl HeldValues {
    pub fn get(&self, equipment_id: &str, label: &str) -> Option<f64> {
        self.values
            .get(&(equipment_id.to_string(), label.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Record this cycle's outcome for overridden points, then seed `values`
    /// with the held value of those that were not due
    fn sync(
        &mut self,
        equipment: &Equipment,
        result: &EquipmentResult,
        values: &mut HashMap<String, f64>,
    ) {
        let overridden = equipment
            .points
            .iter()
            .filter(|p| p.cycle_ms.is_some() && !p.is_virtual());
        for point in overridden {
            let key = (equipment.id.clone(), point.label.clone());
            match result.points.iter().find(|r| r.label == point.label) {
                Some(read) => match (read.success, &read.value) {
                    (true, Some(CalcValue::Number(v))) => {
                        self.values.insert(key, *v);
                    },
                    _ => {
                        self.values.remove(&key);
                    },
                },
                None => {
                    if let Some(v) = self.values.get(&key) {
                        values.entry(point.label.clone()).or_insert(*v);
                    }
                },
            }
        }
    }
}

/// Apply transforms to a freshly polled result
pub fn apply(
    protocol: &Protocol,
    mut result: ProtocolResult,
    held: &mut HeldValues,
) -> ProtocolResult {
    for equipment_result in &mut result.equipments {
        let Some(equipment) = protocol.equipment(&equipment_result.equipment_id) else {
            continue;
        };
        transform_equipment(equipment, equipment_result, held);
    }
    result.recount();
    result
}

fn transform_equipment(
    equipment: &Equipment,
    result: &mut EquipmentResult,
    held: &mut HeldValues,
) {
    let mut values: HashMap<String, f64> = HashMap::new();

    for point_result in result.points.iter_mut() {
        let Some(point) = equipment.points.iter().find(|p| p.label == point_result.label) else {
            continue;
        };
        transform_point(point, point_result);
        if point_result.success {
            if let Some(CalcValue::Number(v)) = point_result.value {
                values.insert(point.label.clone(), v);
            }
        }
    }
    held.sync(equipment, result, &mut values);

    // Not reached by a cycle that aborted on a connection failure
    if result.fault().is_some() {
        return;
    }

    let virtual_points: Vec<&Point> = equipment.points.iter().filter(|p| p.is_virtual()).collect();
    if virtual_points.is_empty() {
        return;
    }

    let started = Utc::now();
    let outcomes = resolve_virtual_points(
        virtual_points
            .iter()
            .map(|p| (p.label.as_str(), p.expression.as_str())),
        &mut values,
    );
    for (point, outcome) in virtual_points.into_iter().zip(outcomes) {
        let point_result = match outcome.result {
            Ok(v) => {
                let mut r = PointResult::ok(point, CalcValue::Number(v), started);
                r.value = Some(CalcValue::Number(v));
                check_bounds(point, &mut r);
                r
            },
            Err(e) => PointResult::failed(point, CollectError::from(e).to_string(), started),
        };
        result.points.push(point_result);
    }
}

fn transform_point(point: &Point, result: &mut PointResult) {
    if !result.success {
        return;
    }
    let Some(raw) = result.raw.as_ref() else {
        return;
    };
    match forward(&point.expression, raw) {
        Ok(value) => {
            result.value = Some(value);
            check_bounds(point, result);
        },
        Err(e) => {
            debug!("Point {} transform failed: {}", point.label, e);
            result.fail(CollectError::from(e).to_string());
        },
    }
}

/// Out-of-range values stay attached to the failed point
fn check_bounds(point: &Point, result: &mut PointResult) {
    if let Some(CalcValue::Number(v)) = result.value {
        if !point.in_range(v) {
            result.fail(format!(
                "Value {} out of range [{}, {}]",
                v,
                point.min.map_or("-".to_string(), |m| m.to_string()),
                point.max.map_or("-".to_string(), |m| m.to_string()),
            ));
        }
    }
}

/// Convert an inbound business value into the raw value to send
pub fn prepare_write(point: &Point, text: &str) -> Result<CalcValue> {
    let value = business_value(text);
    if let CalcValue::Number(v) = value {
        if !point.in_range(v) {
            return Err(CollectError::validation(format!(
                "Value {} for {} is out of range",
                v, point.label
            )));
        }
    }
    Ok(inverse(&point.expression, &value)?)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use edgelink_model::{DataType, VIRTUAL_POINT_ADDRESS};

    fn point(label: &str, expression: &str) -> Point {
        serde_yaml::from_str(&format!(
            "label: {label}\naddress: '4000{}'\ndata_type: float\nexpression: '{expression}'\n",
            label.len()
        ))
        .unwrap()
    }

    fn virtual_point(label: &str, expression: &str) -> Point {
        let mut p = point(label, expression);
        p.address = VIRTUAL_POINT_ADDRESS.to_string();
        p
    }

    fn run(points: Vec<Point>, raws: &[(&str, f64)]) -> ProtocolResult {
        run_held(points, raws, &mut HeldValues::default())
    }

    fn run_held(
        points: Vec<Point>,
        raws: &[(&str, f64)],
        held: &mut HeldValues,
    ) -> ProtocolResult {
        let mut protocol = crate::test_utils::sample_protocol("p1");
        protocol.equipments[0].points = points;
        let mut result = ProtocolResult::begin(&protocol);
        let mut eq = EquipmentResult::begin(&protocol.equipments[0]);
        for (label, raw) in raws {
            let p = protocol.point("e1", label).unwrap();
            eq.points.push(PointResult::ok(p, CalcValue::Number(*raw), Utc::now()));
        }
        eq.finish();
        result.equipments.push(eq);
        result.finish();
        apply(&protocol, result, held)
    }

    #[test]
    fn test_forward_applied() {
        let result = run(vec![point("Ua", "x * 0.1")], &[("Ua", 2310.0)]);
        let r = result.equipments[0].point("Ua").unwrap();
        assert_eq!(r.value, Some(CalcValue::Number(231.0)));
        assert!(result.read_is_success());
    }

    #[test]
    fn test_one_bad_expression_fails_one_point() {
        let points = vec![
            point("a", "x + 1"),
            point("bb", "x / "),
            point("ccc", "x * 2"),
            point("dddd", ""),
        ];
        let result = run(points, &[("a", 1.0), ("bb", 2.0), ("ccc", 3.0), ("dddd", 4.0)]);
        let eq = &result.equipments[0];
        assert_eq!(eq.total, 4);
        assert_eq!(eq.success_count, 3);
        assert_eq!(eq.failed_count, 1);
        let failed = eq.point("bb").unwrap();
        assert!(!failed.error.as_deref().unwrap_or_default().is_empty());
        assert!(!result.read_is_success());
    }

    #[test]
    fn test_out_of_range_keeps_value() {
        let mut p = point("t", "");
        p.max = Some(100.0);
        let result = run(vec![p], &[("t", 150.0)]);
        let r = result.equipments[0].point("t").unwrap();
        assert!(!r.success);
        assert_eq!(r.value, Some(CalcValue::Number(150.0)));
        assert!(r.error.as_ref().unwrap().contains("out of range"));
    }

    #[test]
    fn test_virtual_points() {
        let points = vec![
            point("Ua", ""),
            point("Ia", ""),
            virtual_point("Pa", "Ua * Ia / 1000"),
            virtual_point("Pb", "Pa * 2"),
        ];
        let result = run(points, &[("Ua", 231.0), ("Ia", 10.0)]);
        let eq = &result.equipments[0];
        assert_eq!(eq.point("Pa").unwrap().value, Some(CalcValue::Number(2.31)));
        assert_eq!(eq.point("Pb").unwrap().value, Some(CalcValue::Number(4.62)));
        assert_eq!(eq.total, 4);
    }

    #[test]
    fn test_virtual_point_with_failed_source() {
        let points = vec![
            point("A", "x / "),
            virtual_point("B", "A + 1"),
            point("C", ""),
        ];
        let result = run(points, &[("A", 1.0), ("C", 3.0)]);
        let eq = &result.equipments[0];
        let b = eq.point("B").unwrap();
        assert!(!b.success);
        assert!(b.error.as_ref().unwrap().contains('A'));
        assert!(eq.point("C").unwrap().success);
    }

    #[test]
    fn test_skipped_source_uses_held_value() {
        let mut slow = point("E", "x * 0.1");
        slow.cycle_ms = Some(60_000);
        let points = vec![slow, point("P", ""), virtual_point("R", "E / P")];
        let mut held = HeldValues::default();

        let result = run_held(points.clone(), &[("E", 500.0), ("P", 10.0)], &mut held);
        assert!(result.read_is_success());
        assert_eq!(held.get("e1", "E"), Some(50.0));

        // E not due: absent from the cycle, R still resolves
        let result = run_held(points.clone(), &[("P", 20.0)], &mut held);
        let eq = &result.equipments[0];
        assert!(result.read_is_success(), "{:?}", result.error);
        assert!(eq.point("E").is_none());
        assert_eq!(eq.point("R").unwrap().value, Some(CalcValue::Number(2.5)));

        // A fresh read wins over the held value
        let result = run_held(points.clone(), &[("E", 1000.0), ("P", 20.0)], &mut held);
        assert_eq!(
            result.equipments[0].point("R").unwrap().value,
            Some(CalcValue::Number(5.0))
        );
        assert_eq!(held.get("e1", "E"), Some(100.0));
    }

    #[test]
    fn test_failed_read_drops_held_value() {
        let mut slow = point("E", "x / ");
        slow.cycle_ms = Some(60_000);
        let mut held = HeldValues::default();
        held.values.insert(("e1".into(), "E".into()), 7.0);

        let points = vec![slow, virtual_point("R", "E + 1")];
        let result = run_held(points, &[("E", 1.0)], &mut held);
        assert!(!result.equipments[0].point("R").unwrap().success);
        assert!(held.is_empty());
    }

    #[test]
    fn test_prepare_write() {
        let mut p = point("sp", "x * 0.1");
        p.data_type = DataType::UShort;
        assert_eq!(prepare_write(&p, "12.5").unwrap(), CalcValue::Number(125.0));

        p.max = Some(50.0);
        assert!(matches!(
            prepare_write(&p, "60").unwrap_err(),
            CollectError::Validation(_)
        ));

        let p = point("sq", "x * x");
        assert!(matches!(
            prepare_write(&p, "4").unwrap_err(),
            CollectError::Expression(_)
        ));
    }
}
