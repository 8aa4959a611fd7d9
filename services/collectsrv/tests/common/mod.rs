//! Shared fixtures for collectsrv integration tests

#![allow(dead_code)]

use std::sync::Arc;

use collectsrv::core::bus::BusTopics;
use collectsrv::core::driver::DriverRegistry;
use collectsrv::core::scheduler::ProtocolTaskManager;
use collectsrv::test_utils::{point, sample_protocol, MemoryPublisher};
use edgelink_model::{CalcValue, DataType, Protocol, Workstation, VIRTUAL_POINT_ADDRESS};

/// Simulator protocol: `a` = 2300 * 0.1, `b` = 12, `c` unseeded, `p` = a * b
pub fn simulated(id: &str) -> Protocol {
    let mut protocol = sample_protocol(id);
    protocol.protocol_type = "Simulator".into();
    protocol.cycle_ms = 50;

    let points = &mut protocol.equipments[0].points;
    points[0].default_value = Some("2300".into());
    points[0].expression = "x * 0.1".into();
    points[1].default_value = Some("12".into());

    let mut power = point("p", VIRTUAL_POINT_ADDRESS, DataType::Float);
    power.expression = "a * b".into();
    points.push(power);
    protocol
}

pub fn simulated_workstation(ids: &[&str]) -> Workstation {
    Workstation {
        id: "ws".into(),
        name: "Integration plant".into(),
        protocols: ids.iter().copied().map(simulated).collect(),
    }
}

pub fn simulator_manager() -> (Arc<ProtocolTaskManager>, Arc<MemoryPublisher>) {
    let publisher = Arc::new(MemoryPublisher::new());
    let manager = Arc::new(ProtocolTaskManager::new(
        Arc::new(DriverRegistry::with_builtin()),
        publisher.clone(),
        BusTopics::default(),
    ));
    (manager, publisher)
}

pub fn number(value: &Option<CalcValue>) -> f64 {
    match value {
        Some(CalcValue::Number(v)) => *v,
        other => panic!("expected a number, got {:?}", other),
    }
}
