//! Tests for avatarlink-driver: SimulatedDriver behaviours, bounded calls, DriverSet

use avatarlink_core::*;
use avatarlink_driver::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn robot() -> AvatarInterface {
    AvatarInterface::new("robot-1", "Rover", AvatarType::RobotPhysical).with_standard_safeguards()
}

fn cid() -> ConsciousnessId {
    ConsciousnessId::new("being-1")
}

// ===========================================================================
// SimulatedDriver
// ===========================================================================

#[tokio::test]
async fn connect_returns_handle_for_pair() {
    let driver = SimulatedDriver::default();
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();
    assert_eq!(conn.interface.as_str(), "robot-1");
    assert_eq!(conn.consciousness, cid());
    assert_eq!(conn.driver, "simulated");
    assert_eq!(driver.connect_count(), 1);
}

#[tokio::test]
async fn failing_connect_reports_reason() {
    let driver = SimulatedDriver::failing_connect("port busy");
    let cancel = CancellationToken::new();
    let err = driver.connect(&cancel, &robot(), &cid()).await.unwrap_err();
    assert_eq!(err, DriverError::Connect("port busy".into()));
    assert!(err.to_string().contains("port busy"));
}

#[tokio::test]
async fn execute_records_order() {
    let driver = SimulatedDriver::default();
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();

    let a = Command::movement("being-1", "move");
    let b = Command::chat("being-1", "hello");
    let c = Command::custom("being-1", "wave");
    for cmd in [&a, &b, &c] {
        let outcome = driver.execute(&cancel, &conn, cmd).await.unwrap();
        assert_eq!(outcome.command_id, cmd.id);
        assert_eq!(outcome.status, "executed");
    }
    assert_eq!(driver.executed().await, vec![a.id, b.id, c.id]);
}

#[tokio::test]
async fn failing_action_is_an_execution_error() {
    let driver = SimulatedDriver::default().with_failing_action("craft");
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();
    let err = driver
        .execute(&cancel, &conn, &Command::custom("being-1", "craft"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Execution(_)));
    assert!(driver.executed().await.is_empty());
}

#[tokio::test]
async fn default_telemetry_can_change_mid_session() {
    let driver = SimulatedDriver::default();
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();
    driver.set_default_telemetry(json!({"temperature": 90.0})).await;
    let snap = driver.read_state(&cancel, &conn).await.unwrap();
    assert_eq!(snap.payload["temperature"], 90.0);
}

#[tokio::test]
async fn pushed_telemetry_is_fifo() {
    let driver = SimulatedDriver::default();
    driver.push_telemetry(json!({"n": 1})).await;
    driver.push_telemetry(json!({"n": 2})).await;
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();
    assert_eq!(driver.read_state(&cancel, &conn).await.unwrap().payload["n"], 1);
    assert_eq!(driver.read_state(&cancel, &conn).await.unwrap().payload["n"], 2);
}

#[tokio::test]
async fn read_state_after_cancel_fails() {
    let driver = SimulatedDriver::default();
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();
    cancel.cancel();
    assert_eq!(
        driver.read_state(&cancel, &conn).await.unwrap_err(),
        DriverError::Cancelled
    );
}

// ===========================================================================
// bounded
// ===========================================================================

#[tokio::test]
async fn bounded_hanging_disconnect_times_out() {
    let driver = SimulatedDriver::hanging();
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();

    let start = Instant::now();
    let res = bounded(
        &cancel,
        Duration::from_millis(50),
        driver.disconnect(&cancel, &conn),
    )
    .await;
    assert_eq!(res, Err(DriverError::Timeout(Duration::from_millis(50))));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(driver.disconnect_count(), 0);
}

#[tokio::test]
async fn bounded_hanging_execute_yields_to_cancel() {
    let driver = Arc::new(SimulatedDriver::hanging());
    let cancel = CancellationToken::new();
    let conn = driver.connect(&cancel, &robot(), &cid()).await.unwrap();

    let c2 = cancel.clone();
    let d2 = driver.clone();
    let task = tokio::spawn(async move {
        let cmd = Command::movement("being-1", "move");
        bounded(&c2, Duration::from_secs(30), d2.execute(&c2, &conn, &cmd)).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let start = Instant::now();
    cancel.cancel();
    let res = task.await.unwrap();
    assert_eq!(res.unwrap_err(), DriverError::Cancelled);
    assert!(start.elapsed() < Duration::from_millis(100));
}

// ===========================================================================
// DriverSet
// ===========================================================================

#[test]
fn driver_set_single_serves_all_types() {
    let set = DriverSet::single(Arc::new(SimulatedDriver::default()));
    for t in [
        AvatarType::RobotPhysical,
        AvatarType::GameCharacter,
        AvatarType::Custom,
    ] {
        assert_eq!(set.resolve(t).unwrap().name(), "simulated");
    }
}

#[test]
fn driver_set_prefers_specific_driver() {
    let mut set = DriverSet::new().with_fallback(Arc::new(SimulatedDriver::new("generic")));
    set.register(
        AvatarType::RobotPhysical,
        Arc::new(SimulatedDriver::new("robot")),
    );
    assert_eq!(set.resolve(AvatarType::RobotPhysical).unwrap().name(), "robot");
    assert_eq!(set.resolve(AvatarType::GameCharacter).unwrap().name(), "generic");
    assert_eq!(set.names(), vec!["generic", "robot"]);
}
