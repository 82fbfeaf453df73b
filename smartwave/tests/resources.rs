mod common;

use common::{connect, connect_with, test_config};
use smartwave::protocol::Opcode;
use smartwave::resource::ResourceKind;
use smartwave::{DriverType, Error, Role};

#[tokio::test]
async fn pins_are_exclusive_until_released() {
    let (connection, _sim) = connect().await;

    let a1 = connection.acquire_pin("A1").await.unwrap();
    assert!(matches!(
        connection.acquire_pin("A1").await,
        Err(Error::AlreadyInUse { kind: ResourceKind::Pin, .. })
    ));
    assert!(matches!(
        connection.acquire_pin("C3").await,
        Err(Error::NotFound { .. })
    ));

    connection.release_pin(a1).await.unwrap();
    assert!(matches!(
        connection.release_pin(a1).await,
        Err(Error::InvalidHandle(ResourceKind::Pin))
    ));
    let again = connection.acquire_pin("A1").await.unwrap();
    assert_ne!(again, a1);
}

#[tokio::test]
async fn concurrent_acquire_never_hands_out_a_driver_twice() {
    let mut config = test_config();
    config.resources.i2c_drivers = 2;
    let (connection, _sim) = connect_with(config, |_| {}).await;

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.acquire_driver(DriverType::I2c).await })
        })
        .collect();
    let mut granted = Vec::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => granted.push(handle.id()),
            Err(Error::ResourceExhausted(ResourceKind::Driver(DriverType::I2c))) => exhausted += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    granted.sort();
    assert_eq!(granted, vec![0, 1]);
    assert_eq!(exhausted, 1);
}

#[tokio::test]
async fn handles_from_another_connection_are_rejected() {
    let (first, _sim_a) = connect().await;
    let (second, sim_b) = connect().await;

    let foreign_pin = first.acquire_pin("A1").await.unwrap();
    let driver = second.acquire_driver(DriverType::Gpio).await.unwrap();
    assert!(matches!(
        second.bind_pin(driver, Role::Io, foreign_pin).await,
        Err(Error::InvalidHandle(ResourceKind::Pin))
    ));
    assert_eq!(second.resources().await.driver(driver).unwrap().pin(Role::Io), None);

    // The failed bind left nothing to write.
    let mark = sim_b.mark();
    assert_eq!(second.synchronize().await.unwrap(), 0);
    assert!(sim_b.since(mark).is_empty());
}

#[tokio::test]
async fn synchronize_writes_changes_once() {
    let (connection, sim) = connect().await;
    let driver = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    let pin = connection.acquire_pin("A2").await.unwrap();
    connection.bind_pin(driver, Role::Io, pin).await.unwrap();

    let mark = sim.mark();
    assert_eq!(connection.synchronize().await.unwrap(), 2);
    let sent: Vec<Opcode> = sim.since(mark).iter().map(|f| f.opcode).collect();
    assert_eq!(sent, vec![Opcode::DriverPinMatrix, Opcode::Pin]);

    let mark = sim.mark();
    assert_eq!(connection.synchronize().await.unwrap(), 0);
    assert!(sim.since(mark).is_empty());
}

#[tokio::test]
async fn failed_synchronization_retries_the_rest() {
    let (connection, sim) = connect().await;
    let driver = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    let pin = connection.acquire_pin("B1").await.unwrap();
    connection.bind_pin(driver, Role::Io, pin).await.unwrap();
    sim.state.lock().reject.insert(Opcode::Pin);

    assert!(matches!(
        connection.synchronize().await,
        Err(Error::Rejected { opcode: Opcode::Pin, .. })
    ));

    sim.state.lock().reject.clear();
    let mark = sim.mark();
    assert_eq!(connection.synchronize().await.unwrap(), 1);
    let sent = sim.since(mark);
    assert_eq!(sent[0].opcode, Opcode::Pin);
    assert_eq!(&sent[0].payload[..], &[0xB1, 1, 0]);
}

#[tokio::test]
async fn releasing_a_driver_unwires_its_pins() {
    let (connection, sim) = connect().await;
    let driver = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    let pin = connection.acquire_pin("A3").await.unwrap();
    connection.bind_pin(driver, Role::Io, pin).await.unwrap();
    connection.synchronize().await.unwrap();

    connection.release_driver(driver).await.unwrap();
    assert!(matches!(
        connection.release_driver(driver).await,
        Err(Error::InvalidHandle(_))
    ));
    let mark = sim.mark();
    assert_eq!(connection.synchronize().await.unwrap(), 1);
    let sent = sim.since(mark);
    assert_eq!(sent[0].opcode, Opcode::DriverPinMatrix);
    assert_eq!(sent[0].payload[0], 1);

    // The pin is still held and can be bound again.
    let other = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    connection.bind_pin(other, Role::Io, pin).await.unwrap();
}

#[tokio::test]
async fn removing_a_pin_connection_returns_the_pin() {
    let (connection, _sim) = connect().await;
    let driver = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    let pin = connection.acquire_pin("A4").await.unwrap();
    connection.bind_pin(driver, Role::Io, pin).await.unwrap();

    assert_eq!(
        connection.remove_pin_connection(driver, Role::Io).await.unwrap(),
        Some(pin)
    );
    assert_eq!(
        connection.remove_pin_connection(driver, Role::Io).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn reset_rewrites_held_state() {
    let (connection, sim) = connect().await;
    let driver = connection.acquire_driver(DriverType::Gpio).await.unwrap();
    let pin = connection.acquire_pin("A7").await.unwrap();
    connection.bind_pin(driver, Role::Io, pin).await.unwrap();
    connection.synchronize().await.unwrap();

    connection.reset().await.unwrap();
    let mark = sim.mark();
    assert_eq!(connection.synchronize().await.unwrap(), 2);
    assert_eq!(sim.since(mark).len(), 2);
}
