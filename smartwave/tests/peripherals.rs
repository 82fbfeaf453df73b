mod common;

use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use common::{connect, connect_with, test_config, TIMEOUT};
use smartwave::hw_trait::I2c;
use smartwave::i2c::I2cTransaction;
use smartwave::protocol::Opcode;
use smartwave::resource::ResourceKind;
use smartwave::{
    DeviceEvent, DriverType, Error, Gpio, GpioOptions, I2cConfig, I2cOptions, OutputType, PinId,
    SpiConfig, SpiOptions,
};

fn pin(name: &str) -> PinId {
    name.parse().unwrap()
}

#[tokio::test]
async fn i2c_config_writes_its_wiring_in_order() {
    let (connection, sim) = connect().await;
    let mark = sim.mark();
    let _bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();

    let sent: Vec<Opcode> = sim.since(mark).iter().map(|f| f.opcode).collect();
    assert_eq!(
        sent,
        vec![
            Opcode::Driver,
            Opcode::Stimulus,
            Opcode::DriverPinMatrix,
            Opcode::Pin,
            Opcode::Pin,
            Opcode::StimulusDriverMatrix,
        ]
    );
}

#[tokio::test]
async fn i2c_scan_finds_responding_addresses() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.i2c_targets.extend([0x20, 0x55]);
    })
    .await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();
    assert_eq!(bus.scan_addresses(0..=0x7F, TIMEOUT).await.unwrap(), vec![0x20, 0x55]);
}

#[tokio::test]
async fn i2c_scan_stays_within_range() {
    let (connection, sim) = connect_with(test_config(), |s| {
        s.i2c_targets.extend([0x20, 0x55]);
    })
    .await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();

    assert_eq!(
        bus.scan_addresses(0x21..=0x60, TIMEOUT).await.unwrap(),
        vec![0x55]
    );
    let programmed = sim.state.lock().stimuli.get(&bus.recorder()).cloned();
    assert_eq!(programmed.map(|s| s.len()), Some(0x40));

    assert!(matches!(
        bus.scan_addresses(0x70..=0x80, TIMEOUT).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn i2c_batch_results_follow_transaction_order() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.i2c_targets.insert(0x50);
        s.i2c_data.insert(0x50, vec![0xAB, 0xCD]);
    })
    .await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();

    let batch = bus
        .set_transactions(vec![
            I2cTransaction::write(0x50, vec![0x10]),
            I2cTransaction::read(0x50, 2),
            I2cTransaction::write(0x33, vec![0x01]),
        ])
        .await
        .unwrap();
    let results = bus.send_transactions(&batch, TIMEOUT).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(!results[0].read);
    assert!(results[0].acknowledged());
    assert!(results[1].read);
    assert_eq!(results[1].data, vec![0xAB, 0xCD]);
    assert_eq!(results[2].address, 0x33);
    assert!(!results[2].address_ack);
}

#[tokio::test]
async fn i2c_reloading_the_same_batch_writes_nothing() {
    let (connection, sim) = connect().await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();
    let transactions = vec![I2cTransaction::read(0x10, 4)];

    bus.set_transactions(transactions.clone()).await.unwrap();
    let mark = sim.mark();
    bus.set_transactions(transactions).await.unwrap();
    assert!(sim.since(mark).is_empty());
}

#[tokio::test]
async fn i2c_timeout_then_success() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.i2c_targets.insert(0x48);
        s.ignore_triggers = 1;
    })
    .await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();

    assert!(matches!(
        bus.read(0x48, 1, Duration::from_millis(100)).await,
        Err(Error::Timeout(Opcode::Trigger))
    ));
    assert!(connection.is_connected());
    let result = bus.read(0x48, 1, TIMEOUT).await.unwrap();
    assert!(result.address_ack);
}

#[tokio::test]
async fn i2c_timeout_covers_loading_the_batch() {
    let mut config = test_config();
    config.connection.reply_timeout_ms = 2000;
    let (connection, sim) = connect_with(config, |s| {
        s.i2c_targets.insert(0x48);
    })
    .await;
    let bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();
    sim.state.lock().silent.insert(Opcode::Stimulus);

    let started = Instant::now();
    let result = bus.read(0x48, 1, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(Error::Timeout(Opcode::Stimulus))));
    assert!(started.elapsed() < Duration::from_millis(1000));

    // The unacknowledged program is written again on the next call.
    sim.state.lock().silent.clear();
    assert!(bus.read(0x48, 1, TIMEOUT).await.unwrap().address_ack);
}

#[tokio::test]
async fn spi_timeout_covers_loading_the_words() {
    let mut config = test_config();
    config.connection.reply_timeout_ms = 2000;
    let (connection, sim) = connect_with(config, |_| {}).await;
    let spi = SpiConfig::new(&connection, SpiOptions::default()).await.unwrap();
    sim.state.lock().silent.insert(Opcode::StimulusDriverMatrix);

    let started = Instant::now();
    let result = spi.write(&[0x01, 0x02], Duration::from_millis(100)).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn i2c_bus_trait() {
    let (connection, _sim) = connect_with(test_config(), |s| {
        s.i2c_targets.insert(0x50);
        s.i2c_data.insert(0x50, vec![0x12, 0x34]);
    })
    .await;
    let mut bus = I2cConfig::new(&connection, I2cOptions::default()).await.unwrap();

    let mut buffer = [0u8; 2];
    bus.write_read(0x50, &[0x00], &mut buffer).await.unwrap();
    assert_eq!(buffer, [0x12, 0x34]);

    I2c::write(&mut bus, 0x50, &[0x00, 0x01]).await.unwrap();
    assert!(matches!(
        I2c::write(&mut bus, 0x33, &[0x00]).await,
        Err(Error::I2cNack(0x33))
    ));
}

#[tokio::test]
async fn i2c_release_returns_resources() {
    let mut config = test_config();
    config.resources.stimuli = 1;
    let (connection, sim) = connect_with(config, |_| {}).await;

    let options = I2cOptions {
        scl: Some(pin("B1")),
        sda: Some(pin("B2")),
        ..Default::default()
    };
    let bus = I2cConfig::new(&connection, options.clone()).await.unwrap();
    assert!(matches!(
        I2cConfig::new(&connection, I2cOptions::default()).await,
        Err(Error::ResourceExhausted(ResourceKind::Stimulus))
    ));
    // The failed construction handed back the driver and pins it claimed.
    connection.acquire_pin("A1").await.unwrap();
    connection.acquire_driver_by_id(DriverType::I2c, 1).await.unwrap();

    bus.release().await.unwrap();
    assert!(sim.state.lock().links.is_empty());
    I2cConfig::new(&connection, options).await.unwrap();
}

#[tokio::test]
async fn dropping_configs_while_allocator_is_held_returns_resources() {
    let (connection, _sim) = connect().await;
    let options = I2cOptions {
        scl: Some(pin("B1")),
        sda: Some(pin("B2")),
        ..Default::default()
    };
    let bus = I2cConfig::new(&connection, options.clone()).await.unwrap();
    let gpio = Gpio::new(
        &connection,
        GpioOptions {
            pin: Some(pin("A3")),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let held = connection.resources().await;
    drop(bus);
    drop(gpio);
    drop(held);

    connection.acquire_pin("A3").await.unwrap();
    I2cConfig::new(&connection, options).await.unwrap();
}

#[tokio::test]
async fn spi_write_returns_one_word_per_word_sent() {
    let (connection, _sim) = connect().await;
    let spi = SpiConfig::new(&connection, SpiOptions::default()).await.unwrap();

    let read = spi.write(&[0x01, 0x02, 0x03], TIMEOUT).await.unwrap();
    assert_eq!(read, vec![0x01, 0x02, 0x03]);

    assert!(matches!(
        spi.write(&[0x1FF], TIMEOUT).await,
        Err(Error::InvalidArgument(_))
    ));
    spi.set_bit_width(16).await.unwrap();
    assert_eq!(spi.write(&[0x1FF], TIMEOUT).await.unwrap(), vec![0x1FF]);
}

#[tokio::test]
async fn gpio_reports_level_changes() {
    let (connection, sim) = connect().await;
    let gpio = Gpio::new(
        &connection,
        GpioOptions {
            pin: Some(pin("A2")),
            output: OutputType::Disable,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut events = connection.events();
    let (tx, mut rx) = mpsc::unbounded_channel();
    gpio.on_level_change(move |level| {
        let _ = tx.send(level);
    });

    // A1 is bit 0, A2 bit 1
    sim.set_levels(0b10);
    let level = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(level, Some(true));
    assert!(gpio.input_level());
    assert!(!connection.input_level(pin("A1")));

    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DeviceEvent::InputLevel {
            pin: pin("A2"),
            level: true
        }
    );

    gpio.clear_level_callback();
    sim.set_levels(0);
    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, DeviceEvent::InputLevel { level: false, .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn gpio_settings_only_write_changes() {
    let (connection, sim) = connect().await;
    let gpio = Gpio::new(&connection, GpioOptions::default()).await.unwrap();
    assert_eq!(gpio.driver().kind(), DriverType::Gpio);

    let mark = sim.mark();
    gpio.set_output_type(OutputType::PushPull).await.unwrap();
    gpio.set_level(true).await.unwrap();
    gpio.set_level(true).await.unwrap();
    let sent = sim.since(mark);
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|f| f.opcode == Opcode::DriverPinMatrix));
    assert!(gpio.settings().await.unwrap().level);
}
