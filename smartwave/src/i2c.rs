//! I2C master built from one I2C driver, two pins and a stimulus.
//!
//! A batch of transactions is compiled into stimulus samples: one command
//! word per transaction followed, for writes, by one sample per data byte.
//! Triggering plays the samples into the driver; the stimulus records an
//! info word per transaction plus one data word per two bytes, and the
//! device returns those in a Readback frame.

use async_trait::async_trait;
use bitvec::prelude::*;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;

use crate::device::{time_left, Connection};
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::protocol::{Opcode, TriggerMode};
use crate::resource::{
    Claim, DriverHandle, DriverSettings, DriverType, I2cSettings, PinHandle, PinId, Resources,
    Role, StimulusHandle,
};
use crate::tracing::prelude::*;

/// Highest 7-bit address.
pub const MAX_ADDRESS: u8 = 0x7F;
/// Longest transfer one command word can describe.
pub const MAX_TRANSFER: usize = u8::MAX as usize;

const SAMPLE_WIDTH: u8 = 32;

/// One bus operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum I2cTransaction {
    Write { address: u8, data: Vec<u8> },
    Read { address: u8, length: u8 },
}

impl I2cTransaction {
    pub fn write(address: u8, data: impl Into<Vec<u8>>) -> Self {
        I2cTransaction::Write {
            address,
            data: data.into(),
        }
    }

    pub fn read(address: u8, length: u8) -> Self {
        I2cTransaction::Read { address, length }
    }

    pub fn address(&self) -> u8 {
        match self {
            I2cTransaction::Write { address, .. } | I2cTransaction::Read { address, .. } => *address,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, I2cTransaction::Read { .. })
    }

    /// Number of data bytes moved.
    pub fn len(&self) -> usize {
        match self {
            I2cTransaction::Write { data, .. } => data.len(),
            I2cTransaction::Read { length, .. } => *length as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded words this transaction produces: an info word and one word
    /// per two data bytes.
    fn read_count(&self) -> usize {
        1 + self.len().div_ceil(2)
    }

    fn validate(&self) -> Result<()> {
        if self.address() > MAX_ADDRESS {
            return Err(Error::InvalidArgument(format!(
                "I2C address 0x{:02x} is not 7 bit",
                self.address()
            )));
        }
        if self.len() > MAX_TRANSFER {
            return Err(Error::InvalidArgument(format!(
                "I2C transfer of {} bytes exceeds {}",
                self.len(),
                MAX_TRANSFER
            )));
        }
        Ok(())
    }
}

struct CommandWordBuilder {
    word: u32,
}

impl CommandWordBuilder {
    fn new() -> Self {
        Self { word: 0 }
    }

    fn with_length(mut self, length: u8) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view[0..8].store(length);
        self
    }

    /// Address the target before transferring data.
    fn with_device_select(mut self) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view.set(16, true);
        self
    }

    fn with_address(mut self, address: u8) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view[17..25].store(address);
        self
    }

    fn with_read(mut self, read: bool) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view.set(25, read);
        self
    }

    fn for_transaction(self, transaction: &I2cTransaction) -> Self {
        self.with_length(transaction.len() as u8)
            .with_device_select()
            .with_address(transaction.address())
            .with_read(transaction.is_read())
    }

    fn build(self) -> u32 {
        self.word
    }
}

/// A validated list of transactions and the samples it compiles to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    transactions: Vec<I2cTransaction>,
    samples: Vec<u32>,
    read_count: u16,
}

impl Batch {
    pub fn new(transactions: Vec<I2cTransaction>) -> Result<Self> {
        let mut samples = Vec::new();
        let mut read_count = 0usize;
        for transaction in &transactions {
            transaction.validate()?;
            samples.push(CommandWordBuilder::new().for_transaction(transaction).build());
            if let I2cTransaction::Write { data, .. } = transaction {
                samples.extend(data.iter().map(|&b| b as u32));
            }
            read_count += transaction.read_count();
        }
        let read_count = u16::try_from(read_count).map_err(|_| {
            Error::InvalidArgument(format!("batch reads back {} words", read_count))
        })?;
        Ok(Self {
            transactions,
            samples,
            read_count,
        })
    }

    pub fn transactions(&self) -> &[I2cTransaction] {
        &self.transactions
    }

    pub fn samples(&self) -> &[u32] {
        &self.samples
    }

    pub fn read_count(&self) -> u16 {
        self.read_count
    }
}

/// What the bus reported for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct I2cTransactionResult {
    pub read: bool,
    pub address: u8,
    pub address_ack: bool,
    pub data: Vec<u8>,
    /// Acknowledgment of each data byte, in `data` order
    pub data_acks: Vec<bool>,
}

impl I2cTransactionResult {
    /// Whether the target acknowledged its address and, for writes, every
    /// byte. Reads end with a host NACK, so their data acks are ignored.
    pub fn acknowledged(&self) -> bool {
        self.address_ack && (self.read || self.data_acks.iter().all(|&a| a))
    }
}

/// Split recorded words into one result per transaction.
///
/// Every transaction must be answered by an info word naming its address,
/// direction and length, followed by all of its data. Anything else means
/// the readback does not belong to this batch.
fn decode_results(
    transactions: &[I2cTransaction],
    words: &[u32],
) -> Result<Vec<I2cTransactionResult>> {
    let malformed = |index: usize, what: &str| {
        Error::MalformedFrame(format!("I2C transaction {}: {}", index, what))
    };
    let mut results = Vec::with_capacity(transactions.len());
    let mut words = words.iter();
    for (index, transaction) in transactions.iter().enumerate() {
        let info = words
            .next()
            .ok_or_else(|| malformed(index, "readback ends before its info word"))?;
        let info = info.view_bits::<Lsb0>();
        let length: u8 = info[0..8].load();
        let mut result = I2cTransactionResult {
            read: info[16],
            address: info[8..15].load(),
            address_ack: info[17],
            ..Default::default()
        };
        if result.address != transaction.address()
            || result.read != transaction.is_read()
            || length as usize != transaction.len()
        {
            return Err(malformed(
                index,
                &format!(
                    "answered as {} of {} bytes at 0x{:02x}",
                    if result.read { "read" } else { "write" },
                    length,
                    result.address
                ),
            ));
        }
        for _ in 0..transaction.len().div_ceil(2) {
            let word = words
                .next()
                .ok_or_else(|| malformed(index, "readback ends inside its data"))?;
            let bits = word.view_bits::<Lsb0>();
            result.data.push(bits[0..8].load());
            result.data_acks.push(bits[8]);
            if bits[25] {
                result.data.push(bits[16..24].load());
                result.data_acks.push(bits[24]);
            }
        }
        if result.data.len() != transaction.len() {
            return Err(malformed(
                index,
                &format!("{} of {} bytes recorded", result.data.len(), transaction.len()),
            ));
        }
        results.push(result);
    }
    let extra = words.count();
    if extra > 0 {
        return Err(Error::MalformedFrame(format!(
            "{} recorded words past the last I2C transaction",
            extra
        )));
    }
    Ok(results)
}

/// Construction options; unset fields use the next free pin and the
/// driver defaults.
#[derive(Debug, Clone, Default)]
pub struct I2cOptions {
    pub scl: Option<PinId>,
    pub sda: Option<PinId>,
    pub clock_hz: Option<u32>,
    pub scl_name: Option<String>,
    pub sda_name: Option<String>,
}

/// Configured I2C master on a device.
///
/// Owns its driver, pins and stimulus until [`release`](Self::release).
pub struct I2cConfig {
    connection: Connection,
    driver: DriverHandle,
    scl: PinHandle,
    sda: PinHandle,
    stimulus: StimulusHandle,
    claim: Option<Claim>,
}

impl I2cConfig {
    /// Claim resources, wire them and write the configuration.
    pub async fn new(connection: &Connection, options: I2cOptions) -> Result<Self> {
        let mut resources = connection.resources().await;
        let mut claim = Claim::default();

        let parts = match Self::claim_parts(&mut resources, &mut claim, &options) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = claim.release(&mut resources);
                return Err(e);
            }
        };
        if let Err(e) = connection.synchronize_locked(&mut resources).await {
            let _ = claim.release(&mut resources);
            return Err(e);
        }
        drop(resources);

        let (driver, scl, sda, stimulus) = parts;
        debug!(driver = driver.id(), "I2C config ready");
        Ok(Self {
            connection: connection.clone(),
            driver,
            scl,
            sda,
            stimulus,
            claim: Some(claim),
        })
    }

    fn claim_parts(
        r: &mut Resources,
        claim: &mut Claim,
        options: &I2cOptions,
    ) -> Result<(DriverHandle, PinHandle, PinHandle, StimulusHandle)> {
        let driver = claim.driver(r, DriverType::I2c)?;
        let scl = claim.pin(r, options.scl)?;
        let sda = claim.pin(r, options.sda)?;
        let stimulus = claim.stimulus(r)?;

        if let Some(clock_hz) = options.clock_hz {
            r.configure_driver(driver, DriverSettings::I2c(I2cSettings { clock_hz }))?;
        }
        if let Some(name) = &options.scl_name {
            r.set_role_name(driver, Role::Scl, name)?;
        }
        if let Some(name) = &options.sda_name {
            r.set_role_name(driver, Role::Sda, name)?;
        }
        r.bind_pin(driver, Role::Scl, scl)?;
        r.bind_pin(driver, Role::Sda, sda)?;
        r.set_pullup(scl, true)?;
        r.set_pullup(sda, true)?;
        r.program_stimulus(stimulus, SAMPLE_WIDTH, TriggerMode::Single, &[])?;
        r.link(driver, stimulus, 0)?;
        Ok((driver, scl, sda, stimulus))
    }

    pub fn driver(&self) -> DriverHandle {
        self.driver
    }

    pub fn pins(&self) -> (PinHandle, PinHandle) {
        (self.scl, self.sda)
    }

    /// Stimulus slot whose recorder returns this config's results.
    pub fn recorder(&self) -> u8 {
        self.stimulus.index() as u8
    }

    pub async fn clock(&self) -> Result<u32> {
        match self.connection.resources().await.driver(self.driver)?.settings() {
            DriverSettings::I2c(s) => Ok(s.clock_hz),
            _ => Err(Error::InvalidHandle(crate::resource::ResourceKind::Driver(
                DriverType::I2c,
            ))),
        }
    }

    pub async fn set_clock(&self, clock_hz: u32) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.configure_driver(self.driver, DriverSettings::I2c(I2cSettings { clock_hz }))?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    pub async fn set_pullups(&self, enabled: bool) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.set_pullup(self.scl, enabled)?;
        r.set_pullup(self.sda, enabled)?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    /// Set the label the device displays for `role` (SCL or SDA).
    pub async fn set_display_name(&self, role: Role, name: &str) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.set_role_name(self.driver, role, name)?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    /// Load `transactions` onto the device. Loading the batch that is
    /// already there writes nothing.
    pub async fn set_transactions(&self, transactions: Vec<I2cTransaction>) -> Result<Batch> {
        let batch = Batch::new(transactions)?;
        let mut r = self.connection.resources().await;
        self.load(&mut r, &batch, None).await?;
        Ok(batch)
    }

    async fn load(
        &self,
        r: &mut Resources,
        batch: &Batch,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let changed =
            r.program_stimulus(self.stimulus, SAMPLE_WIDTH, TriggerMode::Single, batch.samples())?;
        r.link(self.driver, self.stimulus, batch.read_count())?;
        if changed {
            trace!(transactions = batch.transactions.len(), "Loading I2C batch");
        }
        self.connection.synchronize_by(r, deadline).await?;
        Ok(())
    }

    /// Run `batch` once and return one result per transaction, in order.
    ///
    /// `timeout` bounds the whole call, including loading the batch. On
    /// timeout nothing is returned and the connection stays usable.
    pub async fn send_transactions(
        &self,
        batch: &Batch,
        timeout: Duration,
    ) -> Result<Vec<I2cTransactionResult>> {
        let deadline = Instant::now() + timeout;
        let mut r = self
            .connection
            .resources_until(deadline, Opcode::Trigger)
            .await?;
        self.load(&mut r, batch, Some(deadline)).await?;
        let readback = self
            .connection
            .trigger_readback(self.recorder(), time_left(deadline, Opcode::Trigger)?)
            .await?;
        drop(r);

        decode_results(&batch.transactions, &readback.samples)
    }

    async fn run(
        &self,
        transactions: Vec<I2cTransaction>,
        timeout: Duration,
    ) -> Result<Vec<I2cTransactionResult>> {
        let batch = Batch::new(transactions)?;
        self.send_transactions(&batch, timeout).await
    }

    async fn run_one(
        &self,
        transaction: I2cTransaction,
        timeout: Duration,
    ) -> Result<I2cTransactionResult> {
        self.run(vec![transaction], timeout)
            .await?
            .pop()
            .ok_or_else(|| Error::MalformedFrame("empty I2C result".into()))
    }

    pub async fn write(
        &self,
        address: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<I2cTransactionResult> {
        self.run_one(I2cTransaction::write(address, data), timeout)
            .await
    }

    pub async fn read(
        &self,
        address: u8,
        length: u8,
        timeout: Duration,
    ) -> Result<I2cTransactionResult> {
        self.run_one(I2cTransaction::read(address, length), timeout)
            .await
    }

    /// Write `register` then `value` in one transaction.
    pub async fn write_register(
        &self,
        address: u8,
        register: &[u8],
        value: &[u8],
        timeout: Duration,
    ) -> Result<I2cTransactionResult> {
        let data = [register, value].concat();
        self.write(address, &data, timeout).await
    }

    /// Write `register`, then read `length` bytes; returns both results.
    pub async fn read_register(
        &self,
        address: u8,
        register: &[u8],
        length: u8,
        timeout: Duration,
    ) -> Result<Vec<I2cTransactionResult>> {
        self.run(
            vec![
                I2cTransaction::write(address, register),
                I2cTransaction::read(address, length),
            ],
            timeout,
        )
        .await
    }

    /// Addresses within `range` that acknowledge an empty read, ascending.
    pub async fn scan_addresses(
        &self,
        range: RangeInclusive<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if *range.end() > MAX_ADDRESS {
            return Err(Error::InvalidArgument(format!(
                "scan range ends at 0x{:02x}, past 0x{:02x}",
                range.end(),
                MAX_ADDRESS
            )));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let transactions = range
            .map(|address| I2cTransaction::read(address, 0))
            .collect();
        let found: Vec<u8> = self
            .run(transactions, timeout)
            .await?
            .into_iter()
            .filter(|r| r.address_ack)
            .map(|r| r.address)
            .collect();
        debug!(found = ?found, "I2C scan complete");
        Ok(found)
    }

    /// Return the driver, pins and stimulus and unwire them on the device.
    pub async fn release(mut self) -> Result<()> {
        let mut r = self.connection.resources().await;
        if let Some(claim) = self.claim.take() {
            claim.release(&mut r)?;
        }
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }
}

impl Drop for I2cConfig {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        trace!(driver = self.driver.id(), "I2C config dropped");
        self.connection.release_on_drop(claim);
    }
}

fn check_acks(address: u8, result: &I2cTransactionResult) -> Result<()> {
    if result.acknowledged() {
        Ok(())
    } else {
        Err(Error::I2cNack(address))
    }
}

fn copy_read(address: u8, result: &I2cTransactionResult, buffer: &mut [u8]) -> Result<()> {
    check_acks(address, result)?;
    if result.data.len() < buffer.len() {
        return Err(Error::MalformedFrame(format!(
            "I2C read returned {} of {} bytes",
            result.data.len(),
            buffer.len()
        )));
    }
    buffer.copy_from_slice(&result.data[..buffer.len()]);
    Ok(())
}

fn transfer_length(buffer: &[u8]) -> Result<u8> {
    u8::try_from(buffer.len()).map_err(|_| {
        Error::InvalidArgument(format!(
            "I2C transfer of {} bytes exceeds {}",
            buffer.len(),
            MAX_TRANSFER
        ))
    })
}

#[async_trait]
impl I2c for I2cConfig {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        let timeout = self.connection.reply_timeout();
        let result = I2cConfig::write(self, address, data, timeout).await?;
        check_acks(address, &result)
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()> {
        let timeout = self.connection.reply_timeout();
        let result = I2cConfig::read(self, address, transfer_length(buffer)?, timeout).await?;
        copy_read(address, &result, buffer)
    }

    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> Result<()> {
        let timeout = self.connection.reply_timeout();
        let results = self
            .read_register(address, data, transfer_length(buffer)?, timeout)
            .await?;
        let [write, read] = results.as_slice() else {
            return Err(Error::MalformedFrame("expected two I2C results".into()));
        };
        check_acks(address, write)?;
        copy_read(address, read, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(I2cTransaction::write(0x50, vec![0xAA, 0xBB]), 0x00A1_0002 ; "write two bytes")]
    #[test_case(I2cTransaction::read(0x50, 1), 0x02A1_0001 ; "read one byte")]
    #[test_case(I2cTransaction::read(0x7F, 0), 0x02FF_0000 ; "empty read")]
    fn command_word(transaction: I2cTransaction, expected: u32) {
        assert_eq!(
            CommandWordBuilder::new().for_transaction(&transaction).build(),
            expected
        );
    }

    #[test]
    fn batch_samples_and_read_count() {
        let batch = Batch::new(vec![
            I2cTransaction::write(0x50, vec![0x01, 0x02, 0x03]),
            I2cTransaction::read(0x50, 1),
        ])
        .unwrap();
        assert_eq!(batch.samples(), &[0x00A1_0003, 1, 2, 3, 0x02A1_0001]);
        // (1 + 2) + (1 + 1)
        assert_eq!(batch.read_count(), 5);
    }

    #[test]
    fn invalid_transactions_rejected() {
        assert!(Batch::new(vec![I2cTransaction::read(0x80, 1)]).is_err());
        assert!(Batch::new(vec![I2cTransaction::write(0x10, vec![0; 256])]).is_err());
    }

    fn write_then_read() -> Vec<I2cTransaction> {
        vec![
            I2cTransaction::write(0x50, vec![0x01, 0x02, 0x03]),
            I2cTransaction::read(0x50, 1),
        ]
    }

    #[test]
    fn decodes_results_in_order() {
        let words = [
            // write of 3 bytes to 0x50, address acked
            0x0002_5003,
            // bytes 0x01 (ack) and 0x02 (ack)
            0x0302_0101,
            // byte 0x03 (nack), no second byte
            0x0000_0003,
            // read of 1 byte from 0x50, address acked
            0x0003_5001,
            0x0000_00AB,
        ];
        let results = decode_results(&write_then_read(), &words).unwrap();
        assert_eq!(results.len(), 2);

        assert!(!results[0].read);
        assert_eq!(results[0].address, 0x50);
        assert!(results[0].address_ack);
        assert_eq!(results[0].data, vec![0x01, 0x02, 0x03]);
        assert_eq!(results[0].data_acks, vec![true, true, false]);
        assert!(!results[0].acknowledged());

        assert!(results[1].read);
        assert_eq!(results[1].data, vec![0xAB]);
        assert!(results[1].acknowledged());
    }

    #[test]
    fn truncated_readback_is_malformed() {
        let transactions = [I2cTransaction::write(0x20, vec![1, 2, 3, 4])];
        assert!(matches!(
            decode_results(&transactions, &[0x0002_2004, 0x0302_0101]),
            Err(Error::MalformedFrame(_))
        ));
        // second transaction never answered
        assert!(matches!(
            decode_results(&write_then_read(), &[0x0002_5003, 0x0302_0101, 0x0000_0003]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test_case(0x0002_5103 ; "other address")]
    #[test_case(0x0003_5003 ; "read instead of write")]
    #[test_case(0x0002_5002 ; "other length")]
    fn mismatched_info_word_is_malformed(info: u32) {
        let words = [info, 0x0302_0101, 0x0000_0003, 0x0003_5001, 0x0000_00AB];
        assert!(matches!(
            decode_results(&write_then_read(), &words),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn trailing_words_are_malformed() {
        let transactions = [I2cTransaction::read(0x50, 0)];
        assert!(decode_results(&transactions, &[0x0003_5000]).is_ok());
        assert!(matches!(
            decode_results(&transactions, &[0x0003_5000, 0x0003_5100]),
            Err(Error::MalformedFrame(_))
        ));
    }
}
