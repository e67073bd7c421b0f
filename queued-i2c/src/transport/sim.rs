//! In-memory simulated bus.
//!
//! Each simulated device is a flat register file indexed by the command
//! byte. The simulator follows the same failure contract as real hardware:
//! opening a channel other than its own fails with `ENOENT`, and addressing
//! an address with no device fails with [`NO_DEVICE`].
//!
//! ```text
//! SimBus::new(1)
//!     .with_device(0x0f, (0..=255u8).rev().collect::<Vec<_>>())
//!     .with_device(0xf0, (0..=255u8).collect::<Vec<_>>())
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{Bit, BusHandle, Functionality, Transport, NO_DEVICE};

/// Functionality reported by default: plain I2C plus the SMBus primitives
/// the simulator implements.
pub const DEFAULT_FUNCTIONALITY: Functionality = Functionality::I2C
    .union(Functionality::SMBUS_QUICK)
    .union(Functionality::SMBUS_READ_BYTE)
    .union(Functionality::SMBUS_WRITE_BYTE)
    .union(Functionality::SMBUS_READ_BYTE_DATA)
    .union(Functionality::SMBUS_WRITE_BYTE_DATA)
    .union(Functionality::SMBUS_READ_WORD_DATA)
    .union(Functionality::SMBUS_WRITE_WORD_DATA)
    .union(Functionality::SMBUS_READ_I2C_BLOCK)
    .union(Functionality::SMBUS_WRITE_I2C_BLOCK);

/// Simulated physical bus.
///
/// Cloning shares the same devices, so a test can keep one clone to inspect
/// registers while the queue drives another.
#[derive(Clone)]
pub struct SimBus {
    channel: u32,
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    devices: BTreeMap<u8, Vec<u8>>,
    functionality: Functionality,
    latency: Option<Duration>,
    transactions: Vec<Transaction>,
    in_flight: usize,
    max_in_flight: usize,
}

/// One completed transaction, as seen on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub operation: &'static str,
    pub address: Option<u8>,
}

impl SimBus {
    /// Create an empty bus answering on `channel`.
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            state: Arc::new(Mutex::new(SimState {
                devices: BTreeMap::new(),
                functionality: DEFAULT_FUNCTIONALITY,
                latency: None,
                transactions: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
            })),
        }
    }

    /// Attach a device with the given register contents.
    pub fn with_device(self, address: u8, registers: impl Into<Vec<u8>>) -> Self {
        self.state.lock().devices.insert(address, registers.into());
        self
    }

    /// Report `functionality` instead of [`DEFAULT_FUNCTIONALITY`].
    pub fn with_functionality(self, functionality: Functionality) -> Self {
        self.state.lock().functionality = functionality;
        self
    }

    /// Delay every operation by `latency`, as a slow adapter would.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Channel number this bus answers on.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Snapshot of a device's registers.
    pub fn registers(&self, address: u8) -> Option<Vec<u8>> {
        self.state.lock().devices.get(&address).cloned()
    }

    /// Transactions in the order they reached the bus.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }

    /// Highest number of transactions ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl Transport for SimBus {
    async fn open(&self, channel: u32) -> io::Result<Box<dyn BusHandle>> {
        if channel != self.channel {
            return Err(Errno::ENOENT.into());
        }
        Ok(Box::new(SimHandle { bus: self.clone() }))
    }
}

struct SimHandle {
    bus: SimBus,
}

impl SimHandle {
    /// Run one transaction: mark it in flight, wait out the configured
    /// latency, then apply `f` to the bus state.
    async fn transaction<T>(
        &self,
        operation: &'static str,
        address: Option<u8>,
        f: impl FnOnce(&mut SimState) -> io::Result<T> + Send,
    ) -> io::Result<T> {
        let latency = {
            let mut state = self.bus.state.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.bus.state.lock();
        state.in_flight -= 1;
        state.transactions.push(Transaction { operation, address });
        f(&mut state)
    }

    /// Run a transaction against the registers of the device at `address`.
    async fn with_device<T>(
        &self,
        operation: &'static str,
        address: u8,
        f: impl FnOnce(&mut Vec<u8>) -> io::Result<T> + Send,
    ) -> io::Result<T> {
        self.transaction(operation, Some(address), |state| {
            let registers = state.devices.get_mut(&address).ok_or_else(|| {
                trace!(address = %format!("{:#04x}", address), "No simulated device");
                io::Error::from(NO_DEVICE)
            })?;
            f(registers)
        })
        .await
    }
}

fn register(registers: &[u8], index: usize) -> io::Result<u8> {
    registers
        .get(index)
        .copied()
        .ok_or_else(|| Errno::EINVAL.into())
}

fn check_index(registers: &[u8], index: usize) -> io::Result<()> {
    if index < registers.len() {
        Ok(())
    } else {
        Err(Errno::EINVAL.into())
    }
}

#[async_trait]
impl BusHandle for SimHandle {
    async fn functionality(&mut self) -> io::Result<Functionality> {
        self.transaction("capabilities", None, |state| Ok(state.functionality))
            .await
    }

    async fn scan(&mut self) -> io::Result<Vec<u8>> {
        self.transaction("scan", None, |state| {
            Ok(state.devices.keys().copied().collect())
        })
        .await
    }

    async fn read(&mut self, address: u8, length: usize) -> io::Result<Bytes> {
        self.with_device("read", address, |registers| {
            let end = length.min(registers.len());
            Ok(Bytes::copy_from_slice(&registers[..end]))
        })
        .await
    }

    async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<usize> {
        self.with_device("write", address, |registers| {
            let n = data.len().min(registers.len());
            registers[..n].copy_from_slice(&data[..n]);
            Ok(n)
        })
        .await
    }

    async fn read_byte(&mut self, address: u8, command: u8) -> io::Result<u8> {
        self.with_device("read_byte", address, |registers| register(registers, command as usize))
            .await
    }

    async fn read_word(&mut self, address: u8, command: u8) -> io::Result<u16> {
        self.with_device("read_word", address, |registers| {
            let high = register(registers, command as usize)?;
            let low = register(registers, command as usize + 1)?;
            Ok(u16::from_be_bytes([high, low]))
        })
        .await
    }

    async fn read_block(&mut self, address: u8, command: u8, length: usize) -> io::Result<Bytes> {
        self.with_device("read_block", address, |registers| {
            let start = command as usize;
            check_index(registers, start)?;
            let end = start.saturating_add(length).min(registers.len());
            Ok(Bytes::copy_from_slice(&registers[start..end]))
        })
        .await
    }

    async fn receive_byte(&mut self, address: u8) -> io::Result<u8> {
        self.with_device("receive_byte", address, |registers| register(registers, 0))
            .await
    }

    async fn write_byte(&mut self, address: u8, command: u8, value: u8) -> io::Result<()> {
        self.with_device("write_byte", address, |registers| {
            check_index(registers, command as usize)?;
            registers[command as usize] = value;
            Ok(())
        })
        .await
    }

    async fn write_word(&mut self, address: u8, command: u8, value: u16) -> io::Result<()> {
        self.with_device("write_word", address, |registers| {
            let start = command as usize;
            check_index(registers, start + 1)?;
            registers[start..start + 2].copy_from_slice(&value.to_be_bytes());
            Ok(())
        })
        .await
    }

    async fn write_block(&mut self, address: u8, command: u8, data: &[u8]) -> io::Result<usize> {
        self.with_device("write_block", address, |registers| {
            let start = command as usize;
            check_index(registers, start)?;
            let n = data.len().min(registers.len() - start);
            registers[start..start + n].copy_from_slice(&data[..n]);
            Ok(n)
        })
        .await
    }

    async fn send_byte(&mut self, address: u8, value: u8) -> io::Result<()> {
        self.with_device("send_byte", address, |registers| {
            check_index(registers, 0)?;
            registers[0] = value;
            Ok(())
        })
        .await
    }

    async fn write_quick(&mut self, address: u8, bit: Bit) -> io::Result<()> {
        // Only the low bit of the first register changes.
        self.with_device("write_quick", address, |registers| {
            check_index(registers, 0)?;
            registers[0] = (registers[0] & 0xfe) | u8::from(bit);
            Ok(())
        })
        .await
    }
}
