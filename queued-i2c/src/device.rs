//! A device at a fixed address on a queued bus.
//!
//! Drivers for specific chips wrap a [`Device`] and build their register
//! map on top of the forwarding methods:
//!
//! ```no_run
//! # use queued_i2c::{device::Device, error::Result};
//! struct WeatherSensor(Device);
//!
//! impl WeatherSensor {
//!     async fn temperature(&self) -> Result<u16> {
//!         self.0.read_word(0x50).await
//!     }
//! }
//! ```

use bytes::Bytes;

use crate::error::Result;
use crate::queue::TransactionQueue;
use crate::transport::Bit;

/// One address on a shared bus. Every call goes through the bus queue with
/// the address filled in.
#[derive(Clone)]
pub struct Device {
    queue: TransactionQueue,
    address: u8,
}

impl Device {
    pub fn new(queue: TransactionQueue, address: u8) -> Self {
        Self { queue, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// The queue this device submits to.
    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    /// Plain I2C read.
    pub async fn read(&self, length: usize) -> Result<Bytes> {
        self.queue.read(self.address, length).await
    }

    /// Plain I2C write.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        self.queue.write(self.address, data).await
    }

    pub async fn read_byte(&self, command: u8) -> Result<u8> {
        self.queue.read_byte(self.address, command).await
    }

    pub async fn read_word(&self, command: u8) -> Result<u16> {
        self.queue.read_word(self.address, command).await
    }

    pub async fn read_block(&self, command: u8, length: usize) -> Result<Bytes> {
        self.queue.read_block(self.address, command, length).await
    }

    pub async fn receive_byte(&self) -> Result<u8> {
        self.queue.receive_byte(self.address).await
    }

    pub async fn write_byte(&self, command: u8, value: u8) -> Result<()> {
        self.queue.write_byte(self.address, command, value).await
    }

    pub async fn write_word(&self, command: u8, value: u16) -> Result<()> {
        self.queue.write_word(self.address, command, value).await
    }

    pub async fn write_block(&self, command: u8, data: impl Into<Bytes>) -> Result<usize> {
        self.queue.write_block(self.address, command, data).await
    }

    pub async fn send_byte(&self, value: u8) -> Result<()> {
        self.queue.send_byte(self.address, value).await
    }

    pub async fn write_quick(&self, bit: Bit) -> Result<()> {
        self.queue.write_quick(self.address, bit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BusChannel;
    use crate::error::BusError;
    use crate::transport::sim::{SimBus, Transaction};
    use std::sync::Arc;

    const SENSOR_ADDR: u8 = 0x72;

    struct WeatherSensor(Device);

    impl WeatherSensor {
        async fn write_config(&self, config: u8) -> Result<()> {
            self.0.write_byte(0x24, config).await
        }

        async fn temperature(&self) -> Result<u16> {
            self.0.read_word(0x50).await
        }

        async fn pressure(&self) -> Result<u16> {
            self.0.read_word(0x52).await
        }
    }

    async fn open_queue(bus: &SimBus) -> TransactionQueue {
        let queue = TransactionQueue::spawn(BusChannel::new(1, Arc::new(bus.clone())));
        queue.open().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_forwards_address() {
        let bus = SimBus::new(1).with_device(SENSOR_ADDR, vec![0u8; 256]);
        let device = Device::new(open_queue(&bus).await, SENSOR_ADDR);

        device.write_byte(0x22, 0x11).await.unwrap();
        assert_eq!(device.read_byte(0x22).await.unwrap(), 0x11);
        device.write_word(0x30, 0x1234).await.unwrap();
        assert_eq!(device.read_word(0x30).await.unwrap(), 0x1234);
        assert_eq!(device.write_block(0x40, vec![1, 2, 3]).await.unwrap(), 3);
        assert_eq!(&device.read_block(0x40, 3).await.unwrap()[..], &[1, 2, 3]);
        device.send_byte(0x7e).await.unwrap();
        assert_eq!(device.receive_byte().await.unwrap(), 0x7e);
        device.write_quick(Bit::One).await.unwrap();
        assert_eq!(device.write(vec![9, 9]).await.unwrap(), 2);
        assert_eq!(&device.read(2).await.unwrap()[..], &[9, 9]);

        assert!(bus
            .transactions()
            .iter()
            .all(|t| t.address == Some(SENSOR_ADDR)));
    }

    #[tokio::test]
    async fn test_extending_device() {
        let mut registers = vec![0u8; 256];
        registers[0x50..0x54].copy_from_slice(&[0x00, 0x17, 0x03, 0xf5]);
        let bus = SimBus::new(1).with_device(SENSOR_ADDR, registers);
        let sensor = WeatherSensor(Device::new(open_queue(&bus).await, SENSOR_ADDR));

        sensor.write_config(0b101).await.unwrap();
        let (temperature, pressure) = tokio::join!(sensor.temperature(), sensor.pressure());
        assert_eq!(temperature.unwrap(), 23);
        assert_eq!(pressure.unwrap(), 1013);
        assert_eq!(bus.registers(SENSOR_ADDR).unwrap()[0x24], 0b101);

        assert_eq!(
            bus.transactions().last(),
            Some(&Transaction {
                operation: "read_word",
                address: Some(SENSOR_ADDR),
            })
        );
    }

    #[tokio::test]
    async fn test_two_devices_share_one_queue() {
        let bus = SimBus::new(1)
            .with_device(0x0f, (0..=255u8).rev().collect::<Vec<_>>())
            .with_device(0xf0, (0..=255u8).collect::<Vec<_>>());
        let queue = open_queue(&bus).await;
        let a = Device::new(queue.clone(), 0x0f);
        let b = Device::new(queue, 0xf0);
        let missing = Device::new(a.queue().clone(), 0x01);

        let (x, y, z) = tokio::join!(a.read_byte(0), missing.read_byte(0), b.read_byte(0));
        assert_eq!(x.unwrap(), 255);
        assert!(matches!(y, Err(BusError::RemoteDevice { address: 0x01, .. })));
        assert_eq!(z.unwrap(), 0);
    }
}
