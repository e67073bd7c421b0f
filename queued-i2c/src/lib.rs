//! Serialized, queued access to a shared I2C/SMBus bus.
//!
//! Many tasks can talk to many devices on one bus without their
//! transactions interleaving on the wire:
//!
//! ```no_run
//! # async fn example() -> queued_i2c::error::Result<()> {
//! use std::sync::Arc;
//! use queued_i2c::{BusChannel, Device, TransactionQueue};
//! use queued_i2c::transport::linux::LinuxTransport;
//!
//! let channel = BusChannel::new(1, Arc::new(LinuxTransport::default()));
//! let queue = TransactionQueue::spawn(channel);
//! queue.open().await?;
//!
//! let sensor = Device::new(queue.clone(), 0x48);
//! let temperature = sensor.read_word(0x00).await?;
//! # let _ = temperature;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod operation;
pub mod queue;
pub mod tracing;
pub mod transport;

pub use channel::BusChannel;
pub use device::Device;
pub use error::{BusError, Result};
pub use operation::{Operation, Outcome};
pub use queue::TransactionQueue;
pub use transport::{Bit, Functionality};
