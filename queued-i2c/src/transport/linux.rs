//! Linux i2c-dev transport.
//!
//! Opens `/dev/i2c-N` through [`i2cdev`], selecting the target address
//! before each transfer. Adapter functionality comes from the `I2C_FUNCS`
//! ioctl, which `i2cdev` does not expose.
//!
//! Every call blocks in the kernel until the adapter finishes, so transfers
//! run on tokio's blocking pool.
//!
//! Kernel interface: <https://www.kernel.org/doc/Documentation/i2c/dev-interface>

use async_trait::async_trait;
use bytes::Bytes;
use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use nix::errno::Errno;
use nix::libc::c_ulong;
use parking_lot::Mutex;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, trace};

use super::{Bit, BusHandle, Functionality, Transport};

/// Maximum payload of an SMBus block transfer.
pub const SMBUS_BLOCK_MAX: usize = 32;

/// First and last address probed by [`BusHandle::scan`]; the rest of the
/// 7-bit space is reserved.
const SCAN_FIRST: u8 = 0x03;
const SCAN_LAST: u8 = 0x77;

nix::ioctl_read_bad!(i2c_funcs, 0x0705, c_ulong);

/// Opens numbered buses under a device directory (normally `/dev`).
#[derive(Debug, Clone)]
pub struct LinuxTransport {
    device_dir: PathBuf,
}

impl LinuxTransport {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    fn device_path(&self, channel: u32) -> PathBuf {
        self.device_dir.join(format!("i2c-{}", channel))
    }
}

impl Default for LinuxTransport {
    fn default() -> Self {
        Self::new("/dev")
    }
}

#[async_trait]
impl Transport for LinuxTransport {
    async fn open(&self, channel: u32) -> io::Result<Box<dyn BusHandle>> {
        let path = self.device_path(channel);
        debug!(path = %path.display(), "Opening I2C device");
        // Every transfer selects its own address, so start at 0.
        let device = task::spawn_blocking(move || LinuxI2CDevice::new(path, 0))
            .await
            .map_err(io::Error::other)?
            .map_err(io::Error::from)?;

        Ok(Box::new(LinuxHandle {
            device: Arc::new(Mutex::new(device)),
        }))
    }
}

/// Open `/dev/i2c-N`. The queue runs one transfer at a time, so the lock is
/// never contended; it only lets the device move onto the blocking pool.
struct LinuxHandle {
    device: Arc<Mutex<LinuxI2CDevice>>,
}

impl LinuxHandle {
    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LinuxI2CDevice) -> io::Result<T> + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        task::spawn_blocking(move || f(&mut device.lock()))
            .await
            .map_err(io::Error::other)?
    }

    /// Select `address`, then run `f` against the device.
    async fn on_device<T, F>(&self, address: u8, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LinuxI2CDevice) -> io::Result<T> + Send + 'static,
    {
        self.blocking(move |device| {
            device.set_slave_address(u16::from(address))?;
            f(device)
        })
        .await
    }
}

/// SMBus sends words low byte first, so the kernel's value holds the byte
/// at `command` in its low half. Registers here read high byte first.
fn word_from_smbus(raw: u16) -> u16 {
    raw.swap_bytes()
}

fn word_to_smbus(value: u16) -> u16 {
    value.swap_bytes()
}

fn check_block_len(length: usize) -> io::Result<()> {
    if length > SMBUS_BLOCK_MAX {
        return Err(Errno::EINVAL.into());
    }
    Ok(())
}

fn functionality(device: &LinuxI2CDevice) -> io::Result<Functionality> {
    let mut funcs: c_ulong = 0;
    // SAFETY: the fd belongs to `device` and stays open for the call, and
    // `funcs` is a valid c_ulong for the kernel to write.
    unsafe { i2c_funcs(device.as_raw_fd(), &mut funcs) }?;
    Ok(Functionality::from_bits_truncate(funcs as u32))
}

#[async_trait]
impl BusHandle for LinuxHandle {
    async fn functionality(&mut self) -> io::Result<Functionality> {
        self.blocking(|device| functionality(device)).await
    }

    async fn scan(&mut self) -> io::Result<Vec<u8>> {
        self.blocking(|device| {
            let mut found = Vec::new();
            for address in SCAN_FIRST..=SCAN_LAST {
                if device.set_slave_address(u16::from(address)).is_err() {
                    // Claimed by a kernel driver
                    continue;
                }
                // Same probe choice as i2cdetect: a quick write can corrupt
                // EEPROMs and write-protect some chips, so read those ranges.
                let probe = match address {
                    0x30..=0x37 | 0x50..=0x5f => device.smbus_read_byte().map(|_| ()),
                    _ => device.smbus_write_quick(false),
                };
                if probe.is_ok() {
                    found.push(address);
                }
            }
            trace!(found = ?found, "Scan complete");
            Ok(found)
        })
        .await
    }

    async fn read(&mut self, address: u8, length: usize) -> io::Result<Bytes> {
        self.on_device(address, move |device| {
            let mut buffer = vec![0u8; length];
            device.read(&mut buffer)?;
            Ok(Bytes::from(buffer))
        })
        .await
    }

    async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<usize> {
        let data = data.to_vec();
        self.on_device(address, move |device| {
            device.write(&data)?;
            Ok(data.len())
        })
        .await
    }

    async fn read_byte(&mut self, address: u8, command: u8) -> io::Result<u8> {
        self.on_device(address, move |device| Ok(device.smbus_read_byte_data(command)?))
            .await
    }

    async fn read_word(&mut self, address: u8, command: u8) -> io::Result<u16> {
        self.on_device(address, move |device| {
            let raw = device.smbus_read_word_data(command)?;
            Ok(word_from_smbus(raw))
        })
        .await
    }

    async fn read_block(&mut self, address: u8, command: u8, length: usize) -> io::Result<Bytes> {
        check_block_len(length)?;
        self.on_device(address, move |device| {
            let data = device.smbus_read_i2c_block_data(command, length as u8)?;
            Ok(Bytes::from(data))
        })
        .await
    }

    async fn receive_byte(&mut self, address: u8) -> io::Result<u8> {
        self.on_device(address, |device| Ok(device.smbus_read_byte()?))
            .await
    }

    async fn write_byte(&mut self, address: u8, command: u8, value: u8) -> io::Result<()> {
        self.on_device(address, move |device| {
            Ok(device.smbus_write_byte_data(command, value)?)
        })
        .await
    }

    async fn write_word(&mut self, address: u8, command: u8, value: u16) -> io::Result<()> {
        self.on_device(address, move |device| {
            Ok(device.smbus_write_word_data(command, word_to_smbus(value))?)
        })
        .await
    }

    async fn write_block(&mut self, address: u8, command: u8, data: &[u8]) -> io::Result<usize> {
        check_block_len(data.len())?;
        let payload = data.to_vec();
        self.on_device(address, move |device| {
            device.smbus_write_i2c_block_data(command, &payload)?;
            Ok(payload.len())
        })
        .await
    }

    async fn send_byte(&mut self, address: u8, value: u8) -> io::Result<()> {
        self.on_device(address, move |device| Ok(device.smbus_write_byte(value)?))
            .await
    }

    async fn write_quick(&mut self, address: u8, bit: Bit) -> io::Result<()> {
        self.on_device(address, move |device| {
            Ok(device.smbus_write_quick(bit == Bit::One)?)
        })
        .await
    }
}
