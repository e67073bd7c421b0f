//! Bus transport abstraction.
//!
//! A [`Transport`] opens a numbered bus and hands back a [`BusHandle`] that
//! performs the raw and SMBus-style primitives. The rest of the crate only
//! talks to these traits, so the same queue runs against Linux i2c-dev or
//! the in-memory simulator.
//!
//! Transport failures are plain [`std::io::Error`]s carrying an OS error
//! code. Classification into [`crate::error::BusError`] happens one layer
//! up, in [`crate::channel`].

#[cfg(target_os = "linux")]
pub mod linux;
pub mod sim;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use nix::errno::Errno;
use std::io;

/// Error code a transport reports when nobody answers at an address.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const NO_DEVICE: Errno = Errno::EREMOTEIO;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const NO_DEVICE: Errno = Errno::ENXIO;

bitflags! {
    /// Adapter functionality, as reported by the `I2C_FUNCS` ioctl.
    ///
    /// [`Functionality::iter_names`] yields the name/bitmask mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Functionality: u32 {
        const I2C = 0x0000_0001;
        const TEN_BIT_ADDR = 0x0000_0002;
        const PROTOCOL_MANGLING = 0x0000_0004;
        const SMBUS_PEC = 0x0000_0008;
        const NOSTART = 0x0000_0010;
        const SLAVE = 0x0000_0020;
        const SMBUS_BLOCK_PROC_CALL = 0x0000_8000;
        const SMBUS_QUICK = 0x0001_0000;
        const SMBUS_READ_BYTE = 0x0002_0000;
        const SMBUS_WRITE_BYTE = 0x0004_0000;
        const SMBUS_READ_BYTE_DATA = 0x0008_0000;
        const SMBUS_WRITE_BYTE_DATA = 0x0010_0000;
        const SMBUS_READ_WORD_DATA = 0x0020_0000;
        const SMBUS_WRITE_WORD_DATA = 0x0040_0000;
        const SMBUS_PROC_CALL = 0x0080_0000;
        const SMBUS_READ_BLOCK_DATA = 0x0100_0000;
        const SMBUS_WRITE_BLOCK_DATA = 0x0200_0000;
        const SMBUS_READ_I2C_BLOCK = 0x0400_0000;
        const SMBUS_WRITE_I2C_BLOCK = 0x0800_0000;
        const SMBUS_HOST_NOTIFY = 0x1000_0000;
    }
}

/// Single bit for an SMBus quick write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bit {
    Zero,
    One,
}

impl From<bool> for Bit {
    fn from(value: bool) -> Self {
        if value { Bit::One } else { Bit::Zero }
    }
}

impl From<Bit> for u8 {
    fn from(bit: Bit) -> Self {
        match bit {
            Bit::Zero => 0,
            Bit::One => 1,
        }
    }
}

/// Entry point of a bus driver: opens a numbered bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open bus `channel`, failing with `ENOENT` if it does not exist.
    async fn open(&self, channel: u32) -> io::Result<Box<dyn BusHandle>>;
}

/// An opened bus. Dropping the handle releases the underlying resource.
///
/// Word transfers use register order: the byte at `command` is the high
/// byte and the byte at `command + 1` the low byte.
#[async_trait]
pub trait BusHandle: Send {
    /// Report which primitives the adapter supports.
    async fn functionality(&mut self) -> io::Result<Functionality>;

    /// Probe the address space, returning responding addresses in
    /// ascending order.
    async fn scan(&mut self) -> io::Result<Vec<u8>>;

    /// Plain I2C read of up to `length` bytes.
    async fn read(&mut self, address: u8, length: usize) -> io::Result<Bytes>;

    /// Plain I2C write, returning the number of bytes written.
    async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<usize>;

    async fn read_byte(&mut self, address: u8, command: u8) -> io::Result<u8>;

    async fn read_word(&mut self, address: u8, command: u8) -> io::Result<u16>;

    /// Read up to `length` consecutive registers starting at `command`.
    async fn read_block(&mut self, address: u8, command: u8, length: usize) -> io::Result<Bytes>;

    async fn receive_byte(&mut self, address: u8) -> io::Result<u8>;

    async fn write_byte(&mut self, address: u8, command: u8, value: u8) -> io::Result<()>;

    async fn write_word(&mut self, address: u8, command: u8, value: u16) -> io::Result<()>;

    /// Write consecutive registers starting at `command`, returning the
    /// number of bytes written.
    async fn write_block(&mut self, address: u8, command: u8, data: &[u8]) -> io::Result<usize>;

    async fn send_byte(&mut self, address: u8, value: u8) -> io::Result<()>;

    async fn write_quick(&mut self, address: u8, bit: Bit) -> io::Result<()>;
}

/// Error code carried by a transport error, if any.
pub(crate) fn errno(err: &io::Error) -> Option<Errno> {
    err.raw_os_error().map(Errno::from_raw)
}

/// Whether `err` means no device acknowledged the address.
///
/// Adapters disagree on the code: most report `EREMOTEIO`, some `ENXIO`.
pub(crate) fn is_no_device(err: &io::Error) -> bool {
    matches!(errno(err), Some(code) if code == NO_DEVICE || code == Errno::ENXIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_device_codes() {
        assert!(is_no_device(&io::Error::from(NO_DEVICE)));
        assert!(is_no_device(&io::Error::from(Errno::ENXIO)));
        assert!(!is_no_device(&io::Error::from(Errno::ENOENT)));
        assert!(!is_no_device(&io::Error::other("no code")));
    }

    #[test]
    fn test_functionality_names() {
        let funcs = Functionality::I2C | Functionality::SMBUS_QUICK;
        let names: Vec<_> = funcs.iter_names().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["I2C", "SMBUS_QUICK"]);
        assert_eq!(Functionality::from_bits_truncate(0x0001_0001), funcs);
    }

    #[test]
    fn test_bit_conversion() {
        assert_eq!(u8::from(Bit::from(true)), 1);
        assert_eq!(u8::from(Bit::from(false)), 0);
    }
}
