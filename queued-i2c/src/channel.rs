//! Owner of the single bus connection.
//!
//! [`BusChannel`] holds the handle returned by the transport and performs
//! each primitive against it. It is the one place where transport errors
//! are classified into [`BusError`] variants; nothing is retried and the
//! original error is kept as the source.

use bytes::Bytes;
use nix::errno::Errno;
use std::io;
use std::sync::Arc;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::operation::{Operation, Outcome};
use crate::transport::{self, Bit, BusHandle, Functionality, Transport};

/// One numbered bus and, while open, its transport handle.
///
/// Not safe to share between concurrent callers on its own: the bus has no
/// framing that survives interleaved transactions. Wrap it in a
/// [`crate::queue::TransactionQueue`] to serialize access.
pub struct BusChannel {
    channel: u32,
    transport: Arc<dyn Transport>,
    handle: Option<Box<dyn BusHandle>>,
}

impl BusChannel {
    /// Create a closed channel for bus number `channel`.
    pub fn new(channel: u32, transport: Arc<dyn Transport>) -> Self {
        Self {
            channel,
            transport,
            handle: None,
        }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Acquire the transport handle.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(BusError::AlreadyOpen {
                channel: self.channel,
            });
        }
        let channel = self.channel;
        let handle = self.transport.open(channel).await.map_err(|source| {
            if transport::errno(&source) == Some(Errno::ENOENT) {
                BusError::ChannelNotFound { channel, source }
            } else {
                BusError::ChannelOpen { channel, source }
            }
        })?;
        self.handle = Some(handle);
        debug!(channel, "I2C channel open");
        Ok(())
    }

    /// Release the transport handle.
    ///
    /// Closing a channel that is not open is a caller error and fails with
    /// [`BusError::BusNotOpen`].
    pub async fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                drop(handle);
                debug!(channel = self.channel, "I2C channel closed");
                Ok(())
            }
            None => Err(BusError::BusNotOpen),
        }
    }

    fn handle(&mut self) -> Result<&mut (dyn BusHandle + 'static)> {
        self.handle.as_deref_mut().ok_or(BusError::BusNotOpen)
    }

    pub async fn capabilities(&mut self) -> Result<Functionality> {
        let result = self.handle()?.functionality().await;
        result.map_err(|e| classify("capabilities", None, e))
    }

    pub async fn scan(&mut self) -> Result<Vec<u8>> {
        let result = self.handle()?.scan().await;
        result.map_err(|e| classify("scan", None, e))
    }

    pub async fn read(&mut self, address: u8, length: usize) -> Result<Bytes> {
        let result = self.handle()?.read(address, length).await;
        result.map_err(|e| classify("read", Some(address), e))
    }

    pub async fn write(&mut self, address: u8, data: &[u8]) -> Result<usize> {
        let result = self.handle()?.write(address, data).await;
        result.map_err(|e| classify("write", Some(address), e))
    }

    pub async fn read_byte(&mut self, address: u8, command: u8) -> Result<u8> {
        let result = self.handle()?.read_byte(address, command).await;
        result.map_err(|e| classify("read_byte", Some(address), e))
    }

    /// Read `command` as the high byte and `command + 1` as the low byte.
    pub async fn read_word(&mut self, address: u8, command: u8) -> Result<u16> {
        let result = self.handle()?.read_word(address, command).await;
        result.map_err(|e| classify("read_word", Some(address), e))
    }

    pub async fn read_block(&mut self, address: u8, command: u8, length: usize) -> Result<Bytes> {
        let result = self.handle()?.read_block(address, command, length).await;
        result.map_err(|e| classify("read_block", Some(address), e))
    }

    pub async fn receive_byte(&mut self, address: u8) -> Result<u8> {
        let result = self.handle()?.receive_byte(address).await;
        result.map_err(|e| classify("receive_byte", Some(address), e))
    }

    pub async fn write_byte(&mut self, address: u8, command: u8, value: u8) -> Result<()> {
        let result = self.handle()?.write_byte(address, command, value).await;
        result.map_err(|e| classify("write_byte", Some(address), e))
    }

    /// Write the high byte of `value` to `command` and the low byte to
    /// `command + 1`.
    pub async fn write_word(&mut self, address: u8, command: u8, value: u16) -> Result<()> {
        let result = self.handle()?.write_word(address, command, value).await;
        result.map_err(|e| classify("write_word", Some(address), e))
    }

    pub async fn write_block(&mut self, address: u8, command: u8, data: &[u8]) -> Result<usize> {
        let result = self.handle()?.write_block(address, command, data).await;
        result.map_err(|e| classify("write_block", Some(address), e))
    }

    pub async fn send_byte(&mut self, address: u8, value: u8) -> Result<()> {
        let result = self.handle()?.send_byte(address, value).await;
        result.map_err(|e| classify("send_byte", Some(address), e))
    }

    pub async fn write_quick(&mut self, address: u8, bit: Bit) -> Result<()> {
        let result = self.handle()?.write_quick(address, bit).await;
        result.map_err(|e| classify("write_quick", Some(address), e))
    }

    /// Execute `operation` with the matching primitive.
    pub async fn invoke(&mut self, operation: Operation) -> Result<Outcome> {
        Ok(match operation {
            Operation::Open => {
                self.open().await?;
                Outcome::Done
            }
            Operation::Close => {
                self.close().await?;
                Outcome::Done
            }
            Operation::Capabilities => Outcome::Capabilities(self.capabilities().await?),
            Operation::Scan => Outcome::Addresses(self.scan().await?),
            Operation::Read { address, length } => {
                Outcome::Bytes(self.read(address, length).await?)
            }
            Operation::Write { address, data } => Outcome::Count(self.write(address, &data).await?),
            Operation::ReadByte { address, command } => {
                Outcome::Byte(self.read_byte(address, command).await?)
            }
            Operation::ReadWord { address, command } => {
                Outcome::Word(self.read_word(address, command).await?)
            }
            Operation::ReadBlock {
                address,
                command,
                length,
            } => Outcome::Bytes(self.read_block(address, command, length).await?),
            Operation::ReceiveByte { address } => Outcome::Byte(self.receive_byte(address).await?),
            Operation::WriteByte {
                address,
                command,
                value,
            } => {
                self.write_byte(address, command, value).await?;
                Outcome::Done
            }
            Operation::WriteWord {
                address,
                command,
                value,
            } => {
                self.write_word(address, command, value).await?;
                Outcome::Done
            }
            Operation::WriteBlock {
                address,
                command,
                data,
            } => Outcome::Count(self.write_block(address, command, &data).await?),
            Operation::SendByte { address, value } => {
                self.send_byte(address, value).await?;
                Outcome::Done
            }
            Operation::WriteQuick { address, bit } => {
                self.write_quick(address, bit).await?;
                Outcome::Done
            }
        })
    }
}

/// Map a transport error to a [`BusError`].
fn classify(operation: &'static str, address: Option<u8>, source: io::Error) -> BusError {
    match address {
        Some(address) if transport::is_no_device(&source) => {
            BusError::RemoteDevice { address, source }
        }
        _ => BusError::Transport { operation, source },
    }
}
