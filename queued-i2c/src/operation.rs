//! Operations that can be submitted to the transaction queue.
//!
//! Each [`Operation`] variant maps to exactly one bus primitive, and each
//! successful execution yields one [`Outcome`].

use bytes::Bytes;

use crate::transport::{Bit, Functionality};

/// A single bus transaction request.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Acquire the bus handle.
    Open,
    /// Release the bus handle.
    Close,
    /// Query adapter functionality.
    Capabilities,
    /// Probe for responding addresses.
    Scan,
    /// Plain I2C read.
    Read { address: u8, length: usize },
    /// Plain I2C write.
    Write { address: u8, data: Bytes },
    ReadByte { address: u8, command: u8 },
    ReadWord { address: u8, command: u8 },
    ReadBlock { address: u8, command: u8, length: usize },
    ReceiveByte { address: u8 },
    WriteByte { address: u8, command: u8, value: u8 },
    WriteWord { address: u8, command: u8, value: u16 },
    WriteBlock { address: u8, command: u8, data: Bytes },
    SendByte { address: u8, value: u8 },
    WriteQuick { address: u8, bit: Bit },
}

impl Operation {
    /// Name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Target device address, for operations that have one.
    pub fn address(&self) -> Option<u8> {
        match self {
            Operation::Open | Operation::Close | Operation::Capabilities | Operation::Scan => None,
            Operation::Read { address, .. }
            | Operation::Write { address, .. }
            | Operation::ReadByte { address, .. }
            | Operation::ReadWord { address, .. }
            | Operation::ReadBlock { address, .. }
            | Operation::ReceiveByte { address }
            | Operation::WriteByte { address, .. }
            | Operation::WriteWord { address, .. }
            | Operation::WriteBlock { address, .. }
            | Operation::SendByte { address, .. }
            | Operation::WriteQuick { address, .. } => Some(*address),
        }
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Outcome {
    /// The operation produces no value.
    Done,
    Capabilities(Functionality),
    /// Responding addresses, ascending.
    Addresses(Vec<u8>),
    Byte(u8),
    Word(u16),
    /// Bytes read.
    Bytes(Bytes),
    /// Number of bytes written.
    Count(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Scan.name(), "scan");
        assert_eq!(
            Operation::ReadWord { address: 0x0f, command: 0 }.name(),
            "read_word"
        );
        assert_eq!(
            Operation::WriteQuick { address: 0x0f, bit: Bit::One }.name(),
            "write_quick"
        );
    }

    #[test]
    fn test_operation_address() {
        assert_eq!(Operation::Open.address(), None);
        assert_eq!(Operation::ReceiveByte { address: 0x48 }.address(), Some(0x48));
        assert_eq!(
            Operation::Write { address: 0x50, data: Bytes::from_static(&[1, 2]) }.address(),
            Some(0x50)
        );
    }
}
