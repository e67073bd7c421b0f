//! Error types for bus operations.
//!
//! Every failure the transport reports is wrapped into a [`BusError`] whose
//! variant tells the caller what went wrong: a missing bus, a bus that is not
//! open, an address nobody answered, or some other transport failure. The
//! original transport error is kept as the source.

use std::io;
use thiserror::Error;

/// Classified failure of a bus operation.
#[derive(Error, Debug)]
pub enum BusError {
    /// The channel number has no backing bus interface.
    #[error("I2C channel {channel} not found")]
    ChannelNotFound {
        channel: u32,
        #[source]
        source: io::Error,
    },

    /// The bus interface exists but could not be opened.
    #[error("failed to open I2C channel {channel}")]
    ChannelOpen {
        channel: u32,
        #[source]
        source: io::Error,
    },

    /// `open()` was called on a channel that already holds a handle.
    #[error("I2C channel {channel} is already open")]
    AlreadyOpen { channel: u32 },

    /// An operation reached the bus before `open()` succeeded, or after
    /// `close()`.
    #[error("bus is not open")]
    BusNotOpen,

    /// No device answered at the target address.
    #[error("no response from device at address 0x{address:02x}")]
    RemoteDevice {
        address: u8,
        #[source]
        source: io::Error,
    },

    /// Any other transport failure.
    #[error("{operation} failed")]
    Transport {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The queue worker has stopped and can no longer accept operations.
    #[error("transaction queue is closed")]
    QueueClosed,

    /// The channel answered an operation with the wrong kind of outcome.
    ///
    /// Each operation has exactly one outcome kind, so this only appears if
    /// the queue and the channel disagree about that mapping: a bug in this
    /// crate, never a bus condition.
    #[error("{operation} returned unexpected outcome {outcome}")]
    UnexpectedOutcome {
        operation: &'static str,
        outcome: &'static str,
    },
}

/// Convenience type alias for Results using [`BusError`].
pub type Result<T> = std::result::Result<T, BusError>;
