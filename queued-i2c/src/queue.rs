//! Serialized access to a [`BusChannel`].
//!
//! The queue owns the channel and moves it into a worker task. Callers send
//! [`Operation`]s over a bounded channel together with a oneshot reply; the
//! worker takes one request, runs it to completion, replies, and only then
//! takes the next. This gives the two guarantees the bus needs:
//!
//! - at most one transaction on the wire at any time, and
//! - transactions execute in the order they were submitted.
//!
//! A failing operation is reported to its submitter and has no effect on the
//! requests queued behind it. Nothing is retried.
//!
//! There is no cancellation and no timeout. Once submitted, an operation runs
//! even if its submitter stops waiting; a transport call that never returns
//! stalls every request behind it.

use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channel::BusChannel;
use crate::config::QueueConfig;
use crate::error::{BusError, Result};
use crate::operation::{Operation, Outcome};
use crate::transport::{Bit, Functionality};

/// A request waiting for the worker.
struct Request {
    operation: Operation,
    reply: oneshot::Sender<Result<Outcome>>,
}

/// Handle for submitting operations to one bus.
///
/// Cheap to clone; every clone feeds the same worker. The worker, and with
/// it the channel and its handle, is dropped once the last clone is gone.
#[derive(Clone)]
pub struct TransactionQueue {
    tx: mpsc::Sender<Request>,
}

impl TransactionQueue {
    /// Start a worker for `channel` with the default queue depth.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(channel: BusChannel) -> Self {
        Self::spawn_with(channel, &QueueConfig::default())
    }

    /// Start a worker for `channel`.
    pub fn spawn_with(channel: BusChannel, config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.depth.max(1));
        let worker = Worker { channel, rx };
        tokio::spawn(worker.run());
        Self { tx }
    }

    /// Queue `operation` and wait for its outcome.
    pub async fn submit(&self, operation: Operation) -> Result<Outcome> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request { operation, reply })
            .await
            .map_err(|_| BusError::QueueClosed)?;
        response.await.map_err(|_| BusError::QueueClosed)?
    }

    async fn request<T>(
        &self,
        operation: Operation,
        extract: fn(Outcome) -> Option<T>,
    ) -> Result<T> {
        let name = operation.name();
        let outcome = self.submit(operation).await?;
        let kind: &'static str = (&outcome).into();
        extract(outcome).ok_or(BusError::UnexpectedOutcome {
            operation: name,
            outcome: kind,
        })
    }

    async fn request_done(&self, operation: Operation) -> Result<()> {
        self.request(operation, |outcome| match outcome {
            Outcome::Done => Some(()),
            _ => None,
        })
        .await
    }

    async fn request_byte(&self, operation: Operation) -> Result<u8> {
        self.request(operation, |outcome| match outcome {
            Outcome::Byte(value) => Some(value),
            _ => None,
        })
        .await
    }

    async fn request_bytes(&self, operation: Operation) -> Result<Bytes> {
        self.request(operation, |outcome| match outcome {
            Outcome::Bytes(data) => Some(data),
            _ => None,
        })
        .await
    }

    async fn request_count(&self, operation: Operation) -> Result<usize> {
        self.request(operation, |outcome| match outcome {
            Outcome::Count(n) => Some(n),
            _ => None,
        })
        .await
    }

    /// Open the bus. Queued like any other operation, so it never overlaps
    /// a transaction.
    pub async fn open(&self) -> Result<()> {
        self.request_done(Operation::Open).await
    }

    /// Close the bus. Later operations fail with [`BusError::BusNotOpen`]
    /// until it is opened again.
    pub async fn close(&self) -> Result<()> {
        self.request_done(Operation::Close).await
    }

    pub async fn capabilities(&self) -> Result<Functionality> {
        self.request(Operation::Capabilities, |outcome| match outcome {
            Outcome::Capabilities(funcs) => Some(funcs),
            _ => None,
        })
        .await
    }

    pub async fn scan(&self) -> Result<Vec<u8>> {
        self.request(Operation::Scan, |outcome| match outcome {
            Outcome::Addresses(addresses) => Some(addresses),
            _ => None,
        })
        .await
    }

    pub async fn read(&self, address: u8, length: usize) -> Result<Bytes> {
        self.request_bytes(Operation::Read { address, length }).await
    }

    pub async fn write(&self, address: u8, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        self.request_count(Operation::Write { address, data }).await
    }

    pub async fn read_byte(&self, address: u8, command: u8) -> Result<u8> {
        self.request_byte(Operation::ReadByte { address, command }).await
    }

    pub async fn read_word(&self, address: u8, command: u8) -> Result<u16> {
        self.request(Operation::ReadWord { address, command }, |outcome| match outcome {
            Outcome::Word(value) => Some(value),
            _ => None,
        })
        .await
    }

    pub async fn read_block(&self, address: u8, command: u8, length: usize) -> Result<Bytes> {
        self.request_bytes(Operation::ReadBlock {
            address,
            command,
            length,
        })
        .await
    }

    pub async fn receive_byte(&self, address: u8) -> Result<u8> {
        self.request_byte(Operation::ReceiveByte { address }).await
    }

    pub async fn write_byte(&self, address: u8, command: u8, value: u8) -> Result<()> {
        self.request_done(Operation::WriteByte {
            address,
            command,
            value,
        })
        .await
    }

    pub async fn write_word(&self, address: u8, command: u8, value: u16) -> Result<()> {
        self.request_done(Operation::WriteWord {
            address,
            command,
            value,
        })
        .await
    }

    pub async fn write_block(
        &self,
        address: u8,
        command: u8,
        data: impl Into<Bytes>,
    ) -> Result<usize> {
        let data = data.into();
        self.request_count(Operation::WriteBlock {
            address,
            command,
            data,
        })
        .await
    }

    pub async fn send_byte(&self, address: u8, value: u8) -> Result<()> {
        self.request_done(Operation::SendByte { address, value }).await
    }

    pub async fn write_quick(&self, address: u8, bit: Bit) -> Result<()> {
        self.request_done(Operation::WriteQuick { address, bit }).await
    }
}

/// The single execution slot.
struct Worker {
    channel: BusChannel,
    rx: mpsc::Receiver<Request>,
}

impl Worker {
    async fn run(mut self) {
        trace!(channel = self.channel.channel(), "Queue worker started.");

        while let Some(Request { operation, reply }) = self.rx.recv().await {
            let result = self.execute(operation).await;
            // Submitter may have stopped waiting
            let _ = reply.send(result);
        }

        debug!(channel = self.channel.channel(), "Queue worker stopped.");
    }

    async fn execute(&mut self, operation: Operation) -> Result<Outcome> {
        if !matches!(operation, Operation::Open) && !self.channel.is_open() {
            return Err(BusError::BusNotOpen);
        }

        let name = operation.name();
        trace!(
            operation = name,
            address = ?operation.address(),
            "Executing"
        );
        // A panicking transport fails its own operation, not the worker.
        let result = AssertUnwindSafe(self.channel.invoke(operation))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(BusError::Transport {
                    operation: name,
                    source: io::Error::other(panic_message(&*panic)),
                })
            });
        trace!(operation = name, ok = result.is_ok(), "Completed");
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("transport panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("transport panicked: {message}")
    } else {
        "transport panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimBus, Transaction};
    use crate::transport::{BusHandle, Transport};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Delegates to a simulated bus, but the first open panics.
    struct PanicOnFirstOpen {
        bus: SimBus,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl Transport for PanicOnFirstOpen {
        async fn open(&self, channel: u32) -> io::Result<Box<dyn BusHandle>> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("driver bug");
            }
            self.bus.open(channel).await
        }
    }

    fn two_device_bus() -> SimBus {
        SimBus::new(1)
            .with_device(0x0f, (0..=255u8).rev().collect::<Vec<_>>())
            .with_device(0xf0, (0..=255u8).collect::<Vec<_>>())
    }

    fn queue_for(bus: &SimBus) -> TransactionQueue {
        TransactionQueue::spawn(BusChannel::new(bus.channel(), Arc::new(bus.clone())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submissions_run_one_at_a_time_in_order() {
        let bus = two_device_bus().with_latency(Duration::from_millis(5));
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let reads = (0..32u8).map(|command| queue.read_byte(0xf0, command));
        let values = join_all(reads).await;

        for (command, value) in values.into_iter().enumerate() {
            assert_eq!(value.unwrap(), command as u8);
        }
        assert_eq!(bus.max_in_flight(), 1);

        let transactions = bus.transactions();
        assert_eq!(transactions.len(), 32);
        assert!(transactions.iter().all(|t| *t
            == Transaction {
                operation: "read_byte",
                address: Some(0xf0),
            }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_operations_keep_submission_order() {
        let bus = two_device_bus().with_latency(Duration::from_millis(1));
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let (a, b, c, d) = tokio::join!(
            queue.write_byte(0x0f, 0x10, 0xaa),
            queue.read_byte(0x0f, 0x10),
            queue.scan(),
            queue.read_word(0xf0, 0x00),
        );
        a.unwrap();
        // The read was submitted after the write, so it sees the new value
        assert_eq!(b.unwrap(), 0xaa);
        assert_eq!(c.unwrap(), vec![0x0f, 0xf0]);
        assert_eq!(d.unwrap(), 0x0001);

        let order: Vec<_> = bus.transactions().iter().map(|t| t.operation).collect();
        assert_eq!(order, vec!["write_byte", "read_byte", "scan", "read_word"]);
        assert_eq!(bus.max_in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_spawned_callers_never_overlap() {
        let bus = two_device_bus().with_latency(Duration::from_millis(1));
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for command in 0..4u8 {
                        let register = i * 4 + command;
                        queue.write_byte(0xf0, register, 0xff - register).await.unwrap();
                        assert_eq!(queue.read_byte(0xf0, register).await.unwrap(), 0xff - register);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(bus.max_in_flight(), 1);
        assert_eq!(bus.transactions().len(), 64);
    }

    #[tokio::test]
    async fn test_operations_before_open_fail_without_blocking() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);

        let (scan, read, open, after) = tokio::join!(
            queue.scan(),
            queue.read_byte(0x0f, 0x00),
            queue.open(),
            queue.read_byte(0x0f, 0x00),
        );
        assert!(matches!(scan, Err(BusError::BusNotOpen)));
        assert!(matches!(read, Err(BusError::BusNotOpen)));
        open.unwrap();
        assert_eq!(after.unwrap(), 255);

        // Rejected operations never reached the bus
        assert_eq!(bus.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_until_reopened() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();
        queue.close().await.unwrap();

        assert!(matches!(queue.close().await, Err(BusError::BusNotOpen)));
        assert!(matches!(queue.receive_byte(0xf0).await, Err(BusError::BusNotOpen)));

        queue.open().await.unwrap();
        assert_eq!(queue.receive_byte(0xf0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_device_failure_does_not_stall_queue() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let (missing, present) = tokio::join!(queue.read(0x00, 5), queue.read(0x0f, 5));
        assert!(matches!(missing, Err(BusError::RemoteDevice { address: 0x00, .. })));
        assert_eq!(&present.unwrap()[..], &[255, 254, 253, 252, 251]);
    }

    #[tokio::test]
    async fn test_oversized_block_read_does_not_stop_worker() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let data = queue.read_block(0x0f, 1, usize::MAX).await.unwrap();
        assert_eq!(data.len(), 255);
        assert_eq!(queue.read_byte(0x0f, 0).await.unwrap(), 255);
    }

    #[tokio::test]
    async fn test_transport_panic_fails_only_its_operation() {
        let transport = PanicOnFirstOpen {
            bus: two_device_bus(),
            panicked: AtomicBool::new(false),
        };
        let queue = TransactionQueue::spawn(BusChannel::new(1, Arc::new(transport)));

        let (first, second, read) =
            tokio::join!(queue.open(), queue.open(), queue.read_byte(0xf0, 0x07));
        match first {
            Err(BusError::Transport { operation, source }) => {
                assert_eq!(operation, "open");
                assert!(source.to_string().contains("driver bug"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        second.unwrap();
        assert_eq!(read.unwrap(), 0x07);
    }

    #[tokio::test]
    async fn test_open_missing_channel() {
        let bus = SimBus::new(1);
        let queue = TransactionQueue::spawn(BusChannel::new(99, Arc::new(bus)));
        assert!(matches!(
            queue.open().await,
            Err(BusError::ChannelNotFound { channel: 99, .. })
        ));
        assert!(matches!(queue.scan().await, Err(BusError::BusNotOpen)));
    }

    #[tokio::test]
    async fn test_submit_generic_operation() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.submit(Operation::Open).await.unwrap();

        let outcome = queue
            .submit(Operation::WriteBlock {
                address: 0xf0,
                command: 0x30,
                data: Bytes::from_static(&[9, 8, 7]),
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Count(3));
        assert_eq!(
            queue
                .submit(Operation::ReadBlock {
                    address: 0xf0,
                    command: 0x30,
                    length: 3,
                })
                .await
                .unwrap(),
            Outcome::Bytes(Bytes::from_static(&[9, 8, 7]))
        );
    }

    #[tokio::test]
    async fn test_dropped_submitter_still_executes() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        // Poll the write far enough to enqueue it, then drop the future.
        let write = queue.write_byte(0x0f, 0x00, 0x42);
        tokio::pin!(write);
        assert!(futures::poll!(write.as_mut()).is_pending());
        drop(write);

        assert_eq!(queue.read_byte(0x0f, 0x00).await.unwrap(), 0x42);
    }

    #[tokio::test]
    async fn test_mismatched_outcome_is_reported() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();

        let err = queue
            .request(Operation::Scan, |outcome| match outcome {
                Outcome::Byte(value) => Some(value),
                _ => None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::UnexpectedOutcome {
                operation: "scan",
                outcome: "Addresses",
            }
        ));
    }

    #[tokio::test]
    async fn test_capabilities_through_queue() {
        let bus = two_device_bus();
        let queue = queue_for(&bus);
        queue.open().await.unwrap();
        let funcs = queue.capabilities().await.unwrap();
        assert!(funcs.contains(Functionality::I2C | Functionality::SMBUS_QUICK));
    }
}
