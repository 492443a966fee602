//! Asynchronous block I/O.
//!
//! A small set of worker threads pulls [`IoJob`]s off a `kanal` queue and
//! completes each through its callback. Two ways to wait sit on top:
//!
//! - single-entry persist/read: submit, then block on a one-shot reply with
//!   the single-I/O bound;
//! - bulk transfers: each transfer bumps an [`InFlight`] counter that the
//!   caller drains with the bulk bound. Any failure fails the whole batch.

use super::lun::{BLOCK_PAYLOAD, BlockDevice, TransferBuffer};
use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Completion callback; reads get their payload, writes an empty vector.
pub type IoCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// One block operation.
pub enum IoOp {
    /// Read `count` blocks.
    Read {
        /// First block.
        lba: u64,
        /// Blocks.
        count: usize,
    },
    /// Write a payload as whole blocks.
    Write {
        /// First block.
        lba: u64,
        /// Payload.
        data: TransferBuffer,
    },
}

/// A queued operation against one device.
pub struct IoJob {
    device: Arc<dyn BlockDevice>,
    op: IoOp,
    done: IoCallback,
}

impl IoJob {
    /// Job completing through `done`.
    pub fn new(device: Arc<dyn BlockDevice>, op: IoOp, done: IoCallback) -> Self {
        Self { device, op, done }
    }

    /// Run the job, splitting it into transactions of at most `max_blocks`.
    fn run(self, max_blocks: usize) {
        let max_blocks = max_blocks.max(1);
        let result = match self.op {
            IoOp::Read { lba, count } => {
                let mut payload = Vec::with_capacity(count * BLOCK_PAYLOAD);
                let mut done = 0usize;
                let mut outcome = Ok(());
                while done < count {
                    let n = (count - done).min(max_blocks);
                    match self.device.read_blocks(lba + done as u64, n) {
                        Ok(chunk) => payload.extend_from_slice(&chunk),
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                    done += n;
                }
                outcome.map(|()| payload)
            }
            IoOp::Write { lba, data } => {
                let step = max_blocks * BLOCK_PAYLOAD;
                let mut outcome = Ok(());
                for (i, chunk) in data.chunks(step).enumerate() {
                    if let Err(e) = self
                        .device
                        .write_blocks(lba + (i * max_blocks) as u64, chunk)
                    {
                        outcome = Err(e);
                        break;
                    }
                }
                outcome.map(|()| Vec::new())
            }
        };
        (self.done)(result);
    }
}

// ============================================================================
// In-flight counter
// ============================================================================

#[derive(Default)]
struct InFlightState {
    pending: usize,
    failure: Option<Error>,
}

/// Count of outstanding bulk transfers.
#[derive(Default)]
pub struct InFlight {
    state: Mutex<InFlightState>,
    drained: Condvar,
}

impl InFlight {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more transfer.
    pub fn begin(&self) {
        self.state.lock().pending += 1;
    }

    /// Retire one transfer. The first failure is kept.
    pub fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        if let Err(e) = result {
            state.failure.get_or_insert(e);
        }
        if state.pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Transfers still outstanding.
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Wait until every transfer retired.
    ///
    /// # Errors
    ///
    /// The first transfer failure, or `Timeout` if the counter does not
    /// reach zero within `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pending > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() && state.pending > 0 {
                return Err(Error::Timeout(timeout));
            }
        }
        match state.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("pending", &self.pending())
            .finish()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Worker pool executing block I/O.
pub struct IoEngine {
    tx: kanal::Sender<IoJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_blocks: usize,
    single_timeout: Duration,
    bulk_timeout: Duration,
}

impl IoEngine {
    /// Spawn `config.io_workers` workers.
    pub fn start(config: &PersistenceConfig) -> Result<Self> {
        let (tx, rx) = kanal::unbounded::<IoJob>();
        let max_blocks = config.max_blocks_per_transaction;
        let mut workers = Vec::with_capacity(config.io_workers.max(1));
        for i in 0..config.io_workers.max(1) {
            let rx = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("clustermem-io-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job.run(max_blocks);
                    }
                })?;
            workers.push(worker);
        }
        tracing::debug!(workers = workers.len(), max_blocks, "I/O engine started");
        Ok(Self {
            tx,
            workers: Mutex::new(workers),
            max_blocks,
            single_timeout: config.single_io_timeout,
            bulk_timeout: config.bulk_timeout,
        })
    }

    /// Largest single transaction, in blocks.
    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Bound used by [`BulkTransfer::wait`].
    #[inline]
    pub fn bulk_timeout(&self) -> Duration {
        self.bulk_timeout
    }

    /// Queue a job.
    pub fn submit(&self, job: IoJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| Error::ChannelClosed("I/O queue"))
    }

    /// Read blocks and wait for the payload.
    pub fn read(&self, device: &Arc<dyn BlockDevice>, lba: u64, count: usize) -> Result<Vec<u8>> {
        self.single(device, IoOp::Read { lba, count })
    }

    /// Write blocks and wait for completion.
    pub fn write(&self, device: &Arc<dyn BlockDevice>, lba: u64, data: Vec<u8>) -> Result<()> {
        self.single(
            device,
            IoOp::Write {
                lba,
                data: TransferBuffer::detached(data),
            },
        )
        .map(|_| ())
    }

    fn single(&self, device: &Arc<dyn BlockDevice>, op: IoOp) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = kanal::bounded(1);
        self.submit(IoJob::new(
            Arc::clone(device),
            op,
            Box::new(move |result| {
                let _ = reply_tx.send(result);
            }),
        ))?;
        match reply_rx.recv_timeout(self.single_timeout) {
            Ok(result) => result,
            Err(kanal::ReceiveErrorTimeout::Timeout) => {
                tracing::warn!(timeout = ?self.single_timeout, "single-entry I/O timed out");
                Err(Error::Timeout(self.single_timeout))
            }
            Err(_) => Err(Error::ChannelClosed("I/O reply")),
        }
    }

    /// Start a bulk batch.
    pub fn bulk(&self) -> BulkTransfer<'_> {
        BulkTransfer {
            engine: self,
            inflight: Arc::new(InFlight::new()),
        }
    }

    /// Close the queue and join the workers. Jobs still queued are dropped
    /// and their waiters see `ChannelClosed`. Idempotent.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let _ = self.tx.close();
        for w in workers {
            if w.join().is_err() {
                tracing::error!("I/O worker panicked");
            }
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEngine")
            .field("max_blocks", &self.max_blocks)
            .field("single_timeout", &self.single_timeout)
            .field("bulk_timeout", &self.bulk_timeout)
            .finish()
    }
}

/// A batch of transfers drained together.
pub struct BulkTransfer<'a> {
    engine: &'a IoEngine,
    inflight: Arc<InFlight>,
}

impl BulkTransfer<'_> {
    /// Queue a write.
    pub fn write(&self, device: &Arc<dyn BlockDevice>, lba: u64, data: TransferBuffer) -> Result<()> {
        let inflight = Arc::clone(&self.inflight);
        self.enqueue(device, IoOp::Write { lba, data }, move |result| {
            inflight.complete(result.map(|_| ()));
        })
    }

    /// Queue a read; `on_data` receives the payload if it succeeds.
    pub fn read(
        &self,
        device: &Arc<dyn BlockDevice>,
        lba: u64,
        count: usize,
        on_data: impl FnOnce(Vec<u8>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let inflight = Arc::clone(&self.inflight);
        self.enqueue(device, IoOp::Read { lba, count }, move |result| {
            inflight.complete(result.and_then(on_data));
        })
    }

    fn enqueue(
        &self,
        device: &Arc<dyn BlockDevice>,
        op: IoOp,
        done: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) -> Result<()> {
        self.inflight.begin();
        let submitted = self
            .engine
            .submit(IoJob::new(Arc::clone(device), op, Box::new(done)));
        if let Err(e) = submitted {
            self.inflight.complete(Ok(()));
            return Err(e);
        }
        Ok(())
    }

    /// Transfers not yet retired.
    pub fn pending(&self) -> usize {
        self.inflight.pending()
    }

    /// Wait for every transfer with the engine's bulk bound.
    pub fn wait(self) -> Result<()> {
        self.inflight.wait(self.engine.bulk_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::lun::MemoryLun;

    fn engine(single_ms: u64, bulk_ms: u64) -> IoEngine {
        IoEngine::start(&PersistenceConfig {
            io_workers: 2,
            max_blocks_per_transaction: 4,
            single_io_timeout: Duration::from_millis(single_ms),
            bulk_timeout: Duration::from_millis(bulk_ms),
            ..PersistenceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_single_round_trip_split_into_transactions() {
        let io = engine(1000, 1000);
        let lun: Arc<dyn BlockDevice> = Arc::new(MemoryLun::new(32));
        let data: Vec<u8> = (0..10 * 512).map(|i| (i % 199) as u8).collect();
        io.write(&lun, 3, data.clone()).unwrap();
        assert_eq!(io.read(&lun, 3, 10).unwrap(), data);
    }

    #[test]
    fn test_single_timeout() {
        let io = engine(20, 1000);
        let mem = Arc::new(MemoryLun::new(4));
        mem.set_stall(Some(Duration::from_millis(200)));
        let lun: Arc<dyn BlockDevice> = mem;
        let err = io.read(&lun, 0, 1).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_bulk_failure_fails_batch() {
        let io = engine(1000, 1000);
        let mem = Arc::new(MemoryLun::new(16));
        mem.fail_next_write();
        let lun: Arc<dyn BlockDevice> = mem;
        let bulk = io.bulk();
        for i in 0..4u64 {
            bulk.write(&lun, i * 2, TransferBuffer::detached(vec![1u8; 1024]))
                .unwrap();
        }
        assert!(matches!(bulk.wait(), Err(Error::Io(_))));
    }

    #[test]
    fn test_bulk_read_collects() {
        let io = engine(1000, 1000);
        let lun: Arc<dyn BlockDevice> = Arc::new(MemoryLun::new(8));
        lun.write_blocks(0, &[9u8; 8 * 512]).unwrap();
        let seen = Arc::new(Mutex::new(0usize));
        let bulk = io.bulk();
        for i in 0..4u64 {
            let seen = Arc::clone(&seen);
            bulk.read(&lun, i * 2, 2, move |data| {
                assert!(data.iter().all(|b| *b == 9));
                *seen.lock() += data.len();
                Ok(())
            })
            .unwrap();
        }
        bulk.wait().unwrap();
        assert_eq!(*seen.lock(), 8 * 512);
    }

    #[test]
    fn test_bulk_timeout() {
        let io = engine(1000, 20);
        let mem = Arc::new(MemoryLun::new(4));
        mem.set_stall(Some(Duration::from_millis(300)));
        let lun: Arc<dyn BlockDevice> = mem;
        let bulk = io.bulk();
        bulk.write(&lun, 0, TransferBuffer::detached(vec![0u8; 512]))
            .unwrap();
        assert!(bulk.wait().unwrap_err().is_timeout());
    }
}
