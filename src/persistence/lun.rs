//! Back-end block devices.
//!
//! Every LUN is addressed in 520-byte back-end blocks: 512 bytes of payload
//! followed by an 8-byte trailer whose first two bytes hold the block
//! checksum. Writes append the checksum; reads verify it. A block that was
//! never written (all zero, trailer included) reads back as zeros.
//!
//! # Example
//!
//! ```rust,ignore
//! use clustermem::persistence::{BlockDevice, MemoryLun};
//!
//! let lun = MemoryLun::new(16);
//! lun.write_blocks(2, &[0xAB; 512])?;
//! assert_eq!(lun.read_blocks(2, 1)?, vec![0xAB; 512]);
//! ```

use super::checksum::block_checksum;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Payload bytes per block.
pub const BLOCK_PAYLOAD: usize = 512;

/// Trailer bytes per block.
pub const BLOCK_TRAILER: usize = 8;

/// Bytes per back-end block.
pub const BACKEND_BLOCK: usize = BLOCK_PAYLOAD + BLOCK_TRAILER;

/// Raw block storage.
///
/// Implementors move whole back-end blocks; checksum handling lives in the
/// provided `read_blocks`/`write_blocks`.
pub trait BlockDevice: Send + Sync {
    /// Capacity in back-end blocks.
    fn block_count(&self) -> u64;

    /// Read `out.len() / BACKEND_BLOCK` raw blocks starting at `lba`.
    fn read_raw(&self, lba: u64, out: &mut [u8]) -> Result<()>;

    /// Write raw blocks starting at `lba`.
    fn write_raw(&self, lba: u64, data: &[u8]) -> Result<()>;

    /// Make earlier writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Read `count` blocks and return their payload, verifying checksums.
    fn read_blocks(&self, lba: u64, count: usize) -> Result<Vec<u8>> {
        check_range(self.block_count(), lba, count)?;
        let mut raw = vec![0u8; count * BACKEND_BLOCK];
        self.read_raw(lba, &mut raw)?;

        let mut payload = Vec::with_capacity(count * BLOCK_PAYLOAD);
        for (i, block) in raw.chunks_exact(BACKEND_BLOCK).enumerate() {
            let (data, trailer) = block.split_at(BLOCK_PAYLOAD);
            let stored = u16::from_le_bytes([trailer[0], trailer[1]]);
            let never_written = stored == 0 && block.iter().all(|b| *b == 0);
            if !never_written && stored != block_checksum(data) {
                return Err(Error::ChecksumMismatch { lba: lba + i as u64 });
            }
            payload.extend_from_slice(data);
        }
        Ok(payload)
    }

    /// Write `payload` as whole blocks starting at `lba`; a short last block
    /// is zero-padded.
    fn write_blocks(&self, lba: u64, payload: &[u8]) -> Result<()> {
        let count = payload.len().div_ceil(BLOCK_PAYLOAD);
        check_range(self.block_count(), lba, count)?;
        let mut raw = vec![0u8; count * BACKEND_BLOCK];
        for (chunk, block) in payload
            .chunks(BLOCK_PAYLOAD)
            .zip(raw.chunks_exact_mut(BACKEND_BLOCK))
        {
            block[..chunk.len()].copy_from_slice(chunk);
            let sum = block_checksum(&block[..BLOCK_PAYLOAD]);
            block[BLOCK_PAYLOAD..BLOCK_PAYLOAD + 2].copy_from_slice(&sum.to_le_bytes());
        }
        self.write_raw(lba, &raw)
    }
}

fn check_range(capacity: u64, lba: u64, count: usize) -> Result<()> {
    if count == 0 || lba + count as u64 > capacity {
        return Err(Error::InvalidArgument(format!(
            "blocks {lba}+{count} outside lun of {capacity}"
        )));
    }
    Ok(())
}

// ============================================================================
// MemoryLun
// ============================================================================

/// In-memory LUN with fault injection.
pub struct MemoryLun {
    blocks: u64,
    data: Mutex<Vec<u8>>,
    fail_next_write: AtomicBool,
    fail_next_read: AtomicBool,
    stall: Mutex<Option<Duration>>,
}

impl MemoryLun {
    /// Zeroed LUN of `blocks` back-end blocks.
    pub fn new(blocks: u64) -> Self {
        Self {
            blocks,
            data: Mutex::new(vec![0u8; blocks as usize * BACKEND_BLOCK]),
            fail_next_write: AtomicBool::new(false),
            fail_next_read: AtomicBool::new(false),
            stall: Mutex::new(None),
        }
    }

    /// Fail the next write with an I/O error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Fail the next read with an I/O error.
    pub fn fail_next_read(&self) {
        self.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Delay every I/O by `delay`, or stop delaying with `None`.
    pub fn set_stall(&self, delay: Option<Duration>) {
        *self.stall.lock() = delay;
    }

    /// Flip one payload byte of a block without fixing its checksum.
    pub fn corrupt(&self, lba: u64) {
        let mut data = self.data.lock();
        let at = lba as usize * BACKEND_BLOCK;
        if let Some(byte) = data.get_mut(at) {
            *byte ^= 0xFF;
        }
    }

    fn stall(&self) {
        let delay = *self.stall.lock();
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
    }
}

impl BlockDevice for MemoryLun {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_raw(&self, lba: u64, out: &mut [u8]) -> Result<()> {
        self.stall();
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::other("injected read failure").into());
        }
        let start = lba as usize * BACKEND_BLOCK;
        let data = self.data.lock();
        let src = data
            .get(start..start + out.len())
            .ok_or_else(|| Error::InvalidArgument(format!("read past end at lba {lba}")))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn write_raw(&self, lba: u64, raw: &[u8]) -> Result<()> {
        self.stall();
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::other("injected write failure").into());
        }
        let start = lba as usize * BACKEND_BLOCK;
        let mut data = self.data.lock();
        let dst = data
            .get_mut(start..start + raw.len())
            .ok_or_else(|| Error::InvalidArgument(format!("write past end at lba {lba}")))?;
        dst.copy_from_slice(raw);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLun")
            .field("blocks", &self.blocks)
            .finish()
    }
}

// ============================================================================
// FileLun
// ============================================================================

/// LUN backed by a regular file, using positioned reads and writes.
#[derive(Debug)]
pub struct FileLun {
    file: File,
    blocks: u64,
}

impl FileLun {
    /// Create (or truncate) a file sized for `blocks` back-end blocks.
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(blocks * BACKEND_BLOCK as u64)?;
        Ok(Self { file, blocks })
    }

    /// Open an existing LUN file; capacity comes from its length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let blocks = file.metadata()?.len() / BACKEND_BLOCK as u64;
        Ok(Self { file, blocks })
    }
}

impl BlockDevice for FileLun {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_raw(&self, lba: u64, out: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(out, lba * BACKEND_BLOCK as u64)?;
        Ok(())
    }

    fn write_raw(&self, lba: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, lba * BACKEND_BLOCK as u64)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ============================================================================
// Transfer buffers
// ============================================================================

/// Fixed pool of sequential transfer buffers used by bulk dump/load.
///
/// Buffers return to the pool when the [`TransferBuffer`] is dropped, so a
/// bulk operation with every buffer in flight blocks until a transfer
/// completes.
pub struct TransferPool {
    buffer_bytes: usize,
    tx: kanal::Sender<Vec<u8>>,
    rx: kanal::Receiver<Vec<u8>>,
}

impl TransferPool {
    /// `count` buffers of `buffer_bytes` each.
    pub fn new(count: usize, buffer_bytes: usize) -> Self {
        let (tx, rx) = kanal::bounded(count.max(1));
        for _ in 0..count.max(1) {
            let _ = tx.send(Vec::with_capacity(buffer_bytes));
        }
        Self {
            buffer_bytes,
            tx,
            rx,
        }
    }

    /// Bytes in one buffer.
    #[inline]
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// How many `unit_bytes`-sized units fit in one transfer (at least one).
    #[inline]
    pub fn elements_per_transfer(&self, unit_bytes: usize) -> usize {
        (self.buffer_bytes / unit_bytes.max(1)).max(1)
    }

    /// Buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Take a buffer, waiting up to `timeout` for one to come back.
    ///
    /// # Errors
    ///
    /// `Timeout` if none frees in time.
    pub fn acquire(&self, timeout: Duration) -> Result<TransferBuffer> {
        match self.rx.recv_timeout(timeout) {
            Ok(mut data) => {
                data.clear();
                Ok(TransferBuffer {
                    data,
                    home: Some(self.tx.clone()),
                })
            }
            Err(kanal::ReceiveErrorTimeout::Timeout) => Err(Error::Timeout(timeout)),
            Err(_) => Err(Error::ChannelClosed("transfer pool")),
        }
    }
}

impl std::fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPool")
            .field("buffer_bytes", &self.buffer_bytes)
            .field("available", &self.available())
            .finish()
    }
}

/// Payload of one transfer. Pooled buffers go home on drop.
pub struct TransferBuffer {
    data: Vec<u8>,
    home: Option<kanal::Sender<Vec<u8>>>,
}

impl TransferBuffer {
    /// A buffer that belongs to no pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    /// Append payload bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pad with zeros up to `len`.
    pub fn pad_to(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was written into the buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::ops::Deref for TransferBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            let _ = home.try_send(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round_trip() {
        let lun = MemoryLun::new(8);
        let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        lun.write_blocks(3, &payload).unwrap();
        assert_eq!(lun.read_blocks(3, 2).unwrap(), payload);
    }

    #[test]
    fn test_short_payload_padded() {
        let lun = MemoryLun::new(2);
        lun.write_blocks(0, b"abc").unwrap();
        let back = lun.read_blocks(0, 1).unwrap();
        assert_eq!(&back[..3], b"abc");
        assert!(back[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let lun = MemoryLun::new(4);
        assert_eq!(lun.read_blocks(0, 4).unwrap(), vec![0u8; 4 * BLOCK_PAYLOAD]);
    }

    #[test]
    fn test_corruption_detected() {
        let lun = MemoryLun::new(4);
        lun.write_blocks(1, &[7u8; 512]).unwrap();
        lun.corrupt(1);
        assert!(matches!(
            lun.read_blocks(0, 3),
            Err(Error::ChecksumMismatch { lba: 1 })
        ));
    }

    #[test]
    fn test_range_checked() {
        let lun = MemoryLun::new(4);
        assert!(matches!(lun.read_blocks(3, 2), Err(Error::InvalidArgument(_))));
        assert!(matches!(lun.write_blocks(4, &[0u8; 1]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let lun = MemoryLun::new(1);
        lun.fail_next_write();
        assert!(matches!(lun.write_blocks(0, &[1u8; 4]), Err(Error::Io(_))));
        lun.write_blocks(0, &[1u8; 4]).unwrap();
    }

    #[test]
    fn test_file_lun_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.lun");
        {
            let lun = FileLun::create(&path, 16).unwrap();
            lun.write_blocks(5, &[0x3Cu8; 700]).unwrap();
            lun.flush().unwrap();
        }
        let lun = FileLun::open(&path).unwrap();
        assert_eq!(lun.block_count(), 16);
        let back = lun.read_blocks(5, 2).unwrap();
        assert!(back[..700].iter().all(|b| *b == 0x3C));
        assert!(back[700..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_transfer_pool_recycles() {
        let pool = TransferPool::new(2, 4096);
        assert_eq!(pool.elements_per_transfer(512), 8);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let _b = pool.acquire(Duration::from_millis(10)).unwrap();
        assert!(pool.acquire(Duration::from_millis(10)).unwrap_err().is_timeout());
        drop(a);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }
}
