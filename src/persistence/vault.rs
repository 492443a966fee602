//! Vault dump and load.
//!
//! Tags go to the tag LUN, one block each; buffers go to the vault LUN, one
//! 64-block group each, both indexed directly by tag index. Bulk work packs
//! as many units as fit into one pooled transfer buffer and drains the
//! whole batch with the bulk bound.
//!
//! A dump works from a [`VaultSnapshot`] taken while the directory is
//! held, so the bulk writes themselves run with no directory lock.

use super::io::IoEngine;
use super::layout::{Layout, RegionHeader, TAG_MAGIC, VAULT_MAGIC};
use super::lun::{BLOCK_PAYLOAD, BlockDevice, TransferPool};
use crate::config::BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::ident::NodeId;
use crate::observability::{VaultMetrics, trace_vault_error};
use crate::persistence::checksum::buffer_checksum;
use crate::tag::{TAG_RECORD_LEN, TagDirectory, TagRecord};
use parking_lot::Mutex;
use std::sync::Arc;

/// What a dump wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Tag records written.
    pub tags: usize,
    /// Buffers written.
    pub buffers: usize,
}

/// Tag records and allocated buffer contents captured for one dump.
#[derive(Debug, Default)]
pub struct VaultSnapshot {
    records: Vec<TagRecord>,
    buffers: Vec<(u32, Vec<u8>)>,
}

impl VaultSnapshot {
    /// Copy every tag record and every allocated buffer out of `directory`.
    pub fn capture(directory: &TagDirectory) -> Result<Self> {
        let buffers = directory
            .tags()
            .filter(|t| !t.id().is_none())
            .map(|t| Ok((t.index(), directory.buffer_contents(t.index())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            records: directory.records(),
            buffers,
        })
    }

    /// Captured tag records.
    pub fn records(&self) -> &[TagRecord] {
        &self.records
    }

    /// Captured buffers, ascending by tag index.
    pub fn buffers(&self) -> &[(u32, Vec<u8>)] {
        &self.buffers
    }
}

/// Tag and vault LUNs plus the machinery to move them in bulk.
pub struct Vault {
    tags: Arc<dyn BlockDevice>,
    buffers: Arc<dyn BlockDevice>,
    layout: Layout,
    io: Arc<IoEngine>,
    transfers: TransferPool,
    dump_metrics: VaultMetrics,
    load_metrics: VaultMetrics,
}

impl Vault {
    /// Vault over a tag LUN and a buffer LUN.
    pub fn new(
        tags: Arc<dyn BlockDevice>,
        buffers: Arc<dyn BlockDevice>,
        layout: Layout,
        io: Arc<IoEngine>,
        transfers: TransferPool,
    ) -> Self {
        Self {
            tags,
            buffers,
            layout,
            io,
            transfers,
            dump_metrics: VaultMetrics::new("dump"),
            load_metrics: VaultMetrics::new("load"),
        }
    }

    /// The layout in use.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn tag_header(&self) -> RegionHeader {
        RegionHeader::new(TAG_MAGIC, self.layout.buffer_count() as u64)
    }

    fn vault_header(&self) -> RegionHeader {
        RegionHeader::new(VAULT_MAGIC, self.layout.buffer_count() as u64)
    }

    /// Whether both LUNs carry headers for this layout.
    pub fn check_headers(&self) -> Result<bool> {
        let check = |device: &Arc<dyn BlockDevice>, expected: RegionHeader| -> Result<bool> {
            let found = match self.io.read(device, 0, 1) {
                Ok(block) => RegionHeader::from_block(&block)?,
                Err(Error::ChecksumMismatch { .. }) => return Ok(false),
                Err(e) => return Err(e),
            };
            Ok(found.matches(&expected) && found.units == expected.units)
        };
        Ok(check(&self.tags, self.tag_header())? && check(&self.buffers, self.vault_header())?)
    }

    /// Stamp both headers and write a free record for every tag.
    pub fn format(&self, node: NodeId) -> Result<()> {
        let free: Vec<TagRecord> = (0..self.layout.buffer_count() as u32)
            .map(|i| TagRecord::free(i, node))
            .collect();
        self.dump_tags(&free)?;
        self.io
            .write(&self.tags, 0, self.tag_header().to_block().to_vec())?;
        self.io
            .write(&self.buffers, 0, self.vault_header().to_block().to_vec())?;
        tracing::info!(tags = free.len(), "vault formatted");
        Ok(())
    }

    /// Write one tag record, waiting for completion.
    pub fn persist_tag(&self, record: &TagRecord) -> Result<()> {
        let mut block = vec![0u8; BLOCK_PAYLOAD];
        record.encode(&mut block[..TAG_RECORD_LEN]);
        self.io.write(&self.tags, self.layout.tag_lba(record.index), block)
    }

    /// Dump every tag and every allocated buffer of a snapshot.
    pub fn dump(&self, snapshot: &VaultSnapshot) -> Result<DumpSummary> {
        let _timer = self.dump_metrics.start_timer();
        let result = self.dump_tags(snapshot.records()).and_then(|tags| {
            let buffers = self.dump_buffers(snapshot.buffers())?;
            Ok(DumpSummary { tags, buffers })
        });
        match &result {
            Ok(summary) => tracing::info!(
                tags = summary.tags,
                buffers = summary.buffers,
                "vault dump complete"
            ),
            Err(e) => {
                self.dump_metrics.record_failure();
                trace_vault_error("dump", e);
            }
        }
        result
    }

    /// Write tag records in bulk. Records land at their own index.
    pub fn dump_tags(&self, records: &[TagRecord]) -> Result<usize> {
        let per_transfer = self.transfers.elements_per_transfer(BLOCK_PAYLOAD);
        let mut sorted: Vec<&TagRecord> = records.iter().collect();
        sorted.sort_unstable_by_key(|r| r.index);

        let bulk = self.io.bulk();
        for run in runs(&sorted, |r| r.index, per_transfer) {
            let mut transfer = self.transfers.acquire(self.io.bulk_timeout())?;
            for (n, record) in run.iter().enumerate() {
                transfer.extend_from_slice(&record.to_bytes());
                transfer.pad_to((n + 1) * BLOCK_PAYLOAD);
            }
            bulk.write(&self.tags, self.layout.tag_lba(run[0].index), transfer)?;
        }
        bulk.wait()?;
        Ok(records.len())
    }

    /// Write buffers in bulk. Each lands in the slot of its tag index;
    /// `buffers` must ascend by index.
    pub fn dump_buffers(&self, buffers: &[(u32, Vec<u8>)]) -> Result<usize> {
        let per_transfer = self.transfers.elements_per_transfer(BUFFER_SIZE);

        let bulk = self.io.bulk();
        for run in runs(buffers, |(i, _)| *i, per_transfer) {
            let mut transfer = self.transfers.acquire(self.io.bulk_timeout())?;
            for (_, data) in run {
                transfer.extend_from_slice(data);
            }
            bulk.write(&self.buffers, self.layout.vault_lba(run[0].0), transfer)?;
        }
        bulk.wait()?;
        Ok(buffers.len())
    }

    /// Read every tag record back, in index order.
    pub fn load_tags(&self) -> Result<Vec<TagRecord>> {
        let count = self.layout.buffer_count();
        let per_transfer = self.transfers.elements_per_transfer(BLOCK_PAYLOAD);
        let slots: Arc<Mutex<Vec<Option<TagRecord>>>> = Arc::new(Mutex::new(vec![None; count]));

        let bulk = self.io.bulk();
        let mut start = 0usize;
        while start < count {
            let n = per_transfer.min(count - start);
            let slots = Arc::clone(&slots);
            let first = start;
            bulk.read(&self.tags, self.layout.tag_lba(start as u32), n, move |payload| {
                let mut decoded = Vec::with_capacity(n);
                for (k, block) in payload.chunks_exact(BLOCK_PAYLOAD).enumerate() {
                    let mut record = TagRecord::decode(&block[..TAG_RECORD_LEN])?;
                    record.index = (first + k) as u32;
                    decoded.push(record);
                }
                let mut slots = slots.lock();
                for (k, record) in decoded.into_iter().enumerate() {
                    slots[first + k] = Some(record);
                }
                Ok(())
            })?;
            start += n;
        }
        bulk.wait()?;

        let slots = std::mem::take(&mut *slots.lock());
        slots
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.ok_or_else(|| Error::CorruptDurableState(format!("tag {i} not loaded")))
            })
            .collect()
    }

    /// Read allocated buffers back into memory and verify their checksums.
    pub fn load_buffers(&self, directory: &mut TagDirectory) -> Result<usize> {
        let per_transfer = self.transfers.elements_per_transfer(BUFFER_SIZE);
        let allocated: Vec<u32> = directory
            .tags()
            .filter(|t| !t.id().is_none())
            .map(|t| t.index())
            .collect();
        let loaded: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

        let bulk = self.io.bulk();
        for run in runs(&allocated, |i| *i, per_transfer) {
            let first = run[0];
            let blocks = run.len() * (BUFFER_SIZE / BLOCK_PAYLOAD);
            let loaded = Arc::clone(&loaded);
            bulk.read(&self.buffers, self.layout.vault_lba(first), blocks, move |payload| {
                let mut loaded = loaded.lock();
                for (k, data) in payload.chunks_exact(BUFFER_SIZE).enumerate() {
                    loaded.push((first + k as u32, data.to_vec()));
                }
                Ok(())
            })?;
        }
        bulk.wait()?;

        let loaded = std::mem::take(&mut *loaded.lock());
        for (index, data) in &loaded {
            let expected = directory.tag(*index).map(|t| t.checksum()).unwrap_or(0);
            if buffer_checksum(data) != expected {
                return Err(Error::CorruptDurableState(format!(
                    "buffer {index} checksum mismatch"
                )));
            }
            directory.load_buffer(*index, data)?;
        }
        Ok(loaded.len())
    }

    /// Load tags and buffers into `directory`. Returns allocated tags found.
    pub fn load(&self, directory: &mut TagDirectory) -> Result<usize> {
        let _timer = self.load_metrics.start_timer();
        let result = self.load_tags().and_then(|records| {
            let allocated = directory.rebuild(&records)?;
            self.load_buffers(directory)?;
            Ok(allocated)
        });
        match &result {
            Ok(allocated) => tracing::info!(allocated, "vault load complete"),
            Err(e) => {
                self.load_metrics.record_failure();
                trace_vault_error("load", e);
            }
        }
        result
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("layout", &self.layout)
            .field("transfers", &self.transfers)
            .finish()
    }
}

/// Split `items` (sorted by key) into runs of consecutive keys, each at
/// most `max` long.
fn runs<'a, T>(items: &'a [T], key: impl Fn(&T) -> u32, max: usize) -> Vec<&'a [T]> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=items.len() {
        let breaks = i == items.len()
            || i - start >= max
            || key(&items[i]) != key(&items[i - 1]) + 1;
        if breaks {
            out.push(&items[start..i]);
            start = i;
        }
    }
    out
}
