//! Local/remote address map for every carved buffer and tag.
//!
//! Both nodes carve their persistent memory with the same algorithm. Once the
//! peer advertises its scatter list, carving it the same way yields the
//! remote address of every local pair. The map is only meaningful when the
//! two layouts mirror each other, so that is checked up front.

use super::carve::{CarveMode, CarvedPair, MemoryCarving, carve};
use super::SgElement;
use crate::config::BUFFER_SIZE;
use crate::error::{Error, Result};

/// Local and remote placement of one tag/buffer pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerMapping {
    /// Tag index.
    pub index: u32,
    /// Placement on this node.
    pub local: CarvedPair,
    /// Placement on the peer, once its map was received.
    pub remote: Option<CarvedPair>,
}

/// Dual-node memory map.
#[derive(Clone, Debug)]
pub struct PeerMemoryMap {
    local: MemoryCarving,
    remote: Option<MemoryCarving>,
}

impl PeerMemoryMap {
    /// Map with only the local side known.
    pub fn new(local: MemoryCarving) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// Carve the peer's advertised scatter list and attach it.
    ///
    /// The peer must mirror the local layout: same number of ranges, same
    /// range lengths, same buffer alignment within each range. Anything else
    /// would give pairs whose offsets differ between the nodes.
    ///
    /// # Errors
    ///
    /// `PeerLayoutMismatch` if the layouts differ or the peer carves a
    /// different number of pairs. The previous remote side is kept.
    pub fn receive_peer_memory_map(&mut self, peer_sg: &[SgElement]) -> Result<()> {
        check_mirrored(self.local.scatter_list(), peer_sg)?;

        let remote = carve(peer_sg, self.local.requested(), CarveMode::BestEffort)
            .map_err(|e| Error::PeerLayoutMismatch(format!("peer carve failed: {e}")))?;
        if remote.len() != self.local.len() {
            return Err(Error::PeerLayoutMismatch(format!(
                "peer carved {} pairs, local carved {}",
                remote.len(),
                self.local.len()
            )));
        }

        tracing::info!(pairs = remote.len(), ranges = peer_sg.len(), "peer memory map attached");
        self.remote = Some(remote);
        Ok(())
    }

    /// Forget the peer side (peer went away).
    pub fn clear_peer(&mut self) {
        self.remote = None;
    }

    /// Whether the peer's map was received.
    #[inline]
    pub fn has_peer(&self) -> bool {
        self.remote.is_some()
    }

    /// Local carving.
    pub fn local(&self) -> &MemoryCarving {
        &self.local
    }

    /// Number of mapped pairs.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Whether nothing was carved.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Mapping for one tag index.
    pub fn mapping(&self, index: u32) -> Option<PeerMapping> {
        let local = *self.local.pair(index)?;
        let remote = self.remote.as_ref().and_then(|r| r.pair(index).copied());
        Some(PeerMapping {
            index,
            local,
            remote,
        })
    }

    /// All mappings in tag-index order.
    pub fn iter(&self) -> impl Iterator<Item = PeerMapping> + '_ {
        (0..self.local.len() as u32).filter_map(|i| self.mapping(i))
    }
}

fn check_mirrored(local: &[SgElement], peer: &[SgElement]) -> Result<()> {
    if local.len() != peer.len() {
        return Err(Error::PeerLayoutMismatch(format!(
            "peer has {} ranges, local has {}",
            peer.len(),
            local.len()
        )));
    }
    let align = BUFFER_SIZE as u64;
    for (i, (l, p)) in local.iter().zip(peer).enumerate() {
        if l.len != p.len || l.address % align != p.address % align {
            return Err(Error::PeerLayoutMismatch(format!(
                "range {i}: local {:#x}+{:#x} does not mirror peer {:#x}+{:#x}",
                l.address, l.len, p.address, p.len
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::carve::required_bytes;

    fn local_map(count: usize) -> PeerMemoryMap {
        let sg = [SgElement::new(0x100_0000, required_bytes(count))];
        PeerMemoryMap::new(carve(&sg, count, CarveMode::Strict).unwrap())
    }

    #[test]
    fn test_peer_map_attach() {
        let mut map = local_map(3);
        assert!(!map.has_peer());
        assert!(map.mapping(0).unwrap().remote.is_none());

        map.receive_peer_memory_map(&[SgElement::new(0x800_0000, required_bytes(3))])
            .unwrap();
        assert!(map.has_peer());

        for m in map.iter() {
            let remote = m.remote.unwrap();
            assert_eq!(remote.buffer_address - 0x800_0000, m.local.buffer_address - 0x100_0000);
            assert_eq!(remote.tag_address - 0x800_0000, m.local.tag_address - 0x100_0000);
        }
    }

    #[test]
    fn test_peer_map_rejects_mismatch() {
        let mut map = local_map(2);
        let err = map
            .receive_peer_memory_map(&[SgElement::new(0x800_0000, required_bytes(1))])
            .unwrap_err();
        assert!(matches!(err, Error::PeerLayoutMismatch(_)));

        let err = map
            .receive_peer_memory_map(&[
                SgElement::new(0x800_0000, required_bytes(1)),
                SgElement::new(0x900_0000, required_bytes(1)),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::PeerLayoutMismatch(_)));
        assert!(!map.has_peer());
    }

    #[test]
    fn test_peer_map_clear() {
        let mut map = local_map(1);
        map.receive_peer_memory_map(&[SgElement::new(0, required_bytes(1))])
            .unwrap();
        map.clear_peer();
        assert!(map.mapping(0).unwrap().remote.is_none());
    }
}
