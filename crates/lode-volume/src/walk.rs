//! Depth-first tree traversal with pluggable per-leaf operations.
//!
//! Items and key pointers are stored in key order on disk, so the walk
//! delivers leaf items in canonical key order; operations may rely on this
//! to stop early once keys pass their target.

use crate::chunk::ChunkMap;
use lode_block::{BlockReader, ByteDevice};
use lode_error::{Error, Result};
use lode_ondisk::{
    Header, KeyPtr, leaf_payload, parse_internal_items, parse_leaf_items, verify_node_checksum,
};
use lode_types::{DiskKey, ParseError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Whether traversal continues after a leaf hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Abort the leaf loop and every enclosing level.
    Stop,
}

/// Per-leaf (and, for dumps, per-node) hooks invoked by the walker.
pub trait TreeOp {
    /// Called once per visited node before its items are processed.
    fn node(&mut self, _header: &Header, _logical: u64) -> Result<()> {
        Ok(())
    }

    /// Called for each key pointer of an internal node, in order.
    fn key_ptr(&mut self, _ptr: &KeyPtr) -> Result<()> {
        Ok(())
    }

    /// Called for each leaf item, in key order.
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow>;
}

/// A node address, either side of the chunk translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    Logical(u64),
    Physical(u64),
}

/// Everything needed to fetch and verify nodes during one traversal.
pub struct TreeContext<'a, D> {
    pub reader: &'a BlockReader<D>,
    pub chunks: &'a ChunkMap,
    pub nodesize: u32,
}

impl<D: ByteDevice> TreeContext<'_, D> {
    /// Fetch a node through the cached reader and verify its checksum.
    pub fn load_node(&self, addr: Addr) -> Result<Arc<[u8]>> {
        let phys = match addr {
            Addr::Logical(logical) => self
                .chunks
                .logi_to_phys(logical, u64::from(self.nodesize))?,
            Addr::Physical(phys) => phys,
        };

        let block = self.reader.cached_read(phys, self.nodesize)?;
        verify_node_checksum(&block).map_err(|_| Error::BadChecksum {
            kind: "node",
            addr: phys,
        })?;
        Ok(block)
    }
}

/// Walk the tree rooted at `root_logical`, dispatching leaves to `op`.
///
/// When `expected_tree` is given, every node's owner field must match it;
/// the FS walker passes `None` so subvolume trees can be traversed too.
pub fn walk_tree<D: ByteDevice>(
    cx: &TreeContext<'_, D>,
    root_logical: u64,
    expected_tree: Option<u64>,
    op: &mut dyn TreeOp,
) -> Result<()> {
    let mut active_path = HashSet::new();
    let mut visited = HashSet::new();
    walk_node(
        cx,
        root_logical,
        expected_tree,
        op,
        &mut active_path,
        &mut visited,
    )?;
    Ok(())
}

fn walk_node<D: ByteDevice>(
    cx: &TreeContext<'_, D>,
    logical: u64,
    expected_tree: Option<u64>,
    op: &mut dyn TreeOp,
    active_path: &mut HashSet<u64>,
    visited: &mut HashSet<u64>,
) -> Result<Flow> {
    if !active_path.insert(logical) {
        return Err(Error::Format(ParseError::InvalidField {
            field: "block_num",
            reason: "cycle detected in tree pointers",
        }));
    }
    if !visited.insert(logical) {
        return Err(Error::Format(ParseError::InvalidField {
            field: "block_num",
            reason: "duplicate node reference in tree pointers",
        }));
    }

    let block = cx.load_node(Addr::Logical(logical))?;
    let header = Header::parse(&block)?;
    header.validate(block.len())?;

    if let Some(expected) = expected_tree {
        if header.tree != expected {
            return Err(Error::Format(ParseError::InvalidField {
                field: "tree",
                reason: "node owner does not match the walked tree",
            }));
        }
    }

    trace!(
        target: "lode::volume::walk",
        event = "visit_node",
        logical,
        level = header.level,
        nritems = header.nritems
    );

    op.node(&header, logical)?;

    let flow = if header.level == 0 {
        let (_, items) = parse_leaf_items(&block)?;
        let mut flow = Flow::Continue;
        for item in &items {
            if op.leaf(item.key, leaf_payload(&block, item))? == Flow::Stop {
                flow = Flow::Stop;
                break;
            }
        }
        flow
    } else {
        let (_, ptrs) = parse_internal_items(&block)?;
        for ptr in &ptrs {
            op.key_ptr(ptr)?;
        }

        let mut flow = Flow::Continue;
        for ptr in &ptrs {
            if walk_node(cx, ptr.block_num, expected_tree, op, active_path, visited)? == Flow::Stop
            {
                flow = Flow::Stop;
                break;
            }
        }
        flow
    };

    active_path.remove(&logical);
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use lode_block::MemByteDevice;
    use lode_ondisk::{ChunkItem, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE, Stripe};
    use lode_types::crc32c;

    pub(crate) const NODESIZE: u32 = 4096;

    pub(crate) fn write_header(block: &mut [u8], bytenr: u64, tree: u64, nritems: u32, level: u8) {
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x50..0x58].copy_from_slice(&1_u64.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&tree.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
    }

    pub(crate) fn seal_node(block: &mut [u8]) {
        let csum = crc32c(&block[32..]);
        block[0..4].copy_from_slice(&csum.to_le_bytes());
    }

    pub(crate) fn write_leaf_item(
        block: &mut [u8],
        idx: usize,
        key: DiskKey,
        offset: u32,
        size: u32,
    ) {
        let base = HEADER_SIZE + idx * ITEM_SIZE;
        block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
        block[base + 8] = key.item_type;
        block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
        block[base + 17..base + 21].copy_from_slice(&offset.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&size.to_le_bytes());
    }

    pub(crate) fn write_key_ptr(block: &mut [u8], idx: usize, key: DiskKey, child: u64) {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
        block[base + 8] = key.item_type;
        block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
        block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&1_u64.to_le_bytes());
    }

    /// Identity-mapped 1 GiB chunk at logical 0.
    pub(crate) fn identity_chunks() -> ChunkMap {
        ChunkMap::with_parts(
            vec![Chunk {
                logical: 0,
                item: ChunkItem {
                    length: 0x4000_0000,
                    owner: 2,
                    stripe_len: 0x1_0000,
                    chunk_type: 2,
                    io_align: 4096,
                    io_width: 4096,
                    min_io_size: 4096,
                    num_stripes: 1,
                    sub_stripes: 0,
                },
                stripes: vec![Stripe {
                    dev_id: 1,
                    offset: 0,
                    dev_uuid: [0; 16],
                }],
            }],
            Vec::new(),
        )
    }

    struct Collect {
        keys: Vec<DiskKey>,
        payload_first_bytes: Vec<u8>,
        stop_at: Option<u64>,
    }

    impl TreeOp for Collect {
        fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
            if let Some(limit) = self.stop_at {
                if key.objectid > limit {
                    return Ok(Flow::Stop);
                }
            }
            self.keys.push(key);
            self.payload_first_bytes
                .push(payload.first().copied().unwrap_or(0));
            Ok(Flow::Continue)
        }
    }

    fn leaf_with_items(
        logical: u64,
        tree: u64,
        items: &[(DiskKey, &[u8])],
    ) -> (u64, Vec<u8>) {
        let mut block = vec![0_u8; NODESIZE as usize];
        write_header(&mut block, logical, tree, items.len() as u32, 0);
        let mut payload_cursor = NODESIZE as usize - HEADER_SIZE;
        for (idx, (key, payload)) in items.iter().enumerate() {
            payload_cursor -= payload.len();
            write_leaf_item(&mut block, idx, *key, payload_cursor as u32, payload.len() as u32);
            let abs = HEADER_SIZE + payload_cursor;
            block[abs..abs + payload.len()].copy_from_slice(payload);
        }
        seal_node(&mut block);
        (logical, block)
    }

    fn image_with_nodes(nodes: Vec<(u64, Vec<u8>)>) -> MemByteDevice {
        let len = nodes
            .iter()
            .map(|(addr, _)| *addr as usize + NODESIZE as usize)
            .max()
            .unwrap_or(0);
        let mut image = vec![0_u8; len];
        for (addr, block) in nodes {
            image[addr as usize..addr as usize + block.len()].copy_from_slice(&block);
        }
        MemByteDevice::new(image)
    }

    #[test]
    fn walk_delivers_items_in_key_order() {
        let chunks = identity_chunks();

        let (left_addr, left) = leaf_with_items(
            0x2_0000,
            5,
            &[
                (DiskKey::new(256, 0x01, 0), b"a".as_slice()),
                (DiskKey::new(256, 0x54, 7), b"b".as_slice()),
            ],
        );
        let (right_addr, right) = leaf_with_items(
            0x3_0000,
            5,
            &[
                (DiskKey::new(300, 0x01, 0), b"c".as_slice()),
                (DiskKey::new(301, 0x01, 0), b"d".as_slice()),
            ],
        );

        let mut root = vec![0_u8; NODESIZE as usize];
        write_header(&mut root, 0x1_0000, 5, 2, 1);
        write_key_ptr(&mut root, 0, DiskKey::new(256, 0x01, 0), left_addr);
        write_key_ptr(&mut root, 1, DiskKey::new(300, 0x01, 0), right_addr);
        seal_node(&mut root);

        let dev = image_with_nodes(vec![(0x1_0000, root), (left_addr, left), (right_addr, right)]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: None,
        };
        walk_tree(&cx, 0x1_0000, Some(5), &mut op).expect("walk");

        assert_eq!(op.keys.len(), 4);
        assert!(op.keys.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(op.payload_first_bytes, b"abcd");
    }

    #[test]
    fn short_circuit_stops_descent() {
        let chunks = identity_chunks();

        let (left_addr, left) = leaf_with_items(
            0x2_0000,
            5,
            &[
                (DiskKey::new(256, 0x01, 0), b"a".as_slice()),
                (DiskKey::new(400, 0x01, 0), b"x".as_slice()),
            ],
        );
        let (right_addr, right) =
            leaf_with_items(0x3_0000, 5, &[(DiskKey::new(500, 0x01, 0), b"y".as_slice())]);

        let mut root = vec![0_u8; NODESIZE as usize];
        write_header(&mut root, 0x1_0000, 5, 2, 1);
        write_key_ptr(&mut root, 0, DiskKey::new(256, 0x01, 0), left_addr);
        write_key_ptr(&mut root, 1, DiskKey::new(500, 0x01, 0), right_addr);
        seal_node(&mut root);

        let dev = image_with_nodes(vec![(0x1_0000, root), (left_addr, left), (right_addr, right)]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: Some(300),
        };
        walk_tree(&cx, 0x1_0000, Some(5), &mut op).expect("walk");

        // Only the item at or below the limit was delivered; the second leaf
        // was never visited.
        assert_eq!(op.keys, vec![DiskKey::new(256, 0x01, 0)]);
        assert_eq!(reader.metrics().misses, 2, "root + left leaf only");
    }

    #[test]
    fn owner_mismatch_is_rejected() {
        let chunks = identity_chunks();
        let (addr, leaf) =
            leaf_with_items(0x1_0000, 3, &[(DiskKey::new(1, 0x01, 0), b"z".as_slice())]);
        let dev = image_with_nodes(vec![(addr, leaf)]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: None,
        };
        let err = walk_tree(&cx, 0x1_0000, Some(5), &mut op).unwrap_err();
        assert!(matches!(
            err,
            Error::Format(ParseError::InvalidField { field: "tree", .. })
        ));
    }

    #[test]
    fn corrupt_node_checksum_is_fatal() {
        let chunks = identity_chunks();
        let (addr, mut leaf) =
            leaf_with_items(0x1_0000, 5, &[(DiskKey::new(1, 0x01, 0), b"z".as_slice())]);
        leaf[0x70] ^= 0xFF; // damage past the checksum slot
        let dev = image_with_nodes(vec![(addr, leaf)]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: None,
        };
        assert!(matches!(
            walk_tree(&cx, 0x1_0000, Some(5), &mut op).unwrap_err(),
            Error::BadChecksum { kind: "node", .. }
        ));
    }

    #[test]
    fn self_cycle_fails_fast() {
        let chunks = identity_chunks();
        let mut root = vec![0_u8; NODESIZE as usize];
        write_header(&mut root, 0x1_0000, 5, 1, 1);
        write_key_ptr(&mut root, 0, DiskKey::new(256, 0x01, 0), 0x1_0000);
        seal_node(&mut root);

        let dev = image_with_nodes(vec![(0x1_0000, root)]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: None,
        };
        assert!(matches!(
            walk_tree(&cx, 0x1_0000, Some(5), &mut op).unwrap_err(),
            Error::Format(ParseError::InvalidField {
                reason: "cycle detected in tree pointers",
                ..
            })
        ));
    }

    #[test]
    fn unmapped_root_reports_unmapped() {
        let chunks = identity_chunks();
        let dev = MemByteDevice::new(vec![0_u8; 4096]);
        let reader = BlockReader::new(dev);
        let cx = TreeContext {
            reader: &reader,
            chunks: &chunks,
            nodesize: NODESIZE,
        };

        let mut op = Collect {
            keys: Vec::new(),
            payload_first_bytes: Vec::new(),
            stop_at: None,
        };
        assert!(matches!(
            walk_tree(&cx, 0x8000_0000, Some(5), &mut op).unwrap_err(),
            Error::Unmapped { .. }
        ));
    }
}
