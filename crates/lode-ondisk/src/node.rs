//! Tree node decoding: header, leaf items, internal key pointers.

use crate::{HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE, MAX_LEVEL};
use lode_types::{
    CSUM_SIZE, DiskKey, ParseError, crc32c, read_disk_key, read_fixed, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// The 101-byte header prefixing every tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    /// Logical address this node was written at.
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    /// Object id of the tree that owns this node.
    pub tree: u64,
    pub nritems: u32,
    /// 0 for leaves; internal nodes carry key pointers.
    pub level: u8,
}

impl Header {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            tree: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Structural bounds: level within the tree depth limit and `nritems`
    /// within the node's capacity for its level.
    pub fn validate(&self, block_size: usize) -> Result<(), ParseError> {
        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(HEADER_SIZE);
        let slot = if self.level == 0 { ITEM_SIZE } else { KEY_PTR_SIZE };
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        if nritems > payload_space / slot {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds node capacity",
            });
        }

        Ok(())
    }
}

/// One leaf item descriptor.
///
/// `offset` is relative to the start of the items region (the byte after the
/// header); the payload lives at `HEADER_SIZE + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: DiskKey,
    pub offset: u32,
    pub size: u32,
}

/// An internal-node entry: a key paired with a child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: DiskKey,
    /// Logical address of the child node.
    pub block_num: u64,
    pub generation: u64,
}

/// Decode the item table of a leaf node, bounds-checking every payload.
pub fn parse_leaf_items(block: &[u8]) -> Result<(Header, Vec<LeafItem>), ParseError> {
    let header = Header::parse(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len())?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * ITEM_SIZE;
        let item = LeafItem {
            key: read_disk_key(block, base)?,
            offset: read_le_u32(block, base + 17)?,
            size: read_le_u32(block, base + 21)?,
        };

        let end = usize::try_from(item.offset)
            .ok()
            .and_then(|off| off.checked_add(usize::try_from(item.size).ok()?))
            .and_then(|end| end.checked_add(HEADER_SIZE))
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            })?;
        if end > block.len() {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "payload extends past the node",
            });
        }

        items.push(item);
    }

    Ok((header, items))
}

/// Borrow the payload bytes of a leaf item previously validated by
/// [`parse_leaf_items`].
#[must_use]
pub fn leaf_payload<'a>(block: &'a [u8], item: &LeafItem) -> &'a [u8] {
    let start = HEADER_SIZE + item.offset as usize;
    &block[start..start + item.size as usize]
}

/// Decode the key-pointer table of an internal node.
pub fn parse_internal_items(block: &[u8]) -> Result<(Header, Vec<KeyPtr>), ParseError> {
    let header = Header::parse(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len())?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        let ptr = KeyPtr {
            key: read_disk_key(block, base)?,
            block_num: read_le_u64(block, base + 17)?,
            generation: read_le_u64(block, base + 25)?,
        };

        if ptr.block_num == 0 {
            return Err(ParseError::InvalidField {
                field: "block_num",
                reason: "child block pointer is zero",
            });
        }

        ptrs.push(ptr);
    }

    Ok((header, ptrs))
}

/// Verify the CRC-32C of a tree node (leaf or internal).
///
/// The checksum covers everything after the 32-byte checksum slot; the
/// expected value is the little-endian u32 in the slot's first 4 bytes.
pub fn verify_node_checksum(block: &[u8]) -> Result<(), ParseError> {
    if block.len() < HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }

    let stored = read_le_u32(block, 0)?;
    let computed = crc32c(&block[CSUM_SIZE..]);
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "node_csum",
            reason: "CRC32C checksum mismatch",
        });
    }

    Ok(())
}
