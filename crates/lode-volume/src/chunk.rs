//! The chunk manager: logical→physical translation and both bootstrap
//! phases (superblock-embedded array, then the authoritative chunk tree).

use crate::walk::{Flow, TreeOp};
use lode_error::{Error, Result};
use lode_ondisk::{
    ChunkItem, DEV_ITEM_SIZE, DevItem, Stripe, Superblock, parse_chunk_record, parse_dev_item,
    parse_sys_chunk_array,
};
use lode_types::{
    DiskKey, ITEM_CHUNK_ITEM, ITEM_DEV_ITEM, block_group_flags_to_string, uuid_to_string,
};
use std::io::Write;
use tracing::{debug, warn};

/// A contiguous region of logical address space backed by device stripes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Start of the logical range (the chunk key's offset).
    pub logical: u64,
    pub item: ChunkItem,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    #[must_use]
    pub fn contains(&self, logical: u64, len: u64) -> bool {
        let Some(request_end) = logical.checked_add(len) else {
            return false;
        };
        let Some(chunk_end) = self.logical.checked_add(self.item.length) else {
            return false;
        };
        logical >= self.logical && request_end <= chunk_end
    }
}

/// The set of known chunks plus the device records met while loading them.
///
/// Cardinality is small on any realistic volume, so lookups are a linear
/// scan in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMap {
    chunks: Vec<Chunk>,
    devices: Vec<DevItem>,
}

impl ChunkMap {
    #[must_use]
    pub fn with_parts(chunks: Vec<Chunk>, devices: Vec<DevItem>) -> Self {
        Self { chunks, devices }
    }

    /// Bootstrap phase 1: decode the superblock's embedded chunk array.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let entries = parse_sys_chunk_array(&sb.sys_chunk_array)?;
        let chunks = entries
            .into_iter()
            .map(|(key, record)| Chunk {
                logical: key.offset,
                item: record.item,
                stripes: record.stripes,
            })
            .collect::<Vec<_>>();
        debug!(
            target: "lode::volume",
            event = "sb_chunks_loaded",
            chunks = chunks.len()
        );
        Ok(Self {
            chunks,
            devices: Vec::new(),
        })
    }

    /// Translate a fully-contained logical range to its physical start.
    ///
    /// The first stripe is used unconditionally; DUP/RAID layouts are not
    /// reconstructed here.
    pub fn logi_to_phys(&self, logical: u64, len: u64) -> Result<u64> {
        for chunk in &self.chunks {
            if chunk.contains(logical, len) {
                let stripe = chunk.stripes.first().ok_or(Error::Unmapped { logical, len })?;
                return Ok((logical - chunk.logical) + stripe.offset);
            }
        }
        Err(Error::Unmapped { logical, len })
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub fn devices(&self) -> &[DevItem] {
        &self.devices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Chunk-tree load hook: collects the authoritative chunk and device set,
/// which replaces the superblock bootstrap wholesale once the walk is done.
#[derive(Debug, Default)]
pub struct ChunkTreeLoad {
    chunks: Vec<Chunk>,
    devices: Vec<DevItem>,
}

impl ChunkTreeLoad {
    #[must_use]
    pub fn into_map(self) -> ChunkMap {
        if self.devices.len() > 1 {
            warn!(
                target: "lode::volume",
                devices = self.devices.len(),
                "multi-device volume: reading stripe 0 only"
            );
        }
        ChunkMap {
            chunks: self.chunks,
            devices: self.devices,
        }
    }
}

impl TreeOp for ChunkTreeLoad {
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        match key.item_type {
            ITEM_DEV_ITEM => {
                if payload.len() != DEV_ITEM_SIZE {
                    return Err(Error::Format(lode_types::ParseError::InvalidField {
                        field: "dev_item",
                        reason: "payload size is not the fixed DEV_ITEM size",
                    }));
                }
                self.devices.push(parse_dev_item(payload)?);
            }
            ITEM_CHUNK_ITEM => {
                let record = parse_chunk_record(payload)?;
                self.chunks.push(Chunk {
                    logical: key.offset,
                    item: record.item,
                    stripes: record.stripes,
                });
            }
            other => {
                warn!(
                    target: "lode::volume",
                    item_type = other,
                    key = %key,
                    "skipping unknown chunk-tree item type"
                );
            }
        }
        Ok(Flow::Continue)
    }
}

/// Chunk-tree dump hook: pretty-prints device and chunk records.
pub struct ChunkTreeDump<'w> {
    pub out: &'w mut dyn Write,
}

impl TreeOp for ChunkTreeDump<'_> {
    fn node(&mut self, header: &lode_ondisk::Header, logical: u64) -> Result<()> {
        writeln!(
            self.out,
            "[node] tree={:#x} addr={logical:#x} level={:#04x} nritems={:#x}",
            header.tree, header.level, header.nritems
        )?;
        Ok(())
    }

    fn key_ptr(&mut self, ptr: &lode_ondisk::KeyPtr) -> Result<()> {
        writeln!(
            self.out,
            "  {} -> block {:#x} generation {:#x}",
            ptr.key, ptr.block_num, ptr.generation
        )?;
        Ok(())
    }

    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        match key.item_type {
            ITEM_DEV_ITEM => {
                let dev = parse_dev_item(payload)?;
                writeln!(
                    self.out,
                    "  DEV_ITEM devid {:#x} uuid {} group {:#x} offset {:#x} size {:#x}",
                    dev.dev_id,
                    uuid_to_string(&dev.dev_uuid),
                    dev.dev_group,
                    dev.start_offset,
                    dev.num_bytes
                )?;
            }
            ITEM_CHUNK_ITEM => {
                let record = parse_chunk_record(payload)?;
                writeln!(
                    self.out,
                    "  CHUNK_ITEM size {:#x} logical {:#x} type {}",
                    record.item.length,
                    key.offset,
                    block_group_flags_to_string(record.item.chunk_type)
                )?;
                for stripe in &record.stripes {
                    writeln!(
                        self.out,
                        "    + STRIPE devid {:#x} offset {:#x}",
                        stripe.dev_id, stripe.offset
                    )?;
                }
            }
            _ => {
                writeln!(self.out, "  unknown {key}")?;
            }
        }
        Ok(Flow::Continue)
    }
}
