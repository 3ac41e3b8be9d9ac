//! Superblock decoding and validation.

use crate::DEV_ITEM_SIZE;
use crate::item::{DevItem, parse_dev_item};
use lode_types::{
    CSUM_SIZE, ParseError, SUPER_INFO_SIZE, SUPER_LABEL_LEN, SUPER_LABEL_OFFSET, SUPER_MAGIC,
    SYS_CHUNK_ARRAY_MAX, SYS_CHUNK_ARRAY_OFFSET, crc32c, read_fixed, read_le_u16, read_le_u32,
    read_le_u64, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

const DEV_ITEM_OFFSET: usize = 0xC9;

/// Host-endian mirror of one superblock copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    /// Physical address this copy was written at.
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    /// Logical address of the root-tree root node.
    pub root: u64,
    /// Logical address of the chunk-tree root node.
    pub chunk_root: u64,
    /// Logical address of the log-tree root node (unused on a clean mount).
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub leafsize: u32,
    pub stripesize: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    /// This device's own DEV_ITEM, embedded in the superblock.
    pub dev_item: DevItem,
    pub label: String,
    /// Raw bytes of the embedded `(key, chunk)` bootstrap records.
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    #[allow(clippy::too_many_lines)]
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let leafsize = read_le_u32(region, 0x98)?;
        let stripesize = read_le_u32(region, 0x9C)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 256K upper bound",
            });
        }
        if stripesize != 0 && !stripesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "stripesize",
                reason: "must be zero or power of two",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds the 2048-byte embedded array",
            });
        }

        let array_end = SYS_CHUNK_ARRAY_OFFSET
            .checked_add(sys_array_len)
            .ok_or(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "offset overflow",
            })?;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            leafsize,
            stripesize,
            sys_chunk_array_size,
            chunk_root_generation: read_le_u64(region, 0xA4)?,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            log_root_level: region[0xC8],
            dev_item: parse_dev_item(&region[DEV_ITEM_OFFSET..DEV_ITEM_OFFSET + DEV_ITEM_SIZE])?,
            label: trim_nul_padded(&read_fixed::<SUPER_LABEL_LEN>(
                region,
                SUPER_LABEL_OFFSET,
            )?),
            sys_chunk_array: region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec(),
        })
    }
}

/// Verify the CRC-32C of one superblock region.
///
/// The checksum covers everything after the 32-byte checksum slot; the
/// expected value is the little-endian u32 in the slot's first 4 bytes.
pub fn verify_superblock_checksum(region: &[u8]) -> Result<(), ParseError> {
    if region.len() < SUPER_INFO_SIZE {
        return Err(ParseError::InsufficientData {
            needed: SUPER_INFO_SIZE,
            offset: 0,
            actual: region.len(),
        });
    }

    let csum_type = read_le_u16(region, 0xC4)?;
    if csum_type != 0 {
        return Err(ParseError::InvalidField {
            field: "csum_type",
            reason: "only CRC32C (type 0) is supported",
        });
    }

    let stored = read_le_u32(region, 0)?;
    let computed = crc32c(&region[CSUM_SIZE..SUPER_INFO_SIZE]);
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "superblock_csum",
            reason: "CRC32C checksum mismatch",
        });
    }

    Ok(())
}
