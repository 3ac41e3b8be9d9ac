#![forbid(unsafe_code)]
//! Shared btrfs key types, on-disk constants, and decoding primitives.
//!
//! Everything here is host-endian after decoding; the on-disk format is
//! little-endian throughout.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub use crc32c::{crc32c, crc32c_append};

/// Size of one superblock copy on disk.
pub const SUPER_INFO_SIZE: usize = 0x1000;
/// Physical offsets of the (up to four) superblock copies.
pub const SUPERBLOCK_PADDRS: [u64; 4] = [0x1_0000, 0x400_0000, 0x40_0000_0000, 0x4_0000_0000_0000];
/// `_BHRfS_M` as a little-endian u64.
pub const SUPER_MAGIC: u64 = 0x4D5F_5366_5248_425F;
/// Size of the checksum slot heading the superblock and every tree node.
pub const CSUM_SIZE: usize = 32;
/// Byte offset of the volume label within the superblock.
pub const SUPER_LABEL_OFFSET: usize = 0x12B;
/// Length of the NUL-padded volume label.
pub const SUPER_LABEL_LEN: usize = 256;
/// Byte offset of the embedded chunk array within the superblock.
pub const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
/// Upper bound on the embedded chunk array length.
pub const SYS_CHUNK_ARRAY_MAX: usize = 0x800;
/// Default node cache capacity for a mounted volume.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

// ── Well-known tree object ids ──────────────────────────────────────────────

pub const OBJID_ROOT_TREE: u64 = 1;
pub const OBJID_EXTENT_TREE: u64 = 2;
pub const OBJID_CHUNK_TREE: u64 = 3;
pub const OBJID_DEV_TREE: u64 = 4;
pub const OBJID_FS_TREE: u64 = 5;
pub const OBJID_ROOT_TREE_DIR: u64 = 6;
/// First object id available for regular files and directories.
pub const OBJID_FIRST_FREE: u64 = 256;
/// Object id of an FS tree's root directory (the first free id).
pub const OBJID_ROOT_DIR: u64 = 256;
/// Object id carried by every embedded chunk-array key.
pub const OBJID_FIRST_CHUNK_TREE: u64 = 0x100;

// ── Leaf item types ─────────────────────────────────────────────────────────

pub const ITEM_INODE_ITEM: u8 = 0x01;
pub const ITEM_INODE_REF: u8 = 0x0C;
pub const ITEM_XATTR_ITEM: u8 = 0x18;
pub const ITEM_DIR_ITEM: u8 = 0x54;
pub const ITEM_DIR_INDEX: u8 = 0x60;
pub const ITEM_EXTENT_DATA: u8 = 0x6C;
pub const ITEM_ROOT_ITEM: u8 = 0xA8;
pub const ITEM_ROOT_BACKREF: u8 = 0xAC;
pub const ITEM_ROOT_REF: u8 = 0xB0;
pub const ITEM_DEV_ITEM: u8 = 0xE4;
pub const ITEM_CHUNK_ITEM: u8 = 0xE8;

// ── POSIX mode bits (btrfs stores st_mode as u32) ───────────────────────────

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFIFO: u32 = 0o010_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFSOCK: u32 = 0o140_000;

// ── Block group type flags (chunk `type` field) ─────────────────────────────

pub const BLOCK_GROUP_DATA: u64 = 1;
pub const BLOCK_GROUP_SYSTEM: u64 = 2;
pub const BLOCK_GROUP_METADATA: u64 = 4;
pub const BLOCK_GROUP_RAID0: u64 = 8;
pub const BLOCK_GROUP_RAID1: u64 = 16;
pub const BLOCK_GROUP_DUP: u64 = 32;
pub const BLOCK_GROUP_RAID10: u64 = 64;

/// The primary index of every tree: `(objectid, type, offset)`.
///
/// Ordering is lexicographic on the triple, matching the on-disk key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl DiskKey {
    pub const SIZE: usize = 17;

    #[must_use]
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }
}

impl Ord for DiskKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.objectid
            .cmp(&other.objectid)
            .then_with(|| self.item_type.cmp(&other.item_type))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for DiskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{:#x}|{:#04x}|{:#x}}}",
            self.objectid, self.item_type, self.offset
        )
    }
}

/// The name hash stored in DIR_ITEM and XATTR_ITEM key offsets.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    crc32c(name)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Read a `DiskKey` (17 bytes) at `offset`.
#[inline]
pub fn read_disk_key(data: &[u8], offset: usize) -> Result<DiskKey, ParseError> {
    let bytes = ensure_slice(data, offset, DiskKey::SIZE)?;
    Ok(DiskKey {
        objectid: read_le_u64(bytes, 0)?,
        item_type: bytes[8],
        offset: read_le_u64(bytes, 9)?,
    })
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Dump-side stringification ───────────────────────────────────────────────

/// Render a UUID byte array in the canonical 8-4-4-4-12 form.
#[must_use]
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7],
        uuid[8], uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
    )
}

/// Render `st_mode` in `ls -l` style, e.g. `drwxr-xr-x`.
#[must_use]
pub fn mode_to_string(mode: u32) -> String {
    let file_type = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        S_IFREG => '-',
        _ => '?',
    };

    let mut out = String::with_capacity(10);
    out.push(file_type);
    for shift in [6_u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Render chunk/block-group type flags, e.g. `SYSTEM|DUP`.
#[must_use]
pub fn block_group_flags_to_string(flags: u64) -> String {
    const NAMES: [(u64, &str); 7] = [
        (BLOCK_GROUP_DATA, "DATA"),
        (BLOCK_GROUP_SYSTEM, "SYSTEM"),
        (BLOCK_GROUP_METADATA, "METADATA"),
        (BLOCK_GROUP_RAID0, "RAID0"),
        (BLOCK_GROUP_RAID1, "RAID1"),
        (BLOCK_GROUP_DUP, "DUP"),
        (BLOCK_GROUP_RAID10, "RAID10"),
    ];

    let parts: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();

    if parts.is_empty() {
        format!("{flags:#x}")
    } else {
        parts.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc32c_reference_vectors() {
        assert_eq!(crc32c(b""), 0);
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn crc32c_append_chains() {
        let whole = crc32c(b"123456789");
        let head = crc32c(b"1234");
        assert_eq!(crc32c_append(head, b"56789"), whole);
    }

    #[test]
    fn name_hash_is_crc32c() {
        assert_eq!(name_hash(b"hello"), crc32c(b"hello"));
        assert_ne!(name_hash(b"hello"), name_hash(b"hello2"));
    }

    #[test]
    fn key_order_is_lexicographic() {
        let a = DiskKey::new(1, 0x54, 99);
        let b = DiskKey::new(1, 0x60, 0);
        let c = DiskKey::new(2, 0x01, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn read_helpers_decode_little_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_u64(&bytes, 1).is_err());
    }

    #[test]
    fn disk_key_round_trip() {
        let mut bytes = [0_u8; 17];
        bytes[0..8].copy_from_slice(&256_u64.to_le_bytes());
        bytes[8] = ITEM_DIR_ITEM;
        bytes[9..17].copy_from_slice(&0xDEAD_u64.to_le_bytes());
        let key = read_disk_key(&bytes, 0).expect("key");
        assert_eq!(key, DiskKey::new(256, ITEM_DIR_ITEM, 0xDEAD));
    }

    #[test]
    fn magic_is_bhrfs_m() {
        assert_eq!(&SUPER_MAGIC.to_le_bytes(), b"_BHRfS_M");
    }

    #[test]
    fn mode_strings() {
        assert_eq!(mode_to_string(S_IFDIR | 0o755), "drwxr-xr-x");
        assert_eq!(mode_to_string(S_IFREG | 0o644), "-rw-r--r--");
        assert_eq!(mode_to_string(S_IFLNK | 0o777), "lrwxrwxrwx");
    }

    #[test]
    fn block_group_flag_strings() {
        assert_eq!(
            block_group_flags_to_string(BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP),
            "SYSTEM|DUP"
        );
        assert_eq!(block_group_flags_to_string(0x8000_0000), "0x80000000");
    }

    #[test]
    fn uuid_formatting() {
        let uuid = [
            0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        assert_eq!(
            uuid_to_string(&uuid),
            "12345678-9abc-def0-1122-334455667788"
        );
    }

    #[test]
    fn trim_label() {
        assert_eq!(trim_nul_padded(b"lode\0\0\0"), "lode");
        assert_eq!(trim_nul_padded(b""), "");
    }

    proptest! {
        #[test]
        fn key_order_matches_tuple_order(
            a_obj in any::<u64>(), a_ty in any::<u8>(), a_off in any::<u64>(),
            b_obj in any::<u64>(), b_ty in any::<u8>(), b_off in any::<u64>(),
        ) {
            let a = DiskKey::new(a_obj, a_ty, a_off);
            let b = DiskKey::new(b_obj, b_ty, b_off);
            prop_assert_eq!(a.cmp(&b), (a_obj, a_ty, a_off).cmp(&(b_obj, b_ty, b_off)));
        }

        #[test]
        fn read_helpers_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64), off in 0_usize..128) {
            let _ = read_le_u16(&data, off);
            let _ = read_le_u32(&data, off);
            let _ = read_le_u64(&data, off);
            let _ = read_disk_key(&data, off);
        }
    }
}
