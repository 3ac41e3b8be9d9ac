//! Leaf item payload decoding: inodes, directory entries, extents, roots,
//! devices, and chunks.

use crate::{
    CHUNK_ITEM_FIXED_SIZE, DEV_ITEM_SIZE, DIR_ENTRY_HEADER_SIZE, EXTENT_DATA_FIXED_SIZE,
    EXTENT_DATA_REGULAR_TAIL, INODE_ITEM_SIZE, ROOT_ITEM_SIZE, STRIPE_SIZE,
};
use lode_types::{
    DiskKey, OBJID_FIRST_CHUNK_TREE, ITEM_CHUNK_ITEM, ParseError, read_disk_key, read_fixed,
    read_le_i64, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// One on-disk timestamp: seconds since the epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

fn read_timespec(data: &[u8], offset: usize) -> Result<Timespec, ParseError> {
    Ok(Timespec {
        sec: read_le_i64(data, offset)?,
        nsec: read_le_u32(data, offset + 8)?,
    })
}

/// INODE_ITEM (0x01): the fixed 160-byte inode record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub blocks: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

pub fn parse_inode_item(data: &[u8]) -> Result<InodeItem, ParseError> {
    if data.len() < INODE_ITEM_SIZE {
        return Err(ParseError::InsufficientData {
            needed: INODE_ITEM_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    Ok(InodeItem {
        generation: read_le_u64(data, 0)?,
        transid: read_le_u64(data, 8)?,
        size: read_le_u64(data, 16)?,
        blocks: read_le_u64(data, 24)?,
        block_group: read_le_u64(data, 32)?,
        nlink: read_le_u32(data, 40)?,
        uid: read_le_u32(data, 44)?,
        gid: read_le_u32(data, 48)?,
        mode: read_le_u32(data, 52)?,
        rdev: read_le_u64(data, 56)?,
        flags: read_le_u64(data, 64)?,
        sequence: read_le_u64(data, 72)?,
        atime: read_timespec(data, 112)?,
        ctime: read_timespec(data, 124)?,
        mtime: read_timespec(data, 136)?,
        otime: read_timespec(data, 148)?,
    })
}

/// INODE_REF (0x0C): back-reference from an inode to its name in a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

pub fn parse_inode_ref(data: &[u8]) -> Result<InodeRef, ParseError> {
    let index = read_le_u64(data, 0)?;
    let name_len = usize::from(read_le_u16(data, 8)?);
    let end = 10_usize
        .checked_add(name_len)
        .ok_or(ParseError::InvalidField {
            field: "inode_ref.name_len",
            reason: "overflow",
        })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: end,
            offset: 10,
            actual: data.len(),
        });
    }
    Ok(InodeRef {
        index,
        name: data[10..end].to_vec(),
    })
}

/// One decoded entry from a DIR_ITEM / DIR_INDEX / XATTR_ITEM payload.
///
/// Several entries may share one key (hash collisions); they are packed
/// back-to-back within the payload and all decoded by
/// [`parse_dir_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Key of the child this entry points at.
    pub child: DiskKey,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
    /// xattr value bytes (`m` in the on-disk record); empty for plain
    /// directory entries.
    pub data: Vec<u8>,
}

/// Decode a chain of directory entries.
///
/// Iteration covers the entire payload; an entry whose declared name and
/// data lengths would extend past the payload is a format error and no
/// entry is emitted for it.
pub fn parse_dir_entries(data: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let mut out = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + DIR_ENTRY_HEADER_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DIR_ENTRY_HEADER_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }

        let child = read_disk_key(data, cur)?;
        let transid = read_le_u64(data, cur + 17)?;
        let data_len = usize::from(read_le_u16(data, cur + 25)?);
        let name_len = usize::from(read_le_u16(data, cur + 27)?);
        let file_type = data[cur + 29];

        let name_start = cur + DIR_ENTRY_HEADER_SIZE;
        let name_end = name_start
            .checked_add(name_len)
            .ok_or(ParseError::InvalidField {
                field: "dir_entry.name_len",
                reason: "overflow",
            })?;
        let entry_end = name_end
            .checked_add(data_len)
            .ok_or(ParseError::InvalidField {
                field: "dir_entry.data_len",
                reason: "overflow",
            })?;
        if entry_end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: entry_end,
                offset: cur,
                actual: data.len(),
            });
        }

        out.push(DirEntry {
            child,
            transid,
            file_type,
            name: data[name_start..name_end].to_vec(),
            data: data[name_end..entry_end].to_vec(),
        });

        cur = entry_end;
    }

    Ok(out)
}

/// Extent payload compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zlib,
    Lzo,
    Unknown(u8),
}

impl From<u8> for Compression {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Zlib,
            2 => Self::Lzo,
            other => Self::Unknown(other),
        }
    }
}

/// EXTENT_DATA payload body: inline bytes or an on-disk reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentPayload {
    /// File bytes stored directly in the leaf.
    Inline { data: Vec<u8> },
    /// Regular (1) or preallocated (2) extent referencing logical bytes.
    Regular {
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
    },
}

/// EXTENT_DATA (0x6C): one file extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentData {
    pub generation: u64,
    /// Decoded (uncompressed) byte length of this extent.
    pub size: u64,
    pub compression: Compression,
    pub encryption: u8,
    pub other_encoding: u16,
    /// Raw type byte: 0 = inline, 1 = regular, 2 = prealloc.
    pub extent_type: u8,
    pub payload: ExtentPayload,
}

impl ExtentData {
    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, ExtentPayload::Inline { .. })
    }
}

pub fn parse_extent_data(data: &[u8]) -> Result<ExtentData, ParseError> {
    if data.len() < EXTENT_DATA_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: EXTENT_DATA_FIXED_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    let generation = read_le_u64(data, 0)?;
    let size = read_le_u64(data, 8)?;
    let compression = Compression::from(data[16]);
    let encryption = data[17];
    let other_encoding = read_le_u16(data, 18)?;
    let extent_type = data[20];

    let payload = match extent_type {
        0 => ExtentPayload::Inline {
            data: data[EXTENT_DATA_FIXED_SIZE..].to_vec(),
        },
        1 | 2 => {
            if data.len() < EXTENT_DATA_FIXED_SIZE + EXTENT_DATA_REGULAR_TAIL {
                return Err(ParseError::InsufficientData {
                    needed: EXTENT_DATA_FIXED_SIZE + EXTENT_DATA_REGULAR_TAIL,
                    offset: 0,
                    actual: data.len(),
                });
            }
            ExtentPayload::Regular {
                disk_bytenr: read_le_u64(data, 21)?,
                disk_num_bytes: read_le_u64(data, 29)?,
                offset: read_le_u64(data, 37)?,
                num_bytes: read_le_u64(data, 45)?,
            }
        }
        _ => {
            return Err(ParseError::InvalidField {
                field: "extent_data.type",
                reason: "unknown extent type",
            });
        }
    };

    Ok(ExtentData {
        generation,
        size,
        compression,
        encryption,
        other_encoding,
        extent_type,
        payload,
    })
}

/// ROOT_ITEM (0xA8): one tree root record in the root tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub expected_generation: u64,
    pub objid: u64,
    /// Logical address of this tree's root node.
    pub root_node_block_num: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_gen_snapshot: u64,
    pub flags: u64,
    pub num_refs: u32,
    pub drop_progress: DiskKey,
    pub drop_level: u8,
    pub root_level: u8,
}

pub fn parse_root_item(data: &[u8]) -> Result<RootItem, ParseError> {
    if data.len() < ROOT_ITEM_SIZE {
        return Err(ParseError::InsufficientData {
            needed: ROOT_ITEM_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    Ok(RootItem {
        inode: parse_inode_item(&data[0..INODE_ITEM_SIZE])?,
        expected_generation: read_le_u64(data, 160)?,
        objid: read_le_u64(data, 168)?,
        root_node_block_num: read_le_u64(data, 176)?,
        byte_limit: read_le_u64(data, 184)?,
        bytes_used: read_le_u64(data, 192)?,
        last_gen_snapshot: read_le_u64(data, 200)?,
        flags: read_le_u64(data, 208)?,
        num_refs: read_le_u32(data, 216)?,
        drop_progress: read_disk_key(data, 220)?,
        drop_level: data[237],
        root_level: data[238],
    })
}

/// ROOT_REF / ROOT_BACKREF (0xB0 / 0xAC): subvolume naming records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

pub fn parse_root_ref(data: &[u8]) -> Result<RootRef, ParseError> {
    let dirid = read_le_u64(data, 0)?;
    let sequence = read_le_u64(data, 8)?;
    let name_len = usize::from(read_le_u16(data, 16)?);
    let end = 18_usize
        .checked_add(name_len)
        .ok_or(ParseError::InvalidField {
            field: "root_ref.name_len",
            reason: "overflow",
        })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: end,
            offset: 18,
            actual: data.len(),
        });
    }
    Ok(RootRef {
        dirid,
        sequence,
        name: data[18..end].to_vec(),
    })
}

/// DEV_ITEM (0xE4): the fixed 98-byte per-device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub dev_id: u64,
    pub num_bytes: u64,
    pub num_bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub min_io_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub dev_uuid: [u8; 16],
    pub fs_uuid: [u8; 16],
}

pub fn parse_dev_item(data: &[u8]) -> Result<DevItem, ParseError> {
    if data.len() < DEV_ITEM_SIZE {
        return Err(ParseError::InsufficientData {
            needed: DEV_ITEM_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    Ok(DevItem {
        dev_id: read_le_u64(data, 0)?,
        num_bytes: read_le_u64(data, 8)?,
        num_bytes_used: read_le_u64(data, 16)?,
        io_align: read_le_u32(data, 24)?,
        io_width: read_le_u32(data, 28)?,
        min_io_size: read_le_u32(data, 32)?,
        dev_type: read_le_u64(data, 36)?,
        generation: read_le_u64(data, 44)?,
        start_offset: read_le_u64(data, 52)?,
        dev_group: read_le_u32(data, 60)?,
        seek_speed: data[64],
        bandwidth: data[65],
        dev_uuid: read_fixed::<16>(data, 66)?,
        fs_uuid: read_fixed::<16>(data, 82)?,
    })
}

/// One stripe: a device-side backing range for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub dev_id: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

fn parse_stripe(data: &[u8], offset: usize) -> Result<Stripe, ParseError> {
    Ok(Stripe {
        dev_id: read_le_u64(data, offset)?,
        offset: read_le_u64(data, offset + 8)?,
        dev_uuid: read_fixed::<16>(data, offset + 16)?,
    })
}

/// CHUNK_ITEM (0xE8) fixed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    /// Length of the logical range this chunk covers.
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub min_io_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
}

/// A fully decoded chunk: fixed prefix plus its stripe array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub item: ChunkItem,
    pub stripes: Vec<Stripe>,
}

/// Decode one CHUNK_ITEM payload, enforcing the `48 + 32·numStripes` size
/// law.
pub fn parse_chunk_record(data: &[u8]) -> Result<ChunkRecord, ParseError> {
    if data.len() < CHUNK_ITEM_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: CHUNK_ITEM_FIXED_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    let item = ChunkItem {
        length: read_le_u64(data, 0)?,
        owner: read_le_u64(data, 8)?,
        stripe_len: read_le_u64(data, 16)?,
        chunk_type: read_le_u64(data, 24)?,
        io_align: read_le_u32(data, 32)?,
        io_width: read_le_u32(data, 36)?,
        min_io_size: read_le_u32(data, 40)?,
        num_stripes: read_le_u16(data, 44)?,
        sub_stripes: read_le_u16(data, 46)?,
    };

    if item.num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripe_bytes = data.len() - CHUNK_ITEM_FIXED_SIZE;
    if stripe_bytes % STRIPE_SIZE != 0
        || stripe_bytes != usize::from(item.num_stripes) * STRIPE_SIZE
    {
        return Err(ParseError::InvalidField {
            field: "chunk_item",
            reason: "payload size does not match the declared stripe count",
        });
    }

    let mut stripes = Vec::with_capacity(usize::from(item.num_stripes));
    for idx in 0..usize::from(item.num_stripes) {
        stripes.push(parse_stripe(data, CHUNK_ITEM_FIXED_SIZE + idx * STRIPE_SIZE)?);
    }

    Ok(ChunkRecord { item, stripes })
}

/// Parse the superblock's embedded chunk array: a packed sequence of
/// `(DiskKey, ChunkItem, stripes…)` records.
///
/// Every key must carry `{objectid: FIRST_CHUNK_TREE, type: CHUNK_ITEM}`;
/// a violating record is fatal because nothing else can be addressed until
/// the bootstrap mapping is trusted.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<(DiskKey, ChunkRecord)>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let key = read_disk_key(data, cur)?;
        if key.objectid != OBJID_FIRST_CHUNK_TREE || key.item_type != ITEM_CHUNK_ITEM {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "embedded key is not a FIRST_CHUNK_TREE chunk item",
            });
        }
        cur += DiskKey::SIZE;

        if cur + CHUNK_ITEM_FIXED_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: CHUNK_ITEM_FIXED_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let num_stripes = usize::from(read_le_u16(data, cur + 44)?);
        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }
        let record_len = CHUNK_ITEM_FIXED_SIZE + num_stripes * STRIPE_SIZE;
        let end = cur.checked_add(record_len).ok_or(ParseError::InvalidField {
            field: "sys_chunk_array",
            reason: "record length overflow",
        })?;
        if end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: record_len,
                offset: cur,
                actual: data.len() - cur,
            });
        }

        entries.push((key, parse_chunk_record(&data[cur..end])?));
        cur = end;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_types::{S_IFDIR, S_IFREG};
    use proptest::prelude::*;

    pub(crate) fn inode_bytes(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
        let mut data = vec![0_u8; INODE_ITEM_SIZE];
        data[16..24].copy_from_slice(&size.to_le_bytes());
        data[40..44].copy_from_slice(&nlink.to_le_bytes());
        data[44..48].copy_from_slice(&1000_u32.to_le_bytes());
        data[48..52].copy_from_slice(&1000_u32.to_le_bytes());
        data[52..56].copy_from_slice(&mode.to_le_bytes());
        data[112..120].copy_from_slice(&1_700_000_000_i64.to_le_bytes());
        data[120..124].copy_from_slice(&42_u32.to_le_bytes());
        data
    }

    pub(crate) fn dir_entry_bytes(child: DiskKey, file_type: u8, name: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&child.objectid.to_le_bytes());
        data.push(child.item_type);
        data.extend_from_slice(&child.offset.to_le_bytes());
        data.extend_from_slice(&0_u64.to_le_bytes()); // transid
        data.extend_from_slice(&0_u16.to_le_bytes()); // data_len
        data.extend_from_slice(&u16::try_from(name.len()).expect("short name").to_le_bytes());
        data.push(file_type);
        data.extend_from_slice(name);
        data
    }

    #[test]
    fn inode_item_decodes() {
        let inode = parse_inode_item(&inode_bytes(S_IFREG | 0o644, 1234, 1)).expect("inode");
        assert_eq!(inode.size, 1234);
        assert_eq!(inode.mode & 0o170_000, S_IFREG);
        assert_eq!(inode.uid, 1000);
        assert_eq!(inode.atime.sec, 1_700_000_000);
        assert_eq!(inode.atime.nsec, 42);
    }

    #[test]
    fn inode_ref_decodes() {
        let mut data = Vec::new();
        data.extend_from_slice(&3_u64.to_le_bytes());
        data.extend_from_slice(&5_u16.to_le_bytes());
        data.extend_from_slice(b"hello");
        let iref = parse_inode_ref(&data).expect("inode ref");
        assert_eq!(iref.index, 3);
        assert_eq!(iref.name, b"hello");

        data.truncate(12);
        assert!(parse_inode_ref(&data).is_err());
    }

    #[test]
    fn dir_entry_chain_decodes_back_to_back() {
        let mut chain = dir_entry_bytes(DiskKey::new(257, 0x01, 0), 1, b"a.txt");
        chain.extend(dir_entry_bytes(DiskKey::new(258, 0x01, 0), 2, b"subdir"));

        let entries = parse_dir_entries(&chain).expect("chain");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].child.objectid, 257);
        assert_eq!(entries[0].name, b"a.txt");
        assert_eq!(entries[1].child.objectid, 258);
        assert_eq!(entries[1].file_type, 2);
    }

    #[test]
    fn dir_entry_chain_rejects_overrun() {
        let mut chain = dir_entry_bytes(DiskKey::new(257, 0x01, 0), 1, b"a.txt");
        // Declare a longer name than the payload holds.
        chain[27..29].copy_from_slice(&200_u16.to_le_bytes());
        assert!(parse_dir_entries(&chain).is_err());
    }

    #[test]
    fn dir_entry_xattr_carries_data() {
        let mut entry = dir_entry_bytes(DiskKey::new(0, 0, 0), 8, b"user.tag");
        entry[25..27].copy_from_slice(&4_u16.to_le_bytes());
        entry.extend_from_slice(b"blue");
        let entries = parse_dir_entries(&entry).expect("xattr");
        assert_eq!(entries[0].name, b"user.tag");
        assert_eq!(entries[0].data, b"blue");
    }

    #[test]
    fn extent_data_inline() {
        let mut data = vec![0_u8; EXTENT_DATA_FIXED_SIZE];
        data[8..16].copy_from_slice(&3_u64.to_le_bytes());
        data[20] = 0;
        data.extend_from_slice(b"abc");
        let ext = parse_extent_data(&data).expect("inline extent");
        assert!(ext.is_inline());
        assert_eq!(ext.size, 3);
        assert_eq!(
            ext.payload,
            ExtentPayload::Inline {
                data: b"abc".to_vec()
            }
        );
    }

    #[test]
    fn extent_data_regular() {
        let mut data = vec![0_u8; EXTENT_DATA_FIXED_SIZE + EXTENT_DATA_REGULAR_TAIL];
        data[8..16].copy_from_slice(&4096_u64.to_le_bytes());
        data[16] = 1; // zlib
        data[20] = 1; // regular
        data[21..29].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        data[29..37].copy_from_slice(&4096_u64.to_le_bytes());
        data[45..53].copy_from_slice(&4096_u64.to_le_bytes());

        let ext = parse_extent_data(&data).expect("regular extent");
        assert_eq!(ext.compression, Compression::Zlib);
        assert_eq!(
            ext.payload,
            ExtentPayload::Regular {
                disk_bytenr: 0x40_0000,
                disk_num_bytes: 4096,
                offset: 0,
                num_bytes: 4096,
            }
        );
    }

    #[test]
    fn extent_data_rejects_unknown_type() {
        let mut data = vec![0_u8; EXTENT_DATA_FIXED_SIZE];
        data[20] = 9;
        assert!(matches!(
            parse_extent_data(&data).unwrap_err(),
            ParseError::InvalidField {
                field: "extent_data.type",
                ..
            }
        ));
    }

    #[test]
    fn root_item_decodes() {
        let mut data = vec![0_u8; ROOT_ITEM_SIZE];
        data[..INODE_ITEM_SIZE].copy_from_slice(&inode_bytes(S_IFDIR | 0o755, 0, 1));
        data[168..176].copy_from_slice(&5_u64.to_le_bytes());
        data[176..184].copy_from_slice(&0x80_0000_u64.to_le_bytes());
        data[216..220].copy_from_slice(&1_u32.to_le_bytes());
        data[238] = 0;

        let root = parse_root_item(&data).expect("root item");
        assert_eq!(root.objid, 5);
        assert_eq!(root.root_node_block_num, 0x80_0000);
        assert_eq!(root.num_refs, 1);
        assert_eq!(root.inode.mode & 0o170_000, S_IFDIR);
    }

    #[test]
    fn root_ref_decodes() {
        let mut data = Vec::new();
        data.extend_from_slice(&6_u64.to_le_bytes());
        data.extend_from_slice(&2_u64.to_le_bytes());
        data.extend_from_slice(&4_u16.to_le_bytes());
        data.extend_from_slice(b"snap");
        let rref = parse_root_ref(&data).expect("root ref");
        assert_eq!(rref.dirid, 6);
        assert_eq!(rref.sequence, 2);
        assert_eq!(rref.name, b"snap");
    }

    pub(crate) fn chunk_record_bytes(length: u64, num_stripes: u16, stripe_offset: u64) -> Vec<u8> {
        let mut data = vec![0_u8; CHUNK_ITEM_FIXED_SIZE];
        data[0..8].copy_from_slice(&length.to_le_bytes());
        data[8..16].copy_from_slice(&2_u64.to_le_bytes());
        data[16..24].copy_from_slice(&0x1_0000_u64.to_le_bytes());
        data[24..32].copy_from_slice(&2_u64.to_le_bytes()); // SYSTEM
        data[44..46].copy_from_slice(&num_stripes.to_le_bytes());
        for idx in 0..num_stripes {
            let mut stripe = vec![0_u8; STRIPE_SIZE];
            stripe[0..8].copy_from_slice(&1_u64.to_le_bytes());
            stripe[8..16].copy_from_slice(&(stripe_offset + u64::from(idx)).to_le_bytes());
            data.extend_from_slice(&stripe);
        }
        data
    }

    #[test]
    fn chunk_record_size_law() {
        let good = chunk_record_bytes(0x80_0000, 2, 0x10_0000);
        let record = parse_chunk_record(&good).expect("chunk record");
        assert_eq!(record.item.length, 0x80_0000);
        assert_eq!(record.stripes.len(), 2);
        assert_eq!(record.stripes[0].offset, 0x10_0000);

        let mut truncated = good.clone();
        truncated.truncate(good.len() - 1);
        assert!(parse_chunk_record(&truncated).is_err());

        let mut extra = good;
        extra.extend_from_slice(&[0_u8; STRIPE_SIZE]);
        assert!(parse_chunk_record(&extra).is_err());
    }

    #[test]
    fn dev_item_decodes() {
        let mut data = vec![0_u8; DEV_ITEM_SIZE];
        data[0..8].copy_from_slice(&1_u64.to_le_bytes());
        data[8..16].copy_from_slice(&(1_u64 << 30).to_le_bytes());
        data[60..64].copy_from_slice(&7_u32.to_le_bytes());
        data[66] = 0xAB;
        let dev = parse_dev_item(&data).expect("dev item");
        assert_eq!(dev.dev_id, 1);
        assert_eq!(dev.num_bytes, 1 << 30);
        assert_eq!(dev.dev_group, 7);
        assert_eq!(dev.dev_uuid[0], 0xAB);
    }

    #[test]
    fn sys_chunk_array_round_trip() {
        let mut array = Vec::new();
        for logical in [0_u64, 0x80_0000] {
            array.extend_from_slice(&OBJID_FIRST_CHUNK_TREE.to_le_bytes());
            array.push(ITEM_CHUNK_ITEM);
            array.extend_from_slice(&logical.to_le_bytes());
            array.extend_from_slice(&chunk_record_bytes(0x80_0000, 1, 0x10_0000));
        }

        let entries = parse_sys_chunk_array(&array).expect("sys chunk array");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.offset, 0);
        assert_eq!(entries[1].0.offset, 0x80_0000);
        assert_eq!(entries[1].1.item.length, 0x80_0000);
    }

    #[test]
    fn sys_chunk_array_rejects_foreign_keys() {
        let mut array = Vec::new();
        array.extend_from_slice(&1_u64.to_le_bytes()); // wrong objectid
        array.push(ITEM_CHUNK_ITEM);
        array.extend_from_slice(&0_u64.to_le_bytes());
        array.extend_from_slice(&chunk_record_bytes(0x80_0000, 1, 0));
        assert!(matches!(
            parse_sys_chunk_array(&array).unwrap_err(),
            ParseError::InvalidField {
                field: "sys_chunk_array",
                ..
            }
        ));
    }

    #[test]
    fn sys_chunk_array_empty_is_valid() {
        assert!(parse_sys_chunk_array(&[]).expect("empty").is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn payload_parsers_never_panic(data in proptest::collection::vec(any::<u8>(), 0..=512)) {
            let _ = parse_inode_item(&data);
            let _ = parse_inode_ref(&data);
            let _ = parse_dir_entries(&data);
            let _ = parse_extent_data(&data);
            let _ = parse_root_item(&data);
            let _ = parse_root_ref(&data);
            let _ = parse_dev_item(&data);
            let _ = parse_chunk_record(&data);
            let _ = parse_sys_chunk_array(&data);
        }

        #[test]
        fn dir_chain_covers_payload_exactly(names in proptest::collection::vec("[a-z]{1,12}", 1..6)) {
            let mut chain = Vec::new();
            for (idx, name) in names.iter().enumerate() {
                chain.extend(dir_entry_bytes(
                    DiskKey::new(257 + idx as u64, 0x01, 0),
                    1,
                    name.as_bytes(),
                ));
            }
            let entries = parse_dir_entries(&chain).expect("legal chain");
            prop_assert_eq!(entries.len(), names.len());
            let total: usize = entries
                .iter()
                .map(|e| DIR_ENTRY_HEADER_SIZE + e.name.len() + e.data.len())
                .sum();
            prop_assert_eq!(total, chain.len());
        }
    }
}
