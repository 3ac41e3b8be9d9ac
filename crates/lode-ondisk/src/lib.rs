#![forbid(unsafe_code)]
//! Byte-exact decoding of the btrfs on-disk format.
//!
//! Pure functions from byte slices to host-endian records; no I/O. The
//! volume layer feeds these from the block reader and owns all policy
//! (caching, checksum handling, tree traversal).

pub mod item;
pub mod node;
pub mod superblock;

pub use item::{
    ChunkItem, ChunkRecord, Compression, DevItem, DirEntry, ExtentData, ExtentPayload, InodeItem,
    InodeRef, RootItem, RootRef, Stripe, Timespec, parse_chunk_record, parse_dev_item,
    parse_dir_entries, parse_extent_data, parse_inode_item, parse_inode_ref, parse_root_item,
    parse_root_ref, parse_sys_chunk_array,
};
pub use node::{
    Header, KeyPtr, LeafItem, leaf_payload, parse_internal_items, parse_leaf_items,
    verify_node_checksum,
};
pub use superblock::{Superblock, verify_superblock_checksum};

/// Size of a node header on disk.
pub const HEADER_SIZE: usize = 101;
/// Size of a leaf item descriptor (key + offset + size).
pub const ITEM_SIZE: usize = 25;
/// Size of an internal key pointer (key + blockptr + generation).
pub const KEY_PTR_SIZE: usize = 33;
/// Maximum tree depth (levels 0..=7).
pub const MAX_LEVEL: u8 = 7;
/// Fixed prefix of a CHUNK_ITEM payload, before the stripe array.
pub const CHUNK_ITEM_FIXED_SIZE: usize = 48;
/// Size of one stripe record inside a CHUNK_ITEM payload.
pub const STRIPE_SIZE: usize = 32;
/// Size of a DEV_ITEM payload.
pub const DEV_ITEM_SIZE: usize = 98;
/// Size of an INODE_ITEM payload.
pub const INODE_ITEM_SIZE: usize = 160;
/// Size of a ROOT_ITEM payload.
pub const ROOT_ITEM_SIZE: usize = 239;
/// Fixed header of a DIR_ITEM / DIR_INDEX / XATTR_ITEM chain entry.
pub const DIR_ENTRY_HEADER_SIZE: usize = 30;
/// Fixed prefix of an EXTENT_DATA payload.
pub const EXTENT_DATA_FIXED_SIZE: usize = 21;
/// Size of the non-inline tail of an EXTENT_DATA payload.
pub const EXTENT_DATA_REGULAR_TAIL: usize = 32;
