#![forbid(unsafe_code)]
//! Synthetic btrfs image construction for tests.
//!
//! Builds byte-exact volumes in memory: superblock copies with sealed
//! checksums, an embedded bootstrap chunk array, and checksummed tree
//! nodes placed at chosen addresses. The conformance suite drives the
//! volume engine against these images end-to-end.

use lode_block::MemByteDevice;
use lode_ondisk::{
    CHUNK_ITEM_FIXED_SIZE, DEV_ITEM_SIZE, DIR_ENTRY_HEADER_SIZE, EXTENT_DATA_FIXED_SIZE,
    EXTENT_DATA_REGULAR_TAIL, HEADER_SIZE, INODE_ITEM_SIZE, ITEM_SIZE, KEY_PTR_SIZE,
    ROOT_ITEM_SIZE, STRIPE_SIZE,
};
use lode_types::{
    CSUM_SIZE, DiskKey, ITEM_CHUNK_ITEM, ITEM_DIR_ITEM, OBJID_FIRST_CHUNK_TREE, SUPER_INFO_SIZE,
    SUPER_LABEL_OFFSET, SUPER_MAGIC, SUPERBLOCK_PADDRS, SYS_CHUNK_ARRAY_OFFSET, crc32c, name_hash,
};

/// Node size used by the standard fixtures (the btrfs default).
pub const DEFAULT_NODESIZE: u32 = 16384;

/// One chunk in a synthetic layout: a logical range backed at `physical`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpec {
    pub logical: u64,
    pub length: u64,
    pub physical: u64,
}

impl ChunkSpec {
    /// A chunk whose logical and physical ranges coincide.
    #[must_use]
    pub fn identity(logical: u64, length: u64) -> Self {
        Self {
            logical,
            length,
            physical: logical,
        }
    }
}

/// Parameters for one superblock copy.
#[derive(Debug, Clone)]
pub struct SuperblockSpec {
    pub generation: u64,
    /// Logical address of the root-tree root node.
    pub root: u64,
    /// Logical address of the chunk-tree root node.
    pub chunk_root: u64,
    pub nodesize: u32,
    pub num_devices: u64,
    pub label: String,
    /// Bootstrap chunks embedded in the superblock.
    pub sys_chunks: Vec<ChunkSpec>,
}

impl Default for SuperblockSpec {
    fn default() -> Self {
        Self {
            generation: 1,
            root: 0,
            chunk_root: 0,
            nodesize: DEFAULT_NODESIZE,
            num_devices: 1,
            label: "lode-test".to_owned(),
            sys_chunks: Vec::new(),
        }
    }
}

// ── Record serializers ──────────────────────────────────────────────────────

/// Serialize a CHUNK_ITEM payload with a single stripe on device 1.
#[must_use]
pub fn chunk_item_record(spec: &ChunkSpec) -> Vec<u8> {
    let mut data = vec![0_u8; CHUNK_ITEM_FIXED_SIZE + STRIPE_SIZE];
    data[0..8].copy_from_slice(&spec.length.to_le_bytes());
    data[8..16].copy_from_slice(&2_u64.to_le_bytes()); // owner: extent tree
    data[16..24].copy_from_slice(&0x1_0000_u64.to_le_bytes()); // stripe_len
    data[24..32].copy_from_slice(&2_u64.to_le_bytes()); // SYSTEM
    data[32..36].copy_from_slice(&4096_u32.to_le_bytes());
    data[36..40].copy_from_slice(&4096_u32.to_le_bytes());
    data[40..44].copy_from_slice(&4096_u32.to_le_bytes());
    data[44..46].copy_from_slice(&1_u16.to_le_bytes()); // num_stripes
    let stripe = CHUNK_ITEM_FIXED_SIZE;
    data[stripe..stripe + 8].copy_from_slice(&1_u64.to_le_bytes()); // devid
    data[stripe + 8..stripe + 16].copy_from_slice(&spec.physical.to_le_bytes());
    data
}

/// The chunk-tree key of a chunk record at `logical`.
#[must_use]
pub fn chunk_key(logical: u64) -> DiskKey {
    DiskKey::new(OBJID_FIRST_CHUNK_TREE, ITEM_CHUNK_ITEM, logical)
}

/// Serialize a DEV_ITEM payload.
#[must_use]
pub fn dev_item_record(dev_id: u64, num_bytes: u64) -> Vec<u8> {
    let mut data = vec![0_u8; DEV_ITEM_SIZE];
    data[0..8].copy_from_slice(&dev_id.to_le_bytes());
    data[8..16].copy_from_slice(&num_bytes.to_le_bytes());
    data[24..28].copy_from_slice(&4096_u32.to_le_bytes());
    data[28..32].copy_from_slice(&4096_u32.to_le_bytes());
    data[32..36].copy_from_slice(&4096_u32.to_le_bytes());
    data
}

/// Serialize an INODE_ITEM payload.
#[must_use]
pub fn inode_record(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
    let mut data = vec![0_u8; INODE_ITEM_SIZE];
    data[16..24].copy_from_slice(&size.to_le_bytes());
    data[40..44].copy_from_slice(&nlink.to_le_bytes());
    data[44..48].copy_from_slice(&1000_u32.to_le_bytes());
    data[48..52].copy_from_slice(&1000_u32.to_le_bytes());
    data[52..56].copy_from_slice(&mode.to_le_bytes());
    data[112..120].copy_from_slice(&1_600_000_000_i64.to_le_bytes());
    data[124..132].copy_from_slice(&1_600_000_000_i64.to_le_bytes());
    data[136..144].copy_from_slice(&1_600_000_000_i64.to_le_bytes());
    data
}

/// Serialize one DIR_ITEM / DIR_INDEX chain entry.
#[must_use]
pub fn dir_entry_record(child: u64, file_type: u8, name: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(DIR_ENTRY_HEADER_SIZE + name.len());
    data.extend_from_slice(&child.to_le_bytes());
    data.push(lode_types::ITEM_INODE_ITEM);
    data.extend_from_slice(&0_u64.to_le_bytes()); // child key offset
    data.extend_from_slice(&0_u64.to_le_bytes()); // transid
    data.extend_from_slice(&0_u16.to_le_bytes()); // data_len
    data.extend_from_slice(
        &u16::try_from(name.len())
            .expect("fixture names fit u16")
            .to_le_bytes(),
    );
    data.push(file_type);
    data.extend_from_slice(name);
    data
}

/// The key of a DIR_ITEM for `name` under `parent`.
#[must_use]
pub fn dir_key(parent: u64, name: &[u8]) -> DiskKey {
    DiskKey::new(parent, ITEM_DIR_ITEM, u64::from(name_hash(name)))
}

/// Serialize a regular (non-inline) EXTENT_DATA payload.
#[must_use]
pub fn extent_regular_record(disk_bytenr: u64, num_bytes: u64) -> Vec<u8> {
    let mut data = vec![0_u8; EXTENT_DATA_FIXED_SIZE + EXTENT_DATA_REGULAR_TAIL];
    data[8..16].copy_from_slice(&num_bytes.to_le_bytes());
    data[20] = 1; // regular
    data[21..29].copy_from_slice(&disk_bytenr.to_le_bytes());
    data[29..37].copy_from_slice(&num_bytes.to_le_bytes());
    data[45..53].copy_from_slice(&num_bytes.to_le_bytes());
    data
}

/// Serialize an inline EXTENT_DATA payload.
#[must_use]
pub fn extent_inline_record(content: &[u8]) -> Vec<u8> {
    let mut data = vec![0_u8; EXTENT_DATA_FIXED_SIZE];
    data[8..16].copy_from_slice(&(content.len() as u64).to_le_bytes());
    data.extend_from_slice(content);
    data
}

/// Serialize a ROOT_ITEM payload pointing at `root_block`.
#[must_use]
pub fn root_item_record(root_block: u64, level: u8) -> Vec<u8> {
    let mut data = vec![0_u8; ROOT_ITEM_SIZE];
    data[..INODE_ITEM_SIZE].copy_from_slice(&inode_record(0o040_755, 0, 1));
    data[168..176].copy_from_slice(&0_u64.to_le_bytes());
    data[176..184].copy_from_slice(&root_block.to_le_bytes());
    data[216..220].copy_from_slice(&1_u32.to_le_bytes());
    data[238] = level;
    data
}

// ── Image assembly ──────────────────────────────────────────────────────────

/// Assembles a byte-exact volume image in memory.
pub struct ImageBuilder {
    nodesize: u32,
    image: Vec<u8>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::with_nodesize(len, DEFAULT_NODESIZE)
    }

    #[must_use]
    pub fn with_nodesize(len: usize, nodesize: u32) -> Self {
        Self {
            nodesize,
            image: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    /// Write superblock copy `copy` (0-based index into the fixed offsets),
    /// sealing its checksum.
    pub fn superblock(&mut self, copy: usize, spec: &SuperblockSpec) -> &mut Self {
        let paddr = SUPERBLOCK_PADDRS[copy];
        let mut sb = vec![0_u8; SUPER_INFO_SIZE];

        sb[0x30..0x38].copy_from_slice(&paddr.to_le_bytes());
        sb[0x40..0x48].copy_from_slice(&SUPER_MAGIC.to_le_bytes());
        sb[0x48..0x50].copy_from_slice(&spec.generation.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&spec.root.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&spec.chunk_root.to_le_bytes());
        sb[0x70..0x78].copy_from_slice(&(self.image.len() as u64).to_le_bytes());
        sb[0x80..0x88].copy_from_slice(&6_u64.to_le_bytes());
        sb[0x88..0x90].copy_from_slice(&spec.num_devices.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&spec.nodesize.to_le_bytes());
        sb[0x98..0x9C].copy_from_slice(&spec.nodesize.to_le_bytes());
        sb[0x9C..0xA0].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0xC9..0xC9 + DEV_ITEM_SIZE]
            .copy_from_slice(&dev_item_record(1, self.image.len() as u64));

        let label = spec.label.as_bytes();
        sb[SUPER_LABEL_OFFSET..SUPER_LABEL_OFFSET + label.len()].copy_from_slice(label);

        let mut array = Vec::new();
        for chunk in &spec.sys_chunks {
            let key = chunk_key(chunk.logical);
            array.extend_from_slice(&key.objectid.to_le_bytes());
            array.push(key.item_type);
            array.extend_from_slice(&key.offset.to_le_bytes());
            array.extend_from_slice(&chunk_item_record(chunk));
        }
        sb[0xA0..0xA4].copy_from_slice(&(array.len() as u32).to_le_bytes());
        sb[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + array.len()].copy_from_slice(&array);

        let csum = crc32c(&sb[CSUM_SIZE..]);
        sb[0..4].copy_from_slice(&csum.to_le_bytes());

        let base = paddr as usize;
        self.image[base..base + SUPER_INFO_SIZE].copy_from_slice(&sb);
        self
    }

    /// Place a checksummed leaf node at physical `addr`.
    ///
    /// Items are sorted into canonical key order; payloads are packed from
    /// the node's tail toward the item table, as on disk.
    pub fn leaf(&mut self, addr: u64, tree: u64, mut items: Vec<(DiskKey, Vec<u8>)>) -> &mut Self {
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let nodesize = self.nodesize as usize;
        let mut block = vec![0_u8; nodesize];
        write_header(&mut block, addr, tree, items.len() as u32, 0);

        let mut payload_cursor = nodesize - HEADER_SIZE;
        for (idx, (key, payload)) in items.iter().enumerate() {
            payload_cursor = payload_cursor
                .checked_sub(payload.len())
                .expect("fixture payloads fit the node");
            let base = HEADER_SIZE + idx * ITEM_SIZE;
            assert!(
                base + ITEM_SIZE <= HEADER_SIZE + payload_cursor,
                "fixture item table collides with payloads"
            );
            write_key(&mut block, base, *key);
            block[base + 17..base + 21].copy_from_slice(&(payload_cursor as u32).to_le_bytes());
            block[base + 21..base + 25].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            let abs = HEADER_SIZE + payload_cursor;
            block[abs..abs + payload.len()].copy_from_slice(payload);
        }

        self.seal_and_place(addr, block)
    }

    /// Place a checksummed internal node at physical `addr`.
    pub fn internal(
        &mut self,
        addr: u64,
        tree: u64,
        level: u8,
        mut ptrs: Vec<(DiskKey, u64)>,
    ) -> &mut Self {
        assert!(level > 0, "internal nodes sit above level 0");
        ptrs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut block = vec![0_u8; self.nodesize as usize];
        write_header(&mut block, addr, tree, ptrs.len() as u32, level);

        for (idx, (key, child)) in ptrs.iter().enumerate() {
            let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
            write_key(&mut block, base, *key);
            block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
            block[base + 25..base + 33].copy_from_slice(&1_u64.to_le_bytes());
        }

        self.seal_and_place(addr, block)
    }

    /// Flip one byte, breaking whatever checksum covers it.
    pub fn corrupt_byte(&mut self, addr: u64) -> &mut Self {
        let idx = addr as usize;
        self.image[idx] ^= 0xFF;
        self
    }

    fn seal_and_place(&mut self, addr: u64, mut block: Vec<u8>) -> &mut Self {
        let csum = crc32c(&block[CSUM_SIZE..]);
        block[0..4].copy_from_slice(&csum.to_le_bytes());

        let base = addr as usize;
        self.image[base..base + block.len()].copy_from_slice(&block);
        self
    }

    #[must_use]
    pub fn device(self) -> MemByteDevice {
        MemByteDevice::new(self.image)
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.image
    }
}

fn write_header(block: &mut [u8], bytenr: u64, tree: u64, nritems: u32, level: u8) {
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&1_u64.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&tree.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
    block[0x64] = level;
}

fn write_key(block: &mut [u8], base: usize, key: DiskKey) {
    block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
    block[base + 8] = key.item_type;
    block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
}

// ── Standard fixture ────────────────────────────────────────────────────────

/// Addresses of the standard single-device fixture volume.
#[derive(Debug, Clone, Copy)]
pub struct StandardLayout {
    pub chunk_root: u64,
    pub root_root: u64,
    pub fs_root: u64,
    /// Logical address the fixture file's extent points at.
    pub extent_addr: u64,
}

impl Default for StandardLayout {
    fn default() -> Self {
        Self {
            chunk_root: 0x2_0000,
            root_root: 0x3_0000,
            fs_root: 0x8_0000,
            extent_addr: 0x10_0000,
        }
    }
}

/// Build the standard fixture: one identity chunk, a chunk tree, a root
/// tree with a default-subvolume entry, and an FS tree holding
///
/// ```text
/// /            (256, drwxr-xr-x)
/// /hello       (257, -rw-r--r--, 3 bytes, one regular extent)
/// /sub         (260, drwx------)
/// /sub/a.txt   (261)
/// /sub/.hidden (262)
/// ```
#[must_use]
pub fn standard_volume() -> MemByteDevice {
    standard_builder().device()
}

/// The standard fixture as a builder, for tests that corrupt it first.
#[must_use]
pub fn standard_builder() -> ImageBuilder {
    let layout = StandardLayout::default();
    let chunk = ChunkSpec::identity(0, 0x100_0000);

    let mut builder = ImageBuilder::new(0x100_0000);
    builder.superblock(
        0,
        &SuperblockSpec {
            generation: 7,
            root: layout.root_root,
            chunk_root: layout.chunk_root,
            sys_chunks: vec![chunk],
            ..SuperblockSpec::default()
        },
    );

    builder.leaf(
        layout.chunk_root,
        lode_types::OBJID_CHUNK_TREE,
        vec![
            (
                DiskKey::new(1, lode_types::ITEM_DEV_ITEM, 1),
                dev_item_record(1, 0x100_0000),
            ),
            (chunk_key(chunk.logical), chunk_item_record(&chunk)),
        ],
    );

    builder.leaf(
        layout.root_root,
        lode_types::OBJID_ROOT_TREE,
        vec![
            (
                DiskKey::new(lode_types::OBJID_FS_TREE, lode_types::ITEM_ROOT_ITEM, 0),
                root_item_record(layout.fs_root, 0),
            ),
            (
                dir_key(lode_types::OBJID_ROOT_TREE_DIR, b"default"),
                dir_entry_record(lode_types::OBJID_FS_TREE, 2, b"default"),
            ),
        ],
    );

    builder.leaf(
        layout.fs_root,
        lode_types::OBJID_FS_TREE,
        vec![
            (
                DiskKey::new(256, lode_types::ITEM_INODE_ITEM, 0),
                inode_record(0o040_755, 0, 1),
            ),
            (dir_key(256, b"hello"), dir_entry_record(257, 1, b"hello")),
            (dir_key(256, b"sub"), dir_entry_record(260, 2, b"sub")),
            (
                DiskKey::new(257, lode_types::ITEM_INODE_ITEM, 0),
                inode_record(0o100_644, 3, 1),
            ),
            (
                DiskKey::new(257, lode_types::ITEM_EXTENT_DATA, 0),
                extent_regular_record(layout.extent_addr, 4096),
            ),
            (
                DiskKey::new(260, lode_types::ITEM_INODE_ITEM, 0),
                inode_record(0o040_700, 0, 1),
            ),
            (dir_key(260, b"a.txt"), dir_entry_record(261, 1, b"a.txt")),
            (
                dir_key(260, b".hidden"),
                dir_entry_record(262, 1, b".hidden"),
            ),
            (
                DiskKey::new(261, lode_types::ITEM_INODE_ITEM, 0),
                inode_record(0o100_644, 5, 1),
            ),
            (
                DiskKey::new(262, lode_types::ITEM_INODE_ITEM, 0),
                inode_record(0o100_600, 6, 1),
            ),
        ],
    );

    builder
}
