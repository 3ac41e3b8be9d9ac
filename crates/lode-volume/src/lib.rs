#![forbid(unsafe_code)]
//! The read-only btrfs volume engine.
//!
//! [`Volume::mount`] runs the full bootstrap — superblock selection, chunk
//! bootstrap from the embedded array, chunk-tree load (which replaces the
//! bootstrap mapping), root-tree load — and the returned handle answers
//! queries: name→id resolution, file packages, directory listings, and
//! tree dumps. A `Volume` only exists in the ready state; dropping it is
//! the unmount.

pub mod chunk;
pub mod fstree;
pub mod root;
pub mod sb;
pub mod walk;

pub use chunk::{Chunk, ChunkMap};
pub use fstree::{DirList, FilePkg, MAX_NAME_LEN};
pub use root::KeyedItem;
pub use walk::{Addr, Flow, TreeContext, TreeOp};

use crate::chunk::{ChunkTreeDump, ChunkTreeLoad};
use crate::fstree::{DirListOp, FsTreeDump, GetFilePkg, NameToId};
use crate::root::{DefaultSubvol, RootTreeDump, RootTreeLoad};
use crate::walk::walk_tree;
use lode_block::{BlockReader, ByteDevice, CacheMetrics};
use lode_error::{Error, Result};
use lode_ondisk::Superblock;
use lode_types::{
    DEFAULT_CACHE_CAPACITY, OBJID_CHUNK_TREE, OBJID_FS_TREE, OBJID_ROOT_TREE, name_hash,
};
use std::io::Write;
use tracing::{debug, info, warn};

/// Mount-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Number of node-sized entries the block cache retains.
    pub cache_capacity: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Which tree a dump request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSelect {
    Chunk,
    Root,
    /// An FS (or subvolume) tree by object id.
    Fs(u64),
}

/// One mounted read-only volume: the device reader plus all metadata state
/// accumulated during mount.
#[derive(Debug)]
pub struct Volume<D> {
    reader: BlockReader<D>,
    sb: Superblock,
    sb_copy: usize,
    chunks: ChunkMap,
    roots: Vec<KeyedItem>,
    default_subvol: u64,
}

impl<D: ByteDevice> Volume<D> {
    /// Mount with default options.
    pub fn mount(dev: D) -> Result<Self> {
        Self::mount_with(dev, MountOptions::default())
    }

    pub fn mount_with(dev: D, opts: MountOptions) -> Result<Self> {
        let reader = BlockReader::with_capacity(dev, opts.cache_capacity);

        let (sb, sb_copy) = sb::locate_superblock(&reader)?;
        if sb.num_devices > 1 {
            warn!(
                target: "lode::volume",
                num_devices = sb.num_devices,
                "multi-device volume: proceeding single-device, stripe 0 only"
            );
        }

        // Phase 1: the embedded array makes the chunk tree addressable.
        let bootstrap = ChunkMap::from_superblock(&sb)?;

        // Phase 2: the chunk tree itself is authoritative and replaces the
        // bootstrap set wholesale.
        let mut chunk_load = ChunkTreeLoad::default();
        {
            let cx = TreeContext {
                reader: &reader,
                chunks: &bootstrap,
                nodesize: sb.nodesize,
            };
            walk_tree(&cx, sb.chunk_root, Some(OBJID_CHUNK_TREE), &mut chunk_load)?;
        }
        let chunks = chunk_load.into_map();
        debug!(
            target: "lode::volume",
            event = "chunk_tree_loaded",
            chunks = chunks.len(),
            devices = chunks.devices().len()
        );

        let mut root_load = RootTreeLoad::default();
        let mut subvol = DefaultSubvol::default();
        {
            let cx = TreeContext {
                reader: &reader,
                chunks: &chunks,
                nodesize: sb.nodesize,
            };
            walk_tree(&cx, sb.root, Some(OBJID_ROOT_TREE), &mut root_load)?;
            walk_tree(&cx, sb.root, Some(OBJID_ROOT_TREE), &mut subvol)?;
        }
        let default_subvol = subvol.found.unwrap_or_else(|| {
            debug!(
                target: "lode::volume",
                "no default-subvolume DIR_ITEM; falling back to the FS tree"
            );
            OBJID_FS_TREE
        });

        info!(
            target: "lode::volume",
            generation = sb.generation,
            sb_copy,
            root_items = root_load.items.len(),
            default_subvol,
            label = %sb.label,
            "volume mounted"
        );

        Ok(Self {
            reader,
            sb,
            sb_copy,
            chunks,
            roots: root_load.items,
            default_subvol,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Which superblock copy won selection (1-based).
    #[must_use]
    pub fn superblock_copy(&self) -> usize {
        self.sb_copy
    }

    #[must_use]
    pub fn chunks(&self) -> &ChunkMap {
        &self.chunks
    }

    /// The cached root-tree items, alive for the mount's lifetime.
    #[must_use]
    pub fn root_items(&self) -> &[KeyedItem] {
        &self.roots
    }

    #[must_use]
    pub fn default_subvol(&self) -> u64 {
        self.default_subvol
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.reader.metrics()
    }

    /// Root node address of `tree`, from the root-tree cache.
    pub fn tree_root_addr(&self, tree: u64) -> Result<u64> {
        root::tree_root_addr(&self.roots, tree)
    }

    fn cx(&self) -> TreeContext<'_, D> {
        TreeContext {
            reader: &self.reader,
            chunks: &self.chunks,
            nodesize: self.sb.nodesize,
        }
    }

    /// Walk an FS (or subvolume) tree with the given operation.
    ///
    /// No owner assertion here: queries may legitimately target subvolume
    /// trees whose nodes carry their own object id.
    fn walk_fs(&self, tree: u64, op: &mut dyn TreeOp) -> Result<()> {
        let root_addr = self.tree_root_addr(tree)?;
        walk_tree(&self.cx(), root_addr, None, op)
    }

    /// Resolve `name` within directory `parent` of `tree` to an object id.
    pub fn name_to_id(&self, tree: u64, parent: u64, name: &str) -> Result<u64> {
        let hash = name_hash(name.as_bytes());
        let mut op = NameToId::new(parent, hash, name.as_bytes());
        self.walk_fs(tree, &mut op)?;
        op.child
            .ok_or_else(|| Error::NotFound(format!("'{name}' in directory {parent:#x}")))
    }

    /// Assemble the [`FilePkg`] for `object_id` in `tree`.
    pub fn file_pkg(&self, tree: u64, object_id: u64) -> Result<FilePkg> {
        let mut op = GetFilePkg::new(object_id);
        self.walk_fs(tree, &mut op)?;
        op.finish()
    }

    /// List directory `object_id` in `tree`, "." and ".." included.
    pub fn dir_list(&self, tree: u64, object_id: u64) -> Result<DirList> {
        let mut op = DirListOp::new(object_id);
        self.walk_fs(tree, &mut op)?;
        op.finish()
    }

    /// Pretty-print a whole tree (diagnostic).
    pub fn dump_tree(&self, select: TreeSelect, out: &mut dyn Write) -> Result<()> {
        match select {
            TreeSelect::Chunk => walk_tree(
                &self.cx(),
                self.sb.chunk_root,
                Some(OBJID_CHUNK_TREE),
                &mut ChunkTreeDump { out },
            ),
            TreeSelect::Root => walk_tree(
                &self.cx(),
                self.sb.root,
                Some(OBJID_ROOT_TREE),
                &mut RootTreeDump { out },
            ),
            TreeSelect::Fs(tree) => {
                let root_addr = self.tree_root_addr(tree)?;
                walk_tree(&self.cx(), root_addr, None, &mut FsTreeDump { out })
            }
        }
    }

    /// Tear the mount down, releasing buffers and cached metadata.
    ///
    /// Dropping the volume is equivalent; this spelling exists for callers
    /// that want the unmount to read as an action.
    pub fn unmount(self) {
        info!(
            target: "lode::volume",
            generation = self.sb.generation,
            "volume unmounted"
        );
        drop(self);
    }
}
