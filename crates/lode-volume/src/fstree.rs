//! FS-tree operations: name lookup, file-package assembly, directory
//! listing, and the diagnostic dump.

use crate::root::KeyedItem;
use crate::walk::{Flow, TreeOp};
use lode_error::{Error, Result};
use lode_ondisk::{
    ExtentPayload, InodeItem, parse_dir_entries, parse_extent_data, parse_inode_item,
    parse_inode_ref,
};
use lode_types::{
    DiskKey, ITEM_DIR_INDEX, ITEM_DIR_ITEM, ITEM_EXTENT_DATA, ITEM_INODE_ITEM, ITEM_INODE_REF,
    ITEM_XATTR_ITEM, OBJID_ROOT_DIR, S_IFDIR, S_IFMT, mode_to_string,
};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Directory entry names are carried at most this long.
pub const MAX_NAME_LEN: usize = 255;

const NEED_INODE: u8 = 0b01;
const NEED_PARENT: u8 = 0b10;

fn truncated_name(name: &[u8]) -> String {
    let take = name.len().min(MAX_NAME_LEN);
    String::from_utf8_lossy(&name[..take]).into_owned()
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

/// Everything a filesystem binding needs to present one object: identity,
/// name, inode, and (for files) its extent records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePkg {
    pub object_id: u64,
    pub parent_id: u64,
    pub name: String,
    /// Dotfile convention: name starts with '.' and is not "." or "..".
    pub hidden: bool,
    pub inode: InodeItem,
    /// EXTENT_DATA leaves for this object, key plus owned payload.
    pub extents: Vec<KeyedItem>,
}

impl FilePkg {
    #[must_use]
    pub fn num_extents(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.inode.mode & S_IFMT == S_IFDIR
    }
}

/// The result of listing one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirList {
    pub entries: Vec<FilePkg>,
}

impl DirList {
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

/// FSOP_NAME_TO_ID: resolve a name within a parent directory.
///
/// Matches DIR_ITEMs whose key offset carries the name hash in its low 32
/// bits, then compares chained entry names byte-wise.
pub struct NameToId<'a> {
    parent: u64,
    hash: u32,
    name: &'a [u8],
    pub child: Option<u64>,
}

impl<'a> NameToId<'a> {
    #[must_use]
    pub fn new(parent: u64, hash: u32, name: &'a [u8]) -> Self {
        Self {
            parent,
            hash,
            name,
            child: None,
        }
    }
}

impl TreeOp for NameToId<'_> {
    #[allow(clippy::cast_possible_truncation)] // low 32 bits carry the hash
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        if key.item_type == ITEM_DIR_ITEM
            && key.objectid == self.parent
            && key.offset as u32 == self.hash
        {
            for entry in parse_dir_entries(payload)? {
                if entry.name == self.name {
                    self.child = Some(entry.child.objectid);
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

/// FSOP_GET_FILE_PKG: assemble the [`FilePkg`] for one object id.
///
/// The walk runs in key order, so everything about the target has been
/// seen once keys pass it; the hook stops there.
pub struct GetFilePkg {
    target: u64,
    need: u8,
    pkg: FilePkg,
}

impl GetFilePkg {
    #[must_use]
    pub fn new(target: u64) -> Self {
        let mut pkg = FilePkg {
            object_id: target,
            ..FilePkg::default()
        };
        let mut need = NEED_INODE;
        if target == OBJID_ROOT_DIR {
            // The root dir has no DIR_ITEM naming it in its own tree.
            pkg.name = "ROOT_DIR".to_owned();
            pkg.parent_id = 0;
        } else {
            need |= NEED_PARENT;
        }
        Self { target, need, pkg }
    }

    pub fn finish(self) -> Result<FilePkg> {
        if self.need != 0 {
            return Err(Error::NotFound(format!(
                "object {:#x} not fully resolved in the walked tree",
                self.target
            )));
        }
        let mut pkg = self.pkg;
        pkg.hidden = is_hidden(&pkg.name);
        Ok(pkg)
    }
}

impl TreeOp for GetFilePkg {
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        if key.objectid > self.target {
            return Ok(Flow::Stop);
        }

        match key.item_type {
            ITEM_INODE_ITEM if key.objectid == self.target => {
                self.pkg.inode = parse_inode_item(payload)?;
                self.need &= !NEED_INODE;
            }
            ITEM_DIR_ITEM => {
                for entry in parse_dir_entries(payload)? {
                    if entry.child.objectid == self.target {
                        // Hash collisions can match more than once; name
                        // uniqueness within a parent makes last-wins safe.
                        self.pkg.name = truncated_name(&entry.name);
                        self.pkg.parent_id = key.objectid;
                        self.need &= !NEED_PARENT;
                    }
                }
            }
            ITEM_EXTENT_DATA if key.objectid == self.target => {
                self.pkg.extents.push(KeyedItem {
                    key,
                    data: payload.to_vec(),
                });
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }
}

/// FSOP_DIR_LIST: collect the entries of one directory, "." and ".."
/// included, each with its inode filled in.
pub struct DirListOp {
    target: u64,
    /// Entries placed but still waiting for their INODE_ITEM.
    pending: i64,
    /// The inode seen just before any entries were placed; it belongs to
    /// the directory that will become "..".
    temp: Option<InodeItem>,
    list: DirList,
}

impl DirListOp {
    #[must_use]
    pub fn new(target: u64) -> Self {
        let mut list = DirList::default();
        let mut pending = 0;
        if target != OBJID_ROOT_DIR {
            list.entries.push(FilePkg {
                object_id: target,
                name: ".".to_owned(),
                ..FilePkg::default()
            });
            pending += 1;
        }
        Self {
            target,
            pending,
            temp: None,
            list,
        }
    }

    pub fn finish(self) -> Result<DirList> {
        if self.pending != 0 {
            // Partial listings are discarded; the caller sees the failure.
            return Err(Error::NotFound(format!(
                "directory {:#x} listing incomplete",
                self.target
            )));
        }
        let mut list = self.list;
        for entry in &mut list.entries {
            entry.hidden = is_hidden(&entry.name);
        }
        Ok(list)
    }
}

impl TreeOp for DirListOp {
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        match key.item_type {
            ITEM_INODE_ITEM => {
                let inode = parse_inode_item(payload)?;
                let seeded = usize::from(self.target != OBJID_ROOT_DIR);
                if self.list.entries.len() == seeded {
                    self.temp = Some(inode);
                }
                for entry in &mut self.list.entries {
                    if entry.object_id == key.objectid {
                        entry.inode = inode;
                        self.pending -= 1;
                        // No break: hard links reuse one INODE_ITEM across
                        // several entries.
                    }
                }
            }
            ITEM_DIR_ITEM => {
                for entry in parse_dir_entries(payload)? {
                    if key.objectid == self.target {
                        self.list.entries.push(FilePkg {
                            object_id: entry.child.objectid,
                            parent_id: key.objectid,
                            name: truncated_name(&entry.name),
                            ..FilePkg::default()
                        });
                        self.pending += 1;
                    }

                    if self.target != OBJID_ROOT_DIR && entry.child.objectid == self.target {
                        // The containing directory names the target: "." can
                        // be fully resolved and ".." emitted from the saved
                        // inode.
                        self.list.entries[0].parent_id = key.objectid;
                        self.list.entries.push(FilePkg {
                            object_id: key.objectid,
                            name: "..".to_owned(),
                            inode: self.temp.unwrap_or_default(),
                            ..FilePkg::default()
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }
}

/// FSOP_DUMP_TREE: human-readable lines for every recognized leaf.
pub struct FsTreeDump<'w> {
    pub out: &'w mut dyn Write,
}

impl TreeOp for FsTreeDump<'_> {
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
            ITEM_INODE_ITEM => {
                let inode = parse_inode_item(payload)?;
                writeln!(
                    self.out,
                    "  INODE_ITEM {:#x} uid {} gid {} mode {} size {:#x}",
                    key.objectid,
                    inode.uid,
                    inode.gid,
                    mode_to_string(inode.mode),
                    inode.size
                )?;
            }
            ITEM_INODE_REF => {
                let iref = parse_inode_ref(payload)?;
                writeln!(
                    self.out,
                    "  INODE_REF {:#x} -> '{}' parent {:#x}",
                    key.objectid,
                    String::from_utf8_lossy(&iref.name),
                    key.offset
                )?;
            }
            ITEM_XATTR_ITEM => {
                for entry in parse_dir_entries(payload)? {
                    writeln!(
                        self.out,
                        "  XATTR_ITEM {:#x} hash {:#010x} name '{}'",
                        key.objectid,
                        key.offset,
                        String::from_utf8_lossy(&entry.name)
                    )?;
                }
            }
            ITEM_DIR_ITEM => {
                for entry in parse_dir_entries(payload)? {
                    writeln!(
                        self.out,
                        "  DIR_ITEM parent {:#x} hash {:#010x} child {:#x} -> '{}'",
                        key.objectid,
                        key.offset,
                        entry.child.objectid,
                        String::from_utf8_lossy(&entry.name)
                    )?;
                }
            }
            ITEM_DIR_INDEX => {
                writeln!(
                    self.out,
                    "  DIR_INDEX {:#x} = idx {:#x}",
                    key.objectid, key.offset
                )?;
            }
            ITEM_EXTENT_DATA => {
                let ext = parse_extent_data(payload)?;
                let kind = match ext.extent_type {
                    0 => "inline",
                    1 => "regular",
                    2 => "prealloc",
                    _ => "unknown",
                };
                writeln!(
                    self.out,
                    "  EXTENT_DATA {:#x} offset {:#x} size {:#x} type {kind}",
                    key.objectid, key.offset, ext.size
                )?;
                if let ExtentPayload::Regular {
                    disk_bytenr,
                    disk_num_bytes,
                    offset,
                    ..
                } = ext.payload
                {
                    writeln!(
                        self.out,
                        "    addr {disk_bytenr:#x} size {disk_num_bytes:#x} offset {offset:#x}"
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
