//! Root-tree operations: the keyed-item cache, default-subvolume
//! resolution, and tree-root lookup.

use crate::walk::{Flow, TreeOp};
use lode_error::{Error, Result};
use lode_ondisk::{
    INODE_ITEM_SIZE, ROOT_ITEM_SIZE, parse_dir_entries, parse_inode_item, parse_inode_ref,
    parse_root_item, parse_root_ref,
};
use lode_types::{
    DiskKey, ITEM_DIR_ITEM, ITEM_INODE_ITEM, ITEM_INODE_REF, ITEM_ROOT_BACKREF, ITEM_ROOT_ITEM,
    ITEM_ROOT_REF, OBJID_ROOT_TREE_DIR, ParseError, mode_to_string,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::warn;

/// One cached leaf: its key plus an owned copy of the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedItem {
    pub key: DiskKey,
    pub data: Vec<u8>,
}

/// Root-tree load hook: caches every recognized leaf verbatim for the
/// lifetime of the mount.
#[derive(Debug, Default)]
pub struct RootTreeLoad {
    pub items: Vec<KeyedItem>,
}

impl TreeOp for RootTreeLoad {
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        match key.item_type {
            ITEM_INODE_ITEM => {
                if payload.len() != INODE_ITEM_SIZE {
                    return Err(Error::Format(ParseError::InvalidField {
                        field: "inode_item",
                        reason: "payload size is not the fixed INODE_ITEM size",
                    }));
                }
            }
            ITEM_ROOT_ITEM => {
                if payload.len() != ROOT_ITEM_SIZE {
                    return Err(Error::Format(ParseError::InvalidField {
                        field: "root_item",
                        reason: "payload size is not the fixed ROOT_ITEM size",
                    }));
                }
            }
            ITEM_INODE_REF | ITEM_DIR_ITEM | ITEM_ROOT_BACKREF | ITEM_ROOT_REF => {}
            other => {
                warn!(
                    target: "lode::volume",
                    item_type = other,
                    key = %key,
                    "skipping unknown root-tree item type"
                );
                return Ok(Flow::Continue);
            }
        }

        self.items.push(KeyedItem {
            key,
            data: payload.to_vec(),
        });
        Ok(Flow::Continue)
    }
}

/// Root-tree hook resolving the default subvolume: the first DIR_ITEM under
/// ROOT_TREE_DIR names it.
#[derive(Debug, Default)]
pub struct DefaultSubvol {
    pub found: Option<u64>,
}

impl TreeOp for DefaultSubvol {
    fn leaf(&mut self, key: DiskKey, payload: &[u8]) -> Result<Flow> {
        if key.item_type == ITEM_DIR_ITEM && key.objectid == OBJID_ROOT_TREE_DIR {
            if let Some(entry) = parse_dir_entries(payload)?.first() {
                self.found = Some(entry.child.objectid);
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Find the root node address of `tree` in the cached root-tree items.
pub fn tree_root_addr(cache: &[KeyedItem], tree: u64) -> Result<u64> {
    for item in cache {
        if item.key.item_type == ITEM_ROOT_ITEM && item.key.objectid == tree {
            let root = parse_root_item(&item.data)?;
            return Ok(root.root_node_block_num);
        }
    }
    Err(Error::NoTree(tree))
}

/// Root-tree dump hook.
pub struct RootTreeDump<'w> {
    pub out: &'w mut dyn Write,
}

impl TreeOp for RootTreeDump<'_> {
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
            ITEM_ROOT_ITEM => {
                let root = parse_root_item(payload)?;
                writeln!(
                    self.out,
                    "  ROOT_ITEM {:#x} -> {:#x} level {:#04x}",
                    key.objectid, root.root_node_block_num, root.root_level
                )?;
            }
            ITEM_ROOT_BACKREF => {
                let rref = parse_root_ref(payload)?;
                writeln!(
                    self.out,
                    "  ROOT_BACKREF subtree {:#x} -> '{}' tree {:#x}",
                    key.objectid,
                    String::from_utf8_lossy(&rref.name),
                    key.offset
                )?;
            }
            ITEM_ROOT_REF => {
                let rref = parse_root_ref(payload)?;
                writeln!(
                    self.out,
                    "  ROOT_REF tree {:#x} subtree {:#x} -> '{}'",
                    key.objectid,
                    key.offset,
                    String::from_utf8_lossy(&rref.name)
                )?;
            }
            _ => {
                writeln!(self.out, "  unknown {key}")?;
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_types::OBJID_FS_TREE;

    fn root_item_bytes(root_block: u64) -> Vec<u8> {
        let mut data = vec![0_u8; ROOT_ITEM_SIZE];
        data[176..184].copy_from_slice(&root_block.to_le_bytes());
        data
    }

    fn dir_item_bytes(child: u64, name: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&child.to_le_bytes());
        data.push(ITEM_ROOT_ITEM);
        data.extend_from_slice(&0_u64.to_le_bytes());
        data.extend_from_slice(&0_u64.to_le_bytes());
        data.extend_from_slice(&0_u16.to_le_bytes());
        data.extend_from_slice(&u16::try_from(name.len()).expect("short name").to_le_bytes());
        data.push(2);
        data.extend_from_slice(name);
        data
    }

    #[test]
    fn load_caches_known_types_and_skips_unknown() {
        let mut op = RootTreeLoad::default();
        op.leaf(
            DiskKey::new(OBJID_FS_TREE, ITEM_ROOT_ITEM, 0),
            &root_item_bytes(0x8000),
        )
        .expect("root item cached");
        op.leaf(DiskKey::new(6, ITEM_DIR_ITEM, 0x1234), &dir_item_bytes(5, b"default"))
            .expect("dir item cached");
        op.leaf(DiskKey::new(9, 0x7F, 0), b"whatever")
            .expect("unknown skipped");

        assert_eq!(op.items.len(), 2);
        assert_eq!(op.items[0].key.objectid, OBJID_FS_TREE);
    }

    #[test]
    fn load_rejects_wrong_fixed_sizes() {
        let mut op = RootTreeLoad::default();
        assert!(
            op.leaf(DiskKey::new(5, ITEM_ROOT_ITEM, 0), &[0_u8; 100])
                .is_err()
        );
        assert!(
            op.leaf(DiskKey::new(5, ITEM_INODE_ITEM, 0), &[0_u8; 10])
                .is_err()
        );
    }

    #[test]
    fn tree_root_lookup() {
        let cache = vec![
            KeyedItem {
                key: DiskKey::new(OBJID_FS_TREE, ITEM_ROOT_ITEM, 0),
                data: root_item_bytes(0x9000),
            },
            KeyedItem {
                key: DiskKey::new(7, ITEM_ROOT_ITEM, 0),
                data: root_item_bytes(0xA000),
            },
        ];

        assert_eq!(tree_root_addr(&cache, OBJID_FS_TREE).expect("fs"), 0x9000);
        assert_eq!(tree_root_addr(&cache, 7).expect("subvol"), 0xA000);
        assert!(matches!(
            tree_root_addr(&cache, 99).unwrap_err(),
            Error::NoTree(99)
        ));
    }

    #[test]
    fn default_subvol_short_circuits() {
        let mut op = DefaultSubvol::default();
        let flow = op
            .leaf(
                DiskKey::new(OBJID_ROOT_TREE_DIR, ITEM_DIR_ITEM, 0x9999),
                &dir_item_bytes(0x101, b"default"),
            )
            .expect("leaf");
        assert_eq!(flow, Flow::Stop);
        assert_eq!(op.found, Some(0x101));
    }

    #[test]
    fn default_subvol_ignores_other_dirs() {
        let mut op = DefaultSubvol::default();
        let flow = op
            .leaf(
                DiskKey::new(42, ITEM_DIR_ITEM, 0x9999),
                &dir_item_bytes(0x101, b"other"),
            )
            .expect("leaf");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(op.found, None);
    }
}
