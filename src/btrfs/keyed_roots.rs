//! Root tree lookups: resolving a tree's current root bytenr/generation
//! from its `ROOT_ITEM` entry (spec.md §3 "Tree roots", "Subvolume tree").
//!
//! Grounded on the teacher's `xfs::ag::AgiInfo::from_buf` (a single fixed
//! on-disk record parsed with zerocopy into an ergonomic struct) and
//! `original_source/kernel-shared/ctree.h`'s `btrfs_root_item` layout.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::btrfs::path::{BlockSource, Path};
use crate::btrfs::types::{item_type, tree_id, Key};
use crate::error::FsckError;

/// `btrfs_inode_item` is embedded in every root item but unused by the
/// checker beyond its fixed size.
const INODE_ITEM_SIZE: usize = 160;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct RootItemRaw {
    _inode_item: [u8; INODE_ITEM_SIZE],
    generation: U64,
    root_dirid: U64,
    bytenr: U64,
    byte_limit: U64,
    bytes_used: U64,
    last_snapshot: U64,
    flags: U64,
    refs: U32,
    drop_progress_objectid: U64,
    drop_progress_type: u8,
    drop_progress_offset: U64,
    drop_level: u8,
    level: u8,
}

/// The subset of `btrfs_root_item` the checker and scrub controller care
/// about: where the tree's root block currently lives and how many
/// subvolume references exist (spec.md §3 "Subvolume tree").
#[derive(Debug, Clone, Copy)]
pub struct RootItem {
    pub objectid: u64,
    pub bytenr: u64,
    pub generation: u64,
    pub level: u8,
    pub refs: u32,
    pub root_dirid: u64,
    pub last_snapshot: u64,
}

pub fn parse_root_item(objectid: u64, data: &[u8]) -> Result<RootItem, FsckError> {
    let raw = RootItemRaw::ref_from_prefix(data)
        .map_err(|_| FsckError::Parse("root item shorter than btrfs_root_item"))?
        .0;
    Ok(RootItem {
        objectid,
        bytenr: raw.bytenr.get(),
        generation: raw.generation.get(),
        level: raw.level,
        refs: raw.refs.get(),
        root_dirid: raw.root_dirid.get(),
        last_snapshot: raw.last_snapshot.get(),
    })
}

/// Look up a single tree's root item by objectid (for well-known trees use
/// `tree_id::*`; for a subvolume use its own objectid).
pub fn find_root(
    source: &mut impl BlockSource,
    root_tree_bytenr: u64,
    objectid: u64,
) -> Result<Option<RootItem>, FsckError> {
    let target = Key::new(objectid, item_type::ROOT_ITEM, 0);
    let (path, exact) = Path::search_slot(source, root_tree_bytenr, target)?;
    if !exact {
        return Ok(None);
    }
    let item = path
        .current_item()
        .ok_or(FsckError::Parse("search_slot reported exact match with no item"))?;
    Ok(Some(parse_root_item(objectid, &item.data)?))
}

/// Enumerate every subvolume root item (`objectid >= FIRST_FREE_OBJECTID`,
/// excluding the reserved tree ids) present in the root tree, in key
/// order. Used by the checker's Pass B (spec.md §4.2 "fs tree walk") to
/// discover every subvolume without assuming a fixed set in advance.
pub fn iter_subvolume_roots(
    source: &mut impl BlockSource,
    root_tree_bytenr: u64,
) -> Result<Vec<RootItem>, FsckError> {
    let mut roots = Vec::new();
    let start = Key::new(
        crate::btrfs::types::FIRST_FREE_OBJECTID,
        item_type::ROOT_ITEM,
        0,
    );
    let (mut path, exact) = Path::search_slot(source, root_tree_bytenr, start)?;
    if !exact {
        // `exact` is false either because the insertion point already sits
        // on a ROOT_ITEM with a higher offset, or because it overshot past
        // the last item; current_key() distinguishes the two below.
        if path.current_key().is_none() {
            return Ok(roots);
        }
    }

    loop {
        match path.current_key() {
            Some(key) if key.item_type == item_type::ROOT_ITEM => {
                let data = path
                    .current_item()
                    .expect("current_key returned Some")
                    .data
                    .clone();
                if key.objectid != tree_id::EXTENT_TREE_OBJECTID
                    && key.objectid != tree_id::CHUNK_TREE_OBJECTID
                    && key.objectid != tree_id::DEV_TREE_OBJECTID
                    && key.objectid != tree_id::CSUM_TREE_OBJECTID
                    && key.objectid != tree_id::QUOTA_TREE_OBJECTID
                    && key.objectid != tree_id::UUID_TREE_OBJECTID
                    && key.objectid != tree_id::FREE_SPACE_TREE_OBJECTID
                {
                    roots.push(parse_root_item(key.objectid, &data)?);
                }
            }
            Some(_) => {}
            None => break,
        }
        if !path.next_slot(source)? {
            break;
        }
    }

    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::treeblock::{Item, TreeBlock};
    use std::collections::HashMap;

    struct MapSource(HashMap<u64, TreeBlock>);

    impl BlockSource for MapSource {
        fn read_block(
            &mut self,
            bytenr: u64,
            _expected_generation: Option<u64>,
        ) -> Result<TreeBlock, FsckError> {
            self.0
                .get(&bytenr)
                .cloned()
                .ok_or(FsckError::Parse("no such block"))
        }
    }

    fn encode_root_item(bytenr: u64, generation: u64, level: u8, refs: u32) -> Vec<u8> {
        let mut buf = vec![0u8; std::mem::size_of::<RootItemRaw>()];
        let gen_off = INODE_ITEM_SIZE;
        buf[gen_off..gen_off + 8].copy_from_slice(&generation.to_le_bytes());
        let bytenr_off = gen_off + 8 + 8;
        buf[bytenr_off..bytenr_off + 8].copy_from_slice(&bytenr.to_le_bytes());
        let refs_off = bytenr_off + 8 + 8 + 8 + 8 + 8;
        buf[refs_off..refs_off + 4].copy_from_slice(&refs.to_le_bytes());
        let level_off = refs_off + 4 + 8 + 1 + 8 + 1;
        buf[level_off] = level;
        buf
    }

    fn tree_with_one_root(objectid: u64) -> (MapSource, u64) {
        let data = encode_root_item(0x2000, 7, 0, 1);
        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: tree_id::ROOT_TREE_OBJECTID,
            level: 0,
            key_ptrs: Vec::new(),
            items: vec![Item {
                key: Key::new(objectid, item_type::ROOT_ITEM, 0),
                data,
            }],
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        (MapSource(map), 10)
    }

    #[test]
    fn find_root_returns_parsed_item() {
        let (mut source, root_bytenr) = tree_with_one_root(tree_id::FS_TREE_OBJECTID);
        let found = find_root(&mut source, root_bytenr, tree_id::FS_TREE_OBJECTID)
            .expect("lookup ok")
            .expect("present");
        assert_eq!(found.bytenr, 0x2000);
        assert_eq!(found.generation, 7);
    }

    #[test]
    fn find_root_missing_returns_none() {
        let (mut source, root_bytenr) = tree_with_one_root(tree_id::FS_TREE_OBJECTID);
        let found = find_root(&mut source, root_bytenr, 999).expect("lookup ok");
        assert!(found.is_none());
    }

    #[test]
    fn iter_subvolume_roots_skips_reserved_ids() {
        let (mut source, root_bytenr) = tree_with_one_root(tree_id::FS_TREE_OBJECTID);
        let roots = iter_subvolume_roots(&mut source, root_bytenr).expect("iter ok");
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].objectid, tree_id::FS_TREE_OBJECTID);
    }
}
