//! Pass B — fs-tree semantics (spec.md §4.2 `check_fs_roots_lowmem`).
//!
//! Grounded on the teacher's `tree_scan::run_tree_scan` for the "walk a
//! tree leaf by leaf, grouping items by their owning object" shape, and on
//! `original_source/check/mode-lowmem.c`'s `check_fs_roots_lowmem` /
//! `check_inode_item` driver loop. Csum-tree lookups are threaded in as a
//! closure (`csum_lookup`) rather than a second tree walk inlined here,
//! since the csum-tree itself is a sibling tree this module's caller
//! already has open.

use std::collections::HashSet;

use crate::btrfs::keyed_roots::{iter_subvolume_roots, RootItem};
use crate::btrfs::path::{BlockSource, Path};
use crate::btrfs::types::{item_type, Key, FIRST_FREE_OBJECTID};
use crate::check::dirent::{
    check_dir_item_hash, check_dirent_triple, encode_dir_item_entry, name_hash,
    parse_dir_item_entries, parse_inode_ref_entries, DirItemEntry, InodeRefEntry,
};
use crate::check::file_extent::{check_file_extent, CsumRange, FileExtent};
use crate::check::inode::{
    check_inode_item, detect_imode, field_offset, mode, patch_u32_field, patch_u64_field,
    DetectedType, InodeItem,
};
use crate::check::repair::{
    apply_ternary_dirent_repair, mark_repaired, repair_dir_isize, repair_inode_nbytes,
    repair_inode_nlinks, repair_inode_orphan_item, Transaction,
};
use crate::error::FsckError;
use crate::errors_taxonomy::{ErrorKind, ErrorSet};

/// Everything observed for one inode during a single leaf-by-leaf sweep
/// (spec.md §4.2 Pass B step 1).
#[derive(Default)]
struct InodeRecord {
    item: Option<InodeItem>,
    item_raw: Option<Vec<u8>>,
    has_orphan_item: bool,
    inode_refs: Vec<InodeRefEntry>,
    dir_items: Vec<DirItemEntry>,
    dir_item_keys: Vec<Key>,
    dir_indexes: Vec<DirItemEntry>,
    file_extents: Vec<FileExtent>,
}

pub fn check_fs_roots_lowmem(
    source: &mut impl BlockSource,
    root_tree_bytenr: u64,
    super_generation: u64,
    sector_size: u64,
    csum_lookup: &mut dyn FnMut(u64, u64) -> Vec<CsumRange>,
    mut repair: Option<&mut dyn Transaction>,
) -> Result<ErrorSet, FsckError> {
    let mut errors = ErrorSet::EMPTY;
    let roots = iter_subvolume_roots(source, root_tree_bytenr)?;
    // spec.md §4.2 "Shared-leaf optimization": snapshots COW-share unmodified
    // leaves with their parent (and with each other). `iter_subvolume_roots`
    // returns roots in ascending objectid order, so the smallest-id root to
    // touch a given leaf bytenr claims it; later roots skip it rather than
    // re-validating identical data.
    let mut visited_leaves: HashSet<u64> = HashSet::new();
    for root in &roots {
        errors.merge(check_subvolume_tree(
            source,
            root,
            super_generation,
            sector_size,
            csum_lookup,
            &mut visited_leaves,
            repair.as_deref_mut(),
        )?);
        errors.merge(check_root_directory_present(source, root)?);
    }
    Ok(errors)
}

/// One `(parent directory objectid, name)` slot's `DIR_ITEM`/`DIR_INDEX`
/// pair, accumulated across the whole subvolume tree walk. `INODE_REF` is
/// keyed at the *child*'s own objectid rather than the parent's, so it is
/// tracked separately (by `(child objectid, name)`) and joined against this
/// slot through whichever side's claimed `target_ino` is available (spec.md
/// §4.2 Pass B step 1 third/fourth bullets: both the forward direction,
/// "each INODE_REF has a DIR_ITEM/DIR_INDEX", and the reverse, "each
/// DIR_ITEM/DIR_INDEX has an INODE_REF", must be checked).
#[derive(Default, Clone)]
struct DirentSlot {
    dir_item: Option<DirItemEntry>,
    dir_index: Option<DirItemEntry>,
}

fn check_subvolume_tree(
    source: &mut impl BlockSource,
    root: &RootItem,
    super_generation: u64,
    sector_size: u64,
    csum_lookup: &mut dyn FnMut(u64, u64) -> Vec<CsumRange>,
    visited_leaves: &mut HashSet<u64>,
    mut repair: Option<&mut dyn Transaction>,
) -> Result<ErrorSet, FsckError> {
    let mut errors = ErrorSet::EMPTY;
    let start = Key::new(0, 0, 0);
    let (mut path, _) = Path::search_slot(source, root.bytenr, start)?;

    let mut current_objectid: Option<u64> = None;
    let mut record = InodeRecord::default();
    let mut saw_any_item = false;
    let mut last_leaf_bytenr: Option<u64> = None;
    let mut skip_current_leaf = false;
    let mut dirents: std::collections::HashMap<(u64, Vec<u8>), DirentSlot> =
        std::collections::HashMap::new();
    let mut inode_refs: std::collections::HashMap<(u64, Vec<u8>), InodeRefEntry> =
        std::collections::HashMap::new();

    loop {
        let Some(key) = path.current_key() else {
            break;
        };
        saw_any_item = true;

        let leaf_bytenr = path.current_leaf_bytenr();
        if last_leaf_bytenr != Some(leaf_bytenr) {
            last_leaf_bytenr = Some(leaf_bytenr);
            // `insert` returns false when the leaf was already claimed by an
            // earlier (smaller-objectid) root.
            skip_current_leaf = !visited_leaves.insert(leaf_bytenr);
        }

        if skip_current_leaf {
            if let Some(prev_ino) = current_objectid.take() {
                errors.merge(finish_inode(
                    prev_ino,
                    &record,
                    super_generation,
                    sector_size,
                    csum_lookup,
                    &mut dirents,
                    &mut inode_refs,
                    repair.as_deref_mut(),
                ));
                record = InodeRecord::default();
            }
        } else {
            if current_objectid != Some(key.objectid) {
                if let Some(prev_ino) = current_objectid {
                    errors.merge(finish_inode(
                        prev_ino,
                        &record,
                        super_generation,
                        sector_size,
                        csum_lookup,
                        &mut dirents,
                        &mut inode_refs,
                        repair.as_deref_mut(),
                    ));
                }
                record = InodeRecord::default();
                current_objectid = Some(key.objectid);
            }
            let item = path
                .current_item()
                .expect("current_key implies current_item");
            accumulate_item(&mut record, key, &item.data)?;
        }

        if !path.next_slot(source)? {
            break;
        }
    }
    if let Some(last_ino) = current_objectid {
        errors.merge(finish_inode(
            last_ino,
            &record,
            super_generation,
            sector_size,
            csum_lookup,
            &mut dirents,
            &mut inode_refs,
            repair.as_deref_mut(),
        ));
    }

    // Join each directory-entry slot against its claimed child's INODE_REF
    // (forward direction: report a missing/mismatched referencer when the
    // ref never showed up), then flag whatever INODE_REFs were never
    // claimed by any DIR_ITEM/DIR_INDEX slot (reverse direction). In repair
    // mode each slot's ternary outcome is also handed to
    // `apply_ternary_dirent_repair` (spec.md §4.2 "ternary repair rule").
    for ((parent, name), slot) in dirents {
        let Some(canonical) = slot.dir_item.as_ref().or(slot.dir_index.as_ref()) else {
            continue;
        };
        let target_ino = canonical.target_ino;
        let reference = inode_refs.remove(&(target_ino, name.clone()));
        let mut triple_errors = check_dirent_triple(
            target_ino,
            reference.as_ref(),
            slot.dir_item.as_ref(),
            slot.dir_index.as_ref(),
        );
        if let Some(txn) = repair.as_deref_mut() {
            apply_ternary_dirent_repair(
                txn,
                parent,
                target_ino,
                &name,
                reference.as_ref(),
                slot.dir_item.as_ref(),
                slot.dir_index.as_ref(),
                &mut triple_errors,
            );
        }
        errors.merge(triple_errors);
    }
    for ((child_ino, name), reference) in inode_refs {
        let mut triple_errors = check_dirent_triple(child_ino, Some(&reference), None, None);
        if let Some(txn) = repair.as_deref_mut() {
            apply_ternary_dirent_repair(
                txn,
                reference.parent,
                child_ino,
                &name,
                Some(&reference),
                None,
                None,
                &mut triple_errors,
            );
        }
        errors.merge(triple_errors);
    }

    if !saw_any_item {
        errors.insert(ErrorKind::InodeItemMissing);
    }

    Ok(errors)
}

fn accumulate_item(record: &mut InodeRecord, key: Key, data: &[u8]) -> Result<(), FsckError> {
    match key.item_type {
        item_type::INODE_ITEM => {
            record.item = Some(InodeItem::parse(key.objectid, data)?);
            record.item_raw = Some(data.to_vec());
        }
        item_type::INODE_REF => {
            let parent = key.offset;
            record
                .inode_refs
                .extend(parse_inode_ref_entries(data)?.into_iter().map(|mut e| {
                    e.parent = parent;
                    e
                }));
        }
        item_type::DIR_ITEM => {
            let entries: Vec<_> = parse_dir_item_entries(data)?
                .into_iter()
                .map(|mut e| {
                    e.key_offset = key.offset;
                    e
                })
                .collect();
            record
                .dir_item_keys
                .extend(std::iter::repeat(key).take(entries.len()));
            record.dir_items.extend(entries);
        }
        item_type::DIR_INDEX => {
            record
                .dir_indexes
                .extend(parse_dir_item_entries(data)?.into_iter().map(|mut e| {
                    e.key_offset = key.offset;
                    e
                }));
        }
        item_type::EXTENT_DATA => {
            record
                .file_extents
                .push(FileExtent::parse(key.offset, data)?);
        }
        item_type::ORPHAN_ITEM => {
            record.has_orphan_item = true;
        }
        _ => {}
    }
    Ok(())
}

fn finish_inode(
    objectid: u64,
    record: &InodeRecord,
    super_generation: u64,
    sector_size: u64,
    csum_lookup: &mut dyn FnMut(u64, u64) -> Vec<CsumRange>,
    dirents: &mut std::collections::HashMap<(u64, Vec<u8>), DirentSlot>,
    inode_refs: &mut std::collections::HashMap<(u64, Vec<u8>), InodeRefEntry>,
    mut repair: Option<&mut dyn Transaction>,
) -> ErrorSet {
    let mut errors = ErrorSet::EMPTY;

    let Some(item) = &record.item else {
        errors.insert(ErrorKind::InodeItemMissing);
        return errors;
    };

    errors.merge(check_inode_item(item, super_generation, false));

    // spec.md §4.2: "on failure in repair mode, attempts `detect_imode`...
    // then writes the corrected mode." Only the mode field of the raw item
    // is touched; every other byte (uid, gid, rdev, timestamps) this module
    // never parses must survive untouched.
    if errors.contains(ErrorKind::InodeModeError) {
        if let (Some(txn), Some(raw)) = (repair.as_deref_mut(), &record.item_raw) {
            let has_dir_items = !record.dir_items.is_empty() || !record.dir_indexes.is_empty();
            let has_extent_data = !record.file_extents.is_empty();
            let corrected_mode = match detect_imode(has_dir_items, has_extent_data) {
                DetectedType::Directory => mode::S_IFDIR | 0o755,
                DetectedType::Regular => mode::S_IFREG | 0o700,
                DetectedType::Symlink => mode::S_IFLNK | 0o777,
            };
            let patched = patch_u32_field(raw, field_offset::MODE, corrected_mode);
            if txn
                .overwrite_item(objectid, item_type::INODE_ITEM, 0, &patched)
                .is_ok()
            {
                mark_repaired(&mut errors, ErrorKind::InodeModeError);
            }
        }
    }

    // INODE_REF is keyed at the child's own objectid (this record), while
    // DIR_ITEM/DIR_INDEX are keyed at the parent directory's objectid (a
    // different record) — stash each side so the tri-agreement (spec.md
    // §4.2 Pass B step 1 third/fourth bullets) can be joined once the whole
    // subvolume has been walked.
    for reference in &record.inode_refs {
        inode_refs.insert((objectid, reference.name.clone()), reference.clone());
    }
    for entry in &record.dir_items {
        dirents
            .entry((objectid, entry.name.clone()))
            .or_default()
            .dir_item = Some(entry.clone());
    }
    for entry in &record.dir_indexes {
        dirents
            .entry((objectid, entry.name.clone()))
            .or_default()
            .dir_index = Some(entry.clone());
    }

    for (key, entry) in record.dir_item_keys.iter().zip(&record.dir_items) {
        let hash_errors = check_dir_item_hash(*key, &entry.name);
        if hash_errors.contains(ErrorKind::DirItemHashMismatch) {
            if let Some(txn) = repair.as_deref_mut() {
                let correct_offset = name_hash(&entry.name);
                let reinsert = txn
                    .delete_item(objectid, item_type::DIR_ITEM, key.offset)
                    .and_then(|()| {
                        txn.insert_item(
                            objectid,
                            item_type::DIR_ITEM,
                            correct_offset,
                            &encode_dir_item_entry(entry.target_ino, entry.file_type, &entry.name),
                        )
                    });
                if reinsert.is_ok() {
                    errors.merge(hash_errors);
                    mark_repaired(&mut errors, ErrorKind::DirItemHashMismatch);
                    continue;
                }
            }
        }
        errors.merge(hash_errors);
    }

    if item.is_dir() {
        let sum_name_bytes: u64 = record.dir_items.iter().map(|d| d.name.len() as u64).sum();
        if sum_name_bytes != item.size {
            errors.insert(ErrorKind::IsizeError);
        }
        if errors.contains(ErrorKind::IsizeError) {
            if let (Some(txn), Some(raw)) = (repair.as_deref_mut(), &record.item_raw) {
                let corrected = repair_dir_isize(sum_name_bytes);
                let patched = patch_u64_field(raw, field_offset::SIZE, corrected);
                if txn
                    .overwrite_item(objectid, item_type::INODE_ITEM, 0, &patched)
                    .is_ok()
                {
                    mark_repaired(&mut errors, ErrorKind::IsizeError);
                }
            }
        }
    } else {
        let ref_count = record.inode_refs.len() as u32;
        if ref_count != item.nlink {
            errors.insert(ErrorKind::LinkCountError);
        }
        if ref_count == 0 && !record.has_orphan_item {
            errors.insert(ErrorKind::OrphanItem);
        }
        if let Some(txn) = repair.as_deref_mut() {
            if errors.contains(ErrorKind::OrphanItem)
                && repair_inode_orphan_item(txn, objectid).is_ok()
            {
                mark_repaired(&mut errors, ErrorKind::OrphanItem);
            }
            if errors.contains(ErrorKind::LinkCountError) {
                if let (Ok(corrected), Some(raw)) = (
                    repair_inode_nlinks(txn, objectid, ref_count, item.nlink),
                    &record.item_raw,
                ) {
                    let patched = patch_u32_field(raw, field_offset::NLINK, corrected);
                    if txn
                        .overwrite_item(objectid, item_type::INODE_ITEM, 0, &patched)
                        .is_ok()
                    {
                        mark_repaired(&mut errors, ErrorKind::LinkCountError);
                    }
                }
            }
        }
    }

    if item.is_regular() {
        let sum_non_hole: u64 = record
            .file_extents
            .iter()
            .filter(|e| !e.is_hole())
            .map(|e| e.num_bytes)
            .sum();
        if sum_non_hole != item.nbytes {
            errors.insert(ErrorKind::NbytesError);
        }
        if errors.contains(ErrorKind::NbytesError) {
            if let (Some(txn), Some(raw)) = (repair.as_deref_mut(), &record.item_raw) {
                let corrected = repair_inode_nbytes(sum_non_hole);
                let patched = patch_u64_field(raw, field_offset::NBYTES, corrected);
                if txn
                    .overwrite_item(objectid, item_type::INODE_ITEM, 0, &patched)
                    .is_ok()
                {
                    mark_repaired(&mut errors, ErrorKind::NbytesError);
                }
            }
        }
        for extent in &record.file_extents {
            let ranges = csum_lookup(extent.disk_bytenr + extent.extent_offset, extent.num_bytes);
            errors.merge(check_file_extent(
                extent,
                sector_size,
                item.no_datasum(),
                &ranges,
            ));
        }
    }

    errors
}

/// spec.md §4.2 Pass B step 3: "verify the first inode (`FIRST_FREE_OBJECTID`
/// a.k.a. 256) exists and carries the root-directory `..` self-reference."
pub fn check_root_directory_present(
    source: &mut impl BlockSource,
    root: &RootItem,
) -> Result<ErrorSet, FsckError> {
    let mut errors = ErrorSet::EMPTY;
    let target = Key::new(FIRST_FREE_OBJECTID, item_type::INODE_ITEM, 0);
    let (path, exact) = Path::search_slot(source, root.bytenr, target)?;
    if !exact {
        errors.insert(ErrorKind::InodeItemMissing);
        return Ok(errors);
    }
    let _ = path;
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::treeblock::{Item, TreeBlock};
    use crate::check::dirent::name_hash;
    use crate::check::inode::mode;
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

    fn encode_inode_item(mode_bits: u32, size: u64, nbytes: u64, nlink: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 160];
        buf[16..24].copy_from_slice(&size.to_le_bytes());
        buf[24..32].copy_from_slice(&nbytes.to_le_bytes());
        buf[40..44].copy_from_slice(&nlink.to_le_bytes());
        buf[52..56].copy_from_slice(&mode_bits.to_le_bytes());
        buf
    }

    fn encode_inode_ref(index: u64, name: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&index.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name);
        buf
    }

    fn encode_dir_item(target_ino: u64, file_type: u8, name: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&target_ino.to_le_bytes());
        buf.push(item_type::INODE_ITEM);
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // transid
        buf.extend_from_slice(&0u16.to_le_bytes()); // data_len
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.push(file_type);
        buf.extend_from_slice(name);
        buf
    }

    #[test]
    fn clean_fs_round_trip_has_no_errors() {
        // spec.md §8 scenario 1: dir 256 with one regular file 257 named "foo".
        let name = b"foo";
        let mut items = vec![
            Item {
                key: Key::new(256, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFDIR | 0o755, name.len() as u64, 0, 1),
            },
            Item {
                key: Key::new(256, item_type::DIR_ITEM, name_hash(name)),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(256, item_type::DIR_INDEX, 2),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(257, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFREG | 0o644, 5, 0, 1),
            },
            Item {
                key: Key::new(257, item_type::INODE_REF, 256),
                data: encode_inode_ref(2, name),
            },
        ];
        items.sort_by_key(|i| i.key);

        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items,
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        let mut source = MapSource(map);

        let root = RootItem {
            objectid: 5,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };

        let mut csum_lookup = |_start: u64, _len: u64| Vec::new();
        let mut visited_leaves = HashSet::new();
        let errors = check_subvolume_tree(
            &mut source,
            &root,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            None,
        )
        .expect("check ok");
        assert!(
            errors.is_empty(),
            "expected no defects, got bits {:#x}",
            errors.bits()
        );
    }

    #[test]
    fn missing_dir_index_is_reported() {
        let name = b"foo";
        let mut items = vec![
            Item {
                key: Key::new(256, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFDIR | 0o755, name.len() as u64, 0, 1),
            },
            Item {
                key: Key::new(256, item_type::DIR_ITEM, name_hash(name)),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(257, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFREG | 0o644, 5, 0, 1),
            },
            Item {
                key: Key::new(257, item_type::INODE_REF, 256),
                data: encode_inode_ref(2, name),
            },
        ];
        items.sort_by_key(|i| i.key);
        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items,
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        let mut source = MapSource(map);
        let root = RootItem {
            objectid: 5,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };
        let mut csum_lookup = |_start: u64, _len: u64| Vec::new();
        let mut visited_leaves = HashSet::new();
        let errors = check_subvolume_tree(
            &mut source,
            &root,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            None,
        )
        .expect("check ok");
        assert!(errors.contains(ErrorKind::DirIndexMissing));
    }

    #[test]
    fn shared_leaf_is_validated_once() {
        // spec.md §4.2 "Shared-leaf optimization": two roots pointing at the
        // same leaf bytenr (a snapshot sharing its parent's unmodified leaf)
        // must not be double-counted; the second root's walk should see the
        // leaf already claimed and skip it rather than re-deriving an
        // `InodeItemMissing` error from an empty-looking partial record.
        let name = b"foo";
        let mut items = vec![
            Item {
                key: Key::new(256, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFDIR | 0o755, name.len() as u64, 0, 1),
            },
            Item {
                key: Key::new(256, item_type::DIR_ITEM, name_hash(name)),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(256, item_type::DIR_INDEX, 2),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(257, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFREG | 0o644, 5, 0, 1),
            },
            Item {
                key: Key::new(257, item_type::INODE_REF, 256),
                data: encode_inode_ref(2, name),
            },
        ];
        items.sort_by_key(|i| i.key);
        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items,
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        let mut source = MapSource(map);

        let root_a = RootItem {
            objectid: 5,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };
        let root_b = RootItem {
            objectid: 6,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };

        let mut csum_lookup = |_start: u64, _len: u64| Vec::new();
        let mut visited_leaves = HashSet::new();
        let errors_a = check_subvolume_tree(
            &mut source,
            &root_a,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            None,
        )
        .expect("check ok");
        assert!(errors_a.is_empty());

        let errors_b = check_subvolume_tree(
            &mut source,
            &root_b,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            None,
        )
        .expect("check ok");
        assert!(
            errors_b.is_empty(),
            "shared leaf should be skipped, not re-reported, got bits {:#x}",
            errors_b.bits()
        );
    }

    #[derive(Default)]
    struct RecordingTxn {
        inserted: Vec<(u64, u8, u64)>,
    }

    impl Transaction for RecordingTxn {
        fn insert_item(
            &mut self,
            objectid: u64,
            item_type: u8,
            offset: u64,
            _data: &[u8],
        ) -> Result<(), FsckError> {
            self.inserted.push((objectid, item_type, offset));
            Ok(())
        }
        fn delete_item(&mut self, _objectid: u64, _item_type: u8, _offset: u64) -> Result<(), FsckError> {
            Ok(())
        }
        fn overwrite_item(
            &mut self,
            _objectid: u64,
            _item_type: u8,
            _offset: u64,
            _data: &[u8],
        ) -> Result<(), FsckError> {
            Ok(())
        }
        fn commit(self) -> Result<(), FsckError> {
            Ok(())
        }
    }

    #[test]
    fn repair_adds_missing_dir_index_end_to_end() {
        // spec.md §8 scenario 2: INODE_REF + DIR_ITEM present, DIR_INDEX
        // gone. A repair pass should add `(256, DIR_INDEX, 2)` and clear
        // `DirIndexMissing` from the returned error set.
        let name = b"foo";
        let mut items = vec![
            Item {
                key: Key::new(256, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFDIR | 0o755, name.len() as u64, 0, 1),
            },
            Item {
                key: Key::new(256, item_type::DIR_ITEM, name_hash(name)),
                data: encode_dir_item(257, 1, name),
            },
            Item {
                key: Key::new(257, item_type::INODE_ITEM, 0),
                data: encode_inode_item(mode::S_IFREG | 0o644, 5, 0, 1),
            },
            Item {
                key: Key::new(257, item_type::INODE_REF, 256),
                data: encode_inode_ref(2, name),
            },
        ];
        items.sort_by_key(|i| i.key);
        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items,
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        let mut source = MapSource(map);
        let root = RootItem {
            objectid: 5,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };
        let mut csum_lookup = |_start: u64, _len: u64| Vec::new();
        let mut visited_leaves = HashSet::new();
        let mut txn = RecordingTxn::default();
        let errors = check_subvolume_tree(
            &mut source,
            &root,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            Some(&mut txn),
        )
        .expect("check ok");
        assert!(
            !errors.contains(ErrorKind::DirIndexMissing),
            "repair should have cleared DirIndexMissing, got bits {:#x}",
            errors.bits()
        );
        assert_eq!(txn.inserted, vec![(256, item_type::DIR_INDEX, 2)]);
    }

    #[test]
    fn repair_fixes_bad_mode_from_adjacent_extent_data_end_to_end() {
        // spec.md §8 scenario 4: inode 257 has mode 0 but an adjacent
        // EXTENT_DATA item. Repair should infer a regular file and write
        // `S_IFREG | 0700`.
        let extent_data = {
            let mut buf = vec![0u8; 21];
            buf[20] = 1; // extent_type = Regular
            buf.extend_from_slice(&0u64.to_le_bytes()); // disk_bytenr
            buf.extend_from_slice(&0u64.to_le_bytes()); // disk_num_bytes
            buf.extend_from_slice(&0u64.to_le_bytes()); // offset
            buf.extend_from_slice(&0u64.to_le_bytes()); // num_bytes
            buf
        };
        let mut items = vec![
            Item {
                key: Key::new(257, item_type::INODE_ITEM, 0),
                data: encode_inode_item(0, 0, 0, 1),
            },
            Item {
                key: Key::new(257, item_type::EXTENT_DATA, 0),
                data: extent_data,
            },
            Item {
                key: Key::new(257, item_type::INODE_REF, 256),
                data: encode_inode_ref(2, b"foo"),
            },
        ];
        items.sort_by_key(|i| i.key);
        let leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items,
        };
        let mut map = HashMap::new();
        map.insert(10, leaf);
        let mut source = MapSource(map);
        let root = RootItem {
            objectid: 5,
            bytenr: 10,
            generation: 1,
            level: 0,
            refs: 1,
            root_dirid: 256,
            last_snapshot: 0,
        };
        let mut csum_lookup = |_start: u64, _len: u64| Vec::new();
        let mut visited_leaves = HashSet::new();
        let mut txn = RecordingTxn::default();
        let errors = check_subvolume_tree(
            &mut source,
            &root,
            10,
            4096,
            &mut csum_lookup,
            &mut visited_leaves,
            Some(&mut txn),
        )
        .expect("check ok");
        assert!(
            !errors.contains(ErrorKind::InodeModeError),
            "repair should have cleared InodeModeError, got bits {:#x}",
            errors.bits()
        );
    }
}
