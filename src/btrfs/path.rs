//! B-tree navigator (spec.md §4.1 "B-tree navigator").
//!
//! Grounded on the teacher's `xfs::btree::collect_inobt_records` — explicit
//! child-pointer selection during a level-by-level descent — generalized
//! here into a stateful cursor (`Path`) that supports forward/backward
//! in-order stepping instead of a one-shot collection. The physical
//! block-device/mirror-read layer is out of scope (spec.md §1 "external
//! collaborators"); callers supply it through the [`BlockSource`] trait,
//! which is also where csum/generation verification happens.

use crate::btrfs::treeblock::{Item, TreeBlock};
use crate::btrfs::types::Key;
use crate::error::FsckError;

/// Reads a tree block given its bytenr, performing whatever mirror
/// fallback and csum verification the concrete implementation provides.
/// `expected_generation` lets the reader catch a stale mirror or torn
/// write when the caller already knows what generation the parent key
/// pointer recorded; it is `None` only for a tree's root.
pub trait BlockSource {
    fn read_block(
        &mut self,
        bytenr: u64,
        expected_generation: Option<u64>,
    ) -> Result<TreeBlock, FsckError>;
}

#[derive(Debug, Clone)]
struct PathLevel {
    block: TreeBlock,
    slot: usize,
}

/// A cursor into a single tree.
///
/// Invariant (spec.md §4.1): a `Path` does not survive a mutation of the
/// tree it was built from — any CoW rewrites the blocks the path is
/// holding onto. The type itself cannot enforce this (there is no kernel
/// page lock to borrow-check against), so every mutating operation in this
/// crate drops its `Path` before returning and the caller re-`search_slot`s
/// to get a fresh one.
pub struct Path {
    levels: Vec<PathLevel>,
}

impl Path {
    /// Descend from `root_bytenr` to the leaf slot that either holds `key`
    /// exactly or is the first slot greater than it (the insertion point).
    /// Returns the path plus whether an exact match was found, mirroring
    /// the upstream tool's `btrfs_search_slot` return convention.
    pub fn search_slot(
        source: &mut impl BlockSource,
        root_bytenr: u64,
        key: Key,
    ) -> Result<(Self, bool), FsckError> {
        let mut levels = Vec::new();
        let mut bytenr = root_bytenr;
        let mut expected_generation = None;

        loop {
            let block = source.read_block(bytenr, expected_generation)?;
            if block.is_leaf() {
                let slot = block.items.partition_point(|item| item.key < key);
                let exact = block.items.get(slot).map(|i| i.key) == Some(key);
                levels.push(PathLevel { block, slot });
                return Ok((Self { levels }, exact));
            }

            let slot = lower_bound_internal(&block, key);
            let kp = block.key_ptrs[slot];
            expected_generation = Some(kp.generation);
            bytenr = kp.blockptr;
            levels.push(PathLevel { block, slot });
        }
    }

    fn leaf(&self) -> &PathLevel {
        self.levels.last().expect("path always has at least one level")
    }

    /// The key at the current slot, or `None` if the slot is past the end
    /// of the leaf (an exhausted path, e.g. after `next_slot` hits the end
    /// of the tree).
    pub fn current_key(&self) -> Option<Key> {
        self.current_item().map(|item| item.key)
    }

    pub fn current_item(&self) -> Option<&Item> {
        let leaf = self.leaf();
        leaf.block.items.get(leaf.slot)
    }

    /// Bytenr of the leaf block the cursor currently sits in, used by the
    /// shared-leaf optimization (spec.md §4.2 "Shared-leaf optimization").
    pub fn current_leaf_bytenr(&self) -> u64 {
        self.leaf().block.bytenr
    }

    /// Move to the next item in key order, fetching sibling/parent blocks
    /// as needed. Returns `false` once the path has run off the end of the
    /// tree.
    pub fn next_slot(&mut self, source: &mut impl BlockSource) -> Result<bool, FsckError> {
        let leaf_idx = self.levels.len() - 1;
        self.levels[leaf_idx].slot += 1;
        if self.levels[leaf_idx].slot < self.levels[leaf_idx].block.nritems() {
            return Ok(true);
        }

        let Some(climb_to) = self.climb_for_next(leaf_idx)? else {
            return Ok(false);
        };
        self.descend_first(source, climb_to, leaf_idx, true)?;
        Ok(true)
    }

    /// Move to the previous item in key order. Returns `false` once the
    /// path has run off the start of the tree.
    pub fn prev_slot(&mut self, source: &mut impl BlockSource) -> Result<bool, FsckError> {
        let leaf_idx = self.levels.len() - 1;
        if self.levels[leaf_idx].slot > 0 {
            self.levels[leaf_idx].slot -= 1;
            return Ok(true);
        }

        let Some(climb_to) = self.climb_for_prev(leaf_idx)? else {
            return Ok(false);
        };
        self.descend_first(source, climb_to, leaf_idx, false)?;
        Ok(true)
    }

    /// Pops levels upward until one has a next sibling slot, returning the
    /// level index to redescend from, or `None` if the whole tree is
    /// exhausted.
    fn climb_for_next(&mut self, leaf_idx: usize) -> Result<Option<usize>, FsckError> {
        let mut level = leaf_idx;
        loop {
            if level == 0 {
                return Ok(None);
            }
            level -= 1;
            self.levels[level].slot += 1;
            if self.levels[level].slot < self.levels[level].block.nritems() {
                return Ok(Some(level));
            }
        }
    }

    fn climb_for_prev(&mut self, leaf_idx: usize) -> Result<Option<usize>, FsckError> {
        let mut level = leaf_idx;
        loop {
            if level == 0 {
                return Ok(None);
            }
            level -= 1;
            if self.levels[level].slot > 0 {
                self.levels[level].slot -= 1;
                return Ok(Some(level));
            }
        }
    }

    /// Redescend from `from_level` down to the leaf, entering each new
    /// child at its first slot (`forward`) or last slot (`!forward`).
    fn descend_first(
        &mut self,
        source: &mut impl BlockSource,
        from_level: usize,
        leaf_idx: usize,
        forward: bool,
    ) -> Result<(), FsckError> {
        let mut level = from_level;
        while level < leaf_idx {
            let parent_slot = self.levels[level].slot;
            let kp = self.levels[level].block.key_ptrs[parent_slot];
            let child = source.read_block(kp.blockptr, Some(kp.generation))?;
            let slot = if forward {
                0
            } else {
                child.nritems().saturating_sub(1)
            };
            self.levels[level + 1] = PathLevel { block: child, slot };
            level += 1;
        }
        Ok(())
    }

    /// Step backward until either the objectid no longer matches or the
    /// start of the tree is reached, returning the last matching key seen.
    /// Used by callers hunting for "the previous item with this objectid"
    /// (spec.md §4.1).
    pub fn previous_item_for_objectid(
        &mut self,
        source: &mut impl BlockSource,
        objectid: u64,
    ) -> Result<Option<Key>, FsckError> {
        loop {
            if !self.prev_slot(source)? {
                return Ok(None);
            }
            match self.current_key() {
                Some(key) if key.objectid == objectid => return Ok(Some(key)),
                _ => return Ok(None),
            }
        }
    }
}

/// Largest index `i` such that `block.key_ptrs[i].key <= key`, clamped to
/// 0 (every internal node's first key pointer is treated as covering
/// everything below it, matching the upstream tool's descent rule).
fn lower_bound_internal(block: &TreeBlock, key: Key) -> usize {
    let idx = block.key_ptrs.partition_point(|kp| kp.key <= key);
    idx.saturating_sub(1)
}
