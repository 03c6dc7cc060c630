//! Tree block (node/leaf) parsing (spec.md §3 "TreeBlock").
//!
//! Grounded on the teacher's `xfs::btree::{XfsBtreeShortBlockV4, parse_inobt_leaf}`
//! — a fixed header followed by a flat array of fixed-size records — but a
//! btrfs tree block has two distinct trailing layouts depending on its
//! level: internal nodes carry `(key, blockptr, generation)` triples,
//! leaves carry `(key, offset, size)` item headers growing downward from
//! the end of the block toward data growing upward from just after the
//! header, as in `original_source/kernel-shared/ctree.h`'s
//! `btrfs_header`/`btrfs_item`/`btrfs_key_ptr` layout.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::btrfs::types::Key;
use crate::error::FsckError;

pub const CSUM_SIZE: usize = 32;
pub const FSID_SIZE: usize = 16;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct HeaderRaw {
    csum: [u8; CSUM_SIZE],
    fsid: [u8; FSID_SIZE],
    bytenr: U64,
    flags: U64,
    chunk_tree_uuid: [u8; FSID_SIZE],
    generation: U64,
    owner: U64,
    nritems: U32,
    level: u8,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct DiskKeyRaw {
    objectid: U64,
    item_type: u8,
    offset: U64,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct KeyPtrRaw {
    key: DiskKeyRaw,
    blockptr: U64,
    generation: U64,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct ItemRaw {
    key: DiskKeyRaw,
    offset: U32,
    size: U32,
}

fn key_from_raw(raw: &DiskKeyRaw) -> Key {
    Key::new(raw.objectid.get(), raw.item_type, raw.offset.get())
}

/// One internal-node entry: the key covering the child subtree, the
/// child's bytenr, and the generation it was written at (spec.md §3
/// "TreeBlock" node entries).
#[derive(Debug, Clone, Copy)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// One leaf entry: the key plus a byte range into the leaf's data area
/// (spec.md §3 "TreeBlock" leaf entries).
#[derive(Debug, Clone)]
pub struct Item {
    pub key: Key,
    pub data: Vec<u8>,
}

/// A parsed tree block: either an internal node (`level > 0`, `key_ptrs`
/// populated) or a leaf (`level == 0`, `items` populated).
#[derive(Debug, Clone)]
pub struct TreeBlock {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub level: u8,
    pub key_ptrs: Vec<KeyPtr>,
    pub items: Vec<Item>,
}

impl TreeBlock {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// First key in the block, used by the navigator to decide which
    /// child pointer to descend into (spec.md §4.1 "search_slot").
    pub fn first_key(&self) -> Option<Key> {
        if self.is_leaf() {
            self.items.first().map(|item| item.key)
        } else {
            self.key_ptrs.first().map(|kp| kp.key)
        }
    }

    pub fn nritems(&self) -> usize {
        if self.is_leaf() {
            self.items.len()
        } else {
            self.key_ptrs.len()
        }
    }

    /// Parse `buf` (exactly `node_size` bytes) into header + item/keyptr
    /// tables, verifying the body's crc32c against the header's stored
    /// `csum` along the way (spec.md §4.1 "Block validation on load... if
    /// csum verification fails").
    pub fn parse(buf: &[u8], node_size: u32) -> Result<Self, FsckError> {
        if buf.len() < node_size as usize {
            return Err(FsckError::Parse("tree block shorter than node size"));
        }
        let header = HeaderRaw::ref_from_prefix(buf)
            .map_err(|_| FsckError::Parse("buffer too small for tree block header"))?
            .0;

        let computed = crc32c::crc32c(&buf[CSUM_SIZE..node_size as usize]);
        if header.csum[0..4] != computed.to_le_bytes() {
            return Err(FsckError::CsumMismatch("tree block"));
        }

        let header_size = std::mem::size_of::<HeaderRaw>();
        let nritems = header.nritems.get() as usize;
        let level = header.level;

        if level > 0 {
            let mut key_ptrs = Vec::with_capacity(nritems);
            let mut cursor = header_size;
            for _ in 0..nritems {
                let raw = KeyPtrRaw::ref_from_prefix(&buf[cursor..])
                    .map_err(|_| {
                        FsckError::BrokenBlock {
                            bytenr: header.bytenr.get(),
                            reason: "keyptr table truncated",
                        }
                    })?
                    .0;
                key_ptrs.push(KeyPtr {
                    key: key_from_raw(&raw.key),
                    blockptr: raw.blockptr.get(),
                    generation: raw.generation.get(),
                });
                cursor += std::mem::size_of::<KeyPtrRaw>();
            }
            Ok(Self {
                bytenr: header.bytenr.get(),
                generation: header.generation.get(),
                owner: header.owner.get(),
                level,
                key_ptrs,
                items: Vec::new(),
            })
        } else {
            let mut items = Vec::with_capacity(nritems);
            let mut cursor = header_size;
            for _ in 0..nritems {
                let raw = ItemRaw::ref_from_prefix(&buf[cursor..])
                    .map_err(|_| FsckError::BrokenBlock {
                        bytenr: header.bytenr.get(),
                        reason: "item table truncated",
                    })?
                    .0;
                let data_off = header_size + raw.offset.get() as usize;
                let data_end = data_off + raw.size.get() as usize;
                if data_end > buf.len() {
                    return Err(FsckError::BrokenBlock {
                        bytenr: header.bytenr.get(),
                        reason: "item data range exceeds block",
                    });
                }
                items.push(Item {
                    key: key_from_raw(&raw.key),
                    data: buf[data_off..data_end].to_vec(),
                });
                cursor += std::mem::size_of::<ItemRaw>();
            }
            Ok(Self {
                bytenr: header.bytenr.get(),
                generation: header.generation.get(),
                owner: header.owner.get(),
                level,
                key_ptrs: Vec::new(),
                items,
            })
        }
    }
}

impl TreeBlock {
    /// Structural validation performed on every block load (spec.md §4.1
    /// "Block validation on load"): header bytenr must match the address it
    /// was read at, level must not exceed the fixed maximum, and keys must
    /// be strictly increasing. `nritems` bounds and owner-tree-id checks are
    /// left to the caller, which knows the node size and the context's set
    /// of legal tree ids; this method covers the checks that are universal
    /// regardless of context.
    pub fn validate(&self, expected_bytenr: u64) -> Result<(), FsckError> {
        if self.bytenr != expected_bytenr {
            return Err(FsckError::BrokenBlock {
                bytenr: expected_bytenr,
                reason: "header bytenr does not match requested address",
            });
        }
        if self.level as usize > crate::btrfs::types::BTRFS_MAX_LEVEL {
            return Err(FsckError::BrokenBlock {
                bytenr: expected_bytenr,
                reason: "level exceeds maximum tree depth",
            });
        }
        let keys_increasing = if self.is_leaf() {
            self.items.windows(2).all(|w| w[0].key < w[1].key)
        } else {
            self.key_ptrs.windows(2).all(|w| w[0].key < w[1].key)
        };
        if !keys_increasing {
            return Err(FsckError::BrokenBlock {
                bytenr: expected_bytenr,
                reason: "item keys are not strictly increasing",
            });
        }
        Ok(())
    }

    /// spec.md §4.1: "for inner nodes each child's generation equals the
    /// pointer's generation". Called by the navigator once the child block
    /// has actually been read, against the `KeyPtr` that named it.
    pub fn validate_generation(&self, expected_generation: u64) -> Result<(), FsckError> {
        if self.generation != expected_generation {
            return Err(FsckError::BrokenBlock {
                bytenr: self.bytenr,
                reason: "block generation does not match parent pointer",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_SIZE: u32 = 4096;

    fn write_key(buf: &mut [u8], at: usize, key: Key) {
        buf[at..at + 8].copy_from_slice(&key.objectid.to_le_bytes());
        buf[at + 8] = key.item_type;
        buf[at + 9..at + 17].copy_from_slice(&key.offset.to_le_bytes());
    }

    fn build_leaf_with_one_item() -> Vec<u8> {
        let mut buf = vec![0u8; NODE_SIZE as usize];
        // header.nritems at offset 96 (csum32+fsid16+bytenr8+flags8+uuid16+gen8+owner8=96)
        buf[96..100].copy_from_slice(&1u32.to_le_bytes());
        buf[100] = 0; // level = leaf
        let header_size = std::mem::size_of::<HeaderRaw>();
        assert_eq!(header_size, 101);
        write_key(&mut buf, header_size, Key::new(256, 1, 0));
        // one ItemRaw is key(17) + offset(4) + size(4) = 25 bytes; place data
        // immediately after it to avoid overlapping the item table itself.
        let item_raw_size = 25;
        let data = b"hello";
        buf[header_size + 17..header_size + 21]
            .copy_from_slice(&(item_raw_size as u32).to_le_bytes());
        buf[header_size + 21..header_size + 25].copy_from_slice(&(data.len() as u32).to_le_bytes());
        let data_off = header_size + item_raw_size;
        buf[data_off..data_off + data.len()].copy_from_slice(data);
        let computed = crc32c::crc32c(&buf[CSUM_SIZE..]);
        buf[0..4].copy_from_slice(&computed.to_le_bytes());
        buf
    }

    #[test]
    fn parses_leaf_header_fields() {
        let buf = build_leaf_with_one_item();
        let block = TreeBlock::parse(&buf, NODE_SIZE).expect("parses");
        assert!(block.is_leaf());
        assert_eq!(block.nritems(), 1);
        assert_eq!(block.items[0].key, Key::new(256, 1, 0));
    }

    #[test]
    fn rejects_bad_csum() {
        let mut buf = build_leaf_with_one_item();
        buf[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches!(
            TreeBlock::parse(&buf, NODE_SIZE),
            Err(FsckError::CsumMismatch(_))
        ));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let buf = vec![0u8; 10];
        assert!(TreeBlock::parse(&buf, NODE_SIZE).is_err());
    }
}
