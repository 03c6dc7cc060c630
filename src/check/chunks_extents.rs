//! Pass A — chunk/extent sanity (spec.md §4.2 `check_chunks_and_extents_lowmem`).
//!
//! Grounded on the teacher's `xfs::btree::collect_inobt_records` for the
//! "parse a fixed header, then a variable-length array whose length the
//! header names" shape (here: `ChunkItem`'s stripe array and `ExtentItem`'s
//! inline backref list), and on spec.md §3's "Chunk & device extent" /
//! "Extent item" / "Block group item" entities.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::btrfs::keyed_roots::find_root;
use crate::btrfs::path::{BlockSource, Path};
use crate::btrfs::types::{item_type, tree_id, Key};
use crate::check::file_extent::FileExtent;
use crate::error::FsckError;
use crate::errors_taxonomy::{ErrorKind, ErrorSet, RefErrorKind};

pub mod block_profile {
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const DATA: u64 = 1 << 0;
    pub const SYSTEM: u64 = 1 << 1;
    pub const METADATA: u64 = 1 << 2;
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct ChunkItemRaw {
    length: U64,
    owner: U64,
    stripe_len: U64,
    chunk_type: U64,
    io_align: U32,
    io_width: U32,
    sector_size: U32,
    num_stripes: U16,
    sub_stripes: U16,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct StripeRaw {
    devid: U64,
    offset: U64,
    dev_uuid: [u8; 16],
}

#[derive(Debug, Clone, Copy)]
pub struct Stripe {
    pub devid: u64,
    pub physical_offset: u64,
}

/// Parsed `CHUNK_ITEM` (spec.md §3 "Chunk & device extent"). `logical_offset`
/// comes from the item's key, not the item body.
#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub logical_offset: u64,
    pub length: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub sector_size: u32,
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    pub fn parse(logical_offset: u64, data: &[u8]) -> Result<Self, FsckError> {
        let raw = ChunkItemRaw::ref_from_prefix(data)
            .map_err(|_| FsckError::Parse("chunk item shorter than header"))?
            .0;
        let header_size = std::mem::size_of::<ChunkItemRaw>();
        let num_stripes = raw.num_stripes.get() as usize;
        let mut stripes = Vec::with_capacity(num_stripes);
        let mut cursor = header_size;
        for _ in 0..num_stripes {
            let stripe = StripeRaw::ref_from_prefix(&data[cursor..])
                .map_err(|_| FsckError::Parse("chunk stripe array truncated"))?
                .0;
            stripes.push(Stripe {
                devid: stripe.devid.get(),
                physical_offset: stripe.offset.get(),
            });
            cursor += std::mem::size_of::<StripeRaw>();
        }
        Ok(Self {
            logical_offset,
            length: raw.length.get(),
            stripe_len: raw.stripe_len.get(),
            chunk_type: raw.chunk_type.get(),
            sector_size: raw.sector_size.get(),
            stripes,
        })
    }

    fn profile_bits(&self) -> u64 {
        self.chunk_type
            & (block_profile::RAID0
                | block_profile::RAID1
                | block_profile::DUP
                | block_profile::RAID10
                | block_profile::RAID5
                | block_profile::RAID6)
    }

    /// Minimum stripe count for the asserted profile; `DUP`/`RAID1` require
    /// exactly 2, single/unset profiles require exactly 1, striped
    /// profiles require at least 2 (a precise parity-stripe count needs
    /// the device count, out of scope here).
    pub fn stripe_count_is_valid(&self) -> bool {
        match self.profile_bits() {
            0 => self.stripes.len() == 1,
            b if b == block_profile::DUP || b == block_profile::RAID1 => self.stripes.len() == 2,
            _ => self.stripes.len() >= 2,
        }
    }

    pub fn is_sector_aligned(&self) -> bool {
        self.logical_offset % self.sector_size as u64 == 0
            && self.length % self.sector_size as u64 == 0
    }
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct DevExtentRaw {
    chunk_tree: U64,
    chunk_objectid: U64,
    chunk_offset: U64,
    length: U64,
}

/// Parsed `DEV_EXTENT` (spec.md §3 "Chunk & device extent"). `devid` and
/// `physical_offset` come from the item's key.
#[derive(Debug, Clone, Copy)]
pub struct DevExtent {
    pub devid: u64,
    pub physical_offset: u64,
    pub chunk_offset: u64,
    pub length: u64,
}

impl DevExtent {
    pub fn parse(devid: u64, physical_offset: u64, data: &[u8]) -> Result<Self, FsckError> {
        let raw = DevExtentRaw::ref_from_prefix(data)
            .map_err(|_| FsckError::Parse("dev extent shorter than header"))?
            .0;
        Ok(Self {
            devid,
            physical_offset,
            chunk_offset: raw.chunk_offset.get(),
            length: raw.length.get(),
        })
    }
}

/// spec.md §3 "Chunk & device extent" invariants: every stripe resolves to
/// a matching dev-extent of the same length, naming this chunk's logical
/// offset, and the stripe fits on its device.
pub fn check_chunk_dev_extents(
    chunk: &ChunkItem,
    dev_extents: &[DevExtent],
    device_total_bytes: impl Fn(u64) -> Option<u64>,
) -> ErrorSet {
    let mut errors = ErrorSet::EMPTY;
    if !chunk.stripe_count_is_valid() {
        errors.insert_ref(RefErrorKind::ChunkTypeMismatch);
    }
    if !chunk.is_sector_aligned() {
        errors.insert(ErrorKind::BytesUnaligned);
    }

    for stripe in &chunk.stripes {
        let matching = dev_extents
            .iter()
            .find(|de| de.devid == stripe.devid && de.physical_offset == stripe.physical_offset);
        match matching {
            None => errors.insert(ErrorKind::BackrefMissing),
            Some(dev_extent) => {
                if dev_extent.length != chunk.stripe_len
                    || dev_extent.chunk_offset != chunk.logical_offset
                {
                    errors.insert(ErrorKind::BackrefMismatch);
                }
                if let Some(total) = device_total_bytes(stripe.devid) {
                    if stripe.physical_offset + dev_extent.length > total {
                        errors.insert_ref(RefErrorKind::CrossingStripeBoundary);
                    }
                }
            }
        }
    }
    errors
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct BlockGroupItemRaw {
    used: U64,
    chunk_objectid: U64,
    flags: U64,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockGroupItem {
    pub chunk_logical_offset: u64,
    pub length: u64,
    pub used: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub fn parse(chunk_logical_offset: u64, length: u64, data: &[u8]) -> Result<Self, FsckError> {
        let raw = BlockGroupItemRaw::ref_from_prefix(data)
            .map_err(|_| FsckError::Parse("block group item shorter than header"))?
            .0;
        Ok(Self {
            chunk_logical_offset,
            length,
            used: raw.used.get(),
            flags: raw.flags.get(),
        })
    }
}

/// spec.md §3 "Block group item" invariant: `used` equals the sum of
/// `num_bytes` of extent items inside the chunk's logical range, and the
/// type flags (data/metadata/system) agree with the owning chunk.
pub fn check_block_group(chunk: &ChunkItem, bg: &BlockGroupItem, extent_bytes_used: u64) -> ErrorSet {
    let mut errors = ErrorSet::EMPTY;
    if bg.used != extent_bytes_used {
        errors.insert(ErrorKind::BgAccountingError);
    }
    let type_mask = block_profile::DATA | block_profile::METADATA | block_profile::SYSTEM;
    if chunk.chunk_type & type_mask != bg.flags & type_mask {
        errors.insert_ref(RefErrorKind::ChunkTypeMismatch);
    }
    errors
}

/// One inline or keyed backref attached to an `EXTENT_ITEM`/`METADATA_ITEM`
/// (spec.md §3 "Extent item").
#[derive(Debug, Clone, Copy)]
pub enum Backref {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    /// `offset` is the `EXTENT_DATA_REF`'s own offset field: the
    /// referencer file extent item's `key.offset - extent_offset`, which
    /// disambiguates which of an inode's (possibly several, e.g. reflinked)
    /// file extents this backref names.
    ExtentData { root: u64, inode: u64, count: u32, offset: u64 },
    SharedData { parent: u64, count: u32 },
}

impl Backref {
    pub fn ref_count(&self) -> u32 {
        match self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 1,
            Self::ExtentData { count, .. } | Self::SharedData { count, .. } => *count,
        }
    }
}

/// Parsed `EXTENT_ITEM`/`METADATA_ITEM` (spec.md §3 "Extent item"), with
/// its backrefs already decoded (inline + keyed, merged by the caller —
/// this module only models the invariant check, not tree traversal).
#[derive(Debug, Clone)]
pub struct ExtentItem {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub refs: u64,
    pub is_metadata: bool,
    pub generation: u64,
    pub level: Option<u8>,
    pub backrefs: Vec<Backref>,
}

/// spec.md §3 "Extent item" invariant: "the sum of backrefs' counts equals
/// the extent's refcount".
pub fn check_extent_backref_count(extent: &ExtentItem) -> ErrorSet {
    let mut errors = ErrorSet::EMPTY;
    let sum: u64 = extent.backrefs.iter().map(|b| b.ref_count() as u64).sum();
    if sum != extent.refs {
        errors.insert(ErrorKind::ReferencerMissing);
    }
    errors
}

/// spec.md §4.2 bullet 3: resolve each of `extent`'s backrefs to its actual
/// referencer instead of trusting the counts embedded in the extent item
/// itself. Tree-block refs are confirmed by reading the claimed block (or,
/// for a shared ref, the claimed parent node) directly; data refs are
/// confirmed by walking into the named subvolume tree and counting the file
/// extent items that actually point back at this extent.
pub fn resolve_extent_backref_referencers(
    source: &mut impl BlockSource,
    root_tree_bytenr: u64,
    extent: &ExtentItem,
) -> Result<ErrorSet, FsckError> {
    let mut errors = ErrorSet::EMPTY;
    for backref in &extent.backrefs {
        errors.merge(resolve_one_backref(source, root_tree_bytenr, extent, backref)?);
    }
    Ok(errors)
}

fn resolve_one_backref(
    source: &mut impl BlockSource,
    root_tree_bytenr: u64,
    extent: &ExtentItem,
    backref: &Backref,
) -> Result<ErrorSet, FsckError> {
    let mut errors = ErrorSet::EMPTY;
    match *backref {
        Backref::TreeBlock { root } => match source.read_block(extent.bytenr, Some(extent.generation)) {
            Ok(block) => {
                let level_matches = extent.level.map(|l| l == block.level).unwrap_or(true);
                if block.owner != root || block.generation != extent.generation || !level_matches {
                    errors.insert_ref(RefErrorKind::ReferencerMismatch);
                }
            }
            Err(_) => errors.insert(ErrorKind::ReferencerMissing),
        },
        Backref::SharedBlock { parent } => match source.read_block(parent, None) {
            Ok(parent_block) => {
                let found = parent_block
                    .key_ptrs
                    .iter()
                    .any(|kp| kp.blockptr == extent.bytenr && kp.generation == extent.generation);
                if !found {
                    errors.insert_ref(RefErrorKind::ReferencerMismatch);
                }
            }
            Err(_) => errors.insert(ErrorKind::ReferencerMissing),
        },
        Backref::ExtentData { root, inode, count, offset } => {
            if root == tree_id::DATA_RELOC_TREE_OBJECTID {
                return Ok(errors);
            }
            match find_root(source, root_tree_bytenr, root)? {
                None => errors.insert(ErrorKind::ReferencerMissing),
                Some(subvol) => {
                    let matched =
                        count_matching_file_extents(source, subvol.bytenr, inode, offset, extent.bytenr)?;
                    if matched == 0 {
                        errors.insert(ErrorKind::ReferencerMissing);
                    } else if matched as u32 != count {
                        errors.insert_ref(RefErrorKind::ReferencerMismatch);
                    }
                }
            }
        }
        Backref::SharedData { parent, count } => match source.read_block(parent, None) {
            Ok(leaf) => {
                let matched = leaf
                    .items
                    .iter()
                    .filter(|item| item.key.item_type == item_type::EXTENT_DATA)
                    .filter(|item| {
                        FileExtent::parse(item.key.offset, &item.data)
                            .map(|fe| fe.disk_bytenr == extent.bytenr)
                            .unwrap_or(false)
                    })
                    .count();
                if matched == 0 {
                    errors.insert(ErrorKind::ReferencerMissing);
                } else if matched as u32 != count {
                    errors.insert_ref(RefErrorKind::ReferencerMismatch);
                }
            }
            Err(_) => errors.insert(ErrorKind::ReferencerMissing),
        },
    }
    Ok(errors)
}

/// Count `inode`'s `EXTENT_DATA` items in the subvolume rooted at
/// `subvol_bytenr` whose `disk_bytenr` is `extent_bytenr` and whose
/// `file_offset - extent_offset` matches the backref's own `offset` field.
/// Walks backward from past the end of `inode`'s keyspace via
/// `previous_item_for_objectid`, the tool spec.md §4.1 names for exactly
/// this "find items for an objectid without knowing their exact type or
/// offset" search.
fn count_matching_file_extents(
    source: &mut impl BlockSource,
    subvol_bytenr: u64,
    inode: u64,
    backref_offset: u64,
    extent_bytenr: u64,
) -> Result<usize, FsckError> {
    let (mut path, _) = Path::search_slot(
        source,
        subvol_bytenr,
        Key::max_offset(inode, item_type::EXTENT_DATA),
    )?;
    let mut matched = 0;
    while let Some(key) = path.previous_item_for_objectid(source, inode)? {
        if key.item_type != item_type::EXTENT_DATA {
            continue;
        }
        let Some(item) = path.current_item() else {
            continue;
        };
        if let Ok(fe) = FileExtent::parse(key.offset, &item.data) {
            if fe.disk_bytenr == extent_bytenr && fe.file_offset.saturating_sub(fe.extent_offset) == backref_offset {
                matched += 1;
            }
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::btrfs::treeblock::{Item, TreeBlock};

    fn chunk_with_stripes(stripes: Vec<Stripe>, chunk_type: u64) -> ChunkItem {
        ChunkItem {
            logical_offset: 0x1_0000,
            length: 4096,
            stripe_len: 4096,
            chunk_type,
            sector_size: 4096,
            stripes,
        }
    }

    #[test]
    fn dup_profile_requires_two_stripes() {
        let chunk = chunk_with_stripes(
            vec![Stripe {
                devid: 1,
                physical_offset: 0,
            }],
            block_profile::METADATA | block_profile::DUP,
        );
        assert!(!chunk.stripe_count_is_valid());
    }

    #[test]
    fn single_profile_requires_one_stripe() {
        let chunk = chunk_with_stripes(
            vec![Stripe {
                devid: 1,
                physical_offset: 0,
            }],
            block_profile::DATA,
        );
        assert!(chunk.stripe_count_is_valid());
    }

    #[test]
    fn dev_extent_mismatch_is_reported() {
        let chunk = chunk_with_stripes(
            vec![Stripe {
                devid: 1,
                physical_offset: 0x2000,
            }],
            block_profile::DATA,
        );
        let dev_extents = [DevExtent {
            devid: 1,
            physical_offset: 0x2000,
            chunk_offset: 0x1_0000,
            length: 1024, // wrong, should be 4096
        }];
        let errs = check_chunk_dev_extents(&chunk, &dev_extents, |_| Some(u64::MAX));
        assert!(errs.contains(ErrorKind::BackrefMismatch));
    }

    #[test]
    fn missing_dev_extent_is_reported() {
        let chunk = chunk_with_stripes(
            vec![Stripe {
                devid: 1,
                physical_offset: 0x2000,
            }],
            block_profile::DATA,
        );
        let errs = check_chunk_dev_extents(&chunk, &[], |_| Some(u64::MAX));
        assert!(errs.contains(ErrorKind::BackrefMissing));
    }

    #[test]
    fn block_group_accounting_mismatch_detected() {
        let chunk = chunk_with_stripes(vec![], block_profile::DATA);
        let bg = BlockGroupItem {
            chunk_logical_offset: chunk.logical_offset,
            length: chunk.length,
            used: 100,
            flags: block_profile::DATA,
        };
        let errs = check_block_group(&chunk, &bg, 50);
        assert!(errs.contains(ErrorKind::BgAccountingError));
    }

    #[test]
    fn extent_backref_count_matches_refs() {
        let extent = ExtentItem {
            bytenr: 0x4000,
            num_bytes: 4096,
            refs: 2,
            is_metadata: false,
            generation: 1,
            level: None,
            backrefs: vec![Backref::ExtentData {
                root: 5,
                inode: 257,
                count: 2,
                offset: 0,
            }],
        };
        assert!(check_extent_backref_count(&extent).is_empty());
    }

    #[test]
    fn extent_backref_count_mismatch_detected() {
        let extent = ExtentItem {
            bytenr: 0x4000,
            num_bytes: 4096,
            refs: 3,
            is_metadata: false,
            generation: 1,
            level: None,
            backrefs: vec![Backref::ExtentData {
                root: 5,
                inode: 257,
                count: 2,
                offset: 0,
            }],
        };
        assert!(check_extent_backref_count(&extent).contains(ErrorKind::ReferencerMissing));
    }

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

    fn file_extent_data(disk_bytenr: u64, extent_offset: u64) -> Vec<u8> {
        let mut data = vec![0u8; 21 + 32];
        data[16] = 0; // compression
        data[17] = 0; // encryption
        data[20] = 1; // extent_type = Regular
        data[21..29].copy_from_slice(&disk_bytenr.to_le_bytes());
        data[29..37].copy_from_slice(&0u64.to_le_bytes()); // disk_num_bytes
        data[37..45].copy_from_slice(&extent_offset.to_le_bytes());
        data[45..53].copy_from_slice(&4096u64.to_le_bytes()); // num_bytes
        data
    }

    /// Mirrors `btrfs_root_item`'s layout (see `keyed_roots.rs`): a 160-byte
    /// embedded inode item, then `generation`/`root_dirid`/`bytenr` as the
    /// three fields this test cares about, with the rest left zeroed.
    fn encode_root_item(bytenr: u64, generation: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 239];
        buf[160..168].copy_from_slice(&generation.to_le_bytes());
        buf[176..184].copy_from_slice(&bytenr.to_le_bytes());
        buf
    }

    fn root_tree_with_subvol(subvol_objectid: u64, subvol_bytenr: u64) -> (TreeBlock, u64) {
        let data = encode_root_item(subvol_bytenr, 7);
        let leaf = TreeBlock {
            bytenr: 900,
            generation: 1,
            owner: tree_id::ROOT_TREE_OBJECTID,
            level: 0,
            key_ptrs: Vec::new(),
            items: vec![Item {
                key: Key::new(subvol_objectid, item_type::ROOT_ITEM, 0),
                data,
            }],
        };
        (leaf, 900)
    }

    #[test]
    fn tree_block_backref_resolves_against_real_block() {
        let block = TreeBlock {
            bytenr: 0x5000,
            generation: 3,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items: Vec::new(),
        };
        let mut map = HashMap::new();
        map.insert(0x5000, block);
        let mut source = MapSource(map);

        let extent = ExtentItem {
            bytenr: 0x5000,
            num_bytes: 4096,
            refs: 1,
            is_metadata: true,
            generation: 3,
            level: Some(0),
            backrefs: vec![Backref::TreeBlock { root: 5 }],
        };
        let errors = resolve_extent_backref_referencers(&mut source, 0, &extent).expect("resolves");
        assert!(errors.is_empty());
    }

    #[test]
    fn tree_block_backref_wrong_owner_is_mismatch() {
        let block = TreeBlock {
            bytenr: 0x5000,
            generation: 3,
            owner: 999,
            level: 0,
            key_ptrs: Vec::new(),
            items: Vec::new(),
        };
        let mut map = HashMap::new();
        map.insert(0x5000, block);
        let mut source = MapSource(map);

        let extent = ExtentItem {
            bytenr: 0x5000,
            num_bytes: 4096,
            refs: 1,
            is_metadata: true,
            generation: 3,
            level: Some(0),
            backrefs: vec![Backref::TreeBlock { root: 5 }],
        };
        let errors = resolve_extent_backref_referencers(&mut source, 0, &extent).expect("resolves");
        assert!(errors.contains_ref(RefErrorKind::ReferencerMismatch));
    }

    #[test]
    fn data_backref_resolves_against_matching_file_extent() {
        let (root_leaf, root_tree_bytenr) = root_tree_with_subvol(5, 10);
        let fs_leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items: vec![Item {
                key: Key::new(257, item_type::EXTENT_DATA, 0),
                data: file_extent_data(0x4000, 0),
            }],
        };
        let mut map = HashMap::new();
        map.insert(root_tree_bytenr, root_leaf);
        map.insert(10, fs_leaf);
        let mut source = MapSource(map);

        let extent = ExtentItem {
            bytenr: 0x4000,
            num_bytes: 4096,
            refs: 1,
            is_metadata: false,
            generation: 1,
            level: None,
            backrefs: vec![Backref::ExtentData {
                root: 5,
                inode: 257,
                count: 1,
                offset: 0,
            }],
        };
        let errors =
            resolve_extent_backref_referencers(&mut source, root_tree_bytenr, &extent).expect("resolves");
        assert!(errors.is_empty());
    }

    #[test]
    fn data_backref_with_no_matching_file_extent_is_missing() {
        let (root_leaf, root_tree_bytenr) = root_tree_with_subvol(5, 10);
        let fs_leaf = TreeBlock {
            bytenr: 10,
            generation: 1,
            owner: 5,
            level: 0,
            key_ptrs: Vec::new(),
            items: Vec::new(),
        };
        let mut map = HashMap::new();
        map.insert(root_tree_bytenr, root_leaf);
        map.insert(10, fs_leaf);
        let mut source = MapSource(map);

        let extent = ExtentItem {
            bytenr: 0x4000,
            num_bytes: 4096,
            refs: 1,
            is_metadata: false,
            generation: 1,
            level: None,
            backrefs: vec![Backref::ExtentData {
                root: 5,
                inode: 257,
                count: 1,
                offset: 0,
            }],
        };
        let errors =
            resolve_extent_backref_referencers(&mut source, root_tree_bytenr, &extent).expect("resolves");
        assert!(errors.contains(ErrorKind::ReferencerMissing));
    }

    #[test]
    fn data_backref_reloc_tree_is_skipped() {
        let mut source = MapSource(HashMap::new());
        let extent = ExtentItem {
            bytenr: 0x4000,
            num_bytes: 4096,
            refs: 1,
            is_metadata: false,
            generation: 1,
            level: None,
            backrefs: vec![Backref::ExtentData {
                root: tree_id::DATA_RELOC_TREE_OBJECTID,
                inode: 257,
                count: 1,
                offset: 0,
            }],
        };
        let errors = resolve_extent_backref_referencers(&mut source, 0, &extent).expect("resolves");
        assert!(errors.is_empty());
    }
}
