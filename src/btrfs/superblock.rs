//! Superblock parsing (spec.md §3 "Superblock").
//!
//! Grounded on the teacher's `xfs::superblock::FsContext::from_superblock`
//! (zerocopy `FromBytes` struct over a byte prefix, magic + version
//! extraction, then a small ergonomic wrapper type). Btrfs superblocks are
//! little-endian on disk, unlike XFS's big-endian layout, so this module
//! uses `zerocopy::byteorder::little_endian` instead of the teacher's
//! `big_endian` wrappers.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::FsckError;

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

/// Superblock read size and well-known mirror offsets (spec.md §3
/// "mirror copies at well-known offsets").
pub const SUPERBLOCK_OFFSET: u64 = 0x1_0000;
pub const SUPERBLOCK_MIRROR_OFFSETS: [u64; 2] = [0x400_0000, 0x4_0000_0000_00];

/// Incompat feature bits relevant to the checker.
pub mod incompat_flags {
    pub const MIXED_BACKREF: u64 = 1 << 0;
    pub const NO_HOLES: u64 = 1 << 9;
    pub const SKINNY_METADATA: u64 = 1 << 10;
}

/// On-disk superblock prefix (through `root_level`; enough for everything
/// the checker needs — device items, label, and system chunk array follow
/// but are out of scope for this module).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct SuperblockRaw {
    csum: [u8; BTRFS_CSUM_SIZE],
    fsid: [u8; BTRFS_FSID_SIZE],
    bytenr: U64,
    flags: U64,
    magic: [u8; 8],
    generation: U64,
    root: U64,
    chunk_root: U64,
    log_root: U64,
    _unused_log_root_transid: U64,
    total_bytes: U64,
    bytes_used: U64,
    root_dir_objectid: U64,
    num_devices: U64,
    sectorsize: U32,
    nodesize: U32,
    _unused_leafsize: U32,
    stripesize: U32,
    sys_chunk_array_size: U32,
    chunk_root_generation: U64,
    compat_flags: U64,
    compat_ro_flags: U64,
    incompat_flags: U64,
    csum_type: U16,
    root_level: u8,
    chunk_root_level: u8,
    log_root_level: u8,
}

/// Parsed, ergonomic superblock (spec.md §3 "Superblock").
#[derive(Debug, Clone)]
pub struct Superblock {
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub generation: u64,
    pub root_tree_bytenr: u64,
    pub chunk_tree_bytenr: u64,
    pub chunk_root_generation: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    /// Which mirror (0 = primary at `SUPERBLOCK_OFFSET`, 1.. = the
    /// corresponding index into `SUPERBLOCK_MIRROR_OFFSETS`) produced this
    /// superblock. Invariant (spec.md §3): "the first superblock that
    /// passes csum and magic wins; later mirrors are fallbacks."
    pub mirror_index: usize,
}

impl Superblock {
    /// Parse a single candidate buffer, without mirror fallback.
    /// `buf` must be at least 4096 bytes (the full fixed superblock size);
    /// only the prefix through `root_level` is actually interpreted.
    pub fn parse(buf: &[u8]) -> Result<Self, FsckError> {
        let raw = SuperblockRaw::ref_from_prefix(buf)
            .map_err(|_| FsckError::Parse("buffer too small for superblock"))?
            .0;

        if raw.magic != *BTRFS_MAGIC {
            return Err(FsckError::BadMagic("superblock"));
        }

        if !verify_csum(buf, raw.csum_type.get(), &raw.csum) {
            return Err(FsckError::CsumMismatch("superblock"));
        }

        Ok(Self {
            fsid: raw.fsid,
            generation: raw.generation.get(),
            root_tree_bytenr: raw.root.get(),
            chunk_tree_bytenr: raw.chunk_root.get(),
            chunk_root_generation: raw.chunk_root_generation.get(),
            total_bytes: raw.total_bytes.get(),
            bytes_used: raw.bytes_used.get(),
            sector_size: raw.sectorsize.get(),
            node_size: raw.nodesize.get(),
            incompat_flags: raw.incompat_flags.get(),
            csum_type: raw.csum_type.get(),
            root_level: raw.root_level,
            chunk_root_level: raw.chunk_root_level,
            mirror_index: 0,
        })
    }

    /// Try the primary superblock location, then each mirror in order,
    /// until one passes magic+csum (spec.md §3 invariant). `read_at` reads
    /// at least 4096 bytes at the given absolute byte offset; it returns
    /// `Err` only for genuine I/O failure (a short/garbage read that fails
    /// structural validation is handled here, not by the reader).
    pub fn load<F>(device_size: u64, mut read_at: F) -> Result<Self, FsckError>
    where
        F: FnMut(u64) -> Result<Vec<u8>, FsckError>,
    {
        let mut offsets = vec![SUPERBLOCK_OFFSET];
        offsets.extend(
            SUPERBLOCK_MIRROR_OFFSETS
                .iter()
                .copied()
                .filter(|&off| off + 4096 <= device_size),
        );

        let mut last_err = None;
        for (idx, offset) in offsets.into_iter().enumerate() {
            let buf = match read_at(offset) {
                Ok(buf) => buf,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match Self::parse(&buf) {
                Ok(mut sb) => {
                    sb.mirror_index = idx;
                    return Ok(sb);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or(FsckError::Parse("no superblock candidates")))
    }

    pub fn has_skinny_metadata(&self) -> bool {
        self.incompat_flags & incompat_flags::SKINNY_METADATA != 0
    }

    pub fn has_no_holes(&self) -> bool {
        self.incompat_flags & incompat_flags::NO_HOLES != 0
    }

    pub fn fsid_string(&self) -> String {
        crate::format::uuid::format_uuid(&self.fsid)
    }
}

/// Verify the superblock checksum. `csum_type == 0` is crc32c (the only
/// algorithm this crate implements end-to-end; spec.md §1 scopes out full
/// multi-algorithm csum support as part of the external block-device
/// layer). Other csum types are accepted without verification — the
/// on-disk csum field is opaque to us beyond crc32c.
fn verify_csum(buf: &[u8], csum_type: u16, stored: &[u8; BTRFS_CSUM_SIZE]) -> bool {
    if csum_type != 0 {
        return true;
    }
    if buf.len() < BTRFS_CSUM_SIZE {
        return false;
    }
    let computed = crc32c::crc32c(&buf[BTRFS_CSUM_SIZE..]);
    stored[0..4] == computed.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_superblock_bytes(magic_ok: bool, csum_ok: bool) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        if magic_ok {
            buf[64..72].copy_from_slice(BTRFS_MAGIC);
        }
        // generation
        buf[72..80].copy_from_slice(&42u64.to_le_bytes());
        // root
        buf[80..88].copy_from_slice(&0x4000u64.to_le_bytes());
        // chunk_root
        buf[88..96].copy_from_slice(&0x5000u64.to_le_bytes());
        // total_bytes
        buf[112..120].copy_from_slice(&(1u64 << 30).to_le_bytes());
        // bytes_used
        buf[120..128].copy_from_slice(&(1u64 << 20).to_le_bytes());
        // sectorsize
        buf[144..148].copy_from_slice(&4096u32.to_le_bytes());
        // nodesize
        buf[148..152].copy_from_slice(&16384u32.to_le_bytes());
        // csum_type stays 0 (crc32c) at its offset (184..186)
        let computed = crc32c::crc32c(&buf[BTRFS_CSUM_SIZE..]);
        if csum_ok {
            buf[0..4].copy_from_slice(&computed.to_le_bytes());
        } else {
            buf[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        }
        buf
    }

    #[test]
    fn parses_valid_superblock() {
        let buf = build_superblock_bytes(true, true);
        let sb = Superblock::parse(&buf).expect("should parse");
        assert_eq!(sb.generation, 42);
        assert_eq!(sb.root_tree_bytenr, 0x4000);
        assert_eq!(sb.node_size, 16384);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = build_superblock_bytes(false, true);
        assert!(matches!(Superblock::parse(&buf), Err(FsckError::BadMagic(_))));
    }

    #[test]
    fn rejects_bad_csum() {
        let buf = build_superblock_bytes(true, false);
        assert!(matches!(
            Superblock::parse(&buf),
            Err(FsckError::CsumMismatch(_))
        ));
    }

    #[test]
    fn load_falls_back_to_mirror() {
        let good = build_superblock_bytes(true, true);
        let bad = build_superblock_bytes(false, true);
        let device_size = SUPERBLOCK_MIRROR_OFFSETS[0] + 4096;
        let sb = Superblock::load(device_size, |offset| {
            if offset == SUPERBLOCK_OFFSET {
                Ok(bad.clone())
            } else {
                Ok(good.clone())
            }
        })
        .expect("should fall back to mirror");
        assert_eq!(sb.mirror_index, 1);
    }
}
