//! File extent validation (spec.md §3 "File extent", §4.2 Pass B
//! `check_file_extent`/`count_csum_range`).
//!
//! Grounded on the teacher's `xfs::extent::{XfsBmbtRec, unpack_with_context}`
//! for the "fixed on-disk record, unpack into an ergonomic struct" shape,
//! and on `original_source/check/mode-lowmem.c`'s `check_file_extent`.

use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::FsckError;
use crate::errors_taxonomy::{ErrorKind, ErrorSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    Inline,
    Regular,
    Prealloc,
}

impl ExtentKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Inline),
            1 => Some(Self::Regular),
            2 => Some(Self::Prealloc),
            _ => None,
        }
    }
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct FileExtentHeaderRaw {
    generation: U64,
    ram_bytes: U64,
    compression: u8,
    encryption: u8,
    other_encoding: U16,
    extent_type: u8,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct RegularTailRaw {
    disk_bytenr: U64,
    disk_num_bytes: U64,
    offset: U64,
    num_bytes: U64,
}

/// Parsed `EXTENT_DATA` item (spec.md §3 "File extent").
#[derive(Debug, Clone, Copy)]
pub struct FileExtent {
    pub file_offset: u64,
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub kind: ExtentKind,
    /// Only meaningful for `Regular`/`Prealloc`; zero for `Inline`.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub extent_offset: u64,
    pub num_bytes: u64,
}

impl FileExtent {
    pub fn parse(file_offset: u64, data: &[u8]) -> Result<Self, FsckError> {
        let header = FileExtentHeaderRaw::ref_from_prefix(data)
            .map_err(|_| FsckError::Parse("file extent item shorter than header"))?
            .0;
        let kind = ExtentKind::from_raw(header.extent_type)
            .ok_or(FsckError::Parse("unknown file extent type"))?;
        let header_size = std::mem::size_of::<FileExtentHeaderRaw>();

        let (disk_bytenr, disk_num_bytes, extent_offset, num_bytes) = match kind {
            ExtentKind::Inline => (0, 0, 0, header.ram_bytes.get()),
            ExtentKind::Regular | ExtentKind::Prealloc => {
                let tail = RegularTailRaw::ref_from_prefix(&data[header_size..])
                    .map_err(|_| FsckError::Parse("file extent tail truncated"))?
                    .0;
                (
                    tail.disk_bytenr.get(),
                    tail.disk_num_bytes.get(),
                    tail.offset.get(),
                    tail.num_bytes.get(),
                )
            }
        };

        Ok(Self {
            file_offset,
            generation: header.generation.get(),
            ram_bytes: header.ram_bytes.get(),
            compression: header.compression,
            kind,
            disk_bytenr,
            disk_num_bytes,
            extent_offset,
            num_bytes,
        })
    }

    pub fn is_hole(&self) -> bool {
        matches!(self.kind, ExtentKind::Regular) && self.disk_bytenr == 0
    }
}

/// One contiguous logical range covered by an `EXTENT_CSUM` item, in the
/// same coordinate space as `FileExtent::disk_bytenr`.
#[derive(Debug, Clone, Copy)]
pub struct CsumRange {
    pub start: u64,
    pub len: u64,
}

/// spec.md §4.2 `count_csum_range`: how many bytes of `[start, start+len)`
/// are covered by some csum range. `ranges` need not be sorted or
/// non-overlapping; double-covered bytes are not double-counted.
pub fn count_csum_range(ranges: &[CsumRange], start: u64, len: u64) -> u64 {
    let end = start + len;
    let mut covered = vec![false; len as usize];
    for range in ranges {
        let r_end = range.start + range.len;
        let overlap_start = range.start.max(start);
        let overlap_end = r_end.min(end);
        if overlap_start < overlap_end {
            let lo = (overlap_start - start) as usize;
            let hi = (overlap_end - start) as usize;
            covered[lo..hi].fill(true);
        }
    }
    covered.iter().filter(|&&b| b).count() as u64
}

/// spec.md §4.2 `check_file_extent`, minus the repair side. `sector_size`
/// bounds alignment checks; `no_datasum` comes from the owning inode's
/// flags; `csum_ranges` is the set of `EXTENT_CSUM` coverage the caller
/// already collected for this extent's disk range.
pub fn check_file_extent(
    extent: &FileExtent,
    sector_size: u64,
    no_datasum: bool,
    csum_ranges: &[CsumRange],
) -> ErrorSet {
    let mut errors = ErrorSet::EMPTY;

    if extent.extent_offset + extent.num_bytes > extent.ram_bytes {
        errors.insert(ErrorKind::FileExtentError);
    }

    if matches!(extent.kind, ExtentKind::Regular | ExtentKind::Prealloc) && !extent.is_hole() {
        if extent.disk_bytenr % sector_size != 0 || extent.disk_num_bytes % sector_size != 0 {
            errors.insert(ErrorKind::BytesUnaligned);
        }

        if matches!(extent.kind, ExtentKind::Regular) && !no_datasum && extent.num_bytes > 0 {
            let covered = count_csum_range(
                csum_ranges,
                extent.disk_bytenr + extent.extent_offset,
                extent.num_bytes,
            );
            if covered == 0 {
                errors.insert(ErrorKind::CsumItemMissing);
            } else if covered < extent.num_bytes {
                errors.insert(ErrorKind::OddCsumItem);
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular_extent(disk_bytenr: u64, num_bytes: u64) -> FileExtent {
        FileExtent {
            file_offset: 0,
            generation: 1,
            ram_bytes: num_bytes,
            compression: 0,
            kind: ExtentKind::Regular,
            disk_bytenr,
            disk_num_bytes: num_bytes,
            extent_offset: 0,
            num_bytes,
        }
    }

    #[test]
    fn count_csum_range_sums_non_overlapping_coverage() {
        let ranges = [
            CsumRange { start: 0, len: 100 },
            CsumRange {
                start: 200,
                len: 50,
            },
        ];
        assert_eq!(count_csum_range(&ranges, 0, 250), 150);
    }

    #[test]
    fn count_csum_range_does_not_double_count_overlap() {
        let ranges = [
            CsumRange { start: 0, len: 100 },
            CsumRange { start: 50, len: 100 },
        ];
        assert_eq!(count_csum_range(&ranges, 0, 150), 150);
    }

    #[test]
    fn full_csum_coverage_is_clean() {
        let extent = regular_extent(4096, 4096);
        let ranges = [CsumRange {
            start: 4096,
            len: 4096,
        }];
        let errs = check_file_extent(&extent, 4096, false, &ranges);
        assert!(errs.is_empty());
    }

    #[test]
    fn missing_csum_is_reported() {
        let extent = regular_extent(4096, 4096);
        let errs = check_file_extent(&extent, 4096, false, &[]);
        assert!(errs.contains(ErrorKind::CsumItemMissing));
    }

    #[test]
    fn partial_csum_is_odd() {
        let extent = regular_extent(4096, 4096);
        let ranges = [CsumRange {
            start: 4096,
            len: 2048,
        }];
        let errs = check_file_extent(&extent, 4096, false, &ranges);
        assert!(errs.contains(ErrorKind::OddCsumItem));
    }

    #[test]
    fn unaligned_disk_bytenr_is_reported() {
        let extent = regular_extent(100, 4096);
        let ranges = [CsumRange {
            start: 100,
            len: 4096,
        }];
        let errs = check_file_extent(&extent, 4096, false, &ranges);
        assert!(errs.contains(ErrorKind::BytesUnaligned));
    }

    #[test]
    fn nodatasum_inode_skips_csum_check() {
        let extent = regular_extent(4096, 4096);
        let errs = check_file_extent(&extent, 4096, true, &[]);
        assert!(!errs.contains(ErrorKind::CsumItemMissing));
    }
}
