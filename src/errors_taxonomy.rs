//! Bitmask of defect kinds flowing through the checker (spec.md §4.2, §7).
//!
//! Grounded on `original_source/check/mode-lowmem.h`'s `#define ... (1<<N)`
//! bit values and DESIGN NOTES §9's "dedicated `ErrorSet` type with
//! explicit insert/remove/contains" strategy: the bitmask stays a plain
//! integer internally, but every caller interacts through named methods
//! rather than raw bit twiddling.

use std::fmt;

/// One classified defect kind. Bit positions match the upstream tool's
/// `mode-lowmem.h` constants so on-disk dumps / test fixtures referencing
/// those bit numbers stay meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    DirItemMissing = 1 << 2,
    DirItemMismatch = 1 << 3,
    InodeRefMissing = 1 << 4,
    InodeItemMissing = 1 << 5,
    InodeItemMismatch = 1 << 6,
    FileExtentError = 1 << 7,
    OddCsumItem = 1 << 8,
    CsumItemMissing = 1 << 9,
    LinkCountError = 1 << 10,
    NbytesError = 1 << 11,
    IsizeError = 1 << 12,
    OrphanItem = 1 << 13,
    LastItem = 1 << 15,
    RootRefMissing = 1 << 16,
    RootRefMismatch = 1 << 17,
    DirIndexMissing = 1 << 18,
    DirIndexMismatch = 1 << 19,
    DirCountAgain = 1 << 20,
    BgAccountingError = 1 << 21,
    FatalError = 1 << 22,
    InodeFlagsError = 1 << 23,
    DirItemHashMismatch = 1 << 24,
    InodeModeError = 1 << 25,
    InvalidGeneration = 1 << 26,
    SuperBytesUsedError = 1 << 27,
    BackrefMissing = 1 << 28,
    BackrefMismatch = 1 << 29,
    BytesUnaligned = 1 << 30,
    ReferencerMissing = 1 << 31,
}

/// A second, smaller namespace for defects discovered only while resolving
/// backrefs / chunk accounting, mirrored from upstream's internal
/// "low memory mode check" bit field (distinct numbering space from
/// [`ErrorKind`] in the original source, matching spec.md §4.2's own split
/// between the two taxonomies). Packed into the upper half of
/// [`ErrorSet`]'s 64-bit word rather than kept as a second accumulator
/// type, since nothing in this crate needs the two masks to travel
/// separately once accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum RefErrorKind {
    ReferencerMismatch = 1 << 32,
    CrossingStripeBoundary = 1 << 33,
    ItemSizeMismatch = 1 << 34,
    UnknownType = 1 << 35,
    AccountingMismatch = 1 << 36,
    ChunkTypeMismatch = 1 << 37,
}

const ALL_REF_KINDS: &[RefErrorKind] = &[
    RefErrorKind::ReferencerMismatch,
    RefErrorKind::CrossingStripeBoundary,
    RefErrorKind::ItemSizeMismatch,
    RefErrorKind::UnknownType,
    RefErrorKind::AccountingMismatch,
    RefErrorKind::ChunkTypeMismatch,
];

impl RefErrorKind {
    fn label(self) -> &'static str {
        match self {
            Self::ReferencerMismatch => "REFERENCER_MISMATCH",
            Self::CrossingStripeBoundary => "CROSSING_STRIPE_BOUNDARY",
            Self::ItemSizeMismatch => "ITEM_SIZE_MISMATCH",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::AccountingMismatch => "ACCOUNTING_MISMATCH",
            Self::ChunkTypeMismatch => "CHUNK_TYPE_MISMATCH",
        }
    }
}

const ALL_KINDS: &[ErrorKind] = &[
    ErrorKind::DirItemMissing,
    ErrorKind::DirItemMismatch,
    ErrorKind::InodeRefMissing,
    ErrorKind::InodeItemMissing,
    ErrorKind::InodeItemMismatch,
    ErrorKind::FileExtentError,
    ErrorKind::OddCsumItem,
    ErrorKind::CsumItemMissing,
    ErrorKind::LinkCountError,
    ErrorKind::NbytesError,
    ErrorKind::IsizeError,
    ErrorKind::OrphanItem,
    ErrorKind::LastItem,
    ErrorKind::RootRefMissing,
    ErrorKind::RootRefMismatch,
    ErrorKind::DirIndexMissing,
    ErrorKind::DirIndexMismatch,
    ErrorKind::DirCountAgain,
    ErrorKind::BgAccountingError,
    ErrorKind::FatalError,
    ErrorKind::InodeFlagsError,
    ErrorKind::DirItemHashMismatch,
    ErrorKind::InodeModeError,
    ErrorKind::InvalidGeneration,
    ErrorKind::SuperBytesUsedError,
    ErrorKind::BackrefMissing,
    ErrorKind::BackrefMismatch,
    ErrorKind::BytesUnaligned,
    ErrorKind::ReferencerMissing,
];

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            Self::DirItemMissing => "DIR_ITEM_MISSING",
            Self::DirItemMismatch => "DIR_ITEM_MISMATCH",
            Self::InodeRefMissing => "INODE_REF_MISSING",
            Self::InodeItemMissing => "INODE_ITEM_MISSING",
            Self::InodeItemMismatch => "INODE_ITEM_MISMATCH",
            Self::FileExtentError => "FILE_EXTENT_ERROR",
            Self::OddCsumItem => "ODD_CSUM_ITEM",
            Self::CsumItemMissing => "CSUM_ITEM_MISSING",
            Self::LinkCountError => "LINK_COUNT_ERROR",
            Self::NbytesError => "NBYTES_ERROR",
            Self::IsizeError => "ISIZE_ERROR",
            Self::OrphanItem => "ORPHAN_ITEM",
            Self::LastItem => "LAST_ITEM",
            Self::RootRefMissing => "ROOT_REF_MISSING",
            Self::RootRefMismatch => "ROOT_REF_MISMATCH",
            Self::DirIndexMissing => "DIR_INDEX_MISSING",
            Self::DirIndexMismatch => "DIR_INDEX_MISMATCH",
            Self::DirCountAgain => "DIR_COUNT_AGAIN",
            Self::BgAccountingError => "BG_ACCOUNTING_ERROR",
            Self::FatalError => "FATAL_ERROR",
            Self::InodeFlagsError => "INODE_FLAGS_ERROR",
            Self::DirItemHashMismatch => "DIR_ITEM_HASH_MISMATCH",
            Self::InodeModeError => "INODE_MODE_ERROR",
            Self::InvalidGeneration => "INVALID_GENERATION",
            Self::SuperBytesUsedError => "SUPER_BYTES_USED_ERROR",
            Self::BackrefMissing => "BACKREF_MISSING",
            Self::BackrefMismatch => "BACKREF_MISMATCH",
            Self::BytesUnaligned => "BYTES_UNALIGNED",
            Self::ReferencerMissing => "REFERENCER_MISSING",
        }
    }
}

/// Accumulating bitmask of defect kinds. Every `check_*` function returns
/// one of these; callers OR their results together (spec.md §7
/// "Propagation policy"). Never aborts the checker on its own — only
/// [`ErrorKind::FatalError`] signals that the caller should stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSet(u64);

impl ErrorSet {
    pub const EMPTY: Self = Self(0);

    pub fn insert(&mut self, kind: ErrorKind) {
        self.0 |= kind as u64;
    }

    pub fn remove(&mut self, kind: ErrorKind) {
        self.0 &= !(kind as u64);
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0 & (kind as u64) != 0
    }

    pub fn insert_ref(&mut self, kind: RefErrorKind) {
        self.0 |= kind as u64;
    }

    pub fn contains_ref(&self, kind: RefErrorKind) -> bool {
        self.0 & (kind as u64) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Clean means no bit is set other than the benign `LAST_ITEM`
    /// traversal terminator (spec.md §7 "Terminators").
    pub fn is_clean(&self) -> bool {
        self.0 & !(ErrorKind::LastItem as u64) == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn merge(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Iterate over every bit that is set, in the upstream enumeration
    /// order, for use by the output formatter.
    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        ALL_KINDS
            .iter()
            .filter(move |kind| self.contains(**kind))
            .map(|kind| kind.label())
            .chain(
                ALL_REF_KINDS
                    .iter()
                    .filter(move |kind| self.contains_ref(**kind))
                    .map(|kind| kind.label()),
            )
    }
}

impl From<RefErrorKind> for ErrorSet {
    fn from(kind: RefErrorKind) -> Self {
        let mut set = ErrorSet::EMPTY;
        set.insert_ref(kind);
        set
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "clean");
        }
        let labels: Vec<&str> = self.iter().collect();
        write!(f, "{}", labels.join(","))
    }
}

impl std::ops::BitOr for ErrorSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for ErrorSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.merge(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_roundtrip() {
        let mut set = ErrorSet::EMPTY;
        assert!(set.is_empty());
        set.insert(ErrorKind::DirIndexMissing);
        assert!(set.contains(ErrorKind::DirIndexMissing));
        assert!(!set.contains(ErrorKind::DirItemMismatch));
        set.remove(ErrorKind::DirIndexMissing);
        assert!(!set.contains(ErrorKind::DirIndexMissing));
    }

    #[test]
    fn clean_ignores_last_item() {
        let mut set = ErrorSet::EMPTY;
        set.insert(ErrorKind::LastItem);
        assert!(set.is_clean());
        set.insert(ErrorKind::IsizeError);
        assert!(!set.is_clean());
    }

    #[test]
    fn display_lists_set_bits() {
        let mut set = ErrorSet::EMPTY;
        set.insert(ErrorKind::NbytesError);
        set.insert(ErrorKind::IsizeError);
        let text = set.to_string();
        assert!(text.contains("NBYTES_ERROR"));
        assert!(text.contains("ISIZE_ERROR"));
    }

    #[test]
    fn union_merges_bits() {
        let mut a = ErrorSet::EMPTY;
        a.insert(ErrorKind::OrphanItem);
        let mut b = ErrorSet::EMPTY;
        b.insert(ErrorKind::LinkCountError);
        let merged = a | b;
        assert!(merged.contains(ErrorKind::OrphanItem));
        assert!(merged.contains(ErrorKind::LinkCountError));
    }
}
