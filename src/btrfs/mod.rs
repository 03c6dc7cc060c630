//! On-disk format types and the B-tree navigator (spec.md §3, §4.1).

pub mod device_source;
pub mod keyed_roots;
pub mod path;
pub mod superblock;
pub mod treeblock;
pub mod types;
