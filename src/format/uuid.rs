//! UUID/fsid rendering (spec.md §3 "Superblock" `fsid`, §5.1 "Spool files"
//! naming by fsid string).

/// Render a 16-byte UUID as the canonical `8-4-4-4-12` hex form, lowercase,
/// matching the upstream tool's `uuid_unparse` output used to name
/// `scrub.status.<fsid>` files.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_canonical_groups() {
        let bytes: [u8; 16] = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        assert_eq!(
            format_uuid(&bytes),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
    }
}
