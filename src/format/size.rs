//! Human-readable byte sizing (spec.md §4.5; grounded on
//! `original_source/common/units.c`'s `pretty_size_mode` binary-unit table).

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Render `bytes` using the largest binary unit that keeps the mantissa
/// below 1024, with one decimal place once a unit above bytes is used
/// (matching the upstream tool's default `-h` mode).
pub fn pretty_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    format!("{value:.2}{}", UNITS[unit_idx])
}

/// Render raw bytes with no unit conversion, for machine-readable contexts
/// (JSON output, spec.md §6 "Environment").
pub fn raw_size(bytes: u64) -> String {
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_kib_has_no_decimal() {
        assert_eq!(pretty_size(512), "512B");
    }

    #[test]
    fn renders_mib() {
        assert_eq!(pretty_size(5 * 1024 * 1024), "5.00MiB");
    }

    #[test]
    fn renders_gib_fraction() {
        assert_eq!(pretty_size(1536 * 1024 * 1024), "1.50GiB");
    }
}
