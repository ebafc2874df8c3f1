//! Narrow collaborator: human-readable byte-size formatting.
//!
//! Ported from `Utils::formatSize` in `original_source/src/Utils.cpp`: picks the
//! largest unit for which the size clears a 1000-scaled threshold, but renders the
//! value itself in binary (1024-scaled) units, trimming trailing zero fractional
//! digits.

const GB_THRESHOLD: f64 = 1000.0 * 1024.0 * 1024.0;
const MB_THRESHOLD: f64 = 1000.0 * 1024.0;
const KB_THRESHOLD: f64 = 1000.0;

const GB: f64 = (1u64 << 30) as f64;
const MB: f64 = (1u64 << 20) as f64;
const KB: f64 = (1u64 << 10) as f64;

fn format_unit(value: f64, unit: &str) -> String {
    let mut s = format!("{value:.2}");
    if let Some(dot) = s.find('.') {
        let mut end = s.len();
        while end > dot + 1 && s.as_bytes()[end - 1] == b'0' {
            end -= 1;
        }
        if end == dot + 1 {
            end = dot;
        }
        s.truncate(end);
    }
    s.push_str(unit);
    s
}

/// Formats `size` bytes as e.g. `"4M"`, `"512K"`, `"1.5G"`, or `"37B"`.
pub fn format_size(size: u64) -> String {
    let size_f = size as f64;
    if size_f >= GB_THRESHOLD {
        format_unit(size_f / GB, "G")
    } else if size_f >= MB_THRESHOLD {
        format_unit(size_f / MB, "M")
    } else if size_f >= KB_THRESHOLD {
        format_unit(size_f / KB, "K")
    } else {
        format!("{size}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_use_bytes() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(999), "999B");
    }

    #[test]
    fn kilobytes_trim_trailing_zeros() {
        assert_eq!(format_size(1024), "1K");
        assert_eq!(format_size(1536), "1.5K");
    }

    #[test]
    fn megabytes_and_gigabytes() {
        assert_eq!(format_size(4 * 1024 * 1024), "4M");
        assert_eq!(format_size(1_500_000_000), "1.4G");
    }
}
