//! Human-readable bandwidth formatting for the `-status` dashboard.

/// Format a byte rate as bits per second, scaled by powers of 1024 up to `gb/s`.
/// Mirrors the original dashboard's `string_rate`: bytes are multiplied by 8 to
/// get bits, then divided by 1024 until below 512.
pub fn format_rate(bytes_per_sec: u64) -> String {
    const SUFFIXES: [&str; 4] = ["b/s", "kb/s", "mb/s", "gb/s"];

    let mut bits = bytes_per_sec as f64 * 8.0;
    let mut level = 0;
    while bits >= 512.0 && level < SUFFIXES.len() - 1 {
        bits /= 1024.0;
        level += 1;
    }
    format!("{:.2} {}", bits, SUFFIXES[level])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_rate_stays_in_bits_below_threshold() {
        assert_eq!(format_rate(10), "80.00 b/s");
    }

    #[test]
    fn format_rate_scales_to_kilobits() {
        assert_eq!(format_rate(100), "0.78 kb/s");
        assert_eq!(format_rate(1000), "7.81 kb/s");
    }

    #[test]
    fn format_rate_scales_to_megabits() {
        assert_eq!(format_rate(1_000_000), "7.63 mb/s");
        assert_eq!(format_rate(10_000_000), "76.29 mb/s");
    }

    #[test]
    fn format_rate_zero_is_zero_bits() {
        assert_eq!(format_rate(0), "0.00 b/s");
    }
}
