/// Formats a byte count with decimal (SI) units, one digit of precision.
pub fn byte_count_decimal(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}

#[cfg(test)]
mod tests {
    use super::byte_count_decimal;

    #[test]
    fn formats_boundaries() {
        assert_eq!(byte_count_decimal(0), "0 B");
        assert_eq!(byte_count_decimal(999), "999 B");
        assert_eq!(byte_count_decimal(1000), "1.0 kB");
        assert_eq!(byte_count_decimal(987_654_321), "987.7 MB");
        assert_eq!(byte_count_decimal(1_000_000_000_000_000_000), "1.0 EB");
    }
}
