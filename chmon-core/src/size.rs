//! Human readable storage sizes such as `8Gi` or `500M`.
//!
//! A size is a non-negative fixed-point number, an optional dimension
//! (`K`, `M`, `G`, `T`, `P`, `E`) and an optional `i` selecting binary
//! (1024) instead of decimal (1000) scaling. Without a dimension the number
//! is a byte count. Scaling is done in integer arithmetic and any fractional
//! byte left over is truncated, so `1.5` parses to `1` and `0.0001K` to `0`.

use crate::error::{MonitorError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)(?:\.(\d+))?([KMGTPE])?(i)?$").expect("size regex is valid")
});

// Further fraction digits are ignored. 10^20 * 1024^6 still fits in a u128.
const MAX_FRACTION_DIGITS: usize = 20;

fn exponent(dimension: &str) -> Result<u32> {
    match dimension {
        "K" => Ok(1),
        "M" => Ok(2),
        "G" => Ok(3),
        "T" => Ok(4),
        "P" => Ok(5),
        "E" => Ok(6),
        other => Err(MonitorError::UnknownDimension(other.to_string())),
    }
}

/// Parses a storage size string into a number of bytes.
pub fn parse_size(size: &str) -> Result<u64> {
    let invalid = || MonitorError::InvalidSizeFormat(size.to_string());

    let caps = SIZE_REGEX.captures(size).ok_or_else(invalid)?;

    let multiplier: u128 = match caps.get(3) {
        Some(dim) => {
            let base: u128 = if caps.get(4).is_some() { 1024 } else { 1000 };
            base.pow(exponent(dim.as_str())?)
        }
        None => 1,
    };

    let whole: u128 = caps[1].parse().map_err(|_| invalid())?;
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(invalid)?;

    if let Some(fraction) = caps.get(2) {
        let digits = &fraction.as_str()[..fraction.as_str().len().min(MAX_FRACTION_DIGITS)];
        let numerator: u128 = digits.parse().map_err(|_| invalid())?;
        let denominator = 10u128.pow(digits.len() as u32);
        let scaled = numerator.checked_mul(multiplier).ok_or_else(invalid)? / denominator;
        bytes = bytes.checked_add(scaled).ok_or_else(invalid)?;
    }

    u64::try_from(bytes).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_and_decimal_units() {
        assert_eq!(parse_size("1Ki").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1000);
        assert_eq!(parse_size("8Gi").unwrap(), 8 * 1024u64.pow(3));
        assert_eq!(parse_size("500M").unwrap(), 500_000_000);
        assert_eq!(parse_size("2Ti").unwrap(), 2 * 1024u64.pow(4));
        assert_eq!(parse_size("1E").unwrap(), 10u64.pow(18));
    }

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("42i").unwrap(), 42);
    }

    #[test]
    fn test_fractions_truncate() {
        assert_eq!(parse_size("0.5Ki").unwrap(), 512);
        assert_eq!(parse_size("1.5K").unwrap(), 1500);
        assert_eq!(parse_size("1.9").unwrap(), 1);
        assert_eq!(parse_size("0.0001K").unwrap(), 0);
        assert_eq!(parse_size("1.0001Ki").unwrap(), 1024);
    }

    #[test]
    fn test_invalid_format() {
        for input in ["garbage", "", "-1K", "1.2.3G", "1 G", "G", "1Gb", "1.K", "10Z", "1k", "1ii"] {
            assert!(
                matches!(parse_size(input), Err(MonitorError::InvalidSizeFormat(_))),
                "expected InvalidSizeFormat for {:?}",
                input
            );
        }
    }

    #[test]
    fn test_unknown_dimension() {
        assert_eq!(exponent("E").unwrap(), 6);
        assert!(matches!(
            exponent("Z"),
            Err(MonitorError::UnknownDimension(d)) if d == "Z"
        ));
    }

    #[test]
    fn test_long_fraction_with_largest_unit() {
        assert_eq!(
            parse_size("0.999999999999999999999999Ei").unwrap(),
            1024u64.pow(6) - 1
        );
        assert_eq!(parse_size("0.999999999999999999999999E").unwrap(), 10u64.pow(18) - 1);
        assert_eq!(parse_size("15.99999999999999999999Ei").unwrap(), u64::MAX);
    }

    #[test]
    fn test_overflow_is_rejected() {
        assert!(matches!(
            parse_size("16Ei"),
            Err(MonitorError::InvalidSizeFormat(_))
        ));
        assert_eq!(parse_size("15Ei").unwrap(), 15 * 1024u64.pow(6));
    }
}
