//! Human-readable volume sizes.
//!
//! Units are decimal: `M`/`MB` is 10^6 bytes and `G`/`GB` is 10^9 bytes.

use crate::BlockError;

const MB: u64 = 1_000_000;
const GB: u64 = 1_000_000_000;

/// Parse `"300M"`, `"100 GB"` and the like into a byte count.
pub fn parse_size(size: &str) -> Result<u64, BlockError> {
    let invalid = || BlockError::InvalidSize(size.to_string());
    let compact: String = size.chars().filter(|c| !c.is_whitespace()).collect();

    let split = compact
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(compact.len());
    let (digits, unit) = compact.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let quantity: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "M" | "MB" => MB,
        "G" | "GB" => GB,
        _ => return Err(invalid()),
    };
    quantity.checked_mul(multiplier).ok_or_else(invalid)
}

/// Same as [`parse_size`], rendered as a decimal string.
pub fn parse_size_to_byte_string(size: &str) -> Result<String, BlockError> {
    parse_size(size).map(|bytes| bytes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_sizes() {
        let cases = [
            ("300M", "300000000"),
            ("100MB", "100000000"),
            ("100GB", "100000000000"),
            ("300 M", "300000000"),
            ("2G", "2000000000"),
            (" 1 0 MB ", "10000000"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                parse_size_to_byte_string(input).unwrap(),
                expected,
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_rejected_sizes() {
        for input in ["300 MM", "300 Mi", "300", "MB", "", "3M0", "1.5G", "-1G", "10KB"] {
            assert!(
                matches!(
                    parse_size_to_byte_string(input),
                    Err(BlockError::InvalidSize(_))
                ),
                "input {:?} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_overflow_is_rejected() {
        assert!(parse_size("99999999999999999999G").is_err());
        assert!(parse_size("18446744073709551615G").is_err());
    }
}
