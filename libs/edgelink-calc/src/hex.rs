//! HEX2DEC / DEC2HEX base conversion

use crate::error::{CalcError, Result};

/// Parse a hex string (`0xFF`, `0Xff`, `ff`) into its decimal value
pub fn hex_to_dec(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(CalcError::hex(format!("empty hex string '{}'", input)));
    }
    // from_str_radix would accept a sign
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CalcError::hex(format!("invalid hex '{}'", input)));
    }

    i64::from_str_radix(digits, 16)
        .map_err(|e| CalcError::hex(format!("invalid hex '{}': {}", input, e)))
}

/// Format a non-negative integral value as uppercase hex without leading zeros
pub fn dec_to_hex(value: f64, with_prefix: bool) -> Result<String> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= i64::MAX as f64 {
        return Err(CalcError::hex(format!(
            "DEC2HEX expects a non-negative integer, got {}",
            value
        )));
    }

    let digits = format!("{:X}", value as i64);
    Ok(if with_prefix {
        format!("0x{}", digits)
    } else {
        digits
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_dec_prefixes() {
        assert_eq!(hex_to_dec("0xFF").unwrap(), 255);
        assert_eq!(hex_to_dec("0Xff").unwrap(), 255);
        assert_eq!(hex_to_dec("ff").unwrap(), 255);
        assert_eq!(hex_to_dec(" 1A2b ").unwrap(), 0x1A2B);
    }

    #[test]
    fn test_hex_to_dec_rejects_garbage() {
        assert!(hex_to_dec("").is_err());
        assert!(hex_to_dec("0x").is_err());
        assert!(hex_to_dec("0xZZ").is_err());
        assert!(hex_to_dec("-FF").is_err());
        assert!(hex_to_dec("+FF").is_err());
        assert!(hex_to_dec("0x-1").is_err());
    }

    #[test]
    fn test_dec_to_hex() {
        assert_eq!(dec_to_hex(255.0, false).unwrap(), "FF");
        assert_eq!(dec_to_hex(255.0, true).unwrap(), "0xFF");
        assert_eq!(dec_to_hex(0.0, false).unwrap(), "0");
        assert!(dec_to_hex(-1.0, false).is_err());
        assert!(dec_to_hex(1.5, false).is_err());
    }

    #[test]
    fn test_dec_to_hex_upper_bound() {
        // 2^63 does not fit in i64 and must not saturate
        assert!(dec_to_hex(9_223_372_036_854_775_808.0, false).is_err());
        assert_eq!(
            dec_to_hex(9_223_372_036_854_774_784.0, false).unwrap(),
            "7FFFFFFFFFFFFC00"
        );
    }

    #[test]
    fn test_round_trip_is_canonical() {
        for input in ["0x00ff", "ff", "0XABCDEF", "0001"] {
            let canonical = dec_to_hex(hex_to_dec(input).unwrap() as f64, false).unwrap();
            let expected = input
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .trim_start_matches('0')
                .to_uppercase();
            assert_eq!(canonical, expected);
        }
    }
}
