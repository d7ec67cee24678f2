//! Kubernetes quantity parsing
//!
//! Quantities arrive as human-suffixed strings (`500m`, `1Gi`, `2.5`, `129e6`).
//! Everything is converted to canonical integers before arithmetic:
//! CPU to millicores, memory and storage to bytes.
//!
//! Parsing uses exact integer arithmetic and rounds fractional results up,
//! the same way the platform rounds when it schedules.

use crate::error::{CoreError, Result};

/// Largest decimal exponent accepted (`E` = 10^18 is the biggest suffix)
const MAX_EXPONENT: i32 = 18;

/// Parse a CPU quantity into millicores
pub fn parse_cpu_millis(value: &str) -> Result<u64> {
    parse_scaled(value, 1000)
}

/// Parse a memory or storage quantity into bytes
pub fn parse_bytes(value: &str) -> Result<u64> {
    parse_scaled(value, 1)
}

/// Format millicores the way the operators expect them (`500m`)
pub fn format_cpu_millis(millis: u64) -> String {
    format!("{}m", millis)
}

/// Format a byte count using the largest exact binary suffix
pub fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [(&str, u64); 4] = [
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];

    if bytes == 0 {
        return "0".to_string();
    }

    for (suffix, factor) in SUFFIXES {
        if bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

/// Multiplier encoded by a quantity suffix: value = n * 2^binary * 10^decimal
struct Multiplier {
    binary: u32,
    decimal: i32,
}

fn suffix_multiplier(raw: &str, suffix: &str) -> Result<Multiplier> {
    let m = |binary, decimal| Ok(Multiplier { binary, decimal });
    match suffix {
        "" => m(0, 0),
        "Ki" => m(10, 0),
        "Mi" => m(20, 0),
        "Gi" => m(30, 0),
        "Ti" => m(40, 0),
        "Pi" => m(50, 0),
        "Ei" => m(60, 0),
        "n" => m(0, -9),
        "u" => m(0, -6),
        "m" => m(0, -3),
        "k" => m(0, 3),
        "M" => m(0, 6),
        "G" => m(0, 9),
        "T" => m(0, 12),
        "P" => m(0, 15),
        "E" => m(0, 18),
        s if s.starts_with(['e', 'E']) => {
            let exponent: i32 = s[1..]
                .parse()
                .map_err(|_| CoreError::invalid_quantity(raw, "malformed exponent"))?;
            if exponent.abs() > MAX_EXPONENT {
                return Err(CoreError::invalid_quantity(raw, "exponent out of range"));
            }
            m(0, exponent)
        }
        other => Err(CoreError::invalid_quantity(
            raw,
            format!("unknown suffix '{}'", other),
        )),
    }
}

/// Parse `value` and return it multiplied by `scale`, rounded up
fn parse_scaled(value: &str, scale: u128) -> Result<u64> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(CoreError::invalid_quantity(value, "empty quantity"));
    }

    let unsigned = raw.strip_prefix('+').unwrap_or(raw);
    if unsigned.starts_with('-') {
        return Err(CoreError::invalid_quantity(value, "negative quantity"));
    }

    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(CoreError::invalid_quantity(value, "missing digits"));
    }
    if frac_part.contains('.') {
        return Err(CoreError::invalid_quantity(value, "multiple decimal points"));
    }

    let multiplier = suffix_multiplier(value, suffix)?;

    let overflow = || CoreError::invalid_quantity(value, "quantity too large");

    // mantissa / 10^frac_digits is the literal number
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: u128 = digits.parse().map_err(|_| overflow())?;
    let frac_digits = frac_part.len() as u32;

    let mut numerator = mantissa
        .checked_mul(scale)
        .and_then(|n| n.checked_mul(1u128 << multiplier.binary))
        .ok_or_else(overflow)?;
    let mut denominator: u128 = 10u128.checked_pow(frac_digits).ok_or_else(overflow)?;

    if multiplier.decimal >= 0 {
        numerator = numerator
            .checked_mul(10u128.pow(multiplier.decimal as u32))
            .ok_or_else(overflow)?;
    } else {
        denominator = denominator
            .checked_mul(10u128.pow((-multiplier.decimal) as u32))
            .ok_or_else(overflow)?;
    }

    let result = numerator.div_ceil(denominator);
    u64::try_from(result).map_err(|_| overflow())
}
