//! Byte-size parsing and formatting
//!
//! Configuration values such as part sizes accept either a plain byte count
//! (`8388608`) or a number with a unit suffix (`8MiB`, `512 KB`, `1.5GiB`).
//! Decimal suffixes (`KB`, `MB`, `GB`) are powers of 1000, binary suffixes
//! (`KiB`, `MiB`, `GiB`) powers of 1024.

use crate::error::{CommonError, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Parse a human-readable byte size
pub fn parse_bytes(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CommonError::InvalidSize(input.to_string()));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "kib" => KIB,
        "mib" => MIB,
        "gib" => GIB,
        _ => return Err(CommonError::InvalidSize(input.to_string())),
    };

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|_| CommonError::InvalidSize(input.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(CommonError::InvalidSize(input.to_string()));
        }
        Ok((value * multiplier as f64).round() as u64)
    } else {
        let value: u64 = number
            .parse()
            .map_err(|_| CommonError::InvalidSize(input.to_string()))?;
        value
            .checked_mul(multiplier)
            .ok_or_else(|| CommonError::InvalidSize(input.to_string()))
    }
}

/// Format a byte count with the largest binary unit that keeps it >= 1
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
