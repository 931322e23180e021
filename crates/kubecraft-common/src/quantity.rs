//! Kubernetes resource quantity parsing
//!
//! Only memory quantities are interpreted here: admission control sums memory
//! requests in MiB.

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parse a memory quantity into bytes.
///
/// Accepts binary ("768Mi", "1Gi"), decimal ("500M") and bare byte counts.
/// Fractional mantissas ("1.5Gi") are accepted and rounded down to a byte.
pub fn parse_memory_bytes(qty: &str) -> Result<u64, String> {
    let qty = qty.trim();
    if qty.is_empty() {
        return Err("empty memory quantity".to_string());
    }

    let (number, multiplier) = if let Some((suffix, power)) =
        BINARY_SUFFIXES.iter().find(|(s, _)| qty.ends_with(s))
    {
        (&qty[..qty.len() - suffix.len()], 1024f64.powi(*power as i32))
    } else if let Some((suffix, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| qty.ends_with(s)) {
        (&qty[..qty.len() - suffix.len()], 1000f64.powi(*power as i32))
    } else {
        (qty, 1.0)
    };

    if let Ok(n) = number.parse::<u64>() {
        return n
            .checked_mul(multiplier as u64)
            .ok_or_else(|| format!("memory quantity overflows: {qty}"));
    }

    match number.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Ok((n * multiplier).floor() as u64),
        _ => Err(format!(
            "invalid memory quantity '{qty}' (expected e.g. '768Mi', '1Gi')"
        )),
    }
}

/// Parse a memory quantity into whole MiB, truncating any remainder.
pub fn parse_memory_mib(qty: &str) -> Result<u64, String> {
    parse_memory_bytes(qty).map(|b| b / 1024 / 1024)
}
