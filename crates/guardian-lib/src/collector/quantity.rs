//! Kubernetes quantity parsing for CPU and memory values

use crate::error::QuantityError;

/// Parse a CPU quantity ("250m", "1", "123456n", "1.5") into cores
pub fn parse_cpu_cores(quantity: &str) -> Result<f64, QuantityError> {
    let q = quantity.trim();
    let err = || QuantityError(quantity.to_string());

    let (number, scale) = if let Some(n) = q.strip_suffix('n') {
        (n, 1e-9)
    } else if let Some(n) = q.strip_suffix('u') {
        (n, 1e-6)
    } else if let Some(n) = q.strip_suffix('m') {
        (n, 1e-3)
    } else {
        (q, 1.0)
    };

    let value: f64 = number.parse().map_err(|_| err())?;
    if !value.is_finite() || value < 0.0 {
        return Err(err());
    }
    Ok(value * scale)
}

/// Parse a memory quantity ("128Mi", "1Gi", "500M", "1e9", "4096") into bytes
pub fn parse_memory_bytes(quantity: &str) -> Result<u64, QuantityError> {
    let q = quantity.trim();
    let err = || QuantityError(quantity.to_string());

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    let (number, scale) = SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| q.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((q, 1.0));

    let value: f64 = number.parse().map_err(|_| err())?;
    if !value.is_finite() || value < 0.0 {
        return Err(err());
    }
    Ok((value * scale).round() as u64)
}
