use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Bytes per unit. Binary prefixes (K, M, G, T and the KiB forms) are powers
/// of 1024; the two-letter decimal forms are powers of 1000.
fn unit_to_bytes(unit: &str) -> Option<u128> {
    match unit {
        "B" | "bytes" => Some(1),
        "k" | "K" | "KiB" => Some(1024),
        "M" | "MiB" => Some(1024u128.pow(2)),
        "G" | "GiB" => Some(1024u128.pow(3)),
        "T" | "TiB" => Some(1024u128.pow(4)),

        "KB" => Some(1_000),
        "MB" => Some(1_000u128.pow(2)),
        "GB" => Some(1_000u128.pow(3)),
        "TB" => Some(1_000u128.pow(4)),

        _ => None,
    }
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    let split = memory_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(memory_str.len());
    let (number_str, unit) = memory_str.split_at(split);
    let unit = match unit {
        "" => "MiB",
        "g" => "G",
        "m" => "M",
        u => u,
    };

    let number: f64 = number_str
        .parse()
        .with_context(|| format!("Invalid number in memory specification {memory_str:?}"))?;

    let bytes_per_unit = unit_to_bytes(unit).ok_or_else(|| eyre!("Unknown unit: {}", unit))? as f64;

    let mib = 1024.0 * 1024.0;
    let total_mb = (number * bytes_per_unit) / mib;
    if total_mb < 1.0 {
        return Err(eyre!("Memory size too small: {memory_str}"));
    }

    Ok(total_mb as u32)
}
