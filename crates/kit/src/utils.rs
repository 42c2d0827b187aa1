use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(eyre!("Empty size string"));
    }

    let Some(pos) = size_str.rfind(|c: char| c.is_ascii_digit()) else {
        return Err(eyre!("Invalid size format: {}", size_str));
    };
    let (number_part, unit_part) = size_str.split_at(pos + 1);

    let number: u64 = number_part
        .parse()
        .map_err(|_| eyre!("Invalid number in size: {}", number_part))?;

    let multiplier = match unit_part {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024_u64.pow(4),
        _ => return Err(eyre!("Unknown size unit: {}", unit_part)),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| eyre!("Size too large: {}", size_str))
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    let Some(last_char) = memory_str.chars().last() else {
        return Err(eyre!(
            "Memory specification cannot be empty - please provide a value like '2G', '1024M', or '512'"
        ));
    };
    let number_part = &memory_str[..memory_str.len() - last_char.len_utf8()];
    match last_char.to_ascii_uppercase() {
        'G' => {
            let gb: f64 = number_part
                .parse()
                .context("Invalid number in memory specification")?;
            Ok((gb * 1024.0) as u32)
        }
        'M' => number_part
            .parse()
            .context("Invalid number in memory specification"),
        'K' => {
            let kb: u32 = number_part
                .parse()
                .context("Invalid number in memory specification")?;
            Ok(kb / 1024)
        }
        // No suffix, assume megabytes
        _ => memory_str
            .parse()
            .context("Invalid number in memory specification"),
    }
}
