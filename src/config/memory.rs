use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// A memory ceiling as written in a config file: `"1G"`, `"512M"` or a raw byte count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryQuantity {
    Bytes(u64),
    Text(String),
}

impl MemoryQuantity {
    /// Resolve the quantity to a byte count
    pub fn to_bytes(&self) -> Result<u64> {
        let bytes = match self {
            MemoryQuantity::Bytes(bytes) => *bytes,
            MemoryQuantity::Text(text) => parse_memory_to_bytes(text).ok_or_else(|| {
                KeeperError::Config(format!(
                    "Invalid memory quantity '{}'. Expected a number with an optional B, K, M, G or T suffix",
                    text
                ))
            })?,
        };

        if bytes == 0 {
            return Err(KeeperError::Config(
                "max_memory_restart must be greater than zero".to_string(),
            ));
        }

        Ok(bytes)
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryQuantity::Bytes(bytes) => write!(f, "{}", bytes),
            MemoryQuantity::Text(text) => f.write_str(text),
        }
    }
}

/// Parse a memory string such as "1G", "512mb" or "1.5g" into bytes.
///
/// Suffixes are binary multiples and case-insensitive. Returns `None` for an
/// unknown suffix, a malformed number, or a value that overflows `u64`.
pub fn parse_memory_to_bytes(memory: &str) -> Option<u64> {
    let memory = memory.trim();
    let suffix_start = memory
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(idx, _)| idx)
        .unwrap_or(memory.len());

    let (num_part, suffix) = memory.split_at(suffix_start);
    let value: f64 = num_part.parse().ok()?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => KB,
        "m" | "mb" => MB,
        "g" | "gb" => GB,
        "t" | "tb" => TB,
        _ => return None,
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return None;
    }

    Some(bytes as u64)
}

/// Format a byte count for humans, e.g. "1.2GB"
pub fn format_bytes(bytes: u64) -> String {
    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}
