use crate::models::entry::Entry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Type,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(SortKey::Name),
            "size" => Ok(SortKey::Size),
            "type" => Ok(SortKey::Type),
            other => Err(format!("unknown sort key '{other}'")),
        }
    }
}

/// Directories first, then by `key`. Size sorts largest first when
/// `asc` is false.
pub fn sort_entries(entries: &mut [Entry], key: SortKey, asc: bool) {
    entries.sort_by(|a, b| match b.is_directory.cmp(&a.is_directory) {
        Ordering::Equal => {
            let order = match key {
                SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortKey::Size => a.size.cmp(&b.size),
                SortKey::Type => get_extension(a).cmp(&get_extension(b)),
            };
            if asc {
                order
            } else {
                order.reverse()
            }
        }
        kind_order => kind_order,
    });
}

/// Display ordering used when no explicit direction is given.
pub fn default_direction(key: SortKey) -> bool {
    !matches!(key, SortKey::Size)
}

pub fn get_extension(entry: &Entry) -> String {
    if entry.is_directory {
        return "0_dir".to_string();
    }
    std::path::Path::new(&entry.name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "zzz_noext".to_string())
}
