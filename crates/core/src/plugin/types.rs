//! Types exchanged with processing plugins.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An option value accepted by the plugin, in normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOption {
    pub name: String,
    pub value: String,
}

/// A protocol extension accepted by the plugin, in normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedExtension {
    pub name: String,
    pub value: String,
}

/// Everything a plugin needs to acquire and deliver one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub order_id: String,
    /// Engine-side order item id.
    pub order_item_id: String,
    /// Catalog identifier.
    pub identifier: String,
    pub collection: String,
    /// Parsed option values.
    pub options: BTreeMap<String, String>,
    /// 1 for the first attempt.
    pub attempt: u32,
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredItem {
    /// Where the delivered file can be found.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub size_bytes: u64,
}

/// Request to bundle the delivered files of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub order_id: String,
    /// Requested packaging format.
    pub format: String,
    /// Locations of the files to include.
    pub locations: Vec<String>,
}

/// A subscription timeslot, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeslot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Timeslot {
    pub fn new(start: DateTime<Utc>, length: chrono::Duration) -> Self {
        Self {
            start,
            end: start + length,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
