//! Table and JSON output helpers.

use comfy_table::{ContentArrangement, Table};
use imagespy_core::model::Image;
use serde::Serialize;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Table of images, one row each.
pub fn image_table(images: &[Image]) -> Table {
    let mut table = new_table(&["ID", "NAME", "DIGEST", "SCHEMA", "SCRAPED"]);
    for image in images {
        table.add_row(vec![
            image.id.to_string(),
            image.name.clone(),
            short_digest(&image.digest),
            image.schema_version.to_string(),
            format_ago(&image.scraped_at),
        ]);
    }
    table
}

/// Pretty-printed JSON of any serializable value.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

/// Shorten `sha256:<hex>` to the first 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.chars().take(12).collect()
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }

    let years = days / 365;
    format!("{years} years ago")
}
