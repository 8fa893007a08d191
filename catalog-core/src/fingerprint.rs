use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::input::EventInput;
use crate::normalize::{collapse_whitespace, normalize_name};

/// Content fingerprint of a listing: SHA-256 over `name|venue|start`.
///
/// The name and venue key are trimmed, lower-cased and whitespace-collapsed.
/// The start is the first occurrence rendered as RFC 3339 in UTC, so the same
/// instant submitted with different offsets hashes identically.
pub fn dedup_hash(name: &str, venue_key: &str, start: DateTime<Utc>) -> String {
    let name = collapse_whitespace(&name.trim().to_lowercase());
    let venue = collapse_whitespace(&venue_key.trim().to_lowercase());
    let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);

    sha256_hex(format!("{name}|{venue}|{start}").as_bytes())
}

/// The venue component of the fingerprint: an explicit place identifier when
/// the submitter gave one, else the normalized venue name, else the virtual
/// location URL.
pub fn venue_key(input: &EventInput) -> String {
    if let Some(place) = &input.location {
        if let Some(id) = &place.id {
            return id.clone();
        }
        let name = normalize_name(&place.name);
        if !name.is_empty() {
            return name;
        }
    }

    input
        .virtual_location
        .as_ref()
        .map(|v| v.url.clone())
        .unwrap_or_default()
}

/// Hash of the canonical JSON encoding of an already-normalized input.
/// Two deliveries of the same logical request produce the same hash.
pub fn request_hash(input: &EventInput) -> Result<String, serde_json::Error> {
    json_hash(input)
}

pub fn json_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
