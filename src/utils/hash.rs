use sha2::{Digest, Sha256};

/// Deterministic SHA-256 key for per-album cache entries.
/// Inputs are trimmed and lowercased so artist/album capitalisation
/// variants land on the same entry.
pub fn hash_album_key(artist: &str, album: &str) -> String {
    let key = format!("{}|{}", normalize(artist), normalize(album));
    hex_digest(key.as_bytes())
}

/// Key for per-source API results; the source prefix keeps results from
/// different APIs for the same album apart.
pub fn hash_api_key(artist: &str, album: &str, source: &str) -> String {
    let key = format!("{}:{}|{}", normalize(source), normalize(artist), normalize(album));
    hex_digest(key.as_bytes())
}

/// Key for arbitrary generic-cache payloads. Mappings are hashed through
/// their canonical JSON form (sorted keys) so insertion order does not
/// produce distinct keys.
pub fn hash_generic_key(data: &serde_json::Value) -> String {
    let canonical = match data {
        serde_json::Value::Object(_) => canonical_json(data),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    hex_digest(canonical.as_bytes())
}

pub fn hash_pending_key(track_id: &str) -> String {
    hex_digest(format!("pending:{track_id}").as_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("persistent_id must not be empty")]
    EmptyPersistentId,

    #[error("location must not be empty")]
    EmptyLocation,
}

/// SHA-256 fingerprint of a library file, used to detect content
/// replacement that keeps the track id intact.
pub fn track_fingerprint(
    persistent_id: &str,
    location: &str,
    file_size: u64,
    duration: u64,
    date_modified: &str,
    date_added: &str,
) -> Result<String, FingerprintError> {
    if persistent_id.trim().is_empty() {
        return Err(FingerprintError::EmptyPersistentId);
    }
    if location.trim().is_empty() {
        return Err(FingerprintError::EmptyLocation);
    }

    let payload = format!("{persistent_id}|{location}|{file_size}|{duration}|{date_modified}|{date_added}");
    Ok(hex_digest(payload.as_bytes()))
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// serde_json keeps object keys in insertion order by default, so a stable
// representation has to sort them itself.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
