//! Checksum generation and snapshot validation for Layer 1 state.
//!
//! The canonical form of a snapshot is its JSON serialization with keys
//! sorted; `serde_json`'s default map is ordered, so serializing a `Value`
//! object already yields the canonical byte sequence.

use chrono::DateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Digest reported for non-object input; a fixed value so corrupt or missing
/// snapshots hash deterministically.
pub const SENTINEL_CHECKSUM: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Ordered corruption-recovery options. The chain is tried top to bottom;
/// the first option that succeeds wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOption {
    /// Reinstate the newest full-state payload recorded in the event log.
    RestoreFromLog,
    /// Reinstate the `.bak` sidecar left by the previous state overwrite.
    RestoreFromBackup,
    /// Fold update payloads from the event log into a fresh state.
    ReconstructFromLogs,
    /// Start over with an empty state at version 0.
    InitializeEmpty,
    /// Remove every layer and report the task unrecoverable-but-clean.
    EmergencyReset,
}

impl RecoveryOption {
    pub const CHAIN: [RecoveryOption; 5] = [
        RecoveryOption::RestoreFromLog,
        RecoveryOption::RestoreFromBackup,
        RecoveryOption::ReconstructFromLogs,
        RecoveryOption::InitializeEmpty,
        RecoveryOption::EmergencyReset,
    ];
}

#[derive(Debug, Clone)]
pub struct SnapshotValidation {
    pub valid: bool,
    pub checksum_valid: bool,
    pub errors: Vec<String>,
    /// Empty when the snapshot is valid; the full ordered chain otherwise.
    pub recovery_options: Vec<RecoveryOption>,
}

/// Sha256 over the canonical JSON form. Non-object input (including null)
/// yields the sentinel digest.
pub fn generate_checksum(value: &Value) -> String {
    if !value.is_object() {
        return SENTINEL_CHECKSUM.to_string();
    }
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum of a state snapshot with its own `checksum` field excluded.
pub fn checksum_excluding_field(value: &Value) -> String {
    let mut stripped = value.clone();
    if let Some(obj) = stripped.as_object_mut() {
        obj.remove("checksum");
    }
    generate_checksum(&stripped)
}

/// Validate a raw Layer 1 snapshot: checksum, required fields, timestamp
/// well-formedness, and data being a non-null object.
pub fn validate_snapshot(snapshot: &Value) -> SnapshotValidation {
    let mut errors = Vec::new();

    let Some(obj) = snapshot.as_object() else {
        return SnapshotValidation {
            valid: false,
            checksum_valid: false,
            errors: vec!["snapshot is not a JSON object".to_string()],
            recovery_options: RecoveryOption::CHAIN.to_vec(),
        };
    };

    for field in ["task_id", "status", "version", "created_at", "updated_at"] {
        if !obj.contains_key(field) {
            errors.push(format!("missing required field: {}", field));
        }
    }

    for field in ["created_at", "updated_at"] {
        if let Some(raw) = obj.get(field).and_then(Value::as_str)
            && DateTime::parse_from_rfc3339(raw).is_err()
        {
            errors.push(format!("malformed timestamp in {}: {}", field, raw));
        }
    }

    match obj.get("data") {
        Some(data) if data.is_object() => {}
        Some(_) => errors.push("data is not an object".to_string()),
        None => errors.push("missing required field: data".to_string()),
    }

    let checksum_valid = match obj.get("checksum").and_then(Value::as_str) {
        Some(stored) if !stored.is_empty() => stored == checksum_excluding_field(snapshot),
        _ => false,
    };
    if !checksum_valid {
        errors.push("checksum mismatch".to_string());
    }

    let valid = errors.is_empty();
    SnapshotValidation {
        valid,
        checksum_valid,
        errors,
        recovery_options: if valid {
            Vec::new()
        } else {
            RecoveryOption::CHAIN.to_vec()
        },
    }
}
