use serde::{Deserialize, Serialize};

// uid stays Option so a missing or null uid is rejected after normalization
// with "uid is required" rather than failing the JSON parse.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSubmission {
    pub uid: Option<String>,
    pub scanned_at: Option<String>,
    pub source: Option<String>,
    pub target_field: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ScanAccepted {
    pub ok: bool,
    pub event_id: i64,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanEventRecord {
    pub id: i64,
    pub uid: String,
    pub scanned_at: String,
    pub source: String,
    pub target_field: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardRecord {
    pub uid: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub total_scans: i64,
}

#[derive(Debug, Serialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct DbSafetyReport {
    pub engine: String,
    pub foreign_keys_enabled: bool,
    pub orphan_events: i64,
    pub duplicate_uids: Vec<DuplicateUid>,
    pub is_safe: bool,
}

// Non-empty only when the database was modified out of band; the UNIQUE
// constraint on rfid_cards.uid blocks duplicates through the API.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateUid {
    pub uid: String,
    pub dup_count: i64,
}
