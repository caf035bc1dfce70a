use uuid::Uuid;

/// Expected database schema version
/// Version 1 was the single `results` table with a JSON `pred` column,
/// version 2 stores one row per detection
pub const EXPECTED_DB_VERSION: &str = "2";

/// Label used for the placeholder detection when nothing clears the threshold.
/// Used unchanged by the detector adapter, the store and the API.
pub const SENTINEL_LABEL: &str = "unknown";

/// Sentinel label written by older builds, rewritten during migration
pub const LEGACY_SENTINEL_LABEL: &str = "no detection";

/// Device id assigned to multipart uploads
pub const MANUAL_DEVICE_ID: &str = "manual";

/// Device id used when a JSON upload does not carry one
pub const DEFAULT_DEVICE_ID: &str = "unknown";

/// Page size for `/results` when `limit` is omitted
pub const DEFAULT_PAGE_LIMIT: i64 = 20;

/// Generate a unique record ID
/// Format: `rec_` followed by 12 lowercase hex characters
pub fn generate_record_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("rec_{}", &hex[..12])
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
