/// Service entries, processes and workflow runs are keyed by random UUIDs.
pub type EntityId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh opaque identifier.
pub fn new_id() -> EntityId {
    uuid::Uuid::new_v4()
}
