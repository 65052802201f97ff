use serde::Serialize;

/// Replication traffic counters, split by record kind and direction.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    pub entity_creates_sent: u64,
    pub entity_create_bytes_sent: u64,
    pub entity_updates_sent: u64,
    pub entity_update_bytes_sent: u64,
    pub entity_deletes_sent: u64,
    pub entity_delete_bytes_sent: u64,
    pub commands_sent: u64,
    pub command_bytes_sent: u64,

    pub entity_creates_received: u64,
    pub entity_updates_received: u64,
    pub entity_deletes_received: u64,
    pub commands_received: u64,
}

impl SyncStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
