use uuid::Uuid;

use crate::types::Row;

/// Upper bound on rows per chunk unless overridden in configuration.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Deterministic chunk key: the owning backup id plus the chunk's position
/// in the write order.
pub fn chunk_id(backup_id: Uuid, seq: u32) -> String {
    format!("{backup_id}_chunk_{seq}")
}

/// Splits a table's rows into groups of at most `chunk_size` rows.
pub fn split_rows(rows: &[Row], chunk_size: usize) -> Vec<Vec<Row>> {
    let chunk_size = chunk_size.max(1);
    rows.chunks(chunk_size).map(<[Row]>::to_vec).collect()
}
