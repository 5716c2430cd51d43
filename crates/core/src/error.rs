use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// `perform_backup` was called while another backup was in flight.
    #[error("a backup is already in progress")]
    BackupInProgress,

    #[error("backup {0} not found")]
    BackupNotFound(Uuid),

    #[error("rollback point {0} not found")]
    RollbackPointNotFound(Uuid),

    /// Restored chunk data did not hash to the checksum recorded at backup
    /// time. Nothing is applied for the offending backup.
    #[error("backup {backup_id} failed checksum verification (expected {expected}, got {actual})")]
    ChecksumMismatch {
        backup_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
