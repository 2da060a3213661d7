mod log_manager;
mod log_record;
mod recovery;

pub use log_manager::LogManager;
pub use log_record::{DecodeOutcome, LogPayload, LogRecord, LogRecordKind, LOG_HEADER_SIZE};
pub use recovery::{LogRecovery, RecoveryError};
