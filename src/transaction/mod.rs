pub mod concurrency;
pub mod wal;
