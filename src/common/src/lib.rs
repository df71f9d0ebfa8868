pub mod config;
pub mod lock;
pub mod metrics;
pub mod records;
pub mod storage;
pub mod whitelist;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use records::{FileRecord, RecordStore};
pub use whitelist::FileWhitelist;
