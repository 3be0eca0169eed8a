//! Persistence of published snapshots.

pub mod persistence;
pub mod records;

pub use persistence::{PersistReport, PersistenceError, PersistenceWriter, RecordStore};
pub use records::PgRecordStore;
