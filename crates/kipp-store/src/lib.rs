pub mod database;
pub mod error;
pub mod memory;
pub mod provider;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use provider::{SessionInfo, SessionUpdate, StorageProvider};
pub use sqlite::SqliteStore;
