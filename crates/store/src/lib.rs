pub mod connection;
pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use connection::{connect, connect_with_settings, DbPool};
pub use memory::{InMemoryPendingStore, InMemorySessionStore};
pub use sqlite::{SqlitePendingStore, SqliteSessionStore};
