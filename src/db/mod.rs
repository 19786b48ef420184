//! Database access layer.
//!
//! This module provides:
//! - Connection string parsing
//! - Connection factories and the connections they open
//! - The uniform query surface shared by connections and transactions
//! - The multi-result cursor
//! - Named parameter rewriting and binding
//! - Date/time coercion and dynamic row mapping

pub mod coercion;
pub mod connection;
pub mod connection_string;
pub mod factory;
pub mod multiple;
pub mod params;
pub mod types;

pub use coercion::{DateOnly, DateStorage, TimeOnly, TimeStorage, TypeCoercions};
pub use connection::{CommandContext, SqlExecutor, SqliteConnection, SqliteTransaction};
pub use connection_string::{CacheMode, OpenMode, parse_connection_string};
pub use factory::SqliteConnectionFactory;
pub use multiple::MultipleResult;
pub use types::JsonRow;
