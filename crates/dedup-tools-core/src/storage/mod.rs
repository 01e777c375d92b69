pub mod models;
mod queries;
mod sqlite;

pub use queries::now_secs;
pub use sqlite::{attached_table_exists, Database, RetryPolicy, CACHE_SCHEMA};
