// Library interface for testing

pub mod config;
pub mod constants;
pub mod db;
pub mod detect;
pub mod error;
pub mod queries;
pub mod record;
pub mod render;
pub mod schema;
pub mod serve;
pub mod store;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
