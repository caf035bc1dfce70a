//! SQL builders
//!
//! Every statement the service runs is built here with sea-query and rendered
//! for SQLite. Values are inlined by the builder, so results can be passed
//! straight to `sqlx::query`.

pub mod ddl;
pub mod detections;
pub mod legacy;
pub mod metadata;
