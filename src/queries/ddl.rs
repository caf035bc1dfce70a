use sea_query::{Alias, ColumnDef, Index, SqliteQueryBuilder, Table};

use crate::schema::{Detections, Metadata};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS detections (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     record_id TEXT NOT NULL,
///     device_id TEXT NOT NULL,
///     captured_at INTEGER NOT NULL,
///     file TEXT NOT NULL,
///     label TEXT NOT NULL,
///     confidence REAL NOT NULL,
///     x1 REAL, y1 REAL, x2 REAL, y2 REAL
/// )
///
/// Box columns are NULL for the sentinel row.
pub fn create_detections_table() -> String {
    Table::create()
        .table(Detections::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Detections::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Detections::RecordId).string().not_null())
        .col(ColumnDef::new(Detections::DeviceId).string().not_null())
        .col(ColumnDef::new(Detections::CapturedAt).big_integer().not_null())
        .col(ColumnDef::new(Detections::File).string().not_null())
        .col(ColumnDef::new(Detections::Label).string().not_null())
        .col(ColumnDef::new(Detections::Confidence).double().not_null())
        .col(ColumnDef::new(Detections::X1).double().null())
        .col(ColumnDef::new(Detections::Y1).double().null())
        .col(ColumnDef::new(Detections::X2).double().null())
        .col(ColumnDef::new(Detections::Y2).double().null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_detections_record_id ON detections(record_id)
pub fn create_detections_record_id_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_detections_record_id")
        .table(Detections::Table)
        .col(Detections::RecordId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_detections_captured_at ON detections(captured_at, record_id)
pub fn create_detections_captured_at_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_detections_captured_at")
        .table(Detections::Table)
        .col(Detections::CapturedAt)
        .col(Detections::RecordId)
        .to_string(SqliteQueryBuilder)
}

/// ALTER TABLE <from> RENAME TO <to>
pub fn rename_table(from: &str, to: &str) -> String {
    Table::rename()
        .table(Alias::new(from), Alias::new(to))
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?
pub fn count_tables_named(name: &str) -> String {
    use sea_query::{Expr, Func, Query};

    Query::select()
        .expr(Func::count(Expr::col(Alias::new("name"))))
        .from(Alias::new("sqlite_master"))
        .and_where(Expr::col(Alias::new("type")).eq("table"))
        .and_where(Expr::col(Alias::new("name")).eq(name))
        .to_string(SqliteQueryBuilder)
}
