//! SQLite connection handling and schema migration
//!
//! The schema is versioned through the `version` key of the metadata table.
//! Version 1 databases have no metadata table: they consist of a single
//! `results` table holding one row per record with the detections serialized
//! as JSON. [`migrate`] converts them into the per-detection `detections`
//! table once, at startup.

use log::{info, warn};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    unix_now, EXPECTED_DB_VERSION, LEGACY_SENTINEL_LABEL, SENTINEL_LABEL,
};
use crate::queries::{ddl, detections, legacy, metadata};
use crate::record::{normalize_detections, Detection};

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Name of the version 1 table
const LEGACY_TABLE: &str = "results";

/// Name the version 1 table is kept under after a successful conversion
const LEGACY_ARCHIVE_TABLE: &str = "results_v1";

/// Result of running [`migrate`] on a database
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// Empty database, current schema created
    Created,
    /// Already at the expected version
    UpToDate,
    /// Version 1 data converted into per-detection rows
    Migrated { records: usize, rows: usize },
    /// Version 1 data could not be converted; it was renamed aside to
    /// `backup_table` and an empty current schema was created
    FreshStart { reason: String, backup_table: String },
}

/// Open (creating if needed) a file-based database pool for production use
/// Enables WAL mode and a busy timeout so concurrent writers queue instead of failing
pub async fn open_database(db_path: &Path) -> Result<SqlitePool, DynError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| format!("Failed to open database '{}': {}", db_path.display(), e))?;

    Ok(pool)
}

/// Create a file-based database in a temporary directory for testing
/// Returns (pool, guard) - keep the guard alive to prevent temp file deletion
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), DynError> {
    let temp_dir = tempfile::tempdir()?;
    let db_path = temp_dir.path().join("test.sqlite");
    let pool = open_database(&db_path).await?;
    Ok((pool, temp_dir))
}

/// Create tables and indexes of the current schema (idempotent)
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), DynError> {
    let mut tx = pool.begin().await?;
    create_current_schema(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}

async fn create_current_schema(tx: &mut Transaction<'_, Sqlite>) -> Result<(), DynError> {
    sqlx::query(&ddl::create_metadata_table())
        .execute(&mut **tx)
        .await?;
    sqlx::query(&ddl::create_detections_table())
        .execute(&mut **tx)
        .await?;
    sqlx::query(&ddl::create_detections_record_id_index())
        .execute(&mut **tx)
        .await?;
    sqlx::query(&ddl::create_detections_captured_at_index())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Query a single metadata value by key
pub async fn query_metadata(pool: &SqlitePool, key: &str) -> Result<Option<String>, DynError> {
    let sql = metadata::select_by_key(key);
    let result = sqlx::query(&sql).fetch_optional(pool).await?;
    Ok(result.map(|row| row.get::<String, _>(0)))
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool, DynError> {
    let count: i64 = sqlx::query_scalar(&ddl::count_tables_named(name))
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Bring the database to [`EXPECTED_DB_VERSION`]
///
/// Safe to call on every startup. Fails only when the database carries an
/// unknown version or cannot be written at all; a legacy table that cannot be
/// converted results in [`MigrationOutcome::FreshStart`].
pub async fn migrate(pool: &SqlitePool) -> Result<MigrationOutcome, DynError> {
    sqlx::query(&ddl::create_metadata_table())
        .execute(pool)
        .await?;

    match query_metadata(pool, "version").await?.as_deref() {
        Some(EXPECTED_DB_VERSION) => {
            init_database_schema(pool).await?;
            return Ok(MigrationOutcome::UpToDate);
        }
        Some(other) => {
            return Err(format!(
                "Unsupported database version: '{}'. This application only supports version '{}'",
                other, EXPECTED_DB_VERSION
            )
            .into());
        }
        None => {}
    }

    if !table_exists(pool, LEGACY_TABLE).await? {
        let mut tx = pool.begin().await?;
        create_current_schema(&mut tx).await?;
        sqlx::query(&metadata::upsert("version", EXPECTED_DB_VERSION))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(MigrationOutcome::Created);
    }

    info!("Found version 1 '{}' table, converting to per-detection rows", LEGACY_TABLE);

    match convert_legacy_results(pool).await {
        Ok((records, rows)) => {
            info!(
                "Converted {} records into {} detection rows; old table kept as '{}'",
                records, rows, LEGACY_ARCHIVE_TABLE
            );
            Ok(MigrationOutcome::Migrated { records, rows })
        }
        Err(e) => {
            let reason = e.to_string();
            warn!("Conversion of '{}' failed: {}", LEGACY_TABLE, reason);

            let backup_table = format!("{}_backup_{}", LEGACY_TABLE, unix_now());
            let mut tx = pool.begin().await?;
            sqlx::query(&ddl::rename_table(LEGACY_TABLE, &backup_table))
                .execute(&mut *tx)
                .await?;
            create_current_schema(&mut tx).await?;
            sqlx::query(&metadata::upsert("version", EXPECTED_DB_VERSION))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            warn!(
                "Starting with an empty store; unconverted data kept in '{}'",
                backup_table
            );
            Ok(MigrationOutcome::FreshStart {
                reason,
                backup_table,
            })
        }
    }
}

/// One prediction as serialized in the version 1 `pred` column
#[derive(Debug, Deserialize)]
struct LegacyPrediction {
    label: String,
    #[serde(default)]
    score: f64,
    #[serde(rename = "box", default)]
    bbox: Option<Vec<f64>>,
}

impl LegacyPrediction {
    fn into_detection(self) -> Result<Detection, String> {
        let bbox = match self.bbox.as_deref() {
            None | Some([]) => None,
            Some([x1, y1, x2, y2]) => Some([*x1, *y1, *x2, *y2]),
            Some(other) => {
                return Err(format!("box must have 0 or 4 coordinates, got {}", other.len()))
            }
        };
        let label = if bbox.is_none() && self.label == LEGACY_SENTINEL_LABEL {
            SENTINEL_LABEL.to_string()
        } else {
            self.label
        };
        Ok(Detection::new(label, self.score, bbox))
    }
}

/// Parse a version 1 `pred` value; NULL or an empty list become the sentinel
fn parse_legacy_predictions(pred: Option<&str>) -> Result<Vec<Detection>, String> {
    let predictions: Vec<LegacyPrediction> = match pred.map(str::trim) {
        None | Some("") => Vec::new(),
        Some(json) => {
            serde_json::from_str(json).map_err(|e| format!("invalid pred JSON: {}", e))?
        }
    };

    let detections = predictions
        .into_iter()
        .map(LegacyPrediction::into_detection)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(normalize_detections(detections))
}

/// Copy every version 1 row into `detections` inside one transaction
/// Returns (records, rows) converted
async fn convert_legacy_results(pool: &SqlitePool) -> Result<(usize, usize), DynError> {
    let column_rows = sqlx::query(&legacy::select_result_columns())
        .fetch_all(pool)
        .await?;
    let has_pred = column_rows
        .iter()
        .any(|row| row.get::<String, _>(0) == "pred");

    let mut tx = pool.begin().await?;
    create_current_schema(&mut tx).await?;

    let rows = sqlx::query(&legacy::select_all(has_pred))
        .fetch_all(&mut *tx)
        .await?;

    let mut records = 0usize;
    let mut detection_rows = 0usize;

    for row in rows {
        let id: String = row.try_get(0)?;
        let device_id: Option<String> = row.try_get(1)?;
        let ts: Option<i64> = row.try_get(2)?;
        let file: Option<String> = row.try_get(3)?;
        let pred: Option<String> = row.try_get(4)?;

        let detections = parse_legacy_predictions(pred.as_deref())
            .map_err(|e| format!("record '{}': {}", id, e))?;

        let sql = detections::delete_by_record_id(&id);
        sqlx::query(&sql).execute(&mut *tx).await?;

        let sql = detections::insert_rows(
            &id,
            device_id.as_deref().unwrap_or(crate::constants::DEFAULT_DEVICE_ID),
            ts.unwrap_or(0),
            file.as_deref().unwrap_or(""),
            &detections,
        );
        sqlx::query(&sql).execute(&mut *tx).await?;

        records += 1;
        detection_rows += detections.len();
    }

    sqlx::query(&ddl::rename_table(LEGACY_TABLE, LEGACY_ARCHIVE_TABLE))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&metadata::upsert("version", EXPECTED_DB_VERSION))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((records, detection_rows))
}
