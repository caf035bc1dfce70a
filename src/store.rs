//! Record store over the `detections` table
//!
//! Each record is stored as one row per detection sharing `record_id`, with
//! the capture metadata repeated on every row. Reads reconstruct records by
//! folding consecutive rows of the same id (see [`group_rows`]); the queries
//! order rows so that each record's rows are contiguous and already sorted by
//! descending confidence.

use log::debug;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::error::{AppError, Result};
use crate::queries::detections;
use crate::record::{normalize_detections, Detection, DetectionRecord};

/// One `detections` row as read back from the database
#[derive(Debug, Clone)]
pub struct DetectionRow {
    pub record_id: String,
    pub device_id: String,
    pub captured_at: i64,
    pub file: String,
    pub detection: Detection,
}

impl DetectionRow {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let x1: Option<f64> = row.try_get(6)?;
        let y1: Option<f64> = row.try_get(7)?;
        let x2: Option<f64> = row.try_get(8)?;
        let y2: Option<f64> = row.try_get(9)?;
        let bbox = match (x1, y1, x2, y2) {
            (Some(x1), Some(y1), Some(x2), Some(y2)) => Some([x1, y1, x2, y2]),
            _ => None,
        };

        Ok(Self {
            record_id: row.try_get(0)?,
            device_id: row.try_get(1)?,
            captured_at: row.try_get(2)?,
            file: row.try_get(3)?,
            detection: Detection::new(row.try_get::<String, _>(4)?, row.try_get(5)?, bbox),
        })
    }
}

/// Fold rows into records
///
/// Rows must arrive grouped by `record_id` (all rows of a record adjacent) and
/// sorted by descending confidence within each group; record order and
/// detection order are preserved as given.
pub fn group_rows(rows: Vec<DetectionRow>) -> Vec<DetectionRecord> {
    let mut records: Vec<DetectionRecord> = Vec::new();

    for row in rows {
        match records.last_mut() {
            Some(current) if current.id == row.record_id => {
                current.detections.push(row.detection);
            }
            _ => records.push(DetectionRecord {
                id: row.record_id,
                device_id: row.device_id,
                captured_at: row.captured_at,
                file: row.file,
                detections: vec![row.detection],
            }),
        }
    }

    records
}

/// Durable mapping from record id to its detections
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Wrap a pool whose schema has already been migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a record, replacing every row previously saved under `record_id`
    ///
    /// The delete and the inserts run in one transaction, so readers observe
    /// either the previous detection set or the new one. An empty
    /// `detections` list is stored as the single sentinel row.
    pub async fn save(
        &self,
        record_id: &str,
        device_id: &str,
        captured_at: i64,
        file: &str,
        detections: Vec<Detection>,
    ) -> Result<DetectionRecord> {
        if record_id.trim().is_empty() {
            return Err(AppError::BadRequest("record id must not be empty".to_string()));
        }

        let detections = normalize_detections(detections);

        let mut tx = self.pool.begin().await?;

        let sql = detections::delete_by_record_id(record_id);
        let replaced = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();

        let sql = detections::insert_rows(record_id, device_id, captured_at, file, &detections);
        sqlx::query(&sql).execute(&mut *tx).await?;

        tx.commit().await?;

        if replaced > 0 {
            debug!("Replaced {} rows of record {}", replaced, record_id);
        }

        Ok(DetectionRecord {
            id: record_id.to_string(),
            device_id: device_id.to_string(),
            captured_at,
            file: file.to_string(),
            detections,
        })
    }

    /// Fetch one record by id
    pub async fn get(&self, record_id: &str) -> Result<Option<DetectionRecord>> {
        let sql = detections::select_by_record_id(record_id);
        let rows = self.fetch_rows(&sql).await?;
        Ok(group_rows(rows).into_iter().next())
    }

    /// The record with the greatest capture timestamp
    ///
    /// Equal timestamps resolve to the greatest record id.
    pub async fn get_latest(&self) -> Result<Option<DetectionRecord>> {
        let sql = detections::select_latest_record_id();
        let latest: Option<String> = sqlx::query_scalar(&sql)
            .fetch_optional(&self.pool)
            .await?;

        match latest {
            Some(record_id) => self.get(&record_id).await,
            None => Ok(None),
        }
    }

    /// Up to `limit` records, newest first, skipping the first `offset`
    pub async fn list(&self, limit: u64, offset: u64) -> Result<Vec<DetectionRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = detections::select_page_record_ids(limit, offset);
        let ids: Vec<String> = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<std::result::Result<_, _>>()?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = detections::select_by_record_ids(&ids);
        let rows = self.fetch_rows(&sql).await?;
        Ok(group_rows(rows))
    }

    /// Number of distinct records
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&detections::count_records())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<DetectionRow>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let rows = rows
            .iter()
            .map(DetectionRow::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
