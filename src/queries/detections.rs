use sea_query::{Alias, Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::record::Detection;
use crate::schema::Detections;

/// Columns selected for record reconstruction, in the order `store::DetectionRow` reads them
const ROW_COLUMNS: [Detections; 10] = [
    Detections::RecordId,
    Detections::DeviceId,
    Detections::CapturedAt,
    Detections::File,
    Detections::Label,
    Detections::Confidence,
    Detections::X1,
    Detections::Y1,
    Detections::X2,
    Detections::Y2,
];

/// INSERT INTO detections (record_id, device_id, captured_at, file, label, confidence, x1, y1, x2, y2)
/// VALUES (...), (...), ...
///
/// One VALUES tuple per detection, in slice order. Callers must pass a non-empty slice.
pub fn insert_rows(
    record_id: &str,
    device_id: &str,
    captured_at: i64,
    file: &str,
    detections: &[Detection],
) -> String {
    let mut query = Query::insert();
    query.into_table(Detections::Table).columns([
        Detections::RecordId,
        Detections::DeviceId,
        Detections::CapturedAt,
        Detections::File,
        Detections::Label,
        Detections::Confidence,
        Detections::X1,
        Detections::Y1,
        Detections::X2,
        Detections::Y2,
    ]);

    for detection in detections {
        let bbox = detection.bbox;
        query.values_panic([
            record_id.into(),
            device_id.into(),
            captured_at.into(),
            file.into(),
            detection.label.as_str().into(),
            detection.score.into(),
            bbox.map(|b| b[0]).into(),
            bbox.map(|b| b[1]).into(),
            bbox.map(|b| b[2]).into(),
            bbox.map(|b| b[3]).into(),
        ]);
    }

    query.to_string(SqliteQueryBuilder)
}

/// DELETE FROM detections WHERE record_id = ?
pub fn delete_by_record_id(record_id: &str) -> String {
    Query::delete()
        .from_table(Detections::Table)
        .and_where(Expr::col(Detections::RecordId).eq(record_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT <row columns> FROM detections WHERE record_id = ?
/// ORDER BY confidence DESC, id ASC
pub fn select_by_record_id(record_id: &str) -> String {
    Query::select()
        .columns(ROW_COLUMNS)
        .from(Detections::Table)
        .and_where(Expr::col(Detections::RecordId).eq(record_id))
        .order_by(Detections::Confidence, Order::Desc)
        .order_by(Detections::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT record_id FROM detections ORDER BY captured_at DESC, record_id DESC LIMIT 1
pub fn select_latest_record_id() -> String {
    Query::select()
        .column(Detections::RecordId)
        .from(Detections::Table)
        .order_by(Detections::CapturedAt, Order::Desc)
        .order_by(Detections::RecordId, Order::Desc)
        .limit(1)
        .to_string(SqliteQueryBuilder)
}

/// SELECT record_id, MAX(captured_at) AS ts FROM detections GROUP BY record_id
/// ORDER BY ts DESC, record_id DESC LIMIT ? OFFSET ?
pub fn select_page_record_ids(limit: u64, offset: u64) -> String {
    Query::select()
        .column(Detections::RecordId)
        .expr_as(Func::max(Expr::col(Detections::CapturedAt)), Alias::new("ts"))
        .from(Detections::Table)
        .group_by_col(Detections::RecordId)
        .order_by(Alias::new("ts"), Order::Desc)
        .order_by(Detections::RecordId, Order::Desc)
        .limit(limit)
        .offset(offset)
        .to_string(SqliteQueryBuilder)
}

/// SELECT <row columns> FROM detections WHERE record_id IN (...)
/// ORDER BY captured_at DESC, record_id DESC, confidence DESC, id ASC
///
/// Rows of one record come out contiguous so they can be folded in a single pass.
pub fn select_by_record_ids(record_ids: &[String]) -> String {
    Query::select()
        .columns(ROW_COLUMNS)
        .from(Detections::Table)
        .and_where(Expr::col(Detections::RecordId).is_in(record_ids.iter().map(String::as_str)))
        .order_by(Detections::CapturedAt, Order::Desc)
        .order_by(Detections::RecordId, Order::Desc)
        .order_by(Detections::Confidence, Order::Desc)
        .order_by(Detections::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(DISTINCT record_id) FROM detections
pub fn count_records() -> String {
    Query::select()
        .expr(Expr::cust("COUNT(DISTINCT \"record_id\")"))
        .from(Detections::Table)
        .to_string(SqliteQueryBuilder)
}
