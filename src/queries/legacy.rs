use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::LegacyResults;

/// SELECT name FROM pragma_table_info('results')
pub fn select_result_columns() -> String {
    "SELECT name FROM pragma_table_info('results')".to_string()
}

/// SELECT id, device_id, ts, file, pred FROM results ORDER BY ts, id
///
/// Builds without the `pred` column (selecting NULL instead) for databases
/// created before that column existed.
pub fn select_all(has_pred: bool) -> String {
    let mut query = Query::select();
    query
        .columns([
            LegacyResults::Id,
            LegacyResults::DeviceId,
            LegacyResults::Ts,
            LegacyResults::File,
        ])
        .from(LegacyResults::Table);

    if has_pred {
        query.column(LegacyResults::Pred);
    } else {
        query.expr_as(Expr::cust("NULL"), Alias::new("pred"));
    }

    query
        .order_by(LegacyResults::Ts, Order::Asc)
        .order_by(LegacyResults::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO results (id, device_id, ts, file, pred) VALUES (?, ?, ?, ?, ?)
///
/// Only used to build legacy fixtures in tests.
pub fn insert(id: &str, device_id: &str, ts: i64, file: &str, pred: &str) -> String {
    Query::insert()
        .into_table(LegacyResults::Table)
        .columns([
            LegacyResults::Id,
            LegacyResults::DeviceId,
            LegacyResults::Ts,
            LegacyResults::File,
            LegacyResults::Pred,
        ])
        .values_panic([
            id.into(),
            device_id.into(),
            ts.into(),
            file.into(),
            pred.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS results (id TEXT PRIMARY KEY, device_id TEXT, ts INTEGER, file TEXT, pred TEXT)
///
/// The shape written by the first release. Only used to build legacy fixtures in tests.
pub fn create_table() -> String {
    "CREATE TABLE IF NOT EXISTS results(id TEXT PRIMARY KEY, device_id TEXT, ts INTEGER, file TEXT, pred TEXT)"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all_without_pred_selects_null() {
        let sql = select_all(false);
        assert!(sql.contains("NULL AS \"pred\""));
        assert!(sql.contains("FROM \"results\""));
    }

    #[test]
    fn test_select_all_with_pred() {
        let sql = select_all(true);
        assert!(sql.contains("\"pred\""));
        assert!(!sql.contains("NULL AS"));
    }
}
