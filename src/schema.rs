use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Detections table - one row per detected object, grouped by record_id
#[derive(Iden)]
pub enum Detections {
    Table,
    Id,
    RecordId,
    DeviceId,
    CapturedAt,
    File,
    Label,
    Confidence,
    X1,
    Y1,
    X2,
    Y2,
}

/// Legacy results table - one row per record with a JSON `pred` column
#[derive(Iden)]
pub enum LegacyResults {
    #[iden = "results"]
    Table,
    Id,
    DeviceId,
    Ts,
    File,
    Pred,
}
