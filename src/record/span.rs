use chrono::{DateTime, Datelike, Timelike, Utc};

/// Decoded span-derived fact, the ingestion-side input to the trace graph.
///
/// One fact describes one finished span: where it ran, what it served, how
/// long it took, and (when the span crossed a service boundary) who called
/// it. Facts are consumed by the analysis entry node and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanFact {
    pub service: String,
    pub instance: String,
    pub endpoint: String,
    /// Upstream caller service, when the span carries a cross-service
    /// reference. Drives topology-edge derivation.
    pub peer_service: Option<String>,
    pub time_bucket: i64,
    pub duration_ms: i64,
    pub is_error: bool,
}

/// Minute-resolution time bucket in `YYYYMMDDHHmm` form (UTC).
pub fn minute_bucket(time: DateTime<Utc>) -> i64 {
    i64::from(time.year()) * 1_0000_0000
        + i64::from(time.month()) * 1_00_0000
        + i64::from(time.day()) * 1_0000
        + i64::from(time.hour()) * 100
        + i64::from(time.minute())
}

/// Truncates a minute bucket to its hour bucket (`YYYYMMDDHH`).
pub fn hour_bucket(minute_bucket: i64) -> i64 {
    minute_bucket / 100
}

/// Truncates a minute bucket to its day bucket (`YYYYMMDD`).
pub fn day_bucket(minute_bucket: i64) -> i64 {
    minute_bucket / 1_0000
}
