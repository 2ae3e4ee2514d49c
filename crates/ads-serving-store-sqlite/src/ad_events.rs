//! The append-only `ad_events` table backing the permission history.

use ads_serving_core::{
    from_unix_seconds, to_unix_seconds, AdEvent, AdType, ConfirmationType, TimeWindow,
};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::database::{ColumnType, DbCommand, DbRecord, DbTransaction};
use crate::LedgerError;

pub const TABLE_NAME: &str = "ad_events";

const EVENT_BINDINGS: [ColumnType; 5] = [
    ColumnType::String,
    ColumnType::String,
    ColumnType::String,
    ColumnType::String,
    ColumnType::Double,
];

const SCHEMA_AD_EVENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS ad_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  placement_id TEXT NOT NULL,
  type TEXT NOT NULL,
  confirmation_type TEXT NOT NULL,
  creative_instance_id TEXT NOT NULL,
  created_at TIMESTAMP NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_ad_events_no_update
BEFORE UPDATE ON ad_events
BEGIN
  SELECT RAISE(FAIL, 'ad_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ad_events_no_delete
BEFORE DELETE ON ad_events
BEGIN
  SELECT RAISE(FAIL, 'ad_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ad_events_type_confirmation_created_at
  ON ad_events(type, confirmation_type, created_at);
";

pub fn migrate(transaction: &mut DbTransaction, to_version: i64) {
    if to_version == 1 {
        transaction.push(DbCommand::execute(SCHEMA_AD_EVENTS_V1));
    }
}

#[must_use]
pub fn insert(event: &AdEvent) -> DbCommand {
    DbCommand::run(format!(
        "INSERT INTO {TABLE_NAME} (placement_id, type, confirmation_type, creative_instance_id, created_at) VALUES (?, ?, ?, ?, ?);"
    ))
    .bind_string(event.placement_id.to_string())
    .bind_string(event.ad_type.as_str())
    .bind_string(event.confirmation_type.as_str())
    .bind_string(event.creative_instance_id.as_str())
    .bind_double(to_unix_seconds(event.created_at))
}

#[must_use]
pub fn count(
    ad_type: AdType,
    confirmation_type: ConfirmationType,
    window: TimeWindow,
) -> DbCommand {
    DbCommand::read(
        format!(
            "SELECT COUNT(*) FROM {TABLE_NAME}
             WHERE type = ? AND confirmation_type = ? AND created_at > ? AND created_at <= ?;"
        ),
        &[ColumnType::Int],
    )
    .bind_string(ad_type.as_str())
    .bind_string(confirmation_type.as_str())
    .bind_double(to_unix_seconds(window.start_exclusive()))
    .bind_double(to_unix_seconds(window.end_inclusive()))
}

#[must_use]
pub fn most_recent(
    ad_type: AdType,
    confirmation_type: ConfirmationType,
    at_or_before: OffsetDateTime,
) -> DbCommand {
    DbCommand::read(
        format!(
            "SELECT created_at FROM {TABLE_NAME}
             WHERE type = ? AND confirmation_type = ? AND created_at <= ?
             ORDER BY created_at DESC LIMIT 1;"
        ),
        &[ColumnType::Double],
    )
    .bind_string(ad_type.as_str())
    .bind_string(confirmation_type.as_str())
    .bind_double(to_unix_seconds(at_or_before))
}

/// Newest events first, optionally restricted to one ad type.
#[must_use]
pub fn list(ad_type: Option<AdType>, limit: usize) -> DbCommand {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    match ad_type {
        Some(ad_type) => DbCommand::read(
            format!(
                "SELECT placement_id, type, confirmation_type, creative_instance_id, created_at
                 FROM {TABLE_NAME} WHERE type = ?
                 ORDER BY created_at DESC, event_seq DESC LIMIT ?;"
            ),
            &EVENT_BINDINGS,
        )
        .bind_string(ad_type.as_str())
        .bind_int(limit),
        None => DbCommand::read(
            format!(
                "SELECT placement_id, type, confirmation_type, creative_instance_id, created_at
                 FROM {TABLE_NAME}
                 ORDER BY created_at DESC, event_seq DESC LIMIT ?;"
            ),
            &EVENT_BINDINGS,
        )
        .bind_int(limit),
    }
}

pub fn from_record(record: &DbRecord) -> Result<AdEvent, LedgerError> {
    let raw_placement_id = record.column_string(0)?;
    let placement_id = Ulid::from_string(raw_placement_id).map_err(|err| {
        LedgerError::Validation(format!("invalid placement_id `{raw_placement_id}`: {err}"))
    })?;

    let raw_ad_type = record.column_string(1)?;
    let ad_type = AdType::parse(raw_ad_type)
        .ok_or_else(|| LedgerError::Validation(format!("unknown ad type `{raw_ad_type}`")))?;

    let raw_confirmation_type = record.column_string(2)?;
    let confirmation_type = ConfirmationType::parse(raw_confirmation_type).ok_or_else(|| {
        LedgerError::Validation(format!(
            "unknown confirmation type `{raw_confirmation_type}`"
        ))
    })?;

    Ok(AdEvent {
        placement_id,
        ad_type,
        confirmation_type,
        creative_instance_id: record.column_string(3)?.to_string(),
        created_at: from_unix_seconds(record.column_double(4)?)
            .map_err(|err| LedgerError::Timestamp(err.to_string()))?,
    })
}
