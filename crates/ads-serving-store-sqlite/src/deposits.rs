//! The `deposits` table: at most one deposit per creative instance.

use ads_serving_core::{from_unix_seconds, to_unix_seconds, CreativeAd, Deposit};

use crate::database::{
    build_binding_parameter_placeholders, ColumnType, DbCommand, DbRecord, DbTransaction,
    MAX_ROWS_PER_COMMAND,
};
use crate::LedgerError;

pub const TABLE_NAME: &str = "deposits";

const RECORD_BINDINGS: [ColumnType; 3] =
    [ColumnType::String, ColumnType::Double, ColumnType::Double];

const SCHEMA_DEPOSITS_V24: &str = r"
CREATE TABLE IF NOT EXISTS deposits (
  creative_instance_id TEXT NOT NULL,
  value DOUBLE NOT NULL,
  expire_at TIMESTAMP NOT NULL,
  PRIMARY KEY (creative_instance_id),
  UNIQUE (creative_instance_id) ON CONFLICT REPLACE
);
";

const SCHEMA_DEPOSITS_V25: &str = r"
CREATE INDEX IF NOT EXISTS deposits_expire_at_index
  ON deposits(expire_at);
";

/// Appends the schema changes this table needs to reach `to_version`.
/// Versions that do not touch the table leave the transaction unchanged.
pub fn migrate(transaction: &mut DbTransaction, to_version: i64) {
    match to_version {
        24 => transaction.push(DbCommand::execute(SCHEMA_DEPOSITS_V24)),
        25 => transaction.push(DbCommand::execute(SCHEMA_DEPOSITS_V25)),
        _ => {}
    }
}

/// Queues an upsert of every deposit. An empty batch queues nothing.
///
/// The whole batch is validated before any command is queued.
pub fn insert_or_update(
    transaction: &mut DbTransaction,
    deposits: &[Deposit],
) -> Result<(), LedgerError> {
    for deposit in deposits {
        deposit.validate()?;
    }

    for chunk in deposits.chunks(MAX_ROWS_PER_COMMAND) {
        let mut command = DbCommand::run(format!(
            "INSERT OR REPLACE INTO {TABLE_NAME} (creative_instance_id, value, expire_at) VALUES {};",
            build_binding_parameter_placeholders(RECORD_BINDINGS.len(), chunk.len())
        ));
        for deposit in chunk {
            command = command
                .bind_string(deposit.creative_instance_id.as_str())
                .bind_double(deposit.value)
                .bind_double(to_unix_seconds(deposit.expire_at));
        }
        transaction.push(command);
    }

    Ok(())
}

/// Queues an upsert of the deposit each creative ad will earn, expiring at
/// the creative's end date.
pub fn insert_or_update_creative_ads(
    transaction: &mut DbTransaction,
    creative_ads: &[CreativeAd],
) -> Result<(), LedgerError> {
    let deposits: Vec<Deposit> = creative_ads.iter().map(Deposit::from).collect();
    insert_or_update(transaction, &deposits)
}

#[must_use]
pub fn get_for_creative_instance_id(creative_instance_id: &str) -> DbCommand {
    DbCommand::read(
        format!(
            "SELECT creative_instance_id, value, expire_at FROM {TABLE_NAME} WHERE creative_instance_id = ?;"
        ),
        &RECORD_BINDINGS,
    )
    .bind_string(creative_instance_id)
}

/// Deletes every deposit whose expiry is at or before the database clock.
#[must_use]
pub fn purge_expired() -> DbCommand {
    DbCommand::run(format!(
        "DELETE FROM {TABLE_NAME} WHERE expire_at <= (julianday('now') - 2440587.5) * 86400.0;"
    ))
}

pub fn from_record(record: &DbRecord) -> Result<Deposit, LedgerError> {
    let expire_at = from_unix_seconds(record.column_double(2)?)
        .map_err(|err| LedgerError::Timestamp(err.to_string()))?;
    Ok(Deposit {
        creative_instance_id: record.column_string(0)?.to_string(),
        value: record.column_double(1)?,
        expire_at,
    })
}
