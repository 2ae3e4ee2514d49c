#![allow(clippy::missing_errors_doc)]

//! `SQLite` persistence for ad serving: the append-only ad event history
//! and the deposit ledger, behind a versioned schema.

use std::path::Path;

use ads_serving_core::{
    from_unix_seconds, AdEvent, AdEventHistory, AdEventInput, AdType, AdsError,
    ConfirmationType, CreativeAd, Deposit, TimeWindow,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod ad_events;
pub mod database;
pub mod deposits;
mod ledger;

pub use database::{DbCommand, DbRecord, DbResponse, DbTransaction};
pub use ledger::DepositLedger;

/// Schema version written by [`SqliteAdsStore::migrate`].
pub const DATABASE_VERSION: i64 = 25;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("history error: {0}")]
    History(String),
    #[error("sqlite error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("statement expects {expected} bound parameters, {actual} supplied")]
    BindingMismatch { expected: usize, actual: usize },
    #[error("statement returns {actual} columns, {expected} record bindings declared")]
    RecordBindingMismatch { expected: usize, actual: usize },
    #[error("record column {index} is missing or has an unexpected type")]
    Column { index: usize },
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("failed to start ledger worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    #[error("ledger worker is no longer running")]
    WorkerUnavailable,
}

impl From<AdsError> for LedgerError {
    fn from(err: AdsError) -> Self {
        match err {
            AdsError::Validation(message) => Self::Validation(message),
            AdsError::Configuration(message) => Self::Configuration(message),
            AdsError::History(message) => Self::History(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied_versions: Vec<i64>,
}

pub struct SqliteAdsStore {
    conn: Connection,
}

impl SqliteAdsStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<i64, LedgerError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))?)
    }

    /// Brings the schema up to [`DATABASE_VERSION`], one transaction per
    /// version. Running it again on a current database changes nothing.
    pub fn migrate(&self) -> Result<MigrationReport, LedgerError> {
        let from_version = self.schema_version()?;
        if from_version > DATABASE_VERSION {
            return Err(LedgerError::UnsupportedSchemaVersion {
                found: from_version,
                supported: DATABASE_VERSION,
            });
        }

        let mut applied_versions = Vec::new();
        for version in (from_version + 1)..=DATABASE_VERSION {
            self.migrate_to_version(version)?;
            applied_versions.push(version);
        }

        if applied_versions.is_empty() {
            debug!(version = from_version, "schema already current");
        } else {
            info!(
                from_version,
                to_version = DATABASE_VERSION,
                "migrated ads serving schema"
            );
        }

        Ok(MigrationReport {
            from_version,
            to_version: DATABASE_VERSION,
            applied_versions,
        })
    }

    fn migrate_to_version(&self, version: i64) -> Result<(), LedgerError> {
        let mut transaction = DbTransaction::new();
        ad_events::migrate(&mut transaction, version);
        deposits::migrate(&mut transaction, version);
        transaction.push(DbCommand::execute(format!(
            "PRAGMA user_version = {version};"
        )));
        database::run_transaction(&self.conn, &transaction)?;
        debug!(version, "applied schema migration");
        Ok(())
    }

    pub fn run_transaction(&self, transaction: &DbTransaction) -> Result<DbResponse, LedgerError> {
        database::run_transaction(&self.conn, transaction)
    }

    pub fn save_deposit(&self, deposit: &Deposit) -> Result<(), LedgerError> {
        self.insert_or_update_deposits(std::slice::from_ref(deposit))
    }

    pub fn insert_or_update_deposits(&self, deposits: &[Deposit]) -> Result<(), LedgerError> {
        let mut transaction = DbTransaction::new();
        deposits::insert_or_update(&mut transaction, deposits)?;
        self.commit_writes(&transaction)?;
        debug!(count = deposits.len(), "saved deposits");
        Ok(())
    }

    pub fn insert_or_update_creative_ads(
        &self,
        creative_ads: &[CreativeAd],
    ) -> Result<(), LedgerError> {
        let mut transaction = DbTransaction::new();
        deposits::insert_or_update_creative_ads(&mut transaction, creative_ads)?;
        self.commit_writes(&transaction)?;
        debug!(count = creative_ads.len(), "saved deposits for creative ads");
        Ok(())
    }

    pub fn get_deposit(&self, creative_instance_id: &str) -> Result<Option<Deposit>, LedgerError> {
        if creative_instance_id.is_empty() {
            return Err(LedgerError::Validation(
                "creative_instance_id MUST NOT be empty".to_string(),
            ));
        }

        let response = self
            .read(deposits::get_for_creative_instance_id(creative_instance_id))
            .inspect_err(|err| {
                warn!(creative_instance_id, error = %err, "failed to get deposit value");
            })?;
        response
            .records
            .first()
            .map(deposits::from_record)
            .transpose()
    }

    /// Removes expired deposits and returns how many rows were deleted.
    pub fn purge_expired_deposits(&self) -> Result<usize, LedgerError> {
        let mut transaction = DbTransaction::new();
        transaction.push(deposits::purge_expired());
        let response = self.run_transaction(&transaction).inspect_err(|err| {
            warn!(error = %err, "failed to purge expired deposits");
        })?;
        debug!(purged = response.changes, "purged expired deposits");
        Ok(response.changes)
    }

    pub fn record_ad_event(&self, input: AdEventInput) -> Result<AdEvent, LedgerError> {
        let event = input.into_event()?;
        let mut transaction = DbTransaction::new();
        transaction.push(ad_events::insert(&event));
        self.run_transaction(&transaction)?;
        debug!(
            ad_type = %event.ad_type,
            confirmation_type = %event.confirmation_type,
            "recorded ad event"
        );
        Ok(event)
    }

    pub fn list_ad_events(
        &self,
        ad_type: Option<AdType>,
        limit: usize,
    ) -> Result<Vec<AdEvent>, LedgerError> {
        let response = self.read(ad_events::list(ad_type, limit))?;
        response.records.iter().map(ad_events::from_record).collect()
    }

    fn read(&self, command: DbCommand) -> Result<DbResponse, LedgerError> {
        let mut transaction = DbTransaction::new();
        transaction.push(command);
        self.run_transaction(&transaction)
    }

    fn commit_writes(&self, transaction: &DbTransaction) -> Result<(), LedgerError> {
        if transaction.is_empty() {
            return Ok(());
        }
        self.run_transaction(transaction).map(|_| ())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl AdEventHistory for SqliteAdsStore {
    fn count(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        window: TimeWindow,
    ) -> Result<usize, AdsError> {
        let response = self
            .read(ad_events::count(ad_type, confirmation_type, window))
            .map_err(to_history_error)?;
        let count = match response.records.first() {
            Some(record) => record.column_int(0).map_err(to_history_error)?,
            None => 0,
        };
        usize::try_from(count).map_err(|err| AdsError::History(err.to_string()))
    }

    fn most_recent(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        at_or_before: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, AdsError> {
        let response = self
            .read(ad_events::most_recent(
                ad_type,
                confirmation_type,
                at_or_before,
            ))
            .map_err(to_history_error)?;
        let Some(record) = response.records.first() else {
            return Ok(None);
        };
        let seconds = record.column_double(0).map_err(to_history_error)?;
        from_unix_seconds(seconds)
            .map(Some)
            .map_err(|err| AdsError::History(err.to_string()))
    }
}

fn to_history_error(err: LedgerError) -> AdsError {
    AdsError::History(err.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use ads_serving_core::{
        now_utc, parse_rfc3339_utc, AdsPerDayPermissionRule, MinimumWaitTimePermissionRule,
        PermissionRules,
    };
    use proptest::prelude::*;
    use time::Duration;
    use ulid::Ulid;

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteAdsStore {
        let store = must(SqliteAdsStore::open_in_memory());
        let _ = must(store.migrate());
        store
    }

    fn fixture_time(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn deposit(id: &str, value: f64, expire_at: OffsetDateTime) -> Deposit {
        Deposit {
            creative_instance_id: id.to_string(),
            value,
            expire_at,
        }
    }

    fn served(ad_type: AdType, created_at: OffsetDateTime) -> AdEventInput {
        AdEventInput {
            placement_id: None,
            ad_type,
            confirmation_type: ConfirmationType::Served,
            creative_instance_id: "creative-1".to_string(),
            created_at,
        }
    }

    fn count_rows(store: &SqliteAdsStore, table: &str) -> i64 {
        match store
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            }) {
            Ok(value) => value,
            Err(err) => panic!("failed to count {table}: {err}"),
        }
    }

    fn index_exists(store: &SqliteAdsStore, name: &str) -> bool {
        match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value == 1,
            Err(err) => panic!("failed to query index {name}: {err}"),
        }
    }

    #[test]
    fn fresh_database_migrates_to_current_version() {
        let store = must(SqliteAdsStore::open_in_memory());
        let report = must(store.migrate());

        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, DATABASE_VERSION);
        assert_eq!(report.applied_versions.len(), 25);
        assert_eq!(must(store.schema_version()), DATABASE_VERSION);
        assert!(index_exists(&store, "deposits_expire_at_index"));
        assert!(index_exists(&store, "idx_ad_events_type_confirmation_created_at"));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        must(store.save_deposit(&deposit("c1", 1.0, now_utc() + Duration::days(1))));

        let report = must(store.migrate());
        assert!(report.applied_versions.is_empty());
        assert_eq!(count_rows(&store, "deposits"), 1);
    }

    #[test]
    fn rerunning_deposits_ddl_on_existing_table_is_a_no_op() {
        let store = fixture_store();
        let expire_at = fixture_time("2099-01-01T00:00:00Z");
        must(store.save_deposit(&deposit("c1", 1.0, expire_at)));

        for version in [24, 25] {
            let mut transaction = DbTransaction::new();
            deposits::migrate(&mut transaction, version);
            assert!(!transaction.is_empty());
            let _ = must(store.run_transaction(&transaction));
        }

        assert_eq!(count_rows(&store, "deposits"), 1);
        assert_eq!(must(store.get_deposit("c1")), Some(deposit("c1", 1.0, expire_at)));
        assert_eq!(must(store.schema_version()), DATABASE_VERSION);
    }

    #[test]
    fn core_errors_keep_their_category() {
        assert!(matches!(
            LedgerError::from(AdsError::Validation("bad".to_string())),
            LedgerError::Validation(message) if message == "bad"
        ));
        assert!(matches!(
            LedgerError::from(AdsError::Configuration("bad caps".to_string())),
            LedgerError::Configuration(message) if message == "bad caps"
        ));
        assert!(matches!(
            LedgerError::from(AdsError::History("offline".to_string())),
            LedgerError::History(message) if message == "offline"
        ));
    }

    #[test]
    fn migration_from_v23_creates_deposits_table() {
        let store = must(SqliteAdsStore::open_in_memory());
        if let Err(err) = store
            .connection()
            .execute_batch("PRAGMA user_version = 23;")
        {
            panic!("failed to seed schema version: {err}");
        }

        let report = must(store.migrate());
        assert_eq!(report.applied_versions, vec![24, 25]);
        assert_eq!(count_rows(&store, "deposits"), 0);
    }

    #[test]
    fn newer_schema_version_is_refused() {
        let store = must(SqliteAdsStore::open_in_memory());
        if let Err(err) = store
            .connection()
            .execute_batch("PRAGMA user_version = 26;")
        {
            panic!("failed to seed schema version: {err}");
        }

        assert!(matches!(
            store.migrate(),
            Err(LedgerError::UnsupportedSchemaVersion {
                found: 26,
                supported: 25
            })
        ));
    }

    #[test]
    fn upsert_keeps_one_row_per_creative_instance() {
        let store = fixture_store();
        let expire_at = fixture_time("2099-01-01T00:00:00Z");
        must(store.save_deposit(&deposit("c1", 1.0, expire_at)));
        must(store.save_deposit(&deposit("c1", 2.0, expire_at + Duration::days(1))));

        assert_eq!(count_rows(&store, "deposits"), 1);
        let stored = match must(store.get_deposit("c1")) {
            Some(value) => value,
            None => panic!("expected deposit c1"),
        };
        assert_eq!(stored.value, 2.0);
        assert_eq!(stored.expire_at, expire_at + Duration::days(1));
    }

    #[test]
    fn saving_same_deposit_twice_matches_saving_once() {
        let store = fixture_store();
        let saved = deposit("c1", 0.5, fixture_time("2099-01-01T00:00:00Z"));
        must(store.save_deposit(&saved));
        must(store.save_deposit(&saved));

        assert_eq!(count_rows(&store, "deposits"), 1);
        assert_eq!(must(store.get_deposit("c1")), Some(saved));
    }

    #[test]
    fn missing_deposit_reads_as_none() {
        let store = fixture_store();
        assert_eq!(must(store.get_deposit("unknown")), None);
    }

    #[test]
    fn empty_creative_instance_id_is_rejected_without_io() {
        let store = fixture_store();
        assert!(matches!(
            store.save_deposit(&deposit("", 1.0, now_utc())),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            store.get_deposit(""),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(count_rows(&store, "deposits"), 0);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let store = fixture_store();
        must(store.insert_or_update_deposits(&[]));
        must(store.insert_or_update_creative_ads(&[]));
        assert_eq!(count_rows(&store, "deposits"), 0);
    }

    #[test]
    fn creative_ads_are_saved_with_end_date_as_expiry() {
        let store = fixture_store();
        let end_at = fixture_time("2099-06-30T23:59:59Z");
        let creative_ads = vec![
            CreativeAd {
                creative_instance_id: "c1".to_string(),
                creative_set_id: "set-1".to_string(),
                campaign_id: "campaign-1".to_string(),
                value: 0.05,
                end_at,
                geo_targets: Vec::new(),
            },
            CreativeAd {
                creative_instance_id: "c2".to_string(),
                creative_set_id: "set-1".to_string(),
                campaign_id: "campaign-1".to_string(),
                value: 0.1,
                end_at,
                geo_targets: Vec::new(),
            },
        ];
        must(store.insert_or_update_creative_ads(&creative_ads));

        let stored = match must(store.get_deposit("c2")) {
            Some(value) => value,
            None => panic!("expected deposit c2"),
        };
        assert_eq!(stored.value, 0.1);
        assert_eq!(stored.expire_at, end_at);
    }

    #[test]
    fn purge_removes_only_expired_deposits() {
        let store = fixture_store();
        let now = now_utc();
        must(store.insert_or_update_deposits(&[
            deposit("expired", 1.0, now - Duration::hours(1)),
            deposit("live", 1.0, now + Duration::hours(1)),
        ]));

        assert_eq!(must(store.purge_expired_deposits()), 1);
        assert_eq!(must(store.get_deposit("expired")), None);
        assert!(must(store.get_deposit("live")).is_some());
    }

    #[test]
    fn ad_events_are_append_only() {
        let store = fixture_store();
        let _ = must(store.record_ad_event(served(AdType::NotificationAd, now_utc())));

        let update = store
            .connection()
            .execute("UPDATE ad_events SET type = 'search_result_ad'", []);
        assert!(update.is_err());
        let delete = store.connection().execute("DELETE FROM ad_events", []);
        assert!(delete.is_err());
    }

    #[test]
    fn recorded_events_list_newest_first() {
        let store = fixture_store();
        let base = fixture_time("2026-02-07T12:00:00Z");
        let placement_id = Ulid::new();
        let mut first = served(AdType::InlineContentAd, base - Duration::minutes(5));
        first.placement_id = Some(placement_id);
        let _ = must(store.record_ad_event(first));
        let _ = must(store.record_ad_event(served(AdType::InlineContentAd, base)));
        let _ = must(store.record_ad_event(served(AdType::SearchResultAd, base)));

        let events = must(store.list_ad_events(Some(AdType::InlineContentAd), 10));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].created_at, base);
        assert_eq!(events[1].placement_id, placement_id);

        assert_eq!(must(store.list_ad_events(None, 1)).len(), 1);
    }

    #[test]
    fn sqlite_history_drives_permission_rules() {
        let store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");
        let mut rules = PermissionRules::new();
        rules.register(
            AdType::NotificationAd,
            AdsPerDayPermissionRule::new(AdType::NotificationAd, 2),
        );
        rules.register(
            AdType::NotificationAd,
            MinimumWaitTimePermissionRule::new(AdType::NotificationAd, Duration::minutes(10)),
        );

        let _ = must(store.record_ad_event(served(
            AdType::NotificationAd,
            now - Duration::days(1),
        )));
        let _ = must(store.record_ad_event(served(
            AdType::NotificationAd,
            now - Duration::hours(2),
        )));
        assert!(rules.has_permission(AdType::NotificationAd, &store, now));

        let _ = must(store.record_ad_event(served(
            AdType::NotificationAd,
            now - Duration::minutes(5),
        )));
        let decision = rules.evaluate(AdType::NotificationAd, &store, now);
        assert!(!decision.allowed);
        assert_eq!(decision.denied_by.as_deref(), Some("ads_per_day"));
    }

    #[test]
    fn history_window_excludes_start_and_includes_end() {
        let store = fixture_store();
        let now = fixture_time("2026-02-07T12:00:00Z");
        let _ = must(store.record_ad_event(served(
            AdType::NewTabPageAd,
            now - Duration::days(1),
        )));
        let _ = must(store.record_ad_event(served(AdType::NewTabPageAd, now)));

        let window = TimeWindow::trailing(now, Duration::days(1));
        let count = match store.count(AdType::NewTabPageAd, ConfirmationType::Served, window) {
            Ok(value) => value,
            Err(err) => panic!("count failed: {err}"),
        };
        assert_eq!(count, 1);

        let most_recent = match store.most_recent(
            AdType::NewTabPageAd,
            ConfirmationType::Served,
            now - Duration::seconds(1),
        ) {
            Ok(value) => value,
            Err(err) => panic!("most_recent failed: {err}"),
        };
        assert_eq!(most_recent, Some(now - Duration::days(1)));
    }

    #[test]
    fn unmigrated_store_reports_history_unavailable() {
        let store = must(SqliteAdsStore::open_in_memory());
        let now = fixture_time("2026-02-07T12:00:00Z");
        let window = TimeWindow::trailing(now, Duration::hours(1));

        assert!(matches!(
            store.count(AdType::NotificationAd, ConfirmationType::Served, window),
            Err(AdsError::History(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_purge_leaves_exactly_the_unexpired(offsets in prop::collection::vec(-500i64..500, 1..40)) {
            let store = fixture_store();
            let now = now_utc();
            // Offsets are whole minutes and never zero, so no expiry races the database clock.
            let deposits: Vec<Deposit> = offsets
                .iter()
                .enumerate()
                .map(|(index, offset)| {
                    let minutes = if *offset >= 0 { offset + 1 } else { *offset };
                    deposit(&format!("c{index}"), 1.0, now + Duration::minutes(minutes))
                })
                .collect();
            must(store.insert_or_update_deposits(&deposits));

            let expected_purged = offsets.iter().filter(|offset| **offset < 0).count();
            prop_assert_eq!(must(store.purge_expired_deposits()), expected_purged);

            for saved in &deposits {
                let stored = must(store.get_deposit(&saved.creative_instance_id));
                prop_assert_eq!(stored.is_some(), saved.expire_at > now);
            }
        }
    }
}
