//! Embedded `adsctl` command surface.
//!
//! Hosts can drive ad serving through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a single [`Command`] against a DB path.
//! - [`run_command`] for a single [`Command`] against an opened store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ads_serving_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AdEventInput, AdType, AntiTargetingSites,
    ConfirmationType, CreativeAd, Deposit, EligibilityContext, EligibilityReport, EligibleAds,
    PermissionDecision, PermissionRules, ServingRuleset, StaticSubdivision,
};
use ads_serving_store_sqlite::{
    DepositLedger, MigrationReport, SqliteAdsStore, DATABASE_VERSION,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "adsctl")]
#[command(about = "Ad serving admission control and deposit ledger")]
pub struct Cli {
    #[arg(long, default_value = "./ads_serving.sqlite3")]
    db: PathBuf,

    /// JSON ruleset overriding the built-in v1 caps.
    #[arg(long)]
    ruleset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Permission {
        #[command(subcommand)]
        command: PermissionCommand,
    },
    Eligible(EligibleArgs),
    Deposits {
        #[command(subcommand)]
        command: DepositsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Migrate,
    Version,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    Record(RecordEventArgs),
    List(ListEventsArgs),
}

#[derive(Debug, Args)]
pub struct RecordEventArgs {
    #[arg(long)]
    ad_type: AdTypeArg,
    #[arg(long, default_value = "served")]
    confirmation_type: ConfirmationTypeArg,
    #[arg(long)]
    creative_instance_id: String,
    #[arg(long)]
    placement_id: Option<String>,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListEventsArgs {
    #[arg(long)]
    ad_type: Option<AdTypeArg>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum PermissionCommand {
    Check(PermissionCheckArgs),
}

#[derive(Debug, Args)]
pub struct PermissionCheckArgs {
    #[arg(long)]
    ad_type: AdTypeArg,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct EligibleArgs {
    #[arg(long)]
    ad_type: AdTypeArg,
    /// JSON array of candidate creative ads.
    #[arg(long)]
    candidates: PathBuf,
    #[arg(long)]
    subdivision: Option<String>,
    /// JSON object of anti-targeted sites per creative set and visited sites.
    #[arg(long)]
    anti_targeting: Option<PathBuf>,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum DepositsCommand {
    Save(SaveDepositArgs),
    Get(GetDepositArgs),
    PurgeExpired,
}

#[derive(Debug, Args)]
pub struct SaveDepositArgs {
    #[arg(long)]
    creative_instance_id: String,
    #[arg(long)]
    value: f64,
    #[arg(long)]
    expire_at: String,
}

#[derive(Debug, Args)]
pub struct GetDepositArgs {
    #[arg(long)]
    creative_instance_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AdTypeArg {
    Notification,
    NewTabPage,
    PromotedContent,
    InlineContent,
    SearchResult,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfirmationTypeArg {
    Served,
    Viewed,
    Clicked,
    Dismissed,
    Transferred,
    Flagged,
    Saved,
    Upvoted,
    Downvoted,
    Conversion,
}

#[derive(Debug, Serialize)]
struct SchemaVersionPayload {
    contract_version: &'static str,
    schema_version: i64,
    supported_version: i64,
}

#[derive(Debug, Serialize)]
struct MigrationPayload {
    contract_version: &'static str,
    #[serde(flatten)]
    report: MigrationReport,
}

#[derive(Debug, Serialize)]
struct PermissionCheckPayload {
    contract_version: &'static str,
    rules: Vec<&'static str>,
    decision: PermissionDecision,
}

#[derive(Debug, Serialize)]
struct EligiblePayload {
    contract_version: &'static str,
    #[serde(flatten)]
    report: EligibilityReport,
}

#[derive(Debug, Serialize)]
struct PurgePayload {
    contract_version: &'static str,
    purged: usize,
    purged_at: String,
}

#[derive(Debug, Serialize)]
struct DepositGetPayload {
    contract_version: &'static str,
    creative_instance_id: String,
    found: bool,
    deposit: Option<Deposit>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the ruleset cannot be loaded, the store cannot be
/// opened or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let ruleset = load_ruleset(cli.ruleset.as_deref())?;
    run_command_with_db(&cli.db, &ruleset, cli.command)
}

/// Executes one command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(
    db_path: &Path,
    ruleset: &ServingRuleset,
    command: Command,
) -> Result<()> {
    let store = SqliteAdsStore::open(db_path)
        .with_context(|| format!("failed to open sqlite database at {}", db_path.display()))?;
    if !matches!(command, Command::Schema { .. }) {
        store.migrate().context("failed to migrate ads serving schema")?;
    }
    run_command(command, store, ruleset)
}

/// Executes one command against an opened store.
///
/// # Errors
/// Returns an error when validation, persistence, or evaluation fails.
pub fn run_command(
    command: Command,
    store: SqliteAdsStore,
    ruleset: &ServingRuleset,
) -> Result<()> {
    match command {
        Command::Schema { command } => run_schema(&command, &store),
        Command::Events { command } => run_events(command, &store),
        Command::Permission { command } => run_permission(command, &store, ruleset),
        Command::Eligible(args) => run_eligible(args, &store, ruleset),
        Command::Deposits { command } => run_deposits(command, store),
    }
}

fn run_schema(command: &SchemaCommand, store: &SqliteAdsStore) -> Result<()> {
    match command {
        SchemaCommand::Migrate => {
            let report = store.migrate()?;
            print_json(&MigrationPayload {
                contract_version: "migration_report.v1",
                report,
            })
        }
        SchemaCommand::Version => print_json(&SchemaVersionPayload {
            contract_version: "schema_version.v1",
            schema_version: store.schema_version()?,
            supported_version: DATABASE_VERSION,
        }),
    }
}

fn run_events(command: EventsCommand, store: &SqliteAdsStore) -> Result<()> {
    match command {
        EventsCommand::Record(args) => {
            let placement_id = args
                .placement_id
                .as_deref()
                .map(|raw| Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}")))
                .transpose()?;
            let event = store.record_ad_event(AdEventInput {
                placement_id,
                ad_type: map_ad_type(args.ad_type),
                confirmation_type: map_confirmation_type(args.confirmation_type),
                creative_instance_id: args.creative_instance_id,
                created_at: parse_optional_utc(args.created_at.as_deref())?,
            })?;
            print_json(&event)
        }
        EventsCommand::List(args) => {
            let events = store.list_ad_events(args.ad_type.map(map_ad_type), args.limit)?;
            print_json(&events)
        }
    }
}

fn run_permission(
    command: PermissionCommand,
    store: &SqliteAdsStore,
    ruleset: &ServingRuleset,
) -> Result<()> {
    match command {
        PermissionCommand::Check(args) => {
            let rules = PermissionRules::from_ruleset(ruleset)?;
            let ad_type = map_ad_type(args.ad_type);
            let now = parse_optional_utc(args.now.as_deref())?;
            let decision = rules.evaluate(ad_type, store, now);
            debug!(
                ad_type = %ad_type,
                allowed = decision.allowed,
                "evaluated permission"
            );
            print_json(&PermissionCheckPayload {
                contract_version: "permission_check.v1",
                rules: rules.rule_names(ad_type),
                decision,
            })
        }
    }
}

fn run_eligible(
    args: EligibleArgs,
    store: &SqliteAdsStore,
    ruleset: &ServingRuleset,
) -> Result<()> {
    let candidates: Vec<CreativeAd> = read_json_file(&args.candidates)?;
    let anti_targeting: AntiTargetingSites = match args.anti_targeting.as_deref() {
        Some(path) => read_json_file(path)?,
        None => AntiTargetingSites::default(),
    };
    let subdivision = StaticSubdivision::new(args.subdivision);
    let eligible_ads = EligibleAds::new(Arc::new(PermissionRules::from_ruleset(ruleset)?));

    let context = EligibilityContext {
        ad_type: map_ad_type(args.ad_type),
        candidates: &candidates,
        subdivision_targeting: &subdivision,
        anti_targeting: &anti_targeting,
    };
    let report = eligible_ads.evaluate(&context, store, parse_optional_utc(args.now.as_deref())?);

    print_json(&EligiblePayload {
        contract_version: "eligible_ads.v1",
        report,
    })
}

fn run_deposits(command: DepositsCommand, store: SqliteAdsStore) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("failed to start async runtime")?;
    let ledger = DepositLedger::spawn(store)?;

    runtime.block_on(async {
        match command {
            DepositsCommand::Save(args) => {
                let deposit = Deposit {
                    creative_instance_id: args.creative_instance_id,
                    value: args.value,
                    expire_at: parse_rfc3339_utc(&args.expire_at)
                        .map_err(|err| anyhow!("invalid timestamp: {err}"))?,
                };
                ledger.save(deposit.clone()).await?;
                print_json(&deposit)
            }
            DepositsCommand::Get(args) => {
                let deposit = ledger
                    .get_for_creative_instance_id(&args.creative_instance_id)
                    .await?;
                if deposit.is_none() {
                    debug!(
                        creative_instance_id = %args.creative_instance_id,
                        "deposit not found"
                    );
                }
                print_json(&DepositGetPayload {
                    contract_version: "deposit_get.v1",
                    creative_instance_id: args.creative_instance_id,
                    found: deposit.is_some(),
                    deposit,
                })
            }
            DepositsCommand::PurgeExpired => {
                let purged = ledger.purge_expired().await?;
                print_json(&PurgePayload {
                    contract_version: "deposits_purge.v1",
                    purged,
                    purged_at: format_rfc3339(now_utc())?,
                })
            }
        }
    })
}

/// Reads a ruleset from `path`, or the built-in v1 caps when absent.
///
/// # Errors
/// Returns an error when the file cannot be read or the ruleset is invalid.
pub fn load_ruleset(path: Option<&Path>) -> Result<ServingRuleset> {
    match path {
        Some(path) => {
            let value: Value = read_json_file(path)?;
            ServingRuleset::from_json(&value)
                .with_context(|| format!("invalid ruleset in {}", path.display()))
        }
        None => Ok(ServingRuleset::v1()),
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn map_ad_type(value: AdTypeArg) -> AdType {
    match value {
        AdTypeArg::Notification => AdType::NotificationAd,
        AdTypeArg::NewTabPage => AdType::NewTabPageAd,
        AdTypeArg::PromotedContent => AdType::PromotedContentAd,
        AdTypeArg::InlineContent => AdType::InlineContentAd,
        AdTypeArg::SearchResult => AdType::SearchResultAd,
    }
}

fn map_confirmation_type(value: ConfirmationTypeArg) -> ConfirmationType {
    match value {
        ConfirmationTypeArg::Served => ConfirmationType::Served,
        ConfirmationTypeArg::Viewed => ConfirmationType::Viewed,
        ConfirmationTypeArg::Clicked => ConfirmationType::Clicked,
        ConfirmationTypeArg::Dismissed => ConfirmationType::Dismissed,
        ConfirmationTypeArg::Transferred => ConfirmationType::Transferred,
        ConfirmationTypeArg::Flagged => ConfirmationType::Flagged,
        ConfirmationTypeArg::Saved => ConfirmationType::Saved,
        ConfirmationTypeArg::Upvoted => ConfirmationType::Upvoted,
        ConfirmationTypeArg::Downvoted => ConfirmationType::Downvoted,
        ConfirmationTypeArg::Conversion => ConfirmationType::Conversion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
    }

    #[test]
    fn missing_ruleset_path_uses_v1_caps() {
        assert_eq!(must(load_ruleset(None)), ServingRuleset::v1());
    }

    #[test]
    fn ruleset_file_overrides_caps() {
        let path = temp_path("adsctl-ruleset", "json");
        let body = json!({
            "ruleset_version": 2,
            "caps": {
                "notification_ad": {
                    "enabled": true,
                    "per_day": 3,
                    "per_hour": 1,
                    "minimum_wait_seconds": 60
                }
            }
        });
        if let Err(err) = fs::write(&path, body.to_string()) {
            panic!("failed to write ruleset fixture: {err}");
        }

        let ruleset = must(load_ruleset(Some(&path)));
        assert_eq!(ruleset.ruleset_version, 2);
        assert_eq!(ruleset.caps.len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn invalid_ruleset_is_reported_with_path() {
        let path = temp_path("adsctl-ruleset-invalid", "json");
        if let Err(err) = fs::write(&path, r#"{"ruleset_version": 0, "caps": {}}"#) {
            panic!("failed to write ruleset fixture: {err}");
        }

        let err = match load_ruleset(Some(&path)) {
            Ok(_) => panic!("expected invalid ruleset to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid ruleset"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn ad_type_flags_map_onto_core_ad_types() {
        let cli = must(
            Cli::try_parse_from([
                "adsctl",
                "permission",
                "check",
                "--ad-type",
                "new-tab-page",
            ])
            .map_err(Into::into),
        );
        match cli.command {
            Command::Permission {
                command: PermissionCommand::Check(args),
            } => assert_eq!(map_ad_type(args.ad_type), AdType::NewTabPageAd),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn embed_api_records_events_and_saves_deposits() {
        let db_path = temp_path("adsctl-embed", "sqlite3");
        let db = db_path.to_string_lossy().to_string();

        must(execute_cli(&["adsctl", "--db", &db, "schema", "migrate"]));
        must(execute_cli(&[
            "adsctl",
            "--db",
            &db,
            "events",
            "record",
            "--ad-type",
            "notification",
            "--creative-instance-id",
            "creative-1",
        ]));
        must(execute_cli(&[
            "adsctl",
            "--db",
            &db,
            "deposits",
            "save",
            "--creative-instance-id",
            "creative-1",
            "--value",
            "0.05",
            "--expire-at",
            "2099-01-01T00:00:00Z",
        ]));

        let store = must(SqliteAdsStore::open(&db_path).map_err(Into::into));
        assert_eq!(
            must(store.list_ad_events(None, 10).map_err(Into::into)).len(),
            1
        );
        assert!(must(store.get_deposit("creative-1").map_err(Into::into)).is_some());

        drop(store);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn missing_deposit_is_a_successful_empty_lookup() {
        let db_path = temp_path("adsctl-missing-deposit", "sqlite3");
        let db = db_path.to_string_lossy().to_string();

        must(execute_cli(&[
            "adsctl",
            "--db",
            &db,
            "deposits",
            "get",
            "--creative-instance-id",
            "unknown",
        ]));

        let store = must(SqliteAdsStore::open(&db_path).map_err(Into::into));
        assert!(must(store.get_deposit("unknown").map_err(Into::into)).is_none());

        drop(store);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn deposit_get_payload_reports_absence_as_null() {
        let payload = DepositGetPayload {
            contract_version: "deposit_get.v1",
            creative_instance_id: "unknown".to_string(),
            found: false,
            deposit: None,
        };
        assert_eq!(
            must(serde_json::to_value(&payload).map_err(Into::into)),
            json!({
                "contract_version": "deposit_get.v1",
                "creative_instance_id": "unknown",
                "found": false,
                "deposit": null
            })
        );
    }

    #[test]
    fn migration_payload_carries_contract_version() {
        let payload = MigrationPayload {
            contract_version: "migration_report.v1",
            report: MigrationReport {
                from_version: 0,
                to_version: DATABASE_VERSION,
                applied_versions: vec![1],
            },
        };
        let value = must(serde_json::to_value(&payload).map_err(Into::into));
        assert_eq!(value["contract_version"], json!("migration_report.v1"));
        assert_eq!(value["from_version"], json!(0));
        assert_eq!(value["applied_versions"], json!([1]));
    }
}
