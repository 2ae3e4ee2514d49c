//! Admission control for ad serving.
//!
//! Decides whether an ad of a given type may be shown right now (see
//! [`PermissionRules`]), narrows candidate creatives to the servable subset
//! (see [`EligibleAds`]) and models the earned-value [`Deposit`] that the
//! ledger persists once an ad is served.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod deposit;
mod eligibility;
mod history;
mod permission_rules;

pub use deposit::Deposit;
pub use eligibility::{
    is_subdivision_code, AntiTargetingResource, AntiTargetingSites, EligibilityContext,
    EligibilityReport, EligibleAds, ExcludedCandidate, StaticSubdivision, SubdivisionTargeting,
};
pub use history::{AdEventHistory, AdEventLog, AdEventSnapshot, TimeWindow};
pub use permission_rules::{
    AdTypeEnabledPermissionRule, AdsPerDayPermissionRule, AdsPerHourPermissionRule,
    MinimumWaitTimePermissionRule, PermissionDecision, PermissionRule, PermissionRules,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AdsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("history error: {0}")]
    History(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    NotificationAd,
    NewTabPageAd,
    PromotedContentAd,
    InlineContentAd,
    SearchResultAd,
}

impl AdType {
    pub const ALL: [Self; 5] = [
        Self::NotificationAd,
        Self::NewTabPageAd,
        Self::PromotedContentAd,
        Self::InlineContentAd,
        Self::SearchResultAd,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotificationAd => "notification_ad",
            Self::NewTabPageAd => "new_tab_page_ad",
            Self::PromotedContentAd => "promoted_content_ad",
            Self::InlineContentAd => "inline_content_ad",
            Self::SearchResultAd => "search_result_ad",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notification_ad" => Some(Self::NotificationAd),
            "new_tab_page_ad" => Some(Self::NewTabPageAd),
            "promoted_content_ad" => Some(Self::PromotedContentAd),
            "inline_content_ad" => Some(Self::InlineContentAd),
            "search_result_ad" => Some(Self::SearchResultAd),
            _ => None,
        }
    }
}

impl Display for AdType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationType {
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

impl ConfirmationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Served => "served",
            Self::Viewed => "viewed",
            Self::Clicked => "clicked",
            Self::Dismissed => "dismissed",
            Self::Transferred => "transferred",
            Self::Flagged => "flagged",
            Self::Saved => "saved",
            Self::Upvoted => "upvoted",
            Self::Downvoted => "downvoted",
            Self::Conversion => "conversion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "served" => Some(Self::Served),
            "viewed" => Some(Self::Viewed),
            "clicked" => Some(Self::Clicked),
            "dismissed" => Some(Self::Dismissed),
            "transferred" => Some(Self::Transferred),
            "flagged" => Some(Self::Flagged),
            "saved" => Some(Self::Saved),
            "upvoted" => Some(Self::Upvoted),
            "downvoted" => Some(Self::Downvoted),
            "conversion" => Some(Self::Conversion),
            _ => None,
        }
    }
}

impl Display for ConfirmationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of the ad lifecycle history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdEvent {
    pub placement_id: Ulid,
    pub ad_type: AdType,
    pub confirmation_type: ConfirmationType,
    pub creative_instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdEventInput {
    pub placement_id: Option<Ulid>,
    pub ad_type: AdType,
    pub confirmation_type: ConfirmationType,
    pub creative_instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AdEventInput {
    /// Validates an ad event before it is appended to history.
    ///
    /// # Errors
    /// Returns [`AdsError::Validation`] when the creative instance id is
    /// blank or the timestamp is not UTC.
    pub fn validate(&self) -> Result<(), AdsError> {
        if self.creative_instance_id.trim().is_empty() {
            return Err(AdsError::Validation(
                "creative_instance_id MUST be provided for every ad event".to_string(),
            ));
        }

        if self.created_at.offset() != UtcOffset::UTC {
            return Err(AdsError::Validation(
                "created_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the input and assigns a placement id when none was given.
    ///
    /// # Errors
    /// Returns [`AdsError::Validation`] when [`AdEventInput::validate`] fails.
    pub fn into_event(self) -> Result<AdEvent, AdsError> {
        self.validate()?;
        Ok(AdEvent {
            placement_id: self.placement_id.unwrap_or_else(Ulid::new),
            ad_type: self.ad_type,
            confirmation_type: self.confirmation_type,
            creative_instance_id: self.creative_instance_id,
            created_at: self.created_at,
        })
    }
}

/// A creative that could be served, as supplied by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreativeAd {
    pub creative_instance_id: String,
    pub creative_set_id: String,
    pub campaign_id: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub end_at: OffsetDateTime,
    #[serde(default)]
    pub geo_targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdTypeCaps {
    pub enabled: bool,
    pub per_day: u32,
    pub per_hour: u32,
    pub minimum_wait_seconds: i64,
}

impl AdTypeCaps {
    #[must_use]
    pub fn minimum_wait(&self) -> Duration {
        Duration::seconds(self.minimum_wait_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServingRuleset {
    pub ruleset_version: u32,
    pub caps: BTreeMap<AdType, AdTypeCaps>,
}

impl ServingRuleset {
    #[must_use]
    pub fn v1() -> Self {
        let caps = [
            (AdType::NotificationAd, 100, 10, 0),
            (AdType::NewTabPageAd, 20, 4, 300),
            (AdType::PromotedContentAd, 20, 4, 0),
            (AdType::InlineContentAd, 20, 6, 0),
            (AdType::SearchResultAd, 40, 10, 0),
        ]
        .into_iter()
        .map(|(ad_type, per_day, per_hour, minimum_wait_seconds)| {
            (
                ad_type,
                AdTypeCaps {
                    enabled: true,
                    per_day,
                    per_hour,
                    minimum_wait_seconds,
                },
            )
        })
        .collect();

        Self {
            ruleset_version: 1,
            caps,
        }
    }

    /// Validates ruleset bounds.
    ///
    /// # Errors
    /// Returns [`AdsError::Configuration`] when the version is zero or a
    /// minimum wait is negative.
    pub fn validate(&self) -> Result<(), AdsError> {
        if self.ruleset_version == 0 {
            return Err(AdsError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (ad_type, caps) in &self.caps {
            if caps.minimum_wait_seconds < 0 {
                return Err(AdsError::Configuration(format!(
                    "{ad_type}.minimum_wait_seconds MUST be >= 0"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn caps_for(&self, ad_type: AdType) -> Option<&AdTypeCaps> {
        self.caps.get(&ad_type)
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`AdsError::Configuration`] when JSON decoding fails or the
    /// decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, AdsError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AdsError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AdsError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AdsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AdsError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AdsError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AdsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AdsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AdsError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Seconds since the unix epoch as a double, the storage form of ledger
/// timestamps.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn to_unix_seconds(value: OffsetDateTime) -> f64 {
    value.unix_timestamp() as f64 + f64::from(value.nanosecond()) / 1_000_000_000.0
}

/// Inverse of [`to_unix_seconds`].
///
/// # Errors
/// Returns [`AdsError::Validation`] when the value is not finite or falls
/// outside the representable date range.
#[allow(clippy::cast_possible_truncation)]
pub fn from_unix_seconds(value: f64) -> Result<OffsetDateTime, AdsError> {
    if !value.is_finite() {
        return Err(AdsError::Validation(format!(
            "unix timestamp MUST be finite, got {value}"
        )));
    }

    let whole = value.floor();
    let nanos = ((value - whole) * 1_000_000_000.0).round() as i64;
    let seconds = OffsetDateTime::from_unix_timestamp(whole as i64)
        .map_err(|err| AdsError::Validation(format!("unix timestamp out of range: {err}")))?;
    Ok(seconds + Duration::nanoseconds(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn ad_type_round_trips_through_storage_form() {
        for ad_type in AdType::ALL {
            assert_eq!(AdType::parse(ad_type.as_str()), Some(ad_type));
        }
        assert_eq!(AdType::parse("banner_ad"), None);
    }

    #[test]
    fn confirmation_type_rejects_unknown_values() {
        assert_eq!(
            ConfirmationType::parse("served"),
            Some(ConfirmationType::Served)
        );
        assert_eq!(ConfirmationType::parse("Served"), None);
    }

    #[test]
    fn ad_event_input_requires_creative_instance_id() {
        let input = AdEventInput {
            placement_id: None,
            ad_type: AdType::InlineContentAd,
            confirmation_type: ConfirmationType::Served,
            creative_instance_id: "  ".to_string(),
            created_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
        };

        assert!(matches!(input.validate(), Err(AdsError::Validation(_))));
    }

    #[test]
    fn ad_event_input_assigns_placement_id() {
        let input = AdEventInput {
            placement_id: None,
            ad_type: AdType::InlineContentAd,
            confirmation_type: ConfirmationType::Viewed,
            creative_instance_id: "creative-1".to_string(),
            created_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
        };

        let event = must_ok(input.into_event());
        assert_eq!(event.confirmation_type, ConfirmationType::Viewed);
        assert_eq!(event.creative_instance_id, "creative-1");
    }

    #[test]
    fn v1_ruleset_is_valid_and_covers_every_ad_type() {
        let ruleset = ServingRuleset::v1();
        must_ok(ruleset.validate());
        for ad_type in AdType::ALL {
            assert!(ruleset.caps_for(ad_type).is_some(), "missing caps for {ad_type}");
        }
    }

    #[test]
    fn ruleset_rejects_negative_minimum_wait() {
        let mut ruleset = ServingRuleset::v1();
        if let Some(caps) = ruleset.caps.get_mut(&AdType::NewTabPageAd) {
            caps.minimum_wait_seconds = -1;
        }

        assert!(matches!(
            ruleset.validate(),
            Err(AdsError::Configuration(_))
        ));
    }

    #[test]
    fn ruleset_from_json_reads_snake_case_ad_types() {
        let value = serde_json::json!({
            "ruleset_version": 2,
            "caps": {
                "inline_content_ad": {
                    "enabled": true,
                    "per_day": 3,
                    "per_hour": 2,
                    "minimum_wait_seconds": 0
                }
            }
        });

        let ruleset = must_ok(ServingRuleset::from_json(&value));
        assert_eq!(ruleset.ruleset_version, 2);
        assert_eq!(
            ruleset.caps_for(AdType::InlineContentAd).map(|caps| caps.per_day),
            Some(3)
        );
        assert!(ruleset.caps_for(AdType::SearchResultAd).is_none());
    }

    #[test]
    fn ruleset_from_json_reports_version_zero() {
        let value = serde_json::json!({ "ruleset_version": 0, "caps": {} });
        let err = match ServingRuleset::from_json(&value) {
            Ok(_) => panic!("expected configuration error"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("ruleset_version"));
    }

    #[test]
    fn unix_seconds_conversion_keeps_subsecond_precision() {
        let at = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00.250Z"));
        let seconds = to_unix_seconds(at);
        let restored = must_ok(from_unix_seconds(seconds));
        assert_eq!(restored, at);
    }

    #[test]
    fn from_unix_seconds_rejects_nan() {
        assert!(from_unix_seconds(f64::NAN).is_err());
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }
}
