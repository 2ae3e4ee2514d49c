use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{AdEventHistory, AdType, AdsError, ConfirmationType, ServingRuleset, TimeWindow};

/// A side-effect free predicate answering "may an ad be shown now?".
///
/// An `Err` means the history could not be consulted. [`PermissionRules`]
/// turns that into a denial so a broken store never opens the gate.
pub trait PermissionRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns [`AdsError::History`] when the rule's history query fails.
    fn should_allow(
        &self,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> Result<bool, AdsError>;
}

/// Caps served ads of one type over the trailing 24 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsPerDayPermissionRule {
    ad_type: AdType,
    cap: u32,
}

impl AdsPerDayPermissionRule {
    #[must_use]
    pub fn new(ad_type: AdType, cap: u32) -> Self {
        Self { ad_type, cap }
    }
}

impl PermissionRule for AdsPerDayPermissionRule {
    fn name(&self) -> &'static str {
        "ads_per_day"
    }

    fn should_allow(
        &self,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> Result<bool, AdsError> {
        within_cap(history, self.ad_type, now, Duration::DAY, self.cap)
    }
}

/// Caps served ads of one type over the trailing hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsPerHourPermissionRule {
    ad_type: AdType,
    cap: u32,
}

impl AdsPerHourPermissionRule {
    #[must_use]
    pub fn new(ad_type: AdType, cap: u32) -> Self {
        Self { ad_type, cap }
    }
}

impl PermissionRule for AdsPerHourPermissionRule {
    fn name(&self) -> &'static str {
        "ads_per_hour"
    }

    fn should_allow(
        &self,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> Result<bool, AdsError> {
        within_cap(history, self.ad_type, now, Duration::HOUR, self.cap)
    }
}

/// Requires a minimum gap since the last served ad of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumWaitTimePermissionRule {
    ad_type: AdType,
    minimum_wait: Duration,
}

impl MinimumWaitTimePermissionRule {
    #[must_use]
    pub fn new(ad_type: AdType, minimum_wait: Duration) -> Self {
        Self {
            ad_type,
            minimum_wait,
        }
    }
}

impl PermissionRule for MinimumWaitTimePermissionRule {
    fn name(&self) -> &'static str {
        "minimum_wait_time"
    }

    fn should_allow(
        &self,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> Result<bool, AdsError> {
        if self.minimum_wait <= Duration::ZERO {
            return Ok(true);
        }

        let last_served = history.most_recent(self.ad_type, ConfirmationType::Served, now)?;
        Ok(match last_served {
            Some(served_at) => now - served_at >= self.minimum_wait,
            None => true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdTypeEnabledPermissionRule {
    enabled: bool,
}

impl AdTypeEnabledPermissionRule {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl PermissionRule for AdTypeEnabledPermissionRule {
    fn name(&self) -> &'static str {
        "ad_type_enabled"
    }

    fn should_allow(
        &self,
        _history: &dyn AdEventHistory,
        _now: OffsetDateTime,
    ) -> Result<bool, AdsError> {
        Ok(self.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionDecision {
    pub ad_type: AdType,
    pub allowed: bool,
    pub denied_by: Option<String>,
    pub reason_codes: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

/// Per-ad-type AND composition of [`PermissionRule`]s.
///
/// Rules run in registration order and evaluation stops at the first denial.
/// An ad type with no registered rules is denied.
#[derive(Default)]
pub struct PermissionRules {
    rules: BTreeMap<AdType, Vec<Box<dyn PermissionRule>>>,
}

impl PermissionRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the standard rule set for every ad type in `ruleset`.
    ///
    /// # Errors
    /// Returns [`AdsError::Configuration`] when the ruleset is invalid.
    pub fn from_ruleset(ruleset: &ServingRuleset) -> Result<Self, AdsError> {
        ruleset.validate()?;

        let mut rules = Self::new();
        for (&ad_type, caps) in &ruleset.caps {
            rules
                .register(ad_type, AdTypeEnabledPermissionRule::new(caps.enabled))
                .register(ad_type, AdsPerDayPermissionRule::new(ad_type, caps.per_day))
                .register(
                    ad_type,
                    AdsPerHourPermissionRule::new(ad_type, caps.per_hour),
                );
            if caps.minimum_wait_seconds > 0 {
                rules.register(
                    ad_type,
                    MinimumWaitTimePermissionRule::new(ad_type, caps.minimum_wait()),
                );
            }
        }

        Ok(rules)
    }

    pub fn register(
        &mut self,
        ad_type: AdType,
        rule: impl PermissionRule + 'static,
    ) -> &mut Self {
        self.rules.entry(ad_type).or_default().push(Box::new(rule));
        self
    }

    #[must_use]
    pub fn rule_names(&self, ad_type: AdType) -> Vec<&'static str> {
        self.rules
            .get(&ad_type)
            .map(|rules| rules.iter().map(|rule| rule.name()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_permission(
        &self,
        ad_type: AdType,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> bool {
        self.evaluate(ad_type, history, now).allowed
    }

    #[must_use]
    pub fn evaluate(
        &self,
        ad_type: AdType,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> PermissionDecision {
        let Some(rules) = self.rules.get(&ad_type).filter(|rules| !rules.is_empty()) else {
            return PermissionDecision {
                ad_type,
                allowed: false,
                denied_by: None,
                reason_codes: vec!["denied.no_rules_registered".to_string()],
                evaluated_at: now,
            };
        };

        for rule in rules {
            let reason = match rule.should_allow(history, now) {
                Ok(true) => continue,
                Ok(false) => format!("denied.{}", rule.name()),
                Err(err) => {
                    tracing::warn!(
                        ad_type = ad_type.as_str(),
                        rule = rule.name(),
                        error = %err,
                        "permission rule could not read ad history; denying"
                    );
                    format!("denied.{}.history_unavailable", rule.name())
                }
            };

            return PermissionDecision {
                ad_type,
                allowed: false,
                denied_by: Some(rule.name().to_string()),
                reason_codes: vec![reason],
                evaluated_at: now,
            };
        }

        PermissionDecision {
            ad_type,
            allowed: true,
            denied_by: None,
            reason_codes: vec!["allowed.all_rules".to_string()],
            evaluated_at: now,
        }
    }
}

impl std::fmt::Debug for PermissionRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (ad_type, rules) in &self.rules {
            let names: Vec<&'static str> = rules.iter().map(|rule| rule.name()).collect();
            map.entry(ad_type, &names);
        }
        map.finish()
    }
}

fn within_cap(
    history: &dyn AdEventHistory,
    ad_type: AdType,
    now: OffsetDateTime,
    window: Duration,
    cap: u32,
) -> Result<bool, AdsError> {
    let count = history.count(
        ad_type,
        ConfirmationType::Served,
        TimeWindow::trailing(now, window),
    )?;
    Ok(count < usize::try_from(cap).unwrap_or(usize::MAX))
}
