use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AdEventHistory, AdType, CreativeAd, PermissionDecision, PermissionRules};

pub trait SubdivisionTargeting {
    /// Resolved subdivision code for the current user, e.g. `US-CA`.
    fn current_subdivision(&self) -> Option<&str>;
}

pub trait AntiTargetingResource {
    fn excludes(&self, candidate: &CreativeAd) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticSubdivision {
    subdivision: Option<String>,
}

impl StaticSubdivision {
    #[must_use]
    pub fn new(subdivision: Option<String>) -> Self {
        Self { subdivision }
    }
}

impl SubdivisionTargeting for StaticSubdivision {
    fn current_subdivision(&self) -> Option<&str> {
        self.subdivision.as_deref()
    }
}

/// Sites a creative set must not be shown to, plus the user's visited sites.
/// A creative is excluded when its set lists any site the user has visited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AntiTargetingSites {
    #[serde(default)]
    pub sites_by_creative_set: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub visited_sites: BTreeSet<String>,
}

impl AntiTargetingResource for AntiTargetingSites {
    fn excludes(&self, candidate: &CreativeAd) -> bool {
        self.sites_by_creative_set
            .get(&candidate.creative_set_id)
            .is_some_and(|sites| !sites.is_disjoint(&self.visited_sites))
    }
}

/// Geo targets carrying a region suffix (`US-CA`) are subdivision targets;
/// bare country codes are not.
#[must_use]
pub fn is_subdivision_code(code: &str) -> bool {
    code.contains('-')
}

pub struct EligibilityContext<'a> {
    pub ad_type: AdType,
    pub candidates: &'a [CreativeAd],
    pub subdivision_targeting: &'a dyn SubdivisionTargeting,
    pub anti_targeting: &'a dyn AntiTargetingResource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExcludedCandidate {
    pub creative_instance_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityReport {
    pub decision: PermissionDecision,
    pub eligible: Vec<CreativeAd>,
    pub excluded: Vec<ExcludedCandidate>,
}

/// Read-only filter producing the servable subset of a candidate list.
#[derive(Debug, Clone)]
pub struct EligibleAds {
    permission_rules: Arc<PermissionRules>,
}

impl EligibleAds {
    #[must_use]
    pub fn new(permission_rules: Arc<PermissionRules>) -> Self {
        Self { permission_rules }
    }

    #[must_use]
    pub fn get_eligible_ads(
        &self,
        context: &EligibilityContext<'_>,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> Vec<CreativeAd> {
        self.evaluate(context, history, now).eligible
    }

    /// Like [`EligibleAds::get_eligible_ads`] but keeps the permission
    /// decision and the reason each dropped candidate was excluded.
    #[must_use]
    pub fn evaluate(
        &self,
        context: &EligibilityContext<'_>,
        history: &dyn AdEventHistory,
        now: OffsetDateTime,
    ) -> EligibilityReport {
        let decision = self
            .permission_rules
            .evaluate(context.ad_type, history, now);
        if !decision.allowed {
            return EligibilityReport {
                decision,
                eligible: Vec::new(),
                excluded: Vec::new(),
            };
        }

        let current_subdivision = context.subdivision_targeting.current_subdivision();
        let mut eligible = Vec::with_capacity(context.candidates.len());
        let mut excluded = Vec::new();

        for candidate in context.candidates {
            let reason = if !matches_subdivision(candidate, current_subdivision) {
                "subdivision_mismatch"
            } else if context.anti_targeting.excludes(candidate) {
                "anti_targeted"
            } else {
                eligible.push(candidate.clone());
                continue;
            };

            excluded.push(ExcludedCandidate {
                creative_instance_id: candidate.creative_instance_id.clone(),
                reason: reason.to_string(),
            });
        }

        EligibilityReport {
            decision,
            eligible,
            excluded,
        }
    }
}

fn matches_subdivision(candidate: &CreativeAd, current: Option<&str>) -> bool {
    let mut targets = candidate
        .geo_targets
        .iter()
        .filter(|target| is_subdivision_code(target))
        .peekable();

    if targets.peek().is_none() {
        return true;
    }

    match current {
        Some(current) => targets.any(|target| target.eq_ignore_ascii_case(current)),
        None => false,
    }
}
