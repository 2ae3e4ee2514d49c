use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AdsError, CreativeAd};

/// Value owed for a served creative, payable until `expire_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deposit {
    pub creative_instance_id: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub expire_at: OffsetDateTime,
}

impl Deposit {
    /// # Errors
    /// Returns [`AdsError::Validation`] when the creative instance id is
    /// empty or the value is negative or not finite.
    pub fn validate(&self) -> Result<(), AdsError> {
        if self.creative_instance_id.is_empty() {
            return Err(AdsError::Validation(
                "creative_instance_id MUST NOT be empty".to_string(),
            ));
        }

        if !self.value.is_finite() || self.value < 0.0 {
            return Err(AdsError::Validation(format!(
                "deposit value MUST be a finite number >= 0, got {}",
                self.value
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl From<&CreativeAd> for Deposit {
    fn from(creative_ad: &CreativeAd) -> Self {
        Self {
            creative_instance_id: creative_ad.creative_instance_id.clone(),
            value: creative_ad.value,
            expire_at: creative_ad.end_at,
        }
    }
}
