use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::{AdEvent, AdEventInput, AdType, AdsError, ConfirmationType};

/// Half-open interval `(start, end]`.
///
/// An event stamped exactly at `start` is outside the window, which is what
/// makes a 24h cap release an event the moment it turns 24h old.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start_exclusive: OffsetDateTime,
    end_inclusive: OffsetDateTime,
}

impl TimeWindow {
    #[must_use]
    pub fn trailing(now: OffsetDateTime, length: Duration) -> Self {
        Self {
            start_exclusive: now - length,
            end_inclusive: now,
        }
    }

    #[must_use]
    pub fn start_exclusive(&self) -> OffsetDateTime {
        self.start_exclusive
    }

    #[must_use]
    pub fn end_inclusive(&self) -> OffsetDateTime {
        self.end_inclusive
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at > self.start_exclusive && at <= self.end_inclusive
    }
}

/// Read-only query surface over the ad event history.
///
/// Each call answers from one consistent point-in-time view. Implementations
/// report an unreachable backend as [`AdsError::History`]; callers on the
/// serving path treat that as a denial.
pub trait AdEventHistory {
    /// Counts events of the given kind whose timestamp lies inside `window`.
    ///
    /// # Errors
    /// Returns [`AdsError::History`] when the underlying store cannot be read.
    fn count(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        window: TimeWindow,
    ) -> Result<usize, AdsError>;

    /// Timestamp of the newest matching event at or before `at_or_before`.
    ///
    /// # Errors
    /// Returns [`AdsError::History`] when the underlying store cannot be read.
    fn most_recent(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        at_or_before: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, AdsError>;
}

/// In-memory append-only history.
#[derive(Debug, Clone, Default)]
pub struct AdEventLog {
    events: Vec<AdEvent>,
}

impl AdEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and appends one event.
    ///
    /// # Errors
    /// Returns [`AdsError::Validation`] when the input is malformed; nothing
    /// is appended in that case.
    pub fn record(&mut self, input: AdEventInput) -> Result<AdEvent, AdsError> {
        let event = input.into_event()?;
        self.events.push(event.clone());
        Ok(event)
    }

    /// Validates every input, then appends them in order.
    ///
    /// # Errors
    /// Returns the first [`AdsError::Validation`] found; nothing from the
    /// batch is appended in that case.
    pub fn record_many(
        &mut self,
        inputs: impl IntoIterator<Item = AdEventInput>,
    ) -> Result<Vec<AdEvent>, AdsError> {
        let events = inputs
            .into_iter()
            .map(AdEventInput::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        self.events.extend(events.iter().cloned());
        Ok(events)
    }

    #[must_use]
    pub fn events(&self) -> &[AdEvent] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Freezes the current contents. Later appends to the log are not
    /// visible through the snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AdEventSnapshot {
        AdEventSnapshot {
            events: Arc::from(self.events.as_slice()),
        }
    }
}

impl AdEventHistory for AdEventLog {
    fn count(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        window: TimeWindow,
    ) -> Result<usize, AdsError> {
        Ok(count_matching(&self.events, ad_type, confirmation_type, window))
    }

    fn most_recent(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        at_or_before: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, AdsError> {
        Ok(most_recent_matching(
            &self.events,
            ad_type,
            confirmation_type,
            at_or_before,
        ))
    }
}

/// Immutable, cheaply cloneable view of a history at one point in time.
#[derive(Debug, Clone)]
pub struct AdEventSnapshot {
    events: Arc<[AdEvent]>,
}

impl AdEventSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl AdEventHistory for AdEventSnapshot {
    fn count(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        window: TimeWindow,
    ) -> Result<usize, AdsError> {
        Ok(count_matching(&self.events, ad_type, confirmation_type, window))
    }

    fn most_recent(
        &self,
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        at_or_before: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, AdsError> {
        Ok(most_recent_matching(
            &self.events,
            ad_type,
            confirmation_type,
            at_or_before,
        ))
    }
}

fn count_matching(
    events: &[AdEvent],
    ad_type: AdType,
    confirmation_type: ConfirmationType,
    window: TimeWindow,
) -> usize {
    events
        .iter()
        .filter(|event| {
            event.ad_type == ad_type
                && event.confirmation_type == confirmation_type
                && window.contains(event.created_at)
        })
        .count()
}

fn most_recent_matching(
    events: &[AdEvent],
    ad_type: AdType,
    confirmation_type: ConfirmationType,
    at_or_before: OffsetDateTime,
) -> Option<OffsetDateTime> {
    events
        .iter()
        .filter(|event| {
            event.ad_type == ad_type
                && event.confirmation_type == confirmation_type
                && event.created_at <= at_or_before
        })
        .map(|event| event.created_at)
        .max()
}
