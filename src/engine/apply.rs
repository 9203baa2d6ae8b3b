use std::time::Instant;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    CONSOLIDATIONS_TOTAL, CONSOLIDATION_DURATION_SECONDS, record_changes,
};

use super::consolidate::{NoHooks, SlotHooks, consolidate};
use super::{DAY_KEY, Engine, EngineError};

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Bounded ends must lie in the valid timestamp range; open ends are fine.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    for bound in [span.start, span.end] {
        if let TimeBound::At(t) = bound {
            validate_instant(t)?;
        }
    }
    Ok(())
}

impl Engine {
    fn check_payload(key: &SlotKey, payload: &Payload) -> Result<(), EngineError> {
        if payload.kind() != key.kind {
            return Err(EngineError::PayloadKindMismatch {
                key: *key,
                payload: payload.kind(),
            });
        }
        Ok(())
    }

    /// Existing slots overlapping or touching `span`: touching neighbours are
    /// needed to coalesce with them. A store handing back another timeline's
    /// slots is an error.
    fn fetch_for(&self, key: &SlotKey, span: &Span) -> Result<Vec<Slot>, EngineError> {
        let existing = self.store.find_overlapping(key, &span.touching_window())?;
        if let Some(foreign) = existing.iter().find(|s| s.key != *key) {
            return Err(EngineError::KeyMismatch {
                expected: *key,
                found: foreign.key,
            });
        }
        if existing.len() > MAX_SLOTS_PER_CONSOLIDATION {
            return Err(EngineError::LimitExceeded("too many slots in consolidation period"));
        }
        Ok(existing)
    }

    /// Merge `payload` over `span` into the timeline of `key` and persist the
    /// result. Returns every change, `Unchanged` included, by start.
    pub fn consolidate(
        &self,
        key: SlotKey,
        span: Span,
        payload: &Payload,
        hooks: &mut dyn SlotHooks,
    ) -> Result<Vec<SlotChange>, EngineError> {
        validate_span(&span)?;
        Self::check_payload(&key, payload)?;
        let started = Instant::now();
        let existing = self.fetch_for(&key, &span)?;
        let changes = consolidate(key, span, payload, existing, &self.calendar, hooks);
        self.apply_changes(&changes)?;

        metrics::counter!(CONSOLIDATIONS_TOTAL).increment(1);
        metrics::histogram!(CONSOLIDATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        record_changes(&changes);
        tracing::debug!(
            "consolidated {key} over {span}: {} changes",
            changes.iter().filter(|c| !matches!(c, SlotChange::Unchanged(_))).count()
        );
        Ok(changes)
    }

    /// The same consolidation without writing anything.
    pub fn preview(
        &self,
        key: SlotKey,
        span: Span,
        payload: &Payload,
    ) -> Result<Vec<SlotChange>, EngineError> {
        validate_span(&span)?;
        Self::check_payload(&key, payload)?;
        let existing = self.fetch_for(&key, &span)?;
        Ok(consolidate(key, span, payload, existing, &self.calendar, &mut NoHooks))
    }

    /// Deletes first, then updates, then inserts.
    fn apply_changes(&self, changes: &[SlotChange]) -> Result<(), EngineError> {
        for change in changes {
            if let SlotChange::Removed(slot) = change {
                self.store.delete(slot)?;
                if slot.key == DAY_KEY
                    && let Some(day) = slot.day()
                {
                    self.cache.invalidate(day);
                }
            }
        }
        for change in changes {
            if let SlotChange::Modified { slot, old } = change {
                self.store.persist(slot)?;
                if slot.key == DAY_KEY {
                    if let Some(day) = old.day() {
                        self.cache.invalidate(day);
                    }
                    self.cache.add(slot);
                }
            }
        }
        for change in changes {
            if let SlotChange::Added(slot) = change {
                self.store.persist(slot)?;
                if slot.key == DAY_KEY {
                    self.cache.add(slot);
                }
            }
        }
        Ok(())
    }

    /// Write one day slot per logical day touched by `span`. The day cache
    /// is suspended meanwhile. Returns the number of structural changes.
    pub fn process_day_template(&self, span: Span) -> Result<usize, EngineError> {
        let (TimeBound::At(start), TimeBound::At(end)) = (span.start, span.end) else {
            return Err(EngineError::InvalidPeriod(span));
        };
        if span.is_empty() {
            return Err(EngineError::InvalidPeriod(span));
        }
        validate_span(&span)?;
        let _suspend = self.cache.suspend();

        let first = self.calendar.compute_day(start);
        let last = self.calendar.compute_end_day(end);
        let mut count = 0;
        for day in self.calendar.days_between(first, last) {
            let Some(day_span) = self.calendar.day_span(day) else {
                continue;
            };
            let changes = self.consolidate(DAY_KEY, day_span, &Payload::Day { day }, &mut NoHooks)?;
            count += changes
                .iter()
                .filter(|c| !matches!(c, SlotChange::Unchanged(_)))
                .count();
        }
        tracing::info!("day template {} processed over {span}: {count} changes", self.calendar.template().id);
        Ok(count)
    }
}
