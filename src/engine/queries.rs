use chrono::NaiveDate;

use crate::model::*;

use super::{DAY_KEY, Engine, EngineError, validate_instant};

impl Engine {
    /// Day slot computed from the calendar, not persisted.
    fn live_day(&self, day: NaiveDate) -> Option<Slot> {
        let span = self.calendar.day_span(day)?;
        Some(Slot::new(DAY_KEY, self.interval(span), Payload::Day { day }))
    }

    /// The day slot holding `t`: from the cache, then the store, then
    /// computed from the calendar.
    pub fn find_day_at(&self, t: Ms) -> Result<Slot, EngineError> {
        validate_instant(t)?;
        if let Some(slot) = self.cache.try_get_by_instant(t) {
            return Ok(slot);
        }
        let stored = self
            .store
            .find_overlapping(&DAY_KEY, &Span::new(t, t.saturating_add(1)))?
            .into_iter()
            .find(|s| s.span().contains_instant(t));
        if let Some(slot) = stored {
            self.cache.add(&slot);
            return Ok(slot);
        }
        let day = self.calendar.compute_day(t);
        self.live_day(day)
            .ok_or_else(|| EngineError::MissingReference(format!("no day slot for {day}")))
    }

    /// The slot of a logical day, `None` if `day` starts no day.
    pub fn find_day_by_day(&self, day: NaiveDate) -> Result<Option<Slot>, EngineError> {
        if let Some(slot) = self.cache.try_get_by_day(day) {
            return Ok(Some(slot));
        }
        let Some(span) = self.calendar.day_span(day) else {
            return Ok(None);
        };
        let stored = self
            .store
            .find_overlapping(&DAY_KEY, &span)?
            .into_iter()
            .find(|s| s.day() == Some(day));
        if let Some(slot) = stored {
            self.cache.add(&slot);
            return Ok(Some(slot));
        }
        Ok(self.live_day(day))
    }

    /// Slots of `key` overlapping `span`, by start.
    pub fn find_slots(&self, key: &SlotKey, span: &Span) -> Result<Vec<Slot>, EngineError> {
        self.store.find_overlapping(key, span)
    }

    pub fn find_current(&self, key: &SlotKey, now: Ms) -> Result<Option<Slot>, EngineError> {
        self.store.find_current(key, now)
    }
}
