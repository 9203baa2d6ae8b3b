use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::CURRENT_LOOKBACK_MS;
use crate::model::*;

use super::EngineError;

/// Persistence collaborator. Implementations serialize writes per key; the
/// engine itself takes no lock around a fetch/persist sequence.
pub trait SlotStore: Send + Sync {
    /// Slots of `key` overlapping `span`, ascending by start. Slots whose
    /// interval is empty but starts inside `span` are returned too, so that
    /// they can be cleaned up.
    fn find_overlapping(&self, key: &SlotKey, span: &Span) -> Result<Vec<Slot>, EngineError>;

    /// Insert, or replace the slot with the same id.
    fn persist(&self, slot: &Slot) -> Result<(), EngineError>;

    fn delete(&self, slot: &Slot) -> Result<(), EngineError>;

    /// The slot holding `now`, looking at the last two slots of a bounded
    /// look-back window: the latest one may already start in the future when
    /// clocks are skewed.
    fn find_current(&self, key: &SlotKey, now: Ms) -> Result<Option<Slot>, EngineError> {
        let window = Span::from_start(now.saturating_sub(CURRENT_LOOKBACK_MS));
        let slots = self.find_overlapping(key, &window)?;
        let tail = &slots[slots.len().saturating_sub(2)..];
        Ok(tail
            .iter()
            .rev()
            .find(|s| s.span().contains_instant(now))
            .cloned())
    }
}

/// Timelines kept in memory, one sorted vector per key.
pub struct InMemoryStore {
    timelines: DashMap<SlotKey, Vec<Slot>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            timelines: DashMap::new(),
        }
    }

    pub fn keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self.timelines.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    /// The whole timeline of `key`, ascending by start.
    pub fn timeline(&self, key: &SlotKey) -> Vec<Slot> {
        self.timelines
            .get(key)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn slot_count(&self) -> usize {
        self.timelines.iter().map(|e| e.value().len()).sum()
    }

    fn remove_by_id(slots: &mut Vec<Slot>, id: &Ulid) -> Option<Slot> {
        let pos = slots.iter().position(|s| s.id == *id)?;
        Some(slots.remove(pos))
    }
}

impl SlotStore for InMemoryStore {
    fn find_overlapping(&self, key: &SlotKey, span: &Span) -> Result<Vec<Slot>, EngineError> {
        let Some(slots) = self.timelines.get(key) else {
            return Ok(Vec::new());
        };
        Ok(slots
            .iter()
            .filter(|s| {
                s.span().overlaps(span)
                    || (s.span().is_empty()
                        && s.span().start.value().is_some_and(|t| span.contains_instant(t)))
            })
            .cloned()
            .collect())
    }

    fn persist(&self, slot: &Slot) -> Result<(), EngineError> {
        let mut slots = self.timelines.entry(slot.key).or_default();
        Self::remove_by_id(&mut slots, &slot.id);
        let pos = slots.partition_point(|s| s.span().cmp_start(slot.span()).is_lt());
        slots.insert(pos, slot.clone());
        Ok(())
    }

    fn delete(&self, slot: &Slot) -> Result<(), EngineError> {
        let mut slots = self
            .timelines
            .get_mut(&slot.key)
            .ok_or_else(|| EngineError::Storage(format!("no timeline {}", slot.key)))?;
        Self::remove_by_id(&mut slots, &slot.id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Storage(format!("slot {} not found", slot.id)))
    }
}
