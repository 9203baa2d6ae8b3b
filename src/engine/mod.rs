mod apply;
mod consolidate;
mod error;
mod queries;
mod store;

pub(crate) use apply::{validate_instant, validate_span};
pub use consolidate::{NoHooks, SlotHooks, consolidate};
pub use error::EngineError;
pub use store::{InMemoryStore, SlotStore};

use std::sync::Arc;

use crate::cache::SlotCache;
use crate::calendar::DayCalendar;
use crate::config::EngineConfig;
use crate::interval::Interval;
use crate::model::*;
use crate::notify::NotifyHub;

/// The plant-wide day timeline.
pub const DAY_KEY: SlotKey = SlotKey {
    entity: Entity::Global,
    kind: SlotKind::Day,
};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Consolidation engine: calendar, day cache and the store collaborator.
///
/// Callers serialize work per entity; the engine takes no lock of its own
/// around a fetch → merge → persist sequence.
pub struct Engine {
    calendar: Arc<DayCalendar>,
    cache: Arc<SlotCache>,
    store: Arc<dyn SlotStore>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SlotStore>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        let calendar = config.calendar();
        let cache = SlotCache::new(config.cache_capacity, config.utc_offset_ms);
        if config.cache_active {
            cache.activate();
        }
        Self {
            calendar: Arc::new(calendar),
            cache: Arc::new(cache),
            store,
            notify,
            config,
        }
    }

    pub fn calendar(&self) -> &DayCalendar {
        &self.calendar
    }

    pub fn cache(&self) -> &SlotCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    /// An interval with its day range computed by this engine's calendar.
    pub fn interval(&self, span: Span) -> Interval {
        Interval::new(span, &self.calendar)
    }
}
