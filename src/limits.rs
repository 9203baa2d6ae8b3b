use crate::model::Ms;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60 * SECOND_MS;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Below this instant the cutoff schedule is not consulted: the plain local
/// calendar date is used instead. 2001-01-01T00:00:00Z
pub const MIN_TEMPLATE_PROCESS_MS: Ms = 978_307_200_000;

/// A normalized cutoff lies in `(-12h, 12h]`.
pub const MAX_CUTOFF_MS: Ms = 12 * HOUR_MS;

/// How many calendar days are searched around an instant to find its day.
/// One full week plus the adjacent day covers templates with missing weekdays.
pub const DAY_SEARCH_WINDOW: i64 = 8;

pub const DEFAULT_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_OBSOLETE_AFTER_MS: Ms = 7 * DAY_MS;
pub const DEFAULT_MINIMUM_STEP_SPAN_MS: Ms = 30 * SECOND_MS;
/// Step span used after a step timeout when the period has no end.
pub const DEFAULT_STEP_SPAN_NO_END_MS: Ms = DAY_MS;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Look-back window of `find_current`.
pub const CURRENT_LOOKBACK_MS: Ms = 2 * DAY_MS;

pub const MAX_TEMPLATE_RULES: usize = 32;
pub const MAX_SLOTS_PER_CONSOLIDATION: usize = 100_000;
pub const MAX_QUEUED_PER_KEY: usize = 10_000;
