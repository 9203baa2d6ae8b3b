use crate::calendar::{DayCalendar, DayTemplate};
use crate::engine::EngineError;
use crate::limits::*;
use crate::model::Ms;

/// Runtime settings, read from `SLOTLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub utc_offset_ms: Ms,
    pub day_template: DayTemplate,
    pub cache_capacity: usize,
    pub cache_active: bool,
    /// A modification older than this is dropped as obsolete.
    pub obsolete_after_ms: Ms,
    /// Initial step span of period modifications. `None`: whole period at once.
    pub step_span_ms: Option<Ms>,
    pub min_step_span_ms: Ms,
    pub retry_interval_ms: u64,
    pub metrics_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset_ms: 0,
            day_template: DayTemplate::midnight(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_active: true,
            obsolete_after_ms: DEFAULT_OBSOLETE_AFTER_MS,
            step_span_ms: None,
            min_step_span_ms: DEFAULT_MINIMUM_STEP_SPAN_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            metrics_port: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    var(name).and_then(|s| s.trim().parse().ok())
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Settings from the variable lookup `var`. Unset or unparsable values
    /// fall back to the defaults; an invalid day template or offset fails.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let defaults = Self::default();
        let day_template = match var("SLOTLINE_DAY_CUTOFFS") {
            Some(s) => s.parse()?,
            None => defaults.day_template,
        };
        let utc_offset_minutes: Ms = parse_var(&var, "SLOTLINE_UTC_OFFSET_MINUTES").unwrap_or(0);
        if utc_offset_minutes.abs() > 18 * 60 {
            return Err(EngineError::InvalidConfig(format!(
                "SLOTLINE_UTC_OFFSET_MINUTES out of range: {utc_offset_minutes}"
            )));
        }
        let step_span_ms: Option<Ms> = parse_var(&var, "SLOTLINE_STEP_SPAN_MS");
        if step_span_ms.is_some_and(|s| s <= 0) {
            return Err(EngineError::InvalidConfig(
                "SLOTLINE_STEP_SPAN_MS must be positive".into(),
            ));
        }
        Ok(Self {
            utc_offset_ms: utc_offset_minutes * MINUTE_MS,
            day_template,
            cache_capacity: parse_var(&var, "SLOTLINE_CACHE_CAPACITY")
                .unwrap_or(defaults.cache_capacity),
            cache_active: parse_var(&var, "SLOTLINE_CACHE_ACTIVE").unwrap_or(defaults.cache_active),
            obsolete_after_ms: parse_var(&var, "SLOTLINE_OBSOLETE_AFTER_MS")
                .unwrap_or(defaults.obsolete_after_ms),
            step_span_ms,
            min_step_span_ms: parse_var(&var, "SLOTLINE_MIN_STEP_SPAN_MS")
                .unwrap_or(defaults.min_step_span_ms)
                .max(SECOND_MS),
            retry_interval_ms: parse_var(&var, "SLOTLINE_RETRY_INTERVAL_MS")
                .unwrap_or(defaults.retry_interval_ms),
            metrics_port: parse_var(&var, "SLOTLINE_METRICS_PORT"),
        })
    }

    pub fn calendar(&self) -> DayCalendar {
        DayCalendar::new(self.day_template.clone(), self.utc_offset_ms)
    }
}
