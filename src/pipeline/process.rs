use std::cmp::Ordering;
use std::sync::Arc;

use crate::engine::{Engine, EngineError, NoHooks, validate_instant, validate_span};
use crate::limits::DEFAULT_STEP_SPAN_NO_END_MS;
use crate::model::*;
use crate::observability::{MODIFICATIONS_TOTAL, status_label};

use super::{Association, Checked, Modification, ModificationStatus, Upstream};

/// Result of one step run.
#[derive(Debug, PartialEq, Eq)]
enum StepOutcome {
    /// The step's range was applied up to `done`; `more` if the step has
    /// range left.
    Applied { done: TimeBound<Ms>, more: bool },
    /// Upstream data not available yet.
    MissingData,
    Cancelled,
}

/// Drives modifications through their states against one engine.
pub struct Pipeline {
    engine: Arc<Engine>,
    upstream: Arc<dyn Upstream>,
}

impl Pipeline {
    pub fn new(engine: Arc<Engine>, upstream: Arc<dyn Upstream>) -> Self {
        Self { engine, upstream }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Dispatch `m` once: at most one step (or one chunk of a step) is run.
    /// Terminal modifications are left alone.
    pub fn process(
        &self,
        m: &mut Modification,
        now: Ms,
        checked: &dyn Checked,
    ) -> ModificationStatus {
        if m.status.is_terminal() {
            return m.status;
        }
        m.attempts += 1;
        let previous = m.status;
        m.status = self.dispatch(m, now, checked).unwrap_or_else(|e| match e {
            EngineError::Storage(e) => {
                // Nothing recorded: the step runs again on the next dispatch.
                tracing::warn!("modification {}: storage failure, retry later: {e}", m.id);
                previous
            }
            e => {
                tracing::error!("modification {} failed: {e}", m.id);
                ModificationStatus::Error
            }
        });
        metrics::counter!(MODIFICATIONS_TOTAL, "status" => status_label(m.status)).increment(1);
        if m.status == ModificationStatus::Completed {
            for key in m.association.written_keys() {
                self.engine.notify.send(&key);
            }
        }
        m.status
    }

    /// `process` on the blocking pool: store calls may block.
    pub async fn process_async(
        self: &Arc<Self>,
        mut m: Modification,
        now: Ms,
        checked: Arc<dyn Checked>,
    ) -> Modification {
        let pipeline = Arc::clone(self);
        let id = m.id;
        let fallback = m.clone();
        match tokio::task::spawn_blocking(move || {
            pipeline.process(&mut m, now, checked.as_ref());
            m
        })
        .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("modification {id}: processing task failed: {e}");
                fallback
            }
        }
    }

    /// Transient application: the changes `m` would make, nothing written.
    ///
    /// # Panics
    ///
    /// For associations that can only be processed persistently
    /// (`DetectedOperation`).
    pub fn apply(&self, m: &Modification) -> Result<Vec<SlotChange>, EngineError> {
        match &m.association {
            Association::Fact { key, payload } => self.engine.preview(*key, m.period, payload),
            Association::ShiftTemplate { entity, template_id } => {
                let key = SlotKey::new(*entity, SlotKind::ShiftTemplate);
                let payload = Payload::ShiftTemplate {
                    template_id: *template_id,
                };
                self.engine.preview(key, m.period, &payload)
            }
            Association::DetectedOperation { .. } => {
                panic!("apply: detected operations only support persistent processing")
            }
        }
    }

    fn dispatch(
        &self,
        m: &mut Modification,
        now: Ms,
        checked: &dyn Checked,
    ) -> Result<ModificationStatus, EngineError> {
        let config = &self.engine.config;
        validate_instant(m.created_at)?;
        validate_span(&m.period)?;
        if now.saturating_sub(m.created_at) > config.obsolete_after_ms {
            tracing::warn!(
                "modification {} created at {} is obsolete, dropped",
                m.id,
                m.created_at
            );
            return Ok(ModificationStatus::Obsolete);
        }
        if m.period.is_empty() {
            return Err(EngineError::InvalidPeriod(m.period));
        }
        // Shifts are derived day by day: the period needs bounds.
        if matches!(m.association, Association::ShiftTemplate { .. })
            && (m.period.start.is_open() || m.period.end.is_open())
        {
            return Err(EngineError::InvalidPeriod(m.period));
        }
        if let Association::Fact { key, payload } = &m.association
            && payload.kind() != key.kind
        {
            return Err(EngineError::PayloadKindMismatch {
                key: *key,
                payload: payload.kind(),
            });
        }

        match self.run_step(m, now, checked)? {
            StepOutcome::MissingData => {
                tracing::debug!("modification {}: upstream data missing, pending", m.id);
                Ok(ModificationStatus::Pending)
            }
            StepOutcome::Cancelled => {
                self.shrink_step_span(m);
                tracing::debug!(
                    "modification {}: step cancelled, step span now {:?}",
                    m.id,
                    m.step_span_ms
                );
                Ok(ModificationStatus::Pending)
            }
            StepOutcome::Applied { done, more: true } => {
                m.last_processed = done.value();
                tracing::debug!("modification {}: applied up to {:?}", m.id, m.last_processed);
                Ok(ModificationStatus::InProgress)
            }
            StepOutcome::Applied { more: false, .. } if m.step + 1 < m.association.step_count() => {
                m.step += 1;
                m.last_processed = None;
                tracing::debug!("modification {}: step {} next", m.id, m.step);
                Ok(ModificationStatus::Pending)
            }
            StepOutcome::Applied { more: false, .. } => {
                tracing::debug!("modification {} completed", m.id);
                Ok(ModificationStatus::Completed)
            }
        }
    }

    /// Range of the current step still to apply, and whether it goes on
    /// after it. The period is cut into `step_span_ms` chunks as long as the
    /// chunk lies in the past.
    fn step_range(&self, m: &Modification, now: Ms) -> (Span, bool) {
        let start = m.last_processed.map_or(m.period.start, TimeBound::At);
        if let (Some(step), TimeBound::At(begin)) = (m.step_span_ms, start) {
            let chunk_end = begin.saturating_add(step);
            let inside = TimeBound::At(chunk_end).cmp_upper(&m.period.end) == Ordering::Less;
            if inside && chunk_end <= now {
                return (Span::new(begin, chunk_end), true);
            }
        }
        (Span::with_bounds(start, m.period.end), false)
    }

    fn shrink_step_span(&self, m: &mut Modification) {
        let min = self.engine.config.min_step_span_ms;
        let current = m.step_span_ms.unwrap_or_else(|| {
            let start = m.last_processed.map_or(m.period.start, TimeBound::At);
            Span::with_bounds(start, m.period.end)
                .duration_ms()
                .unwrap_or(DEFAULT_STEP_SPAN_NO_END_MS * 2)
        });
        m.step_span_ms = Some((current / 2).max(min));
    }

    fn run_step(
        &self,
        m: &Modification,
        now: Ms,
        checked: &dyn Checked,
    ) -> Result<StepOutcome, EngineError> {
        if checked.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }
        match (&m.association, m.step) {
            (Association::Fact { key, payload }, _) => {
                let (range, more) = self.step_range(m, now);
                self.engine.consolidate(*key, range, payload, &mut NoHooks)?;
                Ok(StepOutcome::Applied { done: range.end, more })
            }
            (Association::DetectedOperation { machine }, _) => {
                let (range, more) = self.step_range(m, now);
                let Some(operation_id) = self.upstream.operation_at(*machine, &range) else {
                    return Ok(StepOutcome::MissingData);
                };
                let key = SlotKey::new(Entity::Machine(*machine), SlotKind::Operation);
                let payload = Payload::Operation {
                    operation_id: Some(operation_id),
                    auto: true,
                };
                self.engine.consolidate(key, range, &payload, &mut NoHooks)?;
                Ok(StepOutcome::Applied { done: range.end, more })
            }
            (Association::ShiftTemplate { entity, template_id }, 0) => {
                if self.upstream.shift_template(*template_id).is_none() {
                    return Err(EngineError::MissingReference(format!(
                        "shift template {template_id}"
                    )));
                }
                let key = SlotKey::new(*entity, SlotKind::ShiftTemplate);
                let payload = Payload::ShiftTemplate {
                    template_id: *template_id,
                };
                self.engine.consolidate(key, m.period, &payload, &mut NoHooks)?;
                Ok(StepOutcome::Applied {
                    done: m.period.end,
                    more: false,
                })
            }
            (Association::ShiftTemplate { entity, template_id }, _) => {
                let template = self.upstream.shift_template(*template_id).ok_or_else(|| {
                    EngineError::MissingReference(format!("shift template {template_id}"))
                })?;
                let (range, more) = self.step_range(m, now);
                let (TimeBound::At(start), TimeBound::At(end)) = (range.start, range.end) else {
                    return Err(EngineError::InvalidPeriod(range));
                };
                let calendar = self.engine.calendar();
                let key = SlotKey::new(*entity, SlotKind::Shift);
                let first = calendar.compute_day(start);
                let last = calendar.compute_end_day(end);
                for day in calendar.days_between(first, last) {
                    if checked.is_cancelled() {
                        return Ok(StepOutcome::Cancelled);
                    }
                    checked.set_active();
                    let Some(day_span) = calendar.day_span(day) else {
                        continue;
                    };
                    let part = day_span.intersect(&range);
                    if part.is_empty() {
                        continue;
                    }
                    let weekday = chrono::Datelike::weekday(&day).num_days_from_monday();
                    let payload = Payload::Shift {
                        shift_id: template.shifts[weekday as usize],
                        day: Some(day),
                    };
                    self.engine.consolidate(key, part, &payload, &mut NoHooks)?;
                }
                Ok(StepOutcome::Applied { done: range.end, more })
            }
        }
    }
}
