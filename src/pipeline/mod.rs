//! Modifications: intent records that change a timeline over a period, and
//! the state machine that applies them.

mod process;

pub use process::Pipeline;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationStatus {
    Pending,
    /// Partly applied; `last_processed` tells how far.
    InProgress,
    Completed,
    /// Hard failure, needs an operator.
    Error,
    /// Too old to be applied, dropped.
    Obsolete,
}

impl ModificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModificationStatus::Completed | ModificationStatus::Error | ModificationStatus::Obsolete
        )
    }
}

/// What a modification associates over its period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "association", rename_all = "snake_case")]
pub enum Association {
    /// A resolved fact on one timeline.
    Fact { key: SlotKey, payload: Payload },
    /// Two steps: the shift template slot, then one shift slot per day
    /// derived from the template.
    ShiftTemplate { entity: Entity, template_id: u32 },
    /// The operation detected on a machine, resolved upstream.
    DetectedOperation { machine: u32 },
}

impl Association {
    pub fn entity(&self) -> Entity {
        match self {
            Association::Fact { key, .. } => key.entity,
            Association::ShiftTemplate { entity, .. } => *entity,
            Association::DetectedOperation { machine } => Entity::Machine(*machine),
        }
    }

    /// Timelines written by this association.
    pub fn written_keys(&self) -> Vec<SlotKey> {
        match self {
            Association::Fact { key, .. } => vec![*key],
            Association::ShiftTemplate { entity, .. } => vec![
                SlotKey::new(*entity, SlotKind::ShiftTemplate),
                SlotKey::new(*entity, SlotKind::Shift),
            ],
            Association::DetectedOperation { machine } => {
                vec![SlotKey::new(Entity::Machine(*machine), SlotKind::Operation)]
            }
        }
    }

    pub fn step_count(&self) -> u8 {
        match self {
            Association::ShiftTemplate { .. } => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub id: Ulid,
    pub association: Association,
    pub period: Span,
    pub status: ModificationStatus,
    pub created_at: Ms,
    /// Effective end of the part already applied in the current step.
    pub last_processed: Option<Ms>,
    /// Current association step, from 0.
    pub step: u8,
    /// Chunk size for applying the period piecewise. `None`: all at once.
    pub step_span_ms: Option<Ms>,
    pub attempts: u32,
}

impl Modification {
    pub fn new(association: Association, period: Span, created_at: Ms) -> Self {
        Self {
            id: Ulid::new(),
            association,
            period,
            status: ModificationStatus::Pending,
            created_at,
            last_processed: None,
            step: 0,
            step_span_ms: None,
            attempts: 0,
        }
    }

    pub fn with_step_span(mut self, step_span_ms: Option<Ms>) -> Self {
        self.step_span_ms = step_span_ms;
        self
    }

    /// Position reached, compared before and after a dispatch.
    pub(crate) fn progress(&self) -> (u8, Option<Ms>) {
        (self.step, self.last_processed)
    }
}

// ── Collaborators ────────────────────────────────────────────────

/// Weekday → shift of a shift template, Monday first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftTemplateDef {
    pub id: u32,
    pub shifts: [Option<u32>; 7],
}

/// Reference data the pipeline resolves while processing.
pub trait Upstream: Send + Sync {
    /// Operation detected on `machine` over `span`. `None` while detection
    /// has not caught up.
    fn operation_at(&self, machine: u32, span: &Span) -> Option<u64>;

    fn shift_template(&self, template_id: u32) -> Option<ShiftTemplateDef>;
}

/// Upstream data held in memory.
#[derive(Default)]
pub struct MemoryUpstream {
    operations: DashMap<u32, Vec<(Span, u64)>>,
    templates: DashMap<u32, ShiftTemplateDef>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect_operation(&self, machine: u32, span: Span, operation_id: u64) {
        self.operations
            .entry(machine)
            .or_default()
            .push((span, operation_id));
    }

    pub fn add_shift_template(&self, template: ShiftTemplateDef) {
        self.templates.insert(template.id, template);
    }
}

impl Upstream for MemoryUpstream {
    fn operation_at(&self, machine: u32, span: &Span) -> Option<u64> {
        let detections = self.operations.get(&machine)?;
        detections
            .iter()
            .rev()
            .find(|(s, _)| s.contains_span(span))
            .map(|(_, id)| *id)
    }

    fn shift_template(&self, template_id: u32) -> Option<ShiftTemplateDef> {
        self.templates.get(&template_id).map(|t| t.value().clone())
    }
}

/// Liveness and cancellation signal checked by long-running steps.
pub trait Checked: Send + Sync {
    /// Called between units of work.
    fn set_active(&self) {}

    fn is_cancelled(&self) -> bool;
}

impl Checked for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

pub struct NeverCancelled;

impl Checked for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}
