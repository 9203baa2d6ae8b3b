use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::interval::Interval;

/// Unix milliseconds (UTC), the only instant type.
pub type Ms = i64;

// ── Bounds ───────────────────────────────────────────────────────

/// One end of a range: either unbounded or a value.
///
/// Whether an `Open` bound means −∞ or +∞ depends on the side it is used on,
/// so comparisons are explicit about the side (`cmp_lower`, `cmp_upper`,
/// [`cmp_lower_upper`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBound<T> {
    Open,
    At(T),
}

impl<T: Copy> TimeBound<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            TimeBound::Open => None,
            TimeBound::At(v) => Some(*v),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TimeBound::Open)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TimeBound<U> {
        match self {
            TimeBound::Open => TimeBound::Open,
            TimeBound::At(v) => TimeBound::At(f(v)),
        }
    }
}

impl<T> From<Option<T>> for TimeBound<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => TimeBound::At(v),
            None => TimeBound::Open,
        }
    }
}

impl<T: Ord + Copy> TimeBound<T> {
    /// Compare two lower bounds (`Open` is −∞).
    pub fn cmp_lower(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TimeBound::Open, TimeBound::Open) => Ordering::Equal,
            (TimeBound::Open, TimeBound::At(_)) => Ordering::Less,
            (TimeBound::At(_), TimeBound::Open) => Ordering::Greater,
            (TimeBound::At(a), TimeBound::At(b)) => a.cmp(b),
        }
    }

    /// Compare two upper bounds (`Open` is +∞).
    pub fn cmp_upper(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TimeBound::Open, TimeBound::Open) => Ordering::Equal,
            (TimeBound::Open, TimeBound::At(_)) => Ordering::Greater,
            (TimeBound::At(_), TimeBound::Open) => Ordering::Less,
            (TimeBound::At(a), TimeBound::At(b)) => a.cmp(b),
        }
    }
}

/// Compare a lower bound with an upper bound. `Less` means a range built from
/// them is non-empty.
pub fn cmp_lower_upper<T: Ord>(lower: &TimeBound<T>, upper: &TimeBound<T>) -> Ordering {
    match (lower, upper) {
        (TimeBound::At(l), TimeBound::At(u)) => l.cmp(u),
        _ => Ordering::Less,
    }
}

// ── Span ─────────────────────────────────────────────────────────

/// Half-open UTC range `[start, end)`; either end may be unbounded.
///
/// No ordering is enforced on construction: legacy data may carry an end
/// before its start, and such a span simply reports itself as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeBound<Ms>,
    pub end: TimeBound<Ms>,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self {
            start: TimeBound::At(start),
            end: TimeBound::At(end),
        }
    }

    /// `[start, +∞)`
    pub fn from_start(start: Ms) -> Self {
        Self {
            start: TimeBound::At(start),
            end: TimeBound::Open,
        }
    }

    pub fn with_bounds(start: TimeBound<Ms>, end: TimeBound<Ms>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self {
            start: TimeBound::Open,
            end: TimeBound::Open,
        }
    }

    pub fn is_empty(&self) -> bool {
        cmp_lower_upper(&self.start, &self.end) != Ordering::Less
    }

    /// End strictly before start.
    pub fn is_inverted(&self) -> bool {
        cmp_lower_upper(&self.start, &self.end) == Ordering::Greater
    }

    pub fn duration_ms(&self) -> Option<Ms> {
        match (self.start, self.end) {
            (TimeBound::At(s), TimeBound::At(e)) => Some(e - s),
            _ => None,
        }
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        let after_start = match self.start {
            TimeBound::Open => true,
            TimeBound::At(s) => s <= t,
        };
        let before_end = match self.end {
            TimeBound::Open => true,
            TimeBound::At(e) => t < e,
        };
        after_start && before_end
    }

    pub fn intersect(&self, other: &Span) -> Span {
        let start = if self.start.cmp_lower(&other.start) == Ordering::Less {
            other.start
        } else {
            self.start
        };
        let end = if self.end.cmp_upper(&other.end) == Ordering::Greater {
            other.end
        } else {
            self.end
        };
        Span { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty() && !other.is_empty() && !self.intersect(other).is_empty()
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start.cmp_lower(&other.start) != Ordering::Greater
            && self.end.cmp_upper(&other.end) != Ordering::Less
    }

    /// `self` ends exactly where `next` starts.
    pub fn abuts(&self, next: &Span) -> bool {
        matches!((self.end, next.start), (TimeBound::At(e), TimeBound::At(s)) if e == s)
    }

    /// The span widened by one millisecond on each bounded side. Slots that
    /// only touch `self` overlap the widened span.
    pub fn touching_window(&self) -> Span {
        Span {
            start: self.start.map(|s| s.saturating_sub(1)),
            end: self.end.map(|e| e.saturating_add(1)),
        }
    }

    /// Order by start (−∞ first), then by end.
    pub fn cmp_start(&self, other: &Span) -> Ordering {
        self.start
            .cmp_lower(&other.start)
            .then_with(|| self.end.cmp_upper(&other.end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            TimeBound::Open => write!(f, "(-inf, ")?,
            TimeBound::At(s) => write!(f, "[{s}, ")?,
        }
        match self.end {
            TimeBound::Open => write!(f, "+inf)"),
            TimeBound::At(e) => write!(f, "{e})"),
        }
    }
}

// ── Keys ─────────────────────────────────────────────────────────

/// A monitored entity owning timelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Entity {
    /// Plant-wide timelines (days, global shift template).
    Global,
    Machine(u32),
    User(u32),
    ToolPosition(u32),
    MachineModule(u32),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Global => write!(f, "global"),
            Entity::Machine(id) => write!(f, "machine-{id}"),
            Entity::User(id) => write!(f, "user-{id}"),
            Entity::ToolPosition(id) => write!(f, "tool-position-{id}"),
            Entity::MachineModule(id) => write!(f, "machine-module-{id}"),
        }
    }
}

/// What a timeline tracks. Each kind owns its own non-overlapping timeline
/// per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Day,
    ShiftTemplate,
    Shift,
    MachineState,
    Operation,
    ToolLife,
}

impl SlotKind {
    /// Cache domain name.
    pub fn domain(&self) -> &'static str {
        match self {
            SlotKind::Day => "day",
            SlotKind::ShiftTemplate => "shift-template",
            SlotKind::Shift => "shift",
            SlotKind::MachineState => "machine-state",
            SlotKind::Operation => "operation",
            SlotKind::ToolLife => "tool-life",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub entity: Entity,
    pub kind: SlotKind,
}

impl SlotKey {
    pub fn new(entity: Entity, kind: SlotKind) -> Self {
        Self { entity, kind }
    }

    /// Cache-invalidation key `domain/entityId`.
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.kind.domain(), self.entity)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.kind.domain())
    }
}

// ── Payloads ─────────────────────────────────────────────────────

/// The fact carried by a slot. One variant per timeline kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Day {
        day: NaiveDate,
    },
    ShiftTemplate {
        template_id: u32,
    },
    Shift {
        shift_id: Option<u32>,
        day: Option<NaiveDate>,
    },
    MachineState {
        template_id: Option<u32>,
    },
    /// `auto` marks an operation coming from automatic detection.
    Operation {
        operation_id: Option<u64>,
        auto: bool,
    },
    ToolLife {
        tool_id: Option<u32>,
        remaining: Option<i64>,
    },
}

impl Payload {
    pub fn kind(&self) -> SlotKind {
        match self {
            Payload::Day { .. } => SlotKind::Day,
            Payload::ShiftTemplate { .. } => SlotKind::ShiftTemplate,
            Payload::Shift { .. } => SlotKind::Shift,
            Payload::MachineState { .. } => SlotKind::MachineState,
            Payload::Operation { .. } => SlotKind::Operation,
            Payload::ToolLife { .. } => SlotKind::ToolLife,
        }
    }

    /// A payload without data. Days and shift templates are never empty:
    /// no gap is wanted in those timelines.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Day { .. } | Payload::ShiftTemplate { .. } => false,
            Payload::Shift { shift_id, .. } => shift_id.is_none(),
            Payload::MachineState { template_id } => template_id.is_none(),
            Payload::Operation { operation_id, .. } => operation_id.is_none(),
            Payload::ToolLife { tool_id, .. } => tool_id.is_none(),
        }
    }

    /// Two slots with reference-equal payloads may be coalesced.
    pub fn reference_data_equals(&self, other: &Payload) -> bool {
        self == other
    }

    pub fn day(&self) -> Option<NaiveDate> {
        match self {
            Payload::Day { day } => Some(*day),
            Payload::Shift { day, .. } => *day,
            _ => None,
        }
    }

    /// Merge `self` (the new fact) with the payload of an existing slot over
    /// `range`. `None` means the range loses its coverage.
    pub fn merge_with_old(&self, old: &Payload, range: &Span) -> Option<Payload> {
        if self.kind() != old.kind() {
            tracing::error!(
                "merge_with_old: payload kind {:?} merged into a {:?} slot over {range}, keep the new fact",
                self.kind(),
                old.kind()
            );
            return Some(self.clone());
        }
        match (self, old) {
            (Payload::Operation { operation_id: None, .. }, _) => None,
            (
                Payload::Operation { auto: true, .. },
                Payload::Operation {
                    operation_id: Some(_),
                    auto: false,
                },
            ) => {
                tracing::debug!("merge_with_old: manual operation kept over auto-detection on {range}");
                Some(old.clone())
            }
            (Payload::ToolLife { tool_id: None, .. }, _) => None,
            (
                Payload::ToolLife {
                    tool_id: Some(tool),
                    remaining: None,
                },
                Payload::ToolLife {
                    tool_id: Some(old_tool),
                    remaining,
                },
            ) if tool == old_tool => Some(Payload::ToolLife {
                tool_id: Some(*tool),
                remaining: *remaining,
            }),
            _ => Some(self.clone()),
        }
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// A fact on one timeline over one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub id: Ulid,
    pub key: SlotKey,
    pub interval: Interval,
    pub payload: Payload,
}

impl Slot {
    pub fn new(key: SlotKey, interval: Interval, payload: Payload) -> Self {
        Self {
            id: Ulid::new(),
            key,
            interval,
            payload,
        }
    }

    pub fn span(&self) -> &Span {
        self.interval.span()
    }

    /// Empty slots are never persisted.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() || self.span().is_empty()
    }

    /// The logical day this slot stands for, if it covers exactly one.
    pub fn day(&self) -> Option<NaiveDate> {
        if let Some(day) = self.payload.day() {
            return Some(day);
        }
        match (self.interval.begin_day(), self.interval.end_day()) {
            (TimeBound::At(b), TimeBound::At(e)) if b == e => Some(b),
            _ => None,
        }
    }
}

/// Structural outcome of a consolidation for one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotChange {
    Unchanged(Slot),
    Added(Slot),
    Modified { slot: Slot, old: Slot },
    Removed(Slot),
}

impl SlotChange {
    /// The slot as it is after the change (the deleted one for `Removed`).
    pub fn slot(&self) -> &Slot {
        match self {
            SlotChange::Unchanged(s) | SlotChange::Added(s) | SlotChange::Removed(s) => s,
            SlotChange::Modified { slot, .. } => slot,
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, SlotChange::Removed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SlotChange::Unchanged(_) => "unchanged",
            SlotChange::Added(_) => "added",
            SlotChange::Modified { .. } => "modified",
            SlotChange::Removed(_) => "removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), Some(100));
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.abuts(&c));
        assert!(!c.abuts(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
        assert!(Span::unbounded().contains_span(&outer));
        assert!(!outer.contains_span(&Span::from_start(150)));
    }

    #[test]
    fn open_bounds_compare_as_infinities() {
        let open: TimeBound<Ms> = TimeBound::Open;
        assert_eq!(open.cmp_lower(&TimeBound::At(i64::MIN)), Ordering::Less);
        assert_eq!(open.cmp_upper(&TimeBound::At(i64::MAX)), Ordering::Greater);
        assert_eq!(cmp_lower_upper(&open, &open), Ordering::Less);
        assert_eq!(cmp_lower_upper(&TimeBound::At(5), &TimeBound::At(5)), Ordering::Equal);
    }

    #[test]
    fn open_spans_intersect() {
        let left = Span::with_bounds(TimeBound::Open, TimeBound::At(500));
        let right = Span::from_start(300);
        assert_eq!(left.intersect(&right), Span::new(300, 500));
        assert!(Span::unbounded().overlaps(&right));
        assert!(!Span::from_start(500).overlaps(&left));
    }

    #[test]
    fn inverted_span_is_empty() {
        let s = Span::new(200, 100);
        assert!(s.is_empty());
        assert!(s.is_inverted());
        assert!(!s.overlaps(&Span::unbounded()));
        assert!(Span::new(100, 100).is_empty());
        assert!(!Span::new(100, 100).is_inverted());
    }

    #[test]
    fn touching_window_catches_neighbours() {
        let s = Span::new(100, 200);
        let w = s.touching_window();
        assert!(w.overlaps(&Span::new(50, 100)));
        assert!(w.overlaps(&Span::new(200, 250)));
        assert!(!w.overlaps(&Span::new(201, 250)));
    }

    #[test]
    fn cache_key_format() {
        let key = SlotKey::new(Entity::Machine(12), SlotKind::Operation);
        assert_eq!(key.cache_key(), "operation/machine-12");
        assert_eq!(SlotKey::new(Entity::Global, SlotKind::Day).cache_key(), "day/global");
    }

    #[test]
    fn empty_payloads() {
        assert!(Payload::Operation { operation_id: None, auto: false }.is_empty());
        assert!(!Payload::Operation { operation_id: Some(1), auto: true }.is_empty());
        assert!(!Payload::ShiftTemplate { template_id: 0 }.is_empty());
        assert!(Payload::MachineState { template_id: None }.is_empty());
    }

    #[test]
    fn auto_operation_does_not_override_manual() {
        let manual = Payload::Operation { operation_id: Some(7), auto: false };
        let auto = Payload::Operation { operation_id: Some(9), auto: true };
        let range = Span::new(0, 10);
        assert_eq!(auto.merge_with_old(&manual, &range), Some(manual.clone()));
        assert_eq!(manual.merge_with_old(&auto, &range), Some(manual.clone()));
    }

    #[test]
    fn operation_without_id_erases() {
        let old = Payload::Operation { operation_id: Some(7), auto: false };
        let reset = Payload::Operation { operation_id: None, auto: false };
        assert_eq!(reset.merge_with_old(&old, &Span::new(0, 10)), None);
    }

    #[test]
    fn tool_life_keeps_remaining_of_same_tool() {
        let old = Payload::ToolLife { tool_id: Some(3), remaining: Some(120) };
        let new = Payload::ToolLife { tool_id: Some(3), remaining: None };
        assert_eq!(new.merge_with_old(&old, &Span::new(0, 10)), Some(old.clone()));

        let other_tool = Payload::ToolLife { tool_id: Some(4), remaining: None };
        assert_eq!(other_tool.merge_with_old(&old, &Span::new(0, 10)), Some(other_tool.clone()));
    }

    #[test]
    fn payload_serialization_roundtrip() {
        let payload = Payload::Shift {
            shift_id: Some(2),
            day: NaiveDate::from_ymd_opt(2024, 3, 10),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, decoded);
    }
}
