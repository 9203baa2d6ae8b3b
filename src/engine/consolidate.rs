//! Merge-insert of a fact into a timeline.
//!
//! Pure: takes the existing slots overlapping (or touching) the new period
//! and returns the structural changes. Applying them to a store is the
//! caller's job.

use std::cmp::Ordering;

use crate::calendar::DayCalendar;
use crate::interval::Interval;
use crate::model::*;

/// Observers of structural changes. Each is invoked exactly once per changed
/// slot, in ascending time order.
pub trait SlotHooks {
    fn on_added(&mut self, _slot: &Slot) {}
    fn on_modified(&mut self, _slot: &Slot, _old: &Slot) {}
    fn on_removed(&mut self, _slot: &Slot) {}
}

pub struct NoHooks;

impl SlotHooks for NoHooks {}

/// How an existing slot contributes to a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Untouched part of the slot: pass-through or residual, own payload.
    Kept,
    /// Intersection with the new period, merged payload.
    Merged,
}

#[derive(Debug)]
struct Piece {
    span: Span,
    payload: Payload,
    origins: Vec<(usize, Role)>,
}

/// Parts of `span` not covered by `covered` (sorted by start, each clipped
/// to `span`).
fn uncovered(span: &Span, covered: &[Span]) -> Vec<Span> {
    let mut gaps = Vec::new();
    // `None` once the cursor reached +inf.
    let mut cursor = Some(span.start);
    for c in covered {
        let Some(cur) = cursor else { break };
        if cur.cmp_lower(&c.start) == Ordering::Less
            && let TimeBound::At(s) = c.start
        {
            gaps.push(Span::with_bounds(cur, TimeBound::At(s)));
        }
        cursor = match c.end {
            TimeBound::Open => None,
            TimeBound::At(e) if cur.cmp_lower(&TimeBound::At(e)) == Ordering::Less => {
                Some(TimeBound::At(e))
            }
            TimeBound::At(_) => Some(cur),
        };
    }
    if let Some(cur) = cursor {
        let tail = Span::with_bounds(cur, span.end);
        if !tail.is_empty() {
            gaps.push(tail);
        }
    }
    gaps
}

/// Merge the fact `payload` over `span` into `existing`.
///
/// Residual parts of an existing slot keep its payload, the overlapped part
/// gets `payload.merge_with_old`, uncovered parts get `payload`. Abutting
/// results with reference-equal payloads are coalesced, left first.
///
/// Identity: an existing slot survives as `Modified`/`Unchanged` in the piece
/// holding its residual (or its merged part when it has none). A slot whose
/// residuals end up in two pieces is split: `Removed` plus new slots.
pub fn consolidate(
    key: SlotKey,
    span: Span,
    payload: &Payload,
    existing: Vec<Slot>,
    calendar: &DayCalendar,
    hooks: &mut dyn SlotHooks,
) -> Vec<SlotChange> {
    if span.is_empty() {
        tracing::error!("consolidate: empty period {span} for {key}, nothing done");
        return Vec::new();
    }

    let mut changes = Vec::new();
    let mut valid: Vec<Slot> = Vec::with_capacity(existing.len());
    for slot in existing {
        if slot.key != key {
            tracing::error!("consolidate: slot {} of {} fetched for {key}, skipped", slot.id, slot.key);
            continue;
        }
        if slot.is_empty() {
            tracing::warn!("consolidate: empty slot {} ({}) on {key} removed", slot.id, slot.span());
            changes.push(SlotChange::Removed(slot));
            continue;
        }
        valid.push(slot);
    }
    valid.sort_by(|a, b| a.span().cmp_start(b.span()));

    // ── Cut ──────────────────────────────────────────────────────
    let mut pieces = Vec::new();
    let mut covered = Vec::new();
    for (i, slot) in valid.iter().enumerate() {
        let s = *slot.span();
        let inter = s.intersect(&span);
        if inter.is_empty() {
            pieces.push(Piece {
                span: s,
                payload: slot.payload.clone(),
                origins: vec![(i, Role::Kept)],
            });
            continue;
        }
        covered.push(inter);
        if s.start.cmp_lower(&span.start) == Ordering::Less {
            pieces.push(Piece {
                span: Span::with_bounds(s.start, span.start),
                payload: slot.payload.clone(),
                origins: vec![(i, Role::Kept)],
            });
        }
        if s.end.cmp_upper(&span.end) == Ordering::Greater {
            pieces.push(Piece {
                span: Span::with_bounds(span.end, s.end),
                payload: slot.payload.clone(),
                origins: vec![(i, Role::Kept)],
            });
        }
        if let Some(merged) = payload.merge_with_old(&slot.payload, &inter) {
            pieces.push(Piece {
                span: inter,
                payload: merged,
                origins: vec![(i, Role::Merged)],
            });
        }
    }
    for gap in uncovered(&span, &covered) {
        pieces.push(Piece {
            span: gap,
            payload: payload.clone(),
            origins: Vec::new(),
        });
    }
    pieces.retain(|p| !p.span.is_empty() && !p.payload.is_empty());
    pieces.sort_by(|a, b| a.span.cmp_start(&b.span));

    // ── Coalesce ─────────────────────────────────────────────────
    let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let Some(last) = merged.last_mut()
            && last.span.abuts(&piece.span)
            && last.payload.reference_data_equals(&piece.payload)
        {
            last.span.end = piece.span.end;
            last.origins.extend(piece.origins);
            continue;
        }
        merged.push(piece);
    }

    // ── Identity ─────────────────────────────────────────────────
    let split: Vec<bool> = (0..valid.len())
        .map(|i| {
            merged
                .iter()
                .filter(|p| p.origins.contains(&(i, Role::Kept)))
                .count()
                > 1
        })
        .collect();
    let mut claimed = vec![false; valid.len()];
    let mut owner: Vec<Option<usize>> = vec![None; merged.len()];
    for role in [Role::Kept, Role::Merged] {
        for (p, piece) in merged.iter().enumerate() {
            if owner[p].is_some() {
                continue;
            }
            if let Some(&(i, _)) = piece
                .origins
                .iter()
                .find(|(i, r)| *r == role && !split[*i] && !claimed[*i])
            {
                claimed[i] = true;
                owner[p] = Some(i);
            }
        }
    }

    for (piece, owner) in merged.into_iter().zip(owner) {
        match owner {
            Some(i) => {
                let old = &valid[i];
                if *old.span() == piece.span && old.payload == piece.payload {
                    changes.push(SlotChange::Unchanged(old.clone()));
                } else {
                    let mut slot = old.clone();
                    slot.interval.set_range(piece.span, calendar);
                    slot.payload = piece.payload;
                    changes.push(SlotChange::Modified {
                        slot,
                        old: old.clone(),
                    });
                }
            }
            None => changes.push(SlotChange::Added(Slot::new(
                key,
                Interval::new(piece.span, calendar),
                piece.payload,
            ))),
        }
    }
    for (i, slot) in valid.into_iter().enumerate() {
        if !claimed[i] {
            changes.push(SlotChange::Removed(slot));
        }
    }

    // By start; a removed slot goes before what replaces it.
    changes.sort_by(|a, b| {
        a.slot()
            .span()
            .start
            .cmp_lower(&b.slot().span().start)
            .then_with(|| b.is_removed().cmp(&a.is_removed()))
    });
    for change in &changes {
        match change {
            SlotChange::Unchanged(_) => {}
            SlotChange::Added(slot) => hooks.on_added(slot),
            SlotChange::Modified { slot, old } => hooks.on_modified(slot, old),
            SlotChange::Removed(slot) => hooks.on_removed(slot),
        }
    }
    changes
}
