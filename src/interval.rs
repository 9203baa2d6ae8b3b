use chrono::NaiveDate;
use serde::Serialize;

use crate::calendar::DayCalendar;
use crate::model::{Ms, Span, TimeBound};

/// A slot's instant range together with the logical days it covers.
///
/// The day range is derived: it is recomputed by every setter and cannot be
/// set on its own. An end before the begin is logged and kept as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interval {
    span: Span,
    begin_day: TimeBound<NaiveDate>,
    end_day: TimeBound<NaiveDate>,
}

impl Interval {
    pub fn new(span: Span, calendar: &DayCalendar) -> Self {
        let (begin_day, end_day) = calendar.to_day_range(&span);
        if span.is_inverted() {
            tracing::warn!("Interval::new: end before begin in {span}");
        }
        Self {
            span,
            begin_day,
            end_day,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn begin(&self) -> TimeBound<Ms> {
        self.span.start
    }

    pub fn end(&self) -> TimeBound<Ms> {
        self.span.end
    }

    pub fn begin_day(&self) -> TimeBound<NaiveDate> {
        self.begin_day
    }

    pub fn end_day(&self) -> TimeBound<NaiveDate> {
        self.end_day
    }

    pub fn set_begin(&mut self, begin: TimeBound<Ms>, calendar: &DayCalendar) {
        self.span.start = begin;
        self.begin_day = begin.map(|t| calendar.compute_day(t));
    }

    pub fn set_end(&mut self, end: TimeBound<Ms>, calendar: &DayCalendar) {
        self.span.end = end;
        self.end_day = end.map(|t| calendar.compute_end_day(t));
        if self.span.is_inverted() {
            tracing::warn!("Interval::set_end: end before begin in {}", self.span);
        }
    }

    /// Returns false when `span` equals the current range (nothing done).
    pub fn set_range(&mut self, span: Span, calendar: &DayCalendar) -> bool {
        if self.span == span {
            return false;
        }
        // Begin first, so the end check compares against the new begin.
        self.set_begin(span.start, calendar);
        self.set_end(span.end, calendar);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::HOUR_MS;
    use proptest::prelude::*;

    const T0: Ms = 1_710_050_400_000; // 2024-03-10T06:00:00Z

    fn cal() -> DayCalendar {
        DayCalendar::utc("06:00@all".parse().unwrap())
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn days_follow_bounds() {
        let cal = cal();
        let mut iv = Interval::new(Span::new(T0, T0 + 24 * HOUR_MS), &cal);
        assert_eq!(iv.begin_day(), TimeBound::At(date("2024-03-10")));
        assert_eq!(iv.end_day(), TimeBound::At(date("2024-03-10")));

        iv.set_end(TimeBound::Open, &cal);
        assert_eq!(iv.end_day(), TimeBound::Open);

        iv.set_begin(TimeBound::At(T0 - 1), &cal);
        assert_eq!(iv.begin_day(), TimeBound::At(date("2024-03-09")));
    }

    #[test]
    fn set_range_noop_when_equal() {
        let cal = cal();
        let span = Span::new(T0, T0 + HOUR_MS);
        let mut iv = Interval::new(span, &cal);
        assert!(!iv.set_range(span, &cal));
        assert!(iv.set_range(Span::new(T0 + HOUR_MS, T0 + 2 * HOUR_MS), &cal));
        assert_eq!(iv.span(), &Span::new(T0 + HOUR_MS, T0 + 2 * HOUR_MS));
    }

    #[test]
    fn end_before_begin_is_kept() {
        let cal = cal();
        let mut iv = Interval::new(Span::new(T0, T0 + HOUR_MS), &cal);
        iv.set_end(TimeBound::At(T0 - 48 * HOUR_MS), &cal);
        assert_eq!(iv.end(), TimeBound::At(T0 - 48 * HOUR_MS));
        assert!(iv.span().is_inverted());
        assert_eq!(iv.end_day(), TimeBound::At(date("2024-03-07")));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Begin(Option<i64>),
        End(Option<i64>),
        Range(Option<i64>, Option<i64>),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        let bound = prop::option::of(0i64..10 * 24 * HOUR_MS);
        let op = prop_oneof![
            bound.clone().prop_map(Op::Begin),
            bound.clone().prop_map(Op::End),
            (bound.clone(), bound).prop_map(|(b, e)| Op::Range(b, e)),
        ];
        prop::collection::vec(op, 1..20)
    }

    proptest! {
        #[test]
        fn day_range_always_derived(ops in ops()) {
            let cal = cal();
            let mut iv = Interval::new(Span::from_start(T0), &cal);
            let at = |o: Option<i64>| TimeBound::from(o.map(|d| T0 + d));
            for op in ops {
                match op {
                    Op::Begin(b) => iv.set_begin(at(b), &cal),
                    Op::End(e) => iv.set_end(at(e), &cal),
                    Op::Range(b, e) => {
                        iv.set_range(Span::with_bounds(at(b), at(e)), &cal);
                    }
                }
                prop_assert_eq!(iv.begin_day(), iv.begin().map(|t| cal.compute_day(t)));
                prop_assert_eq!(iv.end_day(), iv.end().map(|t| cal.compute_end_day(t)));
            }
        }
    }
}
