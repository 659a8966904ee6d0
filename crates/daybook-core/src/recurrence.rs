use chrono::NaiveDate;
use tracing::{debug, instrument, warn};

use crate::datastore::DataStore;
use crate::datetime::{add_days, add_month_clamped, days_between, format_iso_date, parse_iso_date};
use crate::model::{Event, Occurrence, Repeat, RepeatRule};

/// Upper bound on cursor advances for a single event.
pub const MAX_EXPANSION_STEPS: usize = 5_000;

/// No occurrence is generated past this date, whatever the rule says.
pub fn expansion_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(2100, 1, 1).unwrap_or(NaiveDate::MAX)
}

impl RepeatRule {
    fn step_days(self) -> Option<i64> {
        match self {
            RepeatRule::Daily => Some(1),
            RepeatRule::Every { days } => Some(i64::from(days.max(1))),
            RepeatRule::Weekly => Some(7),
            RepeatRule::Monthly => None,
        }
    }

    /// Next cursor after `date`. Monthly steps clamp to the end of shorter
    /// months and continue from the clamped day.
    pub fn advance(self, date: NaiveDate) -> NaiveDate {
        match self.step_days() {
            Some(step) => add_days(date, step),
            None => add_month_clamped(date),
        }
    }

    /// First cursor on or after `window_start` reachable from `first`.
    fn fast_forward(self, first: NaiveDate, window_start: NaiveDate) -> NaiveDate {
        let Some(step) = self.step_days() else {
            return first;
        };
        let gap = days_between(first, window_start);
        if gap <= 0 {
            return first;
        }
        let steps = (gap + step - 1) / step;
        add_days(first, steps * step)
    }
}

/// Concrete occurrences of `event` within `[window_start, window_end]`,
/// ascending by date.
///
/// Pure: the base event is never modified and repeated calls return the same
/// sequence.
pub fn expand(event: &Event, window_start: NaiveDate, window_end: NaiveDate) -> Vec<Occurrence> {
    let Some(first) = parse_iso_date(&event.date) else {
        debug!(id = %event.id, date = %event.date, "event has no usable date; skipping");
        return vec![];
    };
    if window_end < window_start {
        return vec![];
    }

    let rule = match &event.repeat {
        Repeat::Rule(rule) => *rule,
        Repeat::None => {
            return single(event, first, window_start, window_end);
        }
        Repeat::Unrecognized(raw) => {
            warn!(id = %event.id, repeat = %raw, "unknown repeat rule; treating as one-off");
            return single(event, first, window_start, window_end);
        }
    };

    let until = match event.repeat_until.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            let parsed = parse_iso_date(raw);
            if parsed.is_none() {
                warn!(id = %event.id, repeat_until = %raw, "unparseable repeatUntil; ignoring");
            }
            parsed
        }
        _ => None,
    };

    let sentinel = expansion_sentinel();
    let mut cursor = rule.fast_forward(first, window_start);
    let mut out = Vec::new();

    for _ in 0..MAX_EXPANSION_STEPS {
        if cursor > window_end {
            break;
        }
        if until.is_some_and(|until| cursor > until) {
            break;
        }
        if cursor >= window_start {
            out.push(occurrence_on(event, cursor));
        }

        let next = rule.advance(cursor);
        if next <= cursor || next > sentinel {
            break;
        }
        cursor = next;
    }

    out
}

fn single(
    event: &Event,
    date: NaiveDate,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<Occurrence> {
    if date >= window_start && date <= window_end {
        vec![occurrence_on(event, date)]
    } else {
        vec![]
    }
}

fn occurrence_on(event: &Event, date: NaiveDate) -> Occurrence {
    let mut copy = event.clone();
    copy.date = format_iso_date(date);
    Occurrence {
        event: copy,
        occurrence_date: date,
        base_id: event.id.clone(),
    }
}

/// Expands every event and merges the results ordered by
/// `(date, start time)`. Untimed occurrences come first on their day and
/// ties keep the order of `events`.
#[instrument(skip(events), fields(events = events.len()))]
pub fn expand_all(events: &[Event], window_start: NaiveDate, window_end: NaiveDate) -> Vec<Occurrence> {
    let mut out: Vec<Occurrence> = events
        .iter()
        .flat_map(|event| expand(event, window_start, window_end))
        .collect();

    out.sort_by(|a, b| {
        a.occurrence_date
            .cmp(&b.occurrence_date)
            .then_with(|| a.event.start_minutes().cmp(&b.event.start_minutes()))
    });

    debug!(count = out.len(), "expanded occurrences");
    out
}

/// Occurrences of all stored events within the window. This is what the
/// agenda, the daily view and the events list read.
#[instrument(skip(store))]
pub fn occurrences_between(
    store: &DataStore,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<Occurrence> {
    let events = store.events().load();
    expand_all(&events, window_start, window_end)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{expand, expand_all};
    use crate::model::{Event, ItemId, Repeat, RepeatRule};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn event(id: i64, day: &str, repeat: Repeat) -> Event {
        let mut ev = Event::new(ItemId::Int(id), format!("event {id}"), day.to_string());
        ev.repeat = repeat;
        ev
    }

    fn dates(occurrences: &[crate::model::Occurrence]) -> Vec<String> {
        occurrences.iter().map(|o| o.event.date.clone()).collect()
    }

    #[test]
    fn one_off_inside_window_yields_one_occurrence() {
        let ev = event(4, "2024-05-10", Repeat::None);
        let out = expand(&ev, date(2024, 5, 1), date(2024, 5, 31));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event.date, "2024-05-10");
        assert_eq!(out[0].occurrence_date, date(2024, 5, 10));
        assert_eq!(out[0].base_id, ItemId::Int(4));
    }

    #[test]
    fn one_off_outside_window_yields_nothing() {
        let ev = event(4, "2024-06-01", Repeat::None);
        assert!(expand(&ev, date(2024, 5, 1), date(2024, 5, 31)).is_empty());
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let ev = event(1, "2024-05-31", Repeat::None);
        assert_eq!(expand(&ev, date(2024, 5, 31), date(2024, 5, 31)).len(), 1);
    }

    #[test]
    fn weekly_event_over_january() {
        let ev = event(1, "2024-01-01", Repeat::Rule(RepeatRule::Weekly));
        let out = expand(&ev, date(2024, 1, 1), date(2024, 1, 31));
        assert_eq!(
            dates(&out),
            vec!["2024-01-01", "2024-01-08", "2024-01-15", "2024-01-22", "2024-01-29"]
        );
    }

    #[test]
    fn monthly_clamp_carries_forward() {
        let ev = event(1, "2024-01-31", Repeat::Rule(RepeatRule::Monthly));
        let out = expand(&ev, date(2024, 1, 1), date(2024, 4, 30));
        assert_eq!(
            dates(&out),
            vec!["2024-01-31", "2024-02-29", "2024-03-29", "2024-04-29"]
        );
    }

    #[test]
    fn repeat_until_bounds_emission() {
        let mut ev = event(1, "2024-03-01", Repeat::Rule(RepeatRule::Daily));
        ev.start_time = Some("09:00".to_string());
        ev.repeat_until = Some("2024-03-03".to_string());
        let out = expand(&ev, date(2024, 2, 25), date(2024, 3, 10));
        assert_eq!(dates(&out), vec!["2024-03-01", "2024-03-02", "2024-03-03"]);
        assert!(out.iter().all(|o| o.base_id == ItemId::Int(1)));
    }

    #[test]
    fn every_two_days_stays_aligned_when_window_starts_late() {
        let ev = event(2, "2024-01-01", Repeat::Rule(RepeatRule::Every { days: 2 }));
        let out = expand(&ev, date(2024, 1, 4), date(2024, 1, 10));
        assert_eq!(
            dates(&out),
            vec!["2024-01-05", "2024-01-07", "2024-01-09"]
        );
    }

    #[test]
    fn old_daily_events_still_reach_distant_windows() {
        let ev = event(3, "2000-01-01", Repeat::Rule(RepeatRule::Daily));
        let out = expand(&ev, date(2024, 1, 1), date(2024, 1, 3));
        assert_eq!(dates(&out), vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
    }

    #[test]
    fn unbounded_rules_stop_at_sentinel() {
        let ev = event(5, "2099-12-25", Repeat::Rule(RepeatRule::Daily));
        let out = expand(&ev, date(2099, 12, 1), date(2150, 1, 1));
        assert_eq!(out.last().map(|o| o.occurrence_date), Some(date(2100, 1, 1)));
    }

    #[test]
    fn unknown_rules_emit_once() {
        let ev = event(6, "2024-01-01", Repeat::Unrecognized("hourly".to_string()));
        let out = expand(&ev, date(2024, 1, 1), date(2024, 12, 31));
        assert_eq!(dates(&out), vec!["2024-01-01"]);
    }

    #[test]
    fn non_string_repeat_values_load_and_emit_once() {
        let events: Vec<Event> = ["2", "true", "{}"]
            .iter()
            .map(|raw| {
                let json = format!(r#"{{"id":1,"title":"Gym","date":"2024-03-01","repeat":{raw}}}"#);
                serde_json::from_str(&json).expect("event with odd repeat value")
            })
            .collect();

        assert_eq!(events[0].repeat, Repeat::Unrecognized("2".to_string()));
        for ev in &events {
            let out = expand(ev, date(2024, 3, 1), date(2024, 3, 31));
            assert_eq!(dates(&out), vec!["2024-03-01"]);
        }
    }

    #[test]
    fn expansion_is_pure_and_repeatable() {
        let mut ev = event(7, "2024-02-01", Repeat::Rule(RepeatRule::Weekly));
        ev.location = Some("Office".to_string());
        let before = ev.clone();

        let first = expand(&ev, date(2024, 2, 1), date(2024, 3, 1));
        let second = expand(&ev, date(2024, 2, 1), date(2024, 3, 1));
        assert_eq!(first, second);
        assert_eq!(ev, before);

        for occ in &first {
            let mut restored = occ.event.clone();
            restored.date = before.date.clone();
            assert_eq!(restored, before);
        }
    }

    #[test]
    fn unnormalized_event_dates_are_canonicalized() {
        let ev = event(8, "March 5, 2024", Repeat::None);
        let out = expand(&ev, date(2024, 3, 1), date(2024, 3, 31));
        assert_eq!(dates(&out), vec!["2024-03-05"]);
    }

    #[test]
    fn merged_occurrences_sort_by_date_then_time() {
        let mut late = event(1, "2024-03-01", Repeat::Rule(RepeatRule::Daily));
        late.start_time = Some("18:00".to_string());
        let mut early = event(2, "2024-03-02", Repeat::None);
        early.start_time = Some("7:30am".to_string());
        let untimed = event(3, "2024-03-02", Repeat::None);
        let mut tie = event(4, "2024-03-02", Repeat::None);
        tie.start_time = Some("18:00".to_string());

        let out = expand_all(
            &[late, early, untimed, tie],
            date(2024, 3, 1),
            date(2024, 3, 2),
        );
        let order: Vec<(String, String)> = out
            .iter()
            .map(|o| (o.event.date.clone(), o.base_id.to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2024-03-01".to_string(), "1".to_string()),
                ("2024-03-02".to_string(), "3".to_string()),
                ("2024-03-02".to_string(), "2".to_string()),
                ("2024-03-02".to_string(), "1".to_string()),
                ("2024-03-02".to_string(), "4".to_string()),
            ]
        );
    }
}
