use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::datetime::{MINUTES_PER_DAY, at_minutes, format_iso_date, normalize_date, parse_clock_minutes};
use crate::model::{Occurrence, Reminder, Task};

/// A slice of the day shown by the daily view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPart {
    Morning,
    Day,
    Night,
    All,
}

impl DayPart {
    /// Hours shown, end exclusive. Night runs to 01:00, written as hour 25.
    pub fn hours(self) -> Range<u32> {
        match self {
            DayPart::Morning => 1..9,
            DayPart::Day => 9..17,
            DayPart::Night => 17..25,
            DayPart::All => 0..24,
        }
    }

    /// The part containing `hour` (0..=23). Midnight belongs to night.
    pub fn for_hour(hour: u32) -> Self {
        match hour {
            1..=8 => DayPart::Morning,
            9..=16 => DayPart::Day,
            _ => DayPart::Night,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DayPart::Morning => "morning",
            DayPart::Day => "day",
            DayPart::Night => "night",
            DayPart::All => "all",
        }
    }
}

impl fmt::Display for DayPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayPart {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(DayPart::Morning),
            "day" => Ok(DayPart::Day),
            "night" => Ok(DayPart::Night),
            "all" => Ok(DayPart::All),
            other => Err(anyhow!(
                "unknown day part '{other}' (expected morning, day, night or all)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Event,
    Reminder,
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    pub kind: EntryKind,
    pub id: String,
    pub time: String,
    pub label: String,
    /// Starts before or runs past this row.
    pub continues: bool,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourRow {
    pub hour: u32,
    pub label: String,
    pub current: bool,
    pub entries: Vec<LayoutEntry>,
}

/// One day laid out on an hourly axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayLayout {
    pub date: NaiveDate,
    pub part: DayPart,
    pub rows: Vec<HourRow>,
    pub untimed: Vec<LayoutEntry>,
}

/// Where an item sits on the minute axis of its day.
enum Placement {
    Span { start: u32, end: u32 },
    Point(u32),
    Untimed,
}

impl Placement {
    fn in_hour(&self, hour: u32) -> Option<bool> {
        let row_start = hour * 60;
        let row_end = row_start + 60;
        match *self {
            Placement::Span { start, end } => {
                (start < row_end && end > row_start).then_some(start < row_start || end > row_end)
            }
            Placement::Point(at) => (at >= row_start && at < row_end).then_some(false),
            Placement::Untimed => None,
        }
    }
}

impl DayLayout {
    /// Lays out everything dated `date`.
    ///
    /// Events with an end time occupy every hour they overlap; an end at or
    /// before the start means the event ends the next day. Events without an
    /// end, reminders and tasks sit in the hour they start. Items with no
    /// usable time are listed in `untimed`.
    pub fn build(
        date: NaiveDate,
        part: DayPart,
        occurrences: &[Occurrence],
        reminders: &[Reminder],
        tasks: &[Task],
        now: NaiveDateTime,
    ) -> Self {
        let date_iso = format_iso_date(date);
        let mut items: Vec<(Placement, LayoutEntry)> = Vec::new();

        for occurrence in occurrences.iter().filter(|o| o.occurrence_date == date) {
            let event = &occurrence.event;
            let placement = match (event.start_minutes(), event.end_minutes()) {
                (Some(start), Some(end)) => Placement::Span {
                    start,
                    end: if end <= start { end + MINUTES_PER_DAY } else { end },
                },
                (Some(start), None) => Placement::Point(start),
                (None, _) => Placement::Untimed,
            };
            items.push((
                placement,
                LayoutEntry {
                    kind: EntryKind::Event,
                    id: occurrence.base_id.to_string(),
                    time: event.time_span_label(),
                    label: with_emoji(event.emoji.as_deref(), &event.title),
                    continues: false,
                    done: false,
                },
            ));
        }

        for (idx, reminder) in reminders.iter().enumerate() {
            if reminder.day() != Some(date) {
                continue;
            }
            let clock = reminder.clock();
            items.push((
                point_or_untimed(clock),
                LayoutEntry {
                    kind: EntryKind::Reminder,
                    id: reminder
                        .id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("idx{idx}")),
                    time: clock.unwrap_or_default().to_string(),
                    label: with_emoji(reminder.emoji.as_deref(), reminder.display_text()),
                    continues: false,
                    done: false,
                },
            ));
        }

        for task in tasks.iter().filter(|t| normalize_date(&t.date) == date_iso) {
            let clock = Some(task.time.as_str()).filter(|t| !t.trim().is_empty());
            items.push((
                point_or_untimed(clock),
                LayoutEntry {
                    kind: EntryKind::Task,
                    id: task.id.to_string(),
                    time: task.time.clone(),
                    label: task.display_title().to_string(),
                    continues: false,
                    done: task.done,
                },
            ));
        }

        let rows = part
            .hours()
            .map(|hour| HourRow {
                hour,
                label: format!("{:02}:00", hour % 24),
                current: row_day(date, hour) == Some(now.date()) && now.hour() == hour % 24,
                entries: items
                    .iter()
                    .filter_map(|(placement, entry)| {
                        placement.in_hour(hour).map(|continues| LayoutEntry {
                            continues,
                            ..entry.clone()
                        })
                    })
                    .collect(),
            })
            .collect();

        let untimed = items
            .into_iter()
            .filter(|(placement, _)| matches!(placement, Placement::Untimed))
            .map(|(_, entry)| entry)
            .collect();

        Self {
            date,
            part,
            rows,
            untimed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.untimed.is_empty() && self.rows.iter().all(|row| row.entries.is_empty())
    }
}

fn point_or_untimed(clock: Option<&str>) -> Placement {
    match clock.and_then(parse_clock_minutes) {
        Some(minutes) => Placement::Point(minutes),
        None => Placement::Untimed,
    }
}

fn with_emoji(emoji: Option<&str>, title: &str) -> String {
    match emoji.map(str::trim).filter(|e| !e.is_empty()) {
        Some(emoji) => format!("{emoji} {title}"),
        None => title.to_string(),
    }
}

/// Rows past hour 23 belong to the following day.
fn row_day(date: NaiveDate, hour: u32) -> Option<NaiveDate> {
    if hour >= 24 {
        date.succ_opt()
    } else {
        Some(date)
    }
}

/// Occurrences split for the events list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventsListing {
    pub upcoming: Vec<Occurrence>,
    pub past: Vec<Occurrence>,
}

impl EventsListing {
    /// Untimed occurrences count as ending at 23:59:59 of their day. Past
    /// occurrences older than `past_days` are left out.
    pub fn build(occurrences: Vec<Occurrence>, now: NaiveDateTime, past_days: i64) -> Self {
        let cutoff = Duration::try_days(past_days.max(0))
            .and_then(|back| now.date().checked_sub_signed(back))
            .unwrap_or(NaiveDate::MIN);
        let mut upcoming = Vec::new();
        let mut past = Vec::new();

        for occurrence in occurrences {
            let stamp = listing_instant(&occurrence);
            if stamp >= now {
                upcoming.push((stamp, occurrence));
            } else if occurrence.occurrence_date >= cutoff {
                past.push((stamp, occurrence));
            }
        }

        upcoming.sort_by_key(|(stamp, _)| *stamp);
        past.sort_by_key(|(stamp, _)| *stamp);

        Self {
            upcoming: upcoming.into_iter().map(|(_, o)| o).collect(),
            past: past.into_iter().map(|(_, o)| o).collect(),
        }
    }
}

fn listing_instant(occurrence: &Occurrence) -> NaiveDateTime {
    match occurrence.event.start_minutes() {
        Some(minutes) => at_minutes(occurrence.occurrence_date, minutes),
        None => at_minutes(occurrence.occurrence_date, MINUTES_PER_DAY - 1) + Duration::seconds(59),
    }
}

/// Done / total counter for a set of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub done: usize,
    pub total: usize,
}

impl TaskProgress {
    pub fn of(tasks: &[Task]) -> Self {
        Self {
            done: tasks.iter().filter(|t| t.done).count(),
            total: tasks.len(),
        }
    }

    pub fn percent(self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        u32::try_from(self.done * 100 / self.total).unwrap_or(100)
    }
}

/// Orders tasks by date then time; undated and untimed sort first.
pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by_cached_key(Task::sort_key);
}
