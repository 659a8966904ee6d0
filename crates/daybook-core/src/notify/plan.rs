use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{Duration, NaiveDateTime};
use serde::{Serialize, Serializer};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::datetime::{add_days, at_minutes, normalize_date, to_minutes_of_day};
use crate::model::{Event, Reminder};
use crate::recurrence::expand_all;

const MAX_GRACE_MINUTES: u64 = 1440;
const MAX_LOOKAHEAD_DAYS: u64 = 3660;

/// How long before an occurrence a notification fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NotifyOffset {
    #[default]
    None,
    At,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    OneDay,
}

impl NotifyOffset {
    pub const ALL: [NotifyOffset; 8] = [
        NotifyOffset::None,
        NotifyOffset::At,
        NotifyOffset::FiveMinutes,
        NotifyOffset::FifteenMinutes,
        NotifyOffset::ThirtyMinutes,
        NotifyOffset::OneHour,
        NotifyOffset::TwoHours,
        NotifyOffset::OneDay,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        let token = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|offset| offset.as_str() == token)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotifyOffset::None => "none",
            NotifyOffset::At => "at",
            NotifyOffset::FiveMinutes => "5m",
            NotifyOffset::FifteenMinutes => "15m",
            NotifyOffset::ThirtyMinutes => "30m",
            NotifyOffset::OneHour => "1h",
            NotifyOffset::TwoHours => "2h",
            NotifyOffset::OneDay => "1d",
        }
    }

    /// Minutes before the occurrence, or `None` when nothing is scheduled.
    pub fn minutes(self) -> Option<i64> {
        match self {
            NotifyOffset::None => None,
            NotifyOffset::At => Some(0),
            NotifyOffset::FiveMinutes => Some(5),
            NotifyOffset::FifteenMinutes => Some(15),
            NotifyOffset::ThirtyMinutes => Some(30),
            NotifyOffset::OneHour => Some(60),
            NotifyOffset::TwoHours => Some(120),
            NotifyOffset::OneDay => Some(1440),
        }
    }

    /// The item's own setting when it is a known offset, else `default`.
    pub fn resolve(item_value: Option<&str>, default: NotifyOffset) -> NotifyOffset {
        let Some(raw) = item_value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return default;
        };
        match NotifyOffset::parse(raw) {
            Some(offset) => offset,
            None => {
                warn!(value = %raw, fallback = default.as_str(), "unknown notify offset");
                default
            }
        }
    }
}

impl fmt::Display for NotifyOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifyOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotifyOffset::parse(s).ok_or_else(|| {
            anyhow!("unknown notify offset '{s}' (expected none, at, 5m, 15m, 30m, 1h, 2h or 1d)")
        })
    }
}

impl Serialize for NotifyOffset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKind {
    Event,
    Reminder,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Reminder => "reminder",
        }
    }

    fn url(self) -> &'static str {
        match self {
            ItemKind::Event => "index.html#events",
            ItemKind::Reminder => "index.html#reminders",
        }
    }
}

/// Identity of one pending notification, rendered `kind|id|date`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    pub kind: ItemKind,
    pub id: String,
    pub date: String,
}

impl ScheduleKey {
    pub fn new(kind: ItemKind, id: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            date: date.into(),
        }
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.kind.as_str(), self.id, self.date)
    }
}

impl Serialize for ScheduleKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What the platform notification layer receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub emoji: String,
    pub icon: String,
    pub url: String,
    pub tag: String,
}

impl NotificationPayload {
    /// Title as shown, with the emoji in front when there is one.
    pub fn display_title(&self) -> String {
        if self.emoji.is_empty() {
            self.title.clone()
        } else {
            format!("{} {}", self.emoji, self.title)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySettings {
    pub enabled: bool,
    pub event_default: NotifyOffset,
    pub reminder_default: NotifyOffset,
    pub lookahead_days: i64,
    pub grace: Duration,
    pub default_time_minutes: u32,
    pub icon: String,
    pub rollover_seconds: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self::from_config(&Config::defaults())
    }
}

impl NotifySettings {
    #[instrument(skip(cfg))]
    pub fn from_config(cfg: &Config) -> Self {
        let offset = |key: &str| {
            NotifyOffset::resolve(cfg.get(key).as_deref(), NotifyOffset::None)
        };
        let settings = Self {
            enabled: cfg.get_bool("notify.enabled").unwrap_or(true),
            event_default: offset("notify.event.default"),
            reminder_default: offset("notify.reminder.default"),
            lookahead_days: cfg.get_days("notify.lookahead.days", 30, MAX_LOOKAHEAD_DAYS),
            grace: Duration::minutes(cfg.get_days("notify.grace.minutes", 5, MAX_GRACE_MINUTES)),
            default_time_minutes: cfg.get_clock_minutes("notify.default.time", 9 * 60),
            icon: cfg
                .get("notify.icon")
                .unwrap_or_else(|| "x-office-calendar".to_string()),
            rollover_seconds: cfg.get_bounded("notify.rollover.seconds", 30, 3600).max(1),
        };
        debug!(?settings, "notify settings");
        settings
    }
}

/// A notification the scheduler should arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNotification {
    pub key: ScheduleKey,
    #[serde(rename = "fireAt")]
    pub fire_at: NaiveDateTime,
    pub offset: NotifyOffset,
    pub payload: NotificationPayload,
}

/// Derives every notification for the current data.
///
/// Events are expanded from today through `lookahead_days`; reminders are
/// one-shot and all of them are planned. Items whose offset resolves to
/// `none` are skipped. Stale fire times are left in; the scheduler decides
/// whether they are still inside the grace window.
#[instrument(skip(events, reminders, settings), fields(events = events.len(), reminders = reminders.len()))]
pub fn plan_notifications(
    events: &[Event],
    reminders: &[Reminder],
    settings: &NotifySettings,
    now: NaiveDateTime,
) -> Vec<PlannedNotification> {
    let mut planned = Vec::new();

    for (idx, reminder) in reminders.iter().enumerate() {
        let offset = NotifyOffset::resolve(reminder.notify_setting(), settings.reminder_default);
        let Some(minutes_before) = offset.minutes() else {
            continue;
        };
        let Some(day) = reminder.day() else {
            debug!(index = idx, date = %reminder.date, "reminder without usable date");
            continue;
        };
        let date_iso = normalize_date(&reminder.date);

        let clock = reminder.clock().unwrap_or_default();
        let fire_at = at_minutes(day, to_minutes_of_day(clock, settings.default_time_minutes))
            - Duration::minutes(minutes_before);

        let id = reminder
            .id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("idx{idx}"));
        let key = ScheduleKey::new(ItemKind::Reminder, id, date_iso.clone());
        let body = join_body([date_iso.as_str(), clock]);

        planned.push(PlannedNotification {
            payload: payload(
                &key,
                reminder.display_text(),
                body,
                reminder.emoji.as_deref(),
                settings,
            ),
            key,
            fire_at,
            offset,
        });
    }

    let today = now.date();
    let window_end = add_days(today, settings.lookahead_days);
    for occurrence in expand_all(events, today, window_end) {
        let event = &occurrence.event;
        let offset = NotifyOffset::resolve(event.notify_setting(), settings.event_default);
        let Some(minutes_before) = offset.minutes() else {
            continue;
        };

        let start = event
            .start_minutes()
            .unwrap_or(settings.default_time_minutes);
        let fire_at = at_minutes(occurrence.occurrence_date, start) - Duration::minutes(minutes_before);

        let key = ScheduleKey::new(
            ItemKind::Event,
            occurrence.base_id.to_string(),
            event.date.clone(),
        );
        let span = event.time_span_label();
        let body = join_body([
            event.date.as_str(),
            span.as_str(),
            event.location_text().unwrap_or_default(),
        ]);
        let title = if event.title.trim().is_empty() {
            "Event"
        } else {
            event.title.as_str()
        };

        planned.push(PlannedNotification {
            payload: payload(&key, title, body, event.emoji.as_deref(), settings),
            key,
            fire_at,
            offset,
        });
    }

    planned.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.key.cmp(&b.key)));
    debug!(count = planned.len(), "planned notifications");
    planned
}

fn payload(
    key: &ScheduleKey,
    title: &str,
    body: String,
    emoji: Option<&str>,
    settings: &NotifySettings,
) -> NotificationPayload {
    NotificationPayload {
        title: title.to_string(),
        body,
        emoji: emoji.map(str::trim).unwrap_or_default().to_string(),
        icon: settings.icon.clone(),
        url: key.kind.url().to_string(),
        tag: key.to_string(),
    }
}

fn join_body<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" • ")
}
