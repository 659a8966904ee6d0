use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datetime::{normalize_date, parse_clock_minutes, parse_iso_date};

/// Identifier of a stored record. Older data uses integers, newer records use
/// prefixed strings; both are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Int(i64),
    Text(String),
}

impl ItemId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ItemId::Int(value) => Some(*value),
            ItemId::Text(_) => None,
        }
    }

    /// Matches a user supplied token against this id (`7` matches `Int(7)`).
    pub fn matches(&self, token: &str) -> bool {
        match self {
            ItemId::Int(value) => token.trim().parse::<i64>().ok() == Some(*value),
            ItemId::Text(text) => text == token.trim(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Int(value) => write!(f, "{value}"),
            ItemId::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        ItemId::Int(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepeatRule {
    Daily,
    Every { days: u32 },
    Weekly,
    Monthly,
}

/// Recurrence setting of an event as stored.
///
/// Unknown strings are kept so saving does not lose them, but they expand
/// exactly like [`Repeat::None`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Repeat {
    #[default]
    None,
    Rule(RepeatRule),
    Unrecognized(String),
}

impl Repeat {
    pub fn parse(raw: &str) -> Self {
        let token = raw.trim().to_ascii_lowercase();
        match token.as_str() {
            "" | "none" => Repeat::None,
            "daily" => Repeat::Rule(RepeatRule::Daily),
            "weekly" => Repeat::Rule(RepeatRule::Weekly),
            "monthly" => Repeat::Rule(RepeatRule::Monthly),
            other => match other.strip_suffix("day").map(str::parse::<u32>) {
                Some(Ok(days)) if days > 0 => Repeat::Rule(RepeatRule::Every { days }),
                _ => Repeat::Unrecognized(raw.to_string()),
            },
        }
    }

    pub fn rule(&self) -> Option<RepeatRule> {
        match self {
            Repeat::Rule(rule) => Some(*rule),
            Repeat::None | Repeat::Unrecognized(_) => None,
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Repeat::None => "none".to_string(),
            Repeat::Rule(RepeatRule::Daily) => "daily".to_string(),
            Repeat::Rule(RepeatRule::Every { days }) => format!("{days}day"),
            Repeat::Rule(RepeatRule::Weekly) => "weekly".to_string(),
            Repeat::Rule(RepeatRule::Monthly) => "monthly".to_string(),
            Repeat::Unrecognized(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for Repeat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Repeat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => Repeat::None,
            Value::String(raw) => Repeat::parse(&raw),
            other => Repeat::Unrecognized(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: ItemId,

    pub title: String,

    pub date: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_buffer: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_buffer: Option<u32>,

    #[serde(default)]
    pub repeat: Repeat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_until: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(id: ItemId, title: String, date: String) -> Self {
        Self {
            id,
            title,
            date,
            start_time: None,
            end_time: None,
            location: None,
            emoji: None,
            pre_buffer: None,
            post_buffer: None,
            repeat: Repeat::None,
            repeat_until: None,
            notify: None,
            extra: BTreeMap::new(),
        }
    }

    /// Start time, falling back to the legacy `time` field.
    pub fn start_clock(&self) -> Option<&str> {
        non_empty(self.start_time.as_deref()).or_else(|| extra_str(&self.extra, "time"))
    }

    pub fn start_minutes(&self) -> Option<u32> {
        self.start_clock().and_then(parse_clock_minutes)
    }

    pub fn end_minutes(&self) -> Option<u32> {
        non_empty(self.end_time.as_deref()).and_then(parse_clock_minutes)
    }

    pub fn location_text(&self) -> Option<&str> {
        non_empty(self.location.as_deref()).or_else(|| extra_str(&self.extra, "place"))
    }

    /// "09:00–10:30", "09:00" or empty.
    pub fn time_span_label(&self) -> String {
        let start = self.start_clock().unwrap_or_default();
        match non_empty(self.end_time.as_deref()) {
            Some(end) => format!("{start}–{end}"),
            None => start.to_string(),
        }
    }

    pub fn notify_setting(&self) -> Option<&str> {
        non_empty(self.notify.as_deref()).or_else(|| extra_str(&self.extra, "eventNotify"))
    }
}

/// A concrete instance of an [`Event`] on one date.
///
/// `event.date` already holds the occurrence date; `base_id` points back at
/// the stored record so edits can be applied to it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Occurrence {
    #[serde(flatten)]
    pub event: Event,

    #[serde(rename = "occurrenceDate")]
    pub occurrence_date: chrono::NaiveDate,

    #[serde(rename = "_baseId")]
    pub base_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,

    #[serde(default)]
    pub date: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(default)]
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Reminder {
    pub fn new(id: ItemId, date: String, text: String) -> Self {
        Self {
            id: Some(id),
            date,
            time: None,
            text,
            notify: None,
            emoji: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn display_text(&self) -> &str {
        non_empty(Some(self.text.as_str()))
            .or_else(|| extra_str(&self.extra, "title"))
            .unwrap_or("Reminder")
    }

    pub fn clock(&self) -> Option<&str> {
        non_empty(self.time.as_deref()).or_else(|| extra_str(&self.extra, "reminderTime"))
    }

    pub fn notify_setting(&self) -> Option<&str> {
        non_empty(self.notify.as_deref()).or_else(|| extra_str(&self.extra, "reminderNotify"))
    }

    pub fn day(&self) -> Option<chrono::NaiveDate> {
        parse_iso_date(&self.date)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: ItemId,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub date: String,

    #[serde(default)]
    pub time: String,

    #[serde(default)]
    pub category: String,

    #[serde(default = "default_priority")]
    pub priority: String,

    #[serde(default)]
    pub done: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_priority() -> String {
    "1".to_string()
}

impl Task {
    pub fn new(id: ItemId, title: String, created: String) -> Self {
        Self {
            id,
            title,
            date: String::new(),
            time: String::new(),
            category: String::new(),
            priority: default_priority(),
            done: false,
            created: Some(created),
            extra: BTreeMap::new(),
        }
    }

    pub fn display_title(&self) -> &str {
        non_empty(Some(self.title.as_str()))
            .or_else(|| extra_str(&self.extra, "text"))
            .unwrap_or("(no title)")
    }

    /// Sort key `(date, time)` with dates canonicalized first.
    pub fn sort_key(&self) -> (String, Option<u32>) {
        (normalize_date(&self.date), parse_clock_minutes(&self.time))
    }

    pub fn priority_marks(&self) -> String {
        match self.priority.as_str() {
            "1" => "!".to_string(),
            "2" => "!!".to_string(),
            "3" => "!!!".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub id: ItemId,
    pub name: String,
    #[serde(default = "default_category_color")]
    pub color: String,
}

pub fn default_category_color() -> String {
    "#ffd54f".to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn extra_str<'a>(extra: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    non_empty(extra.get(key).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Event, ItemId, Repeat, RepeatRule, Reminder, Task};

    #[test]
    fn repeat_strings_map_to_rules() {
        assert_eq!(Repeat::parse("none"), Repeat::None);
        assert_eq!(Repeat::parse("daily"), Repeat::Rule(RepeatRule::Daily));
        assert_eq!(
            Repeat::parse("2day"),
            Repeat::Rule(RepeatRule::Every { days: 2 })
        );
        assert_eq!(Repeat::parse("Weekly"), Repeat::Rule(RepeatRule::Weekly));
        assert_eq!(
            Repeat::parse("yearly"),
            Repeat::Unrecognized("yearly".to_string())
        );
        assert_eq!(
            Repeat::parse("0day"),
            Repeat::Unrecognized("0day".to_string())
        );
    }

    #[test]
    fn event_json_keeps_unknown_fields_and_repeat_text() {
        let raw = json!({
            "id": 3,
            "title": "Standup",
            "date": "2024-03-01",
            "time": "09:15",
            "repeat": "fortnightly",
            "colour": "teal"
        });
        let event: Event = serde_json::from_value(raw).expect("event parses");
        assert_eq!(event.id, ItemId::Int(3));
        assert_eq!(event.start_clock(), Some("09:15"));
        assert_eq!(event.start_minutes(), Some(555));
        assert_eq!(event.repeat.rule(), None);

        let back = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(back["repeat"], "fortnightly");
        assert_eq!(back["colour"], "teal");
        assert_eq!(back["time"], "09:15");
    }

    #[test]
    fn missing_repeat_is_none() {
        let event: Event = serde_json::from_value(json!({
            "id": "ev:1",
            "title": "Lunch",
            "date": "2024-03-01",
            "repeat": null
        }))
        .expect("event parses");
        assert_eq!(event.repeat, Repeat::None);
        assert_eq!(event.id.to_string(), "ev:1");
    }

    #[test]
    fn legacy_reminder_and_task_fields_are_honoured() {
        let reminder: Reminder = serde_json::from_value(json!({
            "date": "2024-03-01",
            "title": "Call mum",
            "reminderTime": "18:00"
        }))
        .expect("reminder parses");
        assert_eq!(reminder.display_text(), "Call mum");
        assert_eq!(reminder.clock(), Some("18:00"));
        assert!(reminder.id.is_none());

        let task: Task = serde_json::from_value(json!({
            "id": "task:1",
            "text": "Buy milk",
            "priority": "3"
        }))
        .expect("task parses");
        assert_eq!(task.display_title(), "Buy milk");
        assert_eq!(task.priority_marks(), "!!!");
    }

    #[test]
    fn ids_match_user_tokens() {
        assert!(ItemId::Int(7).matches("7"));
        assert!(!ItemId::Int(7).matches("07x"));
        assert!(ItemId::from("rem:abc").matches("rem:abc"));
    }
}
