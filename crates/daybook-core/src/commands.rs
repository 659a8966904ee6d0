use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::cli::{
    AgendaArgs, CategoryCommand, Command, DayArgs, EventCommand, EventFields, NotifyCommand,
    ReminderCommand, TaskCommand,
};
use crate::config::Config;
use crate::datastore::{DataStore, new_text_id};
use crate::datetime::{
    add_days, format_iso_date, format_minutes, local_now, normalize_date, parse_clock_minutes,
    parse_date_expr,
};
use crate::layout::{DayLayout, DayPart, EventsListing, sort_tasks};
use crate::model::{Category, Event, Repeat, Reminder, Task, default_category_color};
use crate::notify::{
    DesktopNotifier, Notifier, NotifySettings, plan_notifications, run_daemon,
};
use crate::recurrence::occurrences_between;
use crate::render::Renderer;

const DEFAULT_AGENDA_DAYS: i64 = 7;
const MAX_PAST_DAYS: u64 = 3660;

#[instrument(skip_all)]
pub fn dispatch(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Option<Command>,
) -> anyhow::Result<()> {
    let now = local_now();
    let command = command.unwrap_or(Command::Agenda(AgendaArgs::default()));
    debug!(?command, "dispatching command");

    match command {
        Command::Event { action } => match action {
            EventCommand::Add { title, fields } => cmd_event_add(store, title, fields, now),
            EventCommand::Edit { id, title, fields } => cmd_event_edit(store, &id, title, fields, now),
            EventCommand::Delete { id } => cmd_event_delete(store, &id),
            EventCommand::List { days, json } => cmd_event_list(store, cfg, renderer, days, json, now),
        },
        Command::Reminder { action } => match action {
            ReminderCommand::Add {
                text,
                date,
                time,
                emoji,
                notify,
            } => cmd_reminder_add(store, text, &date, time, emoji, notify.map(|o| o.to_string()), now),
            ReminderCommand::List { date, json } => cmd_reminder_list(store, renderer, date, json, now),
            ReminderCommand::Delete { id } => cmd_reminder_delete(store, &id),
        },
        Command::Task { action } => match action {
            TaskCommand::Add {
                title,
                date,
                time,
                category,
                priority,
            } => cmd_task_add(store, title, date, time, category, priority, now),
            TaskCommand::List { pending, json } => cmd_task_list(store, renderer, pending, json),
            TaskCommand::Done { id, undo } => cmd_task_done(store, &id, !undo),
            TaskCommand::Delete { id } => cmd_task_delete(store, &id),
            TaskCommand::Migrate => cmd_task_migrate(store),
        },
        Command::Category { action } => match action {
            CategoryCommand::Add { name, color } => cmd_category_add(store, name, color),
            CategoryCommand::List => cmd_category_list(store, renderer),
            CategoryCommand::Delete { id } => cmd_category_delete(store, &id),
        },
        Command::Agenda(args) => cmd_agenda(store, renderer, args, now),
        Command::Day(args) => cmd_day(store, renderer, args, now),
        Command::Notify { action } => match action {
            NotifyCommand::Plan { json } => cmd_notify_plan(store, cfg, renderer, json, now),
            NotifyCommand::Run => cmd_notify_run(store, cfg),
        },
    }
}

#[instrument(skip(store, fields, now))]
fn cmd_event_add(
    store: &DataStore,
    title: String,
    fields: EventFields,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let title = require_text(title, "event title")?;
    let existing = store.events().load();
    let id = store.next_event_id(&existing);

    let mut event = Event::new(id, title, format_iso_date(now.date()));
    apply_event_fields(&mut event, fields, now.date())?;
    let event = store.add_event(event)?;

    info!(id = %event.id, date = %event.date, "event created");
    println!("Created event {}.", event.id);
    Ok(())
}

#[instrument(skip(store, fields, now))]
fn cmd_event_edit(
    store: &DataStore,
    id: &str,
    title: Option<String>,
    fields: EventFields,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let title = title.map(|t| require_text(t, "event title")).transpose()?;
    let event = store.update_event(id, |event| {
        if let Some(title) = title {
            event.title = title;
        }
        apply_event_fields(event, fields, now.date())
    })?;

    println!("Modified event {}.", event.id);
    Ok(())
}

#[instrument(skip(store))]
fn cmd_event_delete(store: &DataStore, id: &str) -> anyhow::Result<()> {
    let removed = store.delete_event(id)?;
    println!("Deleted event {} '{}'.", removed.id, removed.title);
    Ok(())
}

#[instrument(skip(store, cfg, renderer, now))]
fn cmd_event_list(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    days: u32,
    json: bool,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let past_days = cfg.get_days("events.past.days", 30, MAX_PAST_DAYS);
    let today = now.date();
    let occurrences = occurrences_between(
        store,
        add_days(today, -past_days),
        add_days(today, i64::from(days)),
    );
    let listing = EventsListing::build(occurrences, now, past_days);

    if json {
        renderer.print_json(&listing)
    } else {
        renderer.print_events_listing(&listing)
    }
}

/// Applies every field given on the command line; empty strings clear
/// optional text fields.
fn apply_event_fields(event: &mut Event, fields: EventFields, today: NaiveDate) -> anyhow::Result<()> {
    if let Some(date) = fields.date {
        event.date = resolve_date(&date, today)?;
    }
    if let Some(start) = fields.start_time {
        event.start_time = optional_clock(&start)?;
    }
    if let Some(end) = fields.end_time {
        event.end_time = optional_clock(&end)?;
    }
    if let Some(location) = fields.location {
        event.location = optional_text(location);
    }
    if let Some(emoji) = fields.emoji {
        event.emoji = optional_text(emoji);
    }
    if let Some(pre) = fields.pre_buffer {
        event.pre_buffer = Some(pre);
    }
    if let Some(post) = fields.post_buffer {
        event.post_buffer = Some(post);
    }
    if let Some(repeat) = fields.repeat {
        event.repeat = parse_repeat(&repeat)?;
    }
    if let Some(until) = fields.repeat_until {
        event.repeat_until = if until.trim().is_empty() {
            None
        } else {
            Some(resolve_date(&until, today)?)
        };
    }
    if let Some(notify) = fields.notify {
        event.notify = Some(notify.to_string());
    }

    if let Some(until) = event.repeat_until.as_deref() {
        if until < event.date.as_str() {
            warn!(id = %event.id, date = %event.date, until, "repeatUntil is before the first date");
        }
    }
    Ok(())
}

#[instrument(skip(store, text, now))]
fn cmd_reminder_add(
    store: &DataStore,
    text: String,
    date: &str,
    time: Option<String>,
    emoji: Option<String>,
    notify: Option<String>,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let text = require_text(text, "reminder text")?;
    let mut reminder = Reminder::new(new_text_id("rem"), resolve_date(date, now.date())?, text);
    reminder.time = match time {
        Some(time) => optional_clock(&time)?,
        None => None,
    };
    reminder.emoji = emoji.and_then(optional_text);
    reminder.notify = notify;

    let reminder = store.add_reminder(reminder)?;
    let id = reminder.id.map(|id| id.to_string()).unwrap_or_default();
    println!("Created reminder {id}.");
    Ok(())
}

#[instrument(skip(store, renderer, now))]
fn cmd_reminder_list(
    store: &DataStore,
    renderer: &mut Renderer,
    date: Option<String>,
    json: bool,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let only = date
        .map(|raw| resolve_date(&raw, now.date()))
        .transpose()?;

    let mut listed: Vec<(String, Reminder)> = store
        .reminders()
        .load()
        .into_iter()
        .enumerate()
        .map(|(idx, reminder)| {
            let id = reminder
                .id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("idx{idx}"));
            (id, reminder)
        })
        .filter(|(_, reminder)| {
            only.as_deref()
                .is_none_or(|day| normalize_date(&reminder.date) == day)
        })
        .collect();
    listed.sort_by_cached_key(|(_, reminder)| {
        (
            normalize_date(&reminder.date),
            reminder.clock().and_then(parse_clock_minutes),
        )
    });

    if json {
        let reminders: Vec<&Reminder> = listed.iter().map(|(_, reminder)| reminder).collect();
        renderer.print_json(&reminders)
    } else {
        renderer.print_reminders(&listed)
    }
}

#[instrument(skip(store))]
fn cmd_reminder_delete(store: &DataStore, id: &str) -> anyhow::Result<()> {
    let removed = store.delete_reminder(id)?;
    println!("Deleted reminder '{}'.", removed.display_text());
    Ok(())
}

#[instrument(skip(store, title, now))]
fn cmd_task_add(
    store: &DataStore,
    title: String,
    date: Option<String>,
    time: Option<String>,
    category: Option<String>,
    priority: String,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let title = require_text(title, "task title")?;
    let mut task = Task::new(new_text_id("task"), title, Local::now().to_rfc3339());
    if let Some(date) = date {
        task.date = resolve_date(&date, now.date())?;
    }
    if let Some(time) = time {
        task.time = optional_clock(&time)?.unwrap_or_default();
    }
    if let Some(category) = category.and_then(optional_text) {
        let known = store.categories().load();
        let found = known
            .iter()
            .find(|c| c.id.matches(&category) || c.name.eq_ignore_ascii_case(&category))
            .ok_or_else(|| anyhow!("unknown category: {category}"))?;
        task.category = found.id.to_string();
    }
    task.priority = priority;

    let task = store.add_task(task)?;
    println!("Created task {}.", task.id);
    Ok(())
}

#[instrument(skip(store, renderer))]
fn cmd_task_list(
    store: &DataStore,
    renderer: &mut Renderer,
    pending_only: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut tasks = store.tasks().load();
    if pending_only {
        tasks.retain(|t| !t.done);
    }
    sort_tasks(&mut tasks);

    if json {
        renderer.print_json(&tasks)
    } else {
        let categories = store.categories().load();
        renderer.print_tasks(&tasks, &categories)
    }
}

#[instrument(skip(store))]
fn cmd_task_done(store: &DataStore, id: &str, done: bool) -> anyhow::Result<()> {
    let task = store.set_task_done(id, done)?;
    if done {
        println!("Completed task {}.", task.id);
    } else {
        println!("Reopened task {}.", task.id);
    }
    Ok(())
}

#[instrument(skip(store))]
fn cmd_task_delete(store: &DataStore, id: &str) -> anyhow::Result<()> {
    let removed = store.delete_task(id)?;
    println!("Deleted task '{}'.", removed.display_title());
    Ok(())
}

#[instrument(skip(store))]
fn cmd_task_migrate(store: &DataStore) -> anyhow::Result<()> {
    let changed = store.normalize_task_dates()?;
    println!("Normalized {changed} task date(s).");
    Ok(())
}

#[instrument(skip(store))]
fn cmd_category_add(store: &DataStore, name: String, color: Option<String>) -> anyhow::Result<()> {
    let name = require_text(name, "category name")?;
    let color = match color {
        Some(color) => validate_color(&color)?,
        None => default_category_color(),
    };
    let category = store.add_category(Category {
        id: new_text_id("cat"),
        name,
        color,
    })?;
    println!("Created category {} '{}'.", category.id, category.name);
    Ok(())
}

#[instrument(skip(store, renderer))]
fn cmd_category_list(store: &DataStore, renderer: &mut Renderer) -> anyhow::Result<()> {
    let categories = store.categories().load();
    renderer.print_categories(&categories)
}

#[instrument(skip(store))]
fn cmd_category_delete(store: &DataStore, id: &str) -> anyhow::Result<()> {
    let removed = store.delete_category(id)?;
    println!("Deleted category '{}'.", removed.name);
    Ok(())
}

#[instrument(skip(store, renderer, now))]
fn cmd_agenda(
    store: &DataStore,
    renderer: &mut Renderer,
    args: AgendaArgs,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let today = now.date();
    let from = match args.from {
        Some(raw) => parse_date_expr(&raw, today)?,
        None => today,
    };
    let to = match args.to {
        Some(raw) => parse_date_expr(&raw, today)?,
        None => add_days(from, DEFAULT_AGENDA_DAYS),
    };
    if to < from {
        return Err(anyhow!("agenda window ends before it starts: {from} > {to}"));
    }

    let occurrences = occurrences_between(store, from, to);
    if args.json {
        renderer.print_json(&occurrences)
    } else {
        renderer.print_agenda(&occurrences, today)
    }
}

#[instrument(skip(store, renderer, now))]
fn cmd_day(
    store: &DataStore,
    renderer: &mut Renderer,
    args: DayArgs,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let date = match args.date {
        Some(raw) => parse_date_expr(&raw, now.date())?,
        None => now.date(),
    };
    let part = args.part.unwrap_or_else(|| DayPart::for_hour(now.hour()));

    let occurrences = occurrences_between(store, date, date);
    let reminders = store.reminders().load();
    let tasks = store.tasks().load();
    let layout = DayLayout::build(date, part, &occurrences, &reminders, &tasks, now);

    if args.json {
        renderer.print_json(&layout)
    } else {
        renderer.print_day(&layout)
    }
}

#[instrument(skip(store, cfg, renderer, now))]
fn cmd_notify_plan(
    store: &DataStore,
    cfg: &Config,
    renderer: &mut Renderer,
    json: bool,
    now: NaiveDateTime,
) -> anyhow::Result<()> {
    let settings = NotifySettings::from_config(cfg);
    let events = store.events().load();
    let reminders = store.reminders().load();
    let plan = plan_notifications(&events, &reminders, &settings, now);

    if json {
        renderer.print_json(&plan)
    } else {
        let permission = DesktopNotifier::new(settings.enabled).permission();
        renderer.print_plan(&plan, now, settings.grace, permission)
    }
}

#[instrument(skip(store, cfg))]
fn cmd_notify_run(store: &DataStore, cfg: &Config) -> anyhow::Result<()> {
    let settings = NotifySettings::from_config(cfg);
    run_daemon(store, settings).context("notification daemon failed")
}

fn resolve_date(raw: &str, today: NaiveDate) -> anyhow::Result<String> {
    parse_date_expr(raw, today).map(format_iso_date)
}

/// `HH:MM` for a clock string, `None` for an empty one.
fn optional_clock(raw: &str) -> anyhow::Result<Option<String>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_clock_minutes(raw)
        .map(|minutes| Some(format_minutes(minutes)))
        .ok_or_else(|| anyhow!("invalid time '{raw}' (expected HH:MM or H[:MM]am/pm)"))
}

fn optional_text(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn require_text(raw: String, what: &str) -> anyhow::Result<String> {
    optional_text(raw).ok_or_else(|| anyhow!("{what} cannot be empty"))
}

fn parse_repeat(raw: &str) -> anyhow::Result<Repeat> {
    match Repeat::parse(raw) {
        Repeat::Unrecognized(other) => Err(anyhow!(
            "unknown repeat rule '{other}' (expected none, daily, Nday, weekly or monthly)"
        )),
        repeat => Ok(repeat),
    }
}

fn color_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}){1,2}$").ok())
        .as_ref()
}

fn validate_color(raw: &str) -> anyhow::Result<String> {
    let color = raw.trim();
    let re = color_re().ok_or_else(|| anyhow!("color pattern failed to compile"))?;
    if re.is_match(color) {
        Ok(color.to_ascii_lowercase())
    } else {
        Err(anyhow!("invalid color '{raw}' (expected #rgb or #rrggbb)"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{apply_event_fields, optional_clock, parse_repeat, validate_color};
    use crate::cli::EventFields;
    use crate::model::{Event, ItemId, Repeat, RepeatRule};

    #[test]
    fn clock_inputs_are_normalized() {
        assert_eq!(optional_clock("7:05pm").expect("valid"), Some("19:05".to_string()));
        assert_eq!(optional_clock("  ").expect("empty"), None);
        assert!(optional_clock("25:00").is_err());
    }

    #[test]
    fn repeat_inputs_must_be_known() {
        assert_eq!(
            parse_repeat("2day").expect("known"),
            Repeat::Rule(RepeatRule::Every { days: 2 })
        );
        assert!(parse_repeat("yearly").is_err());
    }

    #[test]
    fn colors_are_hex() {
        assert_eq!(validate_color("#FFD54F").expect("valid"), "#ffd54f");
        assert!(validate_color("yellow").is_err());
    }

    #[test]
    fn event_fields_apply_and_clear() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        let mut event = Event::new(ItemId::Int(1), "Run".to_string(), "2024-03-01".to_string());
        event.location = Some("Park".to_string());

        apply_event_fields(
            &mut event,
            EventFields {
                date: Some("tomorrow".to_string()),
                start_time: Some("6am".to_string()),
                location: Some(String::new()),
                repeat: Some("weekly".to_string()),
                ..EventFields::default()
            },
            today,
        )
        .expect("apply");

        assert_eq!(event.date, "2024-03-02");
        assert_eq!(event.start_time.as_deref(), Some("06:00"));
        assert_eq!(event.location, None);
        assert_eq!(event.repeat, Repeat::Rule(RepeatRule::Weekly));
    }
}
