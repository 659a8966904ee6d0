use std::ffi::OsString;
use std::fs;

use chrono::{NaiveDate, NaiveDateTime};
use daybook_core::datastore::{Collection, DataStore};
use daybook_core::layout::{DayLayout, DayPart, EntryKind};
use daybook_core::model::{Event, ItemId, Repeat, RepeatRule, Reminder, Task};
use daybook_core::notify::{NotifySettings, plan_notifications};
use daybook_core::recurrence::occurrences_between;
use tempfile::tempdir;

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
}

fn at(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").expect("datetime")
}

fn standup() -> Event {
    let mut event = Event::new(ItemId::Int(1), "Standup".to_string(), "2024-03-01".to_string());
    event.start_time = Some("09:00".to_string());
    event.end_time = Some("09:30".to_string());
    event.repeat = Repeat::Rule(RepeatRule::Daily);
    event.repeat_until = Some("2024-03-03".to_string());
    event.notify = Some("at".to_string());
    event
}

#[test]
fn daily_event_expands_and_lays_out() {
    let temp = tempdir().expect("tempdir");
    let store = DataStore::open(temp.path()).expect("open datastore");
    store.add_event(standup()).expect("add event");

    let mut reminder = Reminder::new(
        ItemId::from("rem:1"),
        "2024-03-02".to_string(),
        "Call the bank".to_string(),
    );
    reminder.time = Some("10:00".to_string());
    store.add_reminder(reminder).expect("add reminder");

    let mut task = Task::new(
        ItemId::from("task:1"),
        "File report".to_string(),
        "2024-03-01T08:00:00+00:00".to_string(),
    );
    task.date = "2024-03-02".to_string();
    task.time = "11:00".to_string();
    store.add_task(task).expect("add task");

    let occurrences = occurrences_between(&store, date("2024-03-01"), date("2024-03-10"));
    let dates: Vec<NaiveDate> = occurrences.iter().map(|o| o.occurrence_date).collect();
    assert_eq!(
        dates,
        vec![date("2024-03-01"), date("2024-03-02"), date("2024-03-03")]
    );
    assert!(occurrences.iter().all(|o| o.base_id == ItemId::Int(1)));

    let layout = DayLayout::build(
        date("2024-03-02"),
        DayPart::Day,
        &occurrences,
        &store.reminders().load(),
        &store.tasks().load(),
        at("2024-03-02 10:15"),
    );
    let kinds_at = |hour: u32| -> Vec<EntryKind> {
        layout
            .rows
            .iter()
            .find(|row| row.hour == hour)
            .map(|row| row.entries.iter().map(|e| e.kind).collect())
            .unwrap_or_default()
    };
    assert_eq!(kinds_at(9), vec![EntryKind::Event]);
    assert_eq!(kinds_at(10), vec![EntryKind::Reminder]);
    assert_eq!(kinds_at(11), vec![EntryKind::Task]);
    assert!(layout.untimed.is_empty());

    let current: Vec<u32> = layout.rows.iter().filter(|r| r.current).map(|r| r.hour).collect();
    assert_eq!(current, vec![10]);
}

#[test]
fn date_keyed_reminders_feed_the_notification_plan() {
    let temp = tempdir().expect("tempdir");
    let store = DataStore::open(temp.path()).expect("open datastore");
    store.add_event(standup()).expect("add event");
    fs::write(
        store.path_for(Collection::Reminders),
        r#"{"2024-03-02":[{"text":"Call the bank","time":"10:00","notify":"15m"}]}"#,
    )
    .expect("write reminders");

    let plan = plan_notifications(
        &store.events().load(),
        &store.reminders().load(),
        &NotifySettings::default(),
        at("2024-03-02 08:00"),
    );

    let keys: Vec<String> = plan.iter().map(|p| p.key.to_string()).collect();
    assert_eq!(
        keys,
        vec![
            "event|1|2024-03-02".to_string(),
            "reminder|idx0|2024-03-02".to_string(),
            "event|1|2024-03-03".to_string(),
        ]
    );
    assert_eq!(plan[1].fire_at, at("2024-03-02 09:45"));
}

#[test]
fn corrupt_events_file_reads_as_empty() {
    let temp = tempdir().expect("tempdir");
    let store = DataStore::open(temp.path()).expect("open datastore");
    fs::write(store.path_for(Collection::Events), "{not json").expect("write corrupt file");

    assert!(occurrences_between(&store, date("2024-03-01"), date("2024-03-31")).is_empty());
    assert!(temp.path().join("events.json.corrupt").exists());

    store.add_event(standup()).expect("add after recovery");
    assert_eq!(store.events().load().len(), 1);
}

#[test]
fn writes_signal_subscribers() {
    let temp = tempdir().expect("tempdir");
    let store = DataStore::open(temp.path()).expect("open datastore");
    let mut changes = store.subscribe();

    store
        .add_reminder(Reminder::new(
            ItemId::from("rem:1"),
            "2024-03-02".to_string(),
            "Water plants".to_string(),
        ))
        .expect("add reminder");

    let change = changes.try_recv().expect("change signal");
    assert_eq!(change.collection, Collection::Reminders);
}

#[test]
fn cli_commands_write_to_the_data_directory() {
    let temp = tempdir().expect("tempdir");
    let data = temp.path().join("data");
    let rc = temp.path().join("daybookrc");
    fs::write(&rc, "color=off\n").expect("write rc");

    let invoke = |extra: &[&str]| {
        let mut args: Vec<OsString> = vec![
            "daybook".into(),
            "--rc-file".into(),
            rc.clone().into_os_string(),
            "--data".into(),
            data.clone().into_os_string(),
        ];
        args.extend(extra.iter().map(OsString::from));
        daybook_core::run(args)
    };

    invoke(&[
        "event", "add", "Standup", "--date", "2024-03-01", "--start", "9am", "--repeat",
        "daily", "--until", "2024-03-03",
    ])
    .expect("event add");
    invoke(&["event", "edit", "1", "--end", "09:30"]).expect("event edit");
    invoke(&["category", "add", "Work"]).expect("category add");
    invoke(&["task", "add", "File report", "--category", "work", "--priority", "2"])
        .expect("task add");

    let store = DataStore::open(&data).expect("reopen datastore");
    let events = store.events().load();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, ItemId::Int(1));
    assert_eq!(events[0].start_time.as_deref(), Some("09:00"));
    assert_eq!(events[0].end_time.as_deref(), Some("09:30"));

    let categories = store.categories().load();
    let tasks = store.tasks().load();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].category, categories[0].id.to_string());
    assert_eq!(tasks[0].priority, "2");

    invoke(&["category", "delete", &categories[0].id.to_string()]).expect("category delete");
    assert_eq!(store.tasks().load()[0].category, "");

    assert!(invoke(&["event", "delete", "42"]).is_err());
}
