use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::layout::{DayLayout, EntryKind, EventsListing, LayoutEntry, TaskProgress};
use crate::model::{Category, Occurrence, Reminder, Task};
use crate::notify::{PlannedNotification, Permission};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    pub fn print_json<T: Serialize + ?Sized>(&mut self, value: &T) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, value)?;
        writeln!(out)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, occurrences))]
    pub fn print_agenda(&mut self, occurrences: &[Occurrence], today: NaiveDate) -> anyhow::Result<()> {
        if occurrences.is_empty() {
            println!("No events.");
            return Ok(());
        }
        let mut out = io::stdout().lock();
        let rows = occurrences
            .iter()
            .map(|o| self.occurrence_row(o, o.occurrence_date < today))
            .collect();
        write_table(&mut out, occurrence_headers(), rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, listing))]
    pub fn print_events_listing(&mut self, listing: &EventsListing) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if listing.upcoming.is_empty() && listing.past.is_empty() {
            writeln!(out, "No events.")?;
            return Ok(());
        }

        let mut rows: Vec<Vec<String>> = listing
            .upcoming
            .iter()
            .map(|o| self.occurrence_row(o, false))
            .collect();
        rows.extend(listing.past.iter().map(|o| self.occurrence_row(o, true)));
        write_table(&mut out, occurrence_headers(), rows)?;
        Ok(())
    }

    fn occurrence_row(&self, occurrence: &Occurrence, past: bool) -> Vec<String> {
        let event = &occurrence.event;
        let date = if past {
            self.paint(&event.date, "2")
        } else {
            event.date.clone()
        };
        let title = match event.emoji.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(emoji) => format!("{emoji} {}", event.title),
            None => event.title.clone(),
        };
        let buffers = match (event.pre_buffer.unwrap_or(0), event.post_buffer.unwrap_or(0)) {
            (0, 0) => String::new(),
            (pre, post) => format!("{pre}m/{post}m"),
        };
        vec![
            self.paint(&occurrence.base_id.to_string(), "33"),
            date,
            event.time_span_label(),
            title,
            event.location_text().unwrap_or_default().to_string(),
            buffers,
            event.repeat.rule().map(|_| event.repeat.to_string()).unwrap_or_default(),
        ]
    }

    #[tracing::instrument(skip(self, reminders))]
    pub fn print_reminders(&mut self, reminders: &[(String, Reminder)]) -> anyhow::Result<()> {
        if reminders.is_empty() {
            println!("No reminders.");
            return Ok(());
        }
        let mut out = io::stdout().lock();
        let headers = vec![
            "ID".to_string(),
            "Date".to_string(),
            "Time".to_string(),
            "Text".to_string(),
            "Notify".to_string(),
        ];
        let rows = reminders
            .iter()
            .map(|(id, reminder)| {
                vec![
                    self.paint(id, "33"),
                    reminder.date.clone(),
                    reminder.clock().unwrap_or_default().to_string(),
                    match reminder.emoji.as_deref().filter(|e| !e.trim().is_empty()) {
                        Some(emoji) => format!("{emoji} {}", reminder.display_text()),
                        None => reminder.display_text().to_string(),
                    },
                    reminder.notify_setting().unwrap_or_default().to_string(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tasks, categories))]
    pub fn print_tasks(&mut self, tasks: &[Task], categories: &[Category]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let progress = TaskProgress::of(tasks);
        if tasks.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }

        let names: HashMap<String, &str> = categories
            .iter()
            .map(|c| (c.id.to_string(), c.name.as_str()))
            .collect();

        let headers = vec![
            "ID".to_string(),
            " ".to_string(),
            "Date".to_string(),
            "Time".to_string(),
            "Pri".to_string(),
            "Category".to_string(),
            "Title".to_string(),
        ];
        let rows = tasks
            .iter()
            .map(|task| {
                let title = if task.done {
                    self.paint(task.display_title(), "9")
                } else {
                    task.display_title().to_string()
                };
                vec![
                    self.paint(&task.id.to_string(), "33"),
                    if task.done { "x".to_string() } else { " ".to_string() },
                    task.date.clone(),
                    task.time.clone(),
                    task.priority_marks(),
                    names
                        .get(&task.category)
                        .map(|name| (*name).to_string())
                        .unwrap_or_else(|| task.category.clone()),
                    title,
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        writeln!(
            out,
            "\n{} of {} done ({}%)",
            progress.done,
            progress.total,
            progress.percent()
        )?;
        Ok(())
    }

    #[tracing::instrument(skip(self, categories))]
    pub fn print_categories(&mut self, categories: &[Category]) -> anyhow::Result<()> {
        if categories.is_empty() {
            println!("No categories defined.");
            return Ok(());
        }
        let mut out = io::stdout().lock();
        let headers = vec!["ID".to_string(), "Name".to_string(), "Color".to_string()];
        let rows = categories
            .iter()
            .map(|c| {
                vec![
                    self.paint(&c.id.to_string(), "33"),
                    c.name.clone(),
                    c.color.clone(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, layout))]
    pub fn print_day(&mut self, layout: &DayLayout) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let (first, last) = match (layout.rows.first(), layout.rows.last()) {
            (Some(first), Some(last)) => (first.label.as_str(), last.label.as_str()),
            _ => ("", ""),
        };
        writeln!(
            out,
            "{} · {} view ({first} – {last})",
            layout.date.format("%A %Y-%m-%d"),
            layout.part
        )?;

        for entry in &layout.untimed {
            writeln!(out, "       {}", self.layout_entry(entry))?;
        }

        for row in &layout.rows {
            let label = if row.current {
                self.paint(&row.label, "7")
            } else {
                row.label.clone()
            };
            let entries = row
                .entries
                .iter()
                .map(|entry| self.layout_entry(entry))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(out, "{label}  {entries}")?;
        }

        if layout.is_empty() {
            writeln!(out, "No events for this day.")?;
        }
        Ok(())
    }

    fn layout_entry(&self, entry: &LayoutEntry) -> String {
        let marker = match entry.kind {
            EntryKind::Event => "",
            EntryKind::Reminder => "⏰ ",
            EntryKind::Task if entry.done => "[x] ",
            EntryKind::Task => "[ ] ",
        };
        let text = if entry.time.is_empty() {
            format!("{marker}{}", entry.label)
        } else {
            format!("{marker}{} {}", entry.time, entry.label)
        };
        let text = if entry.continues {
            format!("{text} …")
        } else {
            text
        };
        match entry.kind {
            EntryKind::Event => self.paint(&text, "36"),
            EntryKind::Reminder => self.paint(&text, "35"),
            EntryKind::Task => text,
        }
    }

    #[tracing::instrument(skip(self, plan))]
    pub fn print_plan(
        &mut self,
        plan: &[PlannedNotification],
        now: NaiveDateTime,
        grace: chrono::Duration,
        permission: Permission,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Notifications: {}", permission.as_str())?;
        if plan.is_empty() {
            writeln!(out, "Nothing to schedule.")?;
            return Ok(());
        }

        let headers = vec![
            "Fires".to_string(),
            "Offset".to_string(),
            "Key".to_string(),
            "Title".to_string(),
            "Body".to_string(),
        ];
        let rows = plan
            .iter()
            .map(|p| {
                let fires = p.fire_at.format("%Y-%m-%d %H:%M").to_string();
                let fires = if p.fire_at > now {
                    fires
                } else if now - p.fire_at < grace {
                    self.paint(&format!("{fires} (now)"), "32")
                } else {
                    self.paint(&format!("{fires} (missed)"), "2")
                };
                vec![
                    fires,
                    p.offset.to_string(),
                    p.key.to_string(),
                    p.payload.display_title(),
                    p.payload.body.clone(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn occurrence_headers() -> Vec<String> {
    ["ID", "Date", "Time", "Title", "Location", "Buffer", "Repeat"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| UnicodeWidthStr::width(header.as_str()))
        .collect();

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, &width) in headers.iter().zip(&widths) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;

    for &width in &widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
