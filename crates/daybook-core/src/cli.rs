use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::layout::DayPart;
use crate::notify::NotifyOffset;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "daybook",
    version,
    about = "Daybook: events, reminders and tasks with desktop notifications",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "rc-file", global = true)]
    pub rc_file: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage events
    Event {
        #[command(subcommand)]
        action: EventCommand,
    },
    /// Manage one-shot reminders
    Reminder {
        #[command(subcommand)]
        action: ReminderCommand,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Manage task categories
    Category {
        #[command(subcommand)]
        action: CategoryCommand,
    },
    /// Event occurrences in a date window (default: the next 7 days)
    Agenda(AgendaArgs),
    /// Hourly layout of one day
    Day(DayArgs),
    /// Desktop notifications
    Notify {
        #[command(subcommand)]
        action: NotifyCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct EventFields {
    /// First occurrence date (YYYY-MM-DD, today, tomorrow, monday, +3d, ...)
    #[arg(long)]
    pub date: Option<String>,

    #[arg(long = "start")]
    pub start_time: Option<String>,

    #[arg(long = "end")]
    pub end_time: Option<String>,

    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub emoji: Option<String>,

    /// Padding before the event, in minutes
    #[arg(long = "pre-buffer")]
    pub pre_buffer: Option<u32>,

    /// Padding after the event, in minutes
    #[arg(long = "post-buffer")]
    pub post_buffer: Option<u32>,

    /// none, daily, 2day (any Nday), weekly or monthly
    #[arg(long)]
    pub repeat: Option<String>,

    /// Last date a repeating event may occur on
    #[arg(long = "until")]
    pub repeat_until: Option<String>,

    #[arg(long, value_parser = parse_offset)]
    pub notify: Option<NotifyOffset>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum EventCommand {
    Add {
        title: String,

        #[command(flatten)]
        fields: EventFields,
    },
    Edit {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        fields: EventFields,
    },
    Delete {
        id: String,
    },
    /// Upcoming occurrences, then recently past ones
    List {
        /// How far ahead to look, in days
        #[arg(long, default_value_t = 30)]
        days: u32,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ReminderCommand {
    Add {
        text: String,

        #[arg(long, default_value = "today")]
        date: String,

        #[arg(long)]
        time: Option<String>,

        #[arg(long)]
        emoji: Option<String>,

        #[arg(long, value_parser = parse_offset)]
        notify: Option<NotifyOffset>,
    },
    List {
        /// Only reminders on this date
        #[arg(long)]
        date: Option<String>,

        #[arg(long)]
        json: bool,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    Add {
        title: String,

        #[arg(long)]
        date: Option<String>,

        #[arg(long)]
        time: Option<String>,

        /// Category id
        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value = "1", value_parser = ["1", "2", "3"])]
        priority: String,
    },
    List {
        /// Hide completed tasks
        #[arg(long)]
        pending: bool,

        #[arg(long)]
        json: bool,
    },
    Done {
        id: String,

        /// Mark the task as not done again
        #[arg(long)]
        undo: bool,
    },
    Delete {
        id: String,
    },
    /// Rewrite task dates into YYYY-MM-DD form
    Migrate,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CategoryCommand {
    Add {
        name: String,

        #[arg(long)]
        color: Option<String>,
    },
    List,
    /// Delete a category and clear it from tasks
    Delete {
        id: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct AgendaArgs {
    #[arg(long)]
    pub from: Option<String>,

    #[arg(long)]
    pub to: Option<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DayArgs {
    /// Defaults to today
    pub date: Option<String>,

    /// morning, day, night or all; defaults to the part containing the current hour
    #[arg(long)]
    pub part: Option<DayPart>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum NotifyCommand {
    /// Print the notifications that would be armed now
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// Run the notification daemon until interrupted
    Run,
}

fn parse_offset(raw: &str) -> anyhow::Result<NotifyOffset> {
    raw.parse()
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` / `rc.key:value` overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = if let Some((k, v)) = rest.split_once('=') {
                Some((format!("rc.{k}"), v.to_string()))
            } else if let Some((k, v)) = rest.split_once(':') {
                Some((format!("rc.{k}"), v.to_string()))
            } else {
                None
            };

            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}
