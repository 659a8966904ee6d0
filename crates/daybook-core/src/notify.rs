//! Notification planning, the timer scheduler and the desktop daemon.

mod daemon;
mod desktop;
mod plan;
mod scheduler;

pub use daemon::{FileWatcher, run_daemon};
pub use desktop::{DesktopNotifier, TimerFired, TokioTimerDriver};
pub use plan::{
    ItemKind, NotificationPayload, NotifyOffset, NotifySettings, PlannedNotification,
    ScheduleKey, plan_notifications,
};
pub use scheduler::{
    MAX_TIMER_DELAY, Notifier, Permission, ScheduleOutcome, Scheduler, TimerDriver,
};
