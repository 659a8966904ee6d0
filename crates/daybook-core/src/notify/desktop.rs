use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use notify_rust::Notification;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::plan::{NotificationPayload, ScheduleKey};
use super::scheduler::{Notifier, Permission, TimerDriver};

const APP_NAME: &str = "daybook";

/// Sent by [`TokioTimerDriver`] when an armed sleep elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: ScheduleKey,
    pub token: u64,
}

/// Timers as spawned tokio sleeps. Must be used inside a runtime.
#[derive(Debug, Clone)]
pub struct TokioTimerDriver {
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TokioTimerDriver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TimerDriver for TokioTimerDriver {
    type Handle = JoinHandle<()>;

    fn arm(&mut self, key: &ScheduleKey, token: u64, delay: Duration) -> Self::Handle {
        let tx = self.tx.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(TimerFired { key, token }).is_err() {
                trace!(token, "timer receiver gone");
            }
        })
    }

    fn cancel(&mut self, handle: Self::Handle) {
        handle.abort();
    }
}

/// Desktop notifications through the session notification service.
///
/// Permission is granted unless disabled in config. A tag is shown at most
/// once per process, like a browser notification without `renotify`.
#[derive(Debug)]
pub struct DesktopNotifier {
    enabled: bool,
    shown_tags: HashSet<String>,
}

impl DesktopNotifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            shown_tags: HashSet::new(),
        }
    }
}

impl Notifier for DesktopNotifier {
    fn permission(&self) -> Permission {
        if self.enabled {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    fn request_permission(&mut self) -> Permission {
        self.permission()
    }

    fn show(&mut self, payload: &NotificationPayload) -> anyhow::Result<()> {
        if self.shown_tags.contains(&payload.tag) {
            debug!(tag = %payload.tag, "tag already shown; not renotifying");
            return Ok(());
        }

        Notification::new()
            .summary(&payload.display_title())
            .body(&payload.body)
            .appname(APP_NAME)
            .icon(&payload.icon)
            .show()
            .map_err(|err| anyhow!("desktop notification failed: {err}"))?;

        self.shown_tags.insert(payload.tag.clone());
        Ok(())
    }

    fn retain_tags(&mut self, live: &HashSet<String>) {
        let before = self.shown_tags.len();
        self.shown_tags.retain(|tag| live.contains(tag));
        trace!(forgotten = before - self.shown_tags.len(), "pruned shown tags");
    }
}
