use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use super::desktop::{DesktopNotifier, TimerFired, TokioTimerDriver};
use super::plan::NotifySettings;
use super::scheduler::{Notifier, Scheduler, TimerDriver};
use crate::datastore::{Collection, DataStore};
use crate::datetime::local_now;

/// Reports rewrites of a set of files in one directory, whichever process
/// made them. Watching stops when this is dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Watches `dir` non-recursively. The path of every changed file whose
    /// name matches one of `files` is sent on the returned channel.
    pub fn spawn(
        dir: &Path,
        files: &[PathBuf],
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let names: Vec<OsString> = files
            .iter()
            .filter_map(|path| path.file_name().map(ToOwned::to_owned))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(event) => {
                    if let Some(path) = watched_change(&event, &names) {
                        if tx.send(path).is_err() {
                            trace!("file change receiver gone");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "file watch error"),
            })
            .context("failed to create file watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        debug!(dir = %dir.display(), files = files.len(), "watching for file changes");
        Ok((Self { _watcher: watcher }, rx))
    }
}

/// The watched path an event touched, if the event can change its contents.
fn watched_change(event: &notify::Event, names: &[OsString]) -> Option<PathBuf> {
    let rewrites = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Any | ModifyKind::Data(_) | ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    if !rewrites {
        return None;
    }
    event
        .paths
        .iter()
        .find(|path| {
            path.file_name()
                .is_some_and(|name| names.iter().any(|watched| watched == name))
        })
        .cloned()
}

/// Runs the notification daemon until Ctrl-C.
///
/// Timers are rebuilt at startup, on every write through `store`, whenever
/// another process rewrites `events.json` or `reminders.json`, and when the
/// local date rolls over so the lookahead window keeps moving.
#[instrument(skip(store, settings))]
pub fn run_daemon(store: &DataStore, settings: NotifySettings) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build notification runtime")?;

    runtime.block_on(serve(store, settings))
}

async fn serve(store: &DataStore, settings: NotifySettings) -> anyhow::Result<()> {
    let rollover_check = Duration::from_secs(settings.rollover_seconds.max(1));
    let (driver, mut fired) = TokioTimerDriver::new();
    let notifier = DesktopNotifier::new(settings.enabled);
    let mut scheduler = Scheduler::new(driver, notifier, settings);

    let mut changes = store.subscribe();
    let mut listening = true;

    let watched = [
        store.path_for(Collection::Events),
        store.path_for(Collection::Reminders),
    ];
    let (_watcher, mut file_changes) = match FileWatcher::spawn(&store.data_dir, &watched) {
        Ok((watcher, rx)) => (Some(watcher), rx),
        Err(err) => {
            warn!(error = %err, "changes made by other processes will not be seen");
            let (_, rx) = mpsc::unbounded_channel();
            (None, rx)
        }
    };
    let mut watching = true;

    let mut planned_for = reload(&mut scheduler, store);
    info!(
        pending = scheduler.pending_count(),
        permission = scheduler.permission_status().as_str(),
        "notification daemon started"
    );

    let mut ticker = tokio::time::interval(rollover_check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(TimerFired { key, token }) = fired.recv() => {
                scheduler.on_timer_fired(&key, token, local_now());
            }
            change = changes.recv(), if listening => match change {
                Ok(change) => {
                    if matches!(change.collection, Collection::Events | Collection::Reminders) {
                        planned_for = reload(&mut scheduler, store);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "change signal lagged; rescheduling");
                    planned_for = reload(&mut scheduler, store);
                }
                Err(RecvError::Closed) => {
                    listening = false;
                }
            },
            changed = file_changes.recv(), if watching => match changed {
                Some(path) => {
                    while file_changes.try_recv().is_ok() {}
                    debug!(file = %path.display(), "collection rewritten on disk");
                    planned_for = reload(&mut scheduler, store);
                }
                None => {
                    watching = false;
                }
            },
            _ = ticker.tick() => {
                if local_now().date() != planned_for {
                    info!("date changed; moving lookahead window");
                    planned_for = reload(&mut scheduler, store);
                } else {
                    trace!("date unchanged");
                }
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "failed waiting for ctrl_c");
                }
                info!("shutting down notification daemon");
                break;
            }
        }
    }

    scheduler.cancel_all();
    Ok(())
}

fn reload<D, N>(scheduler: &mut Scheduler<D, N>, store: &DataStore) -> NaiveDate
where
    D: TimerDriver,
    N: Notifier,
{
    let events = store.events().load();
    let reminders = store.reminders().load();
    let now = local_now();
    scheduler.reschedule_all(&events, &reminders, now);
    now.date()
}
