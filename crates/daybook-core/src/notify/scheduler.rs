use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, trace, warn};

use super::plan::{NotificationPayload, NotifySettings, ScheduleKey, plan_notifications};
use crate::model::{Event, Reminder};

/// Longest single timer; longer delays are armed clamped and re-armed on wake.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(0x7FFF_FFFF);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Unknown,
    Granted,
    Denied,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Unknown => "unknown",
            Permission::Granted => "granted",
            Permission::Denied => "denied",
        }
    }
}

/// Platform notification layer.
pub trait Notifier {
    fn permission(&self) -> Permission;

    fn request_permission(&mut self) -> Permission;

    fn show(&mut self, payload: &NotificationPayload) -> anyhow::Result<()>;

    /// Drops any per-tag state for tags outside `live`.
    fn retain_tags(&mut self, _live: &HashSet<String>) {}
}

/// Platform timers. A fired timer is reported back through
/// [`Scheduler::on_timer_fired`] with the same key and token.
pub trait TimerDriver {
    type Handle;

    fn arm(&mut self, key: &ScheduleKey, token: u64, delay: Duration) -> Self::Handle;

    fn cancel(&mut self, handle: Self::Handle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Armed { delay: Duration, clamped: bool },
    FiredNow,
    Dropped,
}

#[derive(Debug)]
struct Pending<H> {
    token: u64,
    fire_at: NaiveDateTime,
    payload: NotificationPayload,
    handle: H,
}

/// Owns the table of pending notification timers.
///
/// At most one timer is pending per [`ScheduleKey`]. Every arm gets a fresh
/// token; a fire whose token no longer matches the table is ignored, so a
/// cancel or replace always wins over a timer that already elapsed.
pub struct Scheduler<D: TimerDriver, N: Notifier> {
    driver: D,
    notifier: N,
    settings: NotifySettings,
    pending: HashMap<ScheduleKey, Pending<D::Handle>>,
    next_token: u64,
    permission: Permission,
}

impl<D: TimerDriver, N: Notifier> Scheduler<D, N> {
    pub fn new(driver: D, notifier: N, settings: NotifySettings) -> Self {
        let permission = notifier.permission();
        Self {
            driver,
            notifier,
            settings,
            pending: HashMap::new(),
            next_token: 0,
            permission,
        }
    }

    pub fn settings(&self) -> &NotifySettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Last known permission state, for status display.
    pub fn permission_status(&self) -> Permission {
        self.permission
    }

    pub fn pending_keys(&self) -> Vec<ScheduleKey> {
        let mut keys: Vec<ScheduleKey> = self.pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[instrument(skip(self, payload), fields(key = %key))]
    pub fn schedule_at(
        &mut self,
        key: ScheduleKey,
        when: NaiveDateTime,
        payload: NotificationPayload,
        now: NaiveDateTime,
    ) -> ScheduleOutcome {
        self.cancel(&key);

        let delta = when - now;
        if delta <= chrono::Duration::zero() {
            if delta > -self.settings.grace {
                debug!(late_by = %-delta, "inside grace window; delivering now");
                self.deliver(&payload);
                return ScheduleOutcome::FiredNow;
            }
            trace!(late_by = %-delta, "stale notification dropped");
            return ScheduleOutcome::Dropped;
        }

        let (delay, clamped) = clamp_delay(delta);
        let token = self.take_token();
        let handle = self.driver.arm(&key, token, delay);
        debug!(token, ?delay, clamped, fire_at = %when, "armed timer");
        self.pending.insert(
            key,
            Pending {
                token,
                fire_at: when,
                payload,
                handle,
            },
        );
        ScheduleOutcome::Armed { delay, clamped }
    }

    /// Removes the timer for `key`. Returns whether one was pending.
    pub fn cancel(&mut self, key: &ScheduleKey) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                trace!(key = %key, token = pending.token, "cancelled timer");
                self.driver.cancel(pending.handle);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            self.driver.cancel(pending.handle);
        }
        debug!(count, "cancelled all timers");
        count
    }

    /// Cancels everything, then arms the full plan for the given data.
    /// Returns how many timers are pending afterwards.
    #[instrument(skip(self, events, reminders))]
    pub fn reschedule_all(
        &mut self,
        events: &[Event],
        reminders: &[Reminder],
        now: NaiveDateTime,
    ) -> usize {
        self.cancel_all();

        let plan = plan_notifications(events, reminders, &self.settings, now);
        let live: HashSet<String> = plan.iter().map(|p| p.payload.tag.clone()).collect();
        self.notifier.retain_tags(&live);

        let mut fired = 0_usize;
        let mut dropped = 0_usize;
        for planned in plan {
            match self.schedule_at(planned.key, planned.fire_at, planned.payload, now) {
                ScheduleOutcome::Armed { .. } => {}
                ScheduleOutcome::FiredNow => fired += 1,
                ScheduleOutcome::Dropped => dropped += 1,
            }
        }

        info!(
            armed = self.pending.len(),
            fired,
            dropped,
            "rescheduled notifications"
        );
        self.pending.len()
    }

    /// Handles an elapsed timer. Returns whether a notification was shown.
    #[instrument(skip(self), fields(key = %key))]
    pub fn on_timer_fired(&mut self, key: &ScheduleKey, token: u64, now: NaiveDateTime) -> bool {
        let current = self.pending.get(key).map(|p| (p.token, p.fire_at));
        let Some((current_token, fire_at)) = current else {
            trace!(token, "timer fired for a key that is no longer pending");
            return false;
        };
        if current_token != token {
            trace!(token, current_token, "stale timer ignored");
            return false;
        }

        if fire_at > now {
            let (delay, clamped) = clamp_delay(fire_at - now);
            let token = self.take_token();
            let handle = self.driver.arm(key, token, delay);
            if let Some(pending) = self.pending.get_mut(key) {
                let previous = std::mem::replace(&mut pending.handle, handle);
                pending.token = token;
                self.driver.cancel(previous);
            }
            debug!(?delay, clamped, "woke early; re-armed for the remainder");
            return false;
        }

        match self.pending.remove(key) {
            Some(pending) => self.deliver(&pending.payload),
            None => false,
        }
    }

    fn deliver(&mut self, payload: &NotificationPayload) -> bool {
        let mut permission = self.notifier.permission();
        if permission != Permission::Granted {
            permission = self.notifier.request_permission();
        }
        self.permission = permission;

        if permission != Permission::Granted {
            debug!(tag = %payload.tag, permission = permission.as_str(), "notification suppressed");
            return false;
        }

        match self.notifier.show(payload) {
            Ok(()) => {
                info!(tag = %payload.tag, title = %payload.display_title(), "notification shown");
                true
            }
            Err(err) => {
                warn!(tag = %payload.tag, error = %err, "failed to show notification");
                false
            }
        }
    }

    fn take_token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }
}

fn clamp_delay(delta: chrono::Duration) -> (Duration, bool) {
    match delta.to_std() {
        Ok(delay) if delay <= MAX_TIMER_DELAY => (delay, false),
        _ => (MAX_TIMER_DELAY, true),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveDateTime};

    use super::{
        MAX_TIMER_DELAY, Notifier, Permission, ScheduleOutcome, Scheduler, TimerDriver,
    };
    use crate::model::{Event, ItemId, Reminder};
    use crate::notify::plan::{ItemKind, NotificationPayload, NotifySettings, ScheduleKey};

    #[derive(Debug, Default)]
    struct FakeTimers {
        armed: Vec<(ScheduleKey, u64, Duration)>,
        live: HashSet<u64>,
        cancelled: Vec<u64>,
    }

    impl TimerDriver for FakeTimers {
        type Handle = u64;

        fn arm(&mut self, key: &ScheduleKey, token: u64, delay: Duration) -> u64 {
            self.armed.push((key.clone(), token, delay));
            self.live.insert(token);
            token
        }

        fn cancel(&mut self, handle: u64) {
            self.live.remove(&handle);
            self.cancelled.push(handle);
        }
    }

    #[derive(Debug)]
    struct FakeNotifier {
        permission: Permission,
        shown: Vec<String>,
    }

    impl FakeNotifier {
        fn granted() -> Self {
            Self {
                permission: Permission::Granted,
                shown: vec![],
            }
        }
    }

    impl Notifier for FakeNotifier {
        fn permission(&self) -> Permission {
            self.permission
        }

        fn request_permission(&mut self) -> Permission {
            self.permission
        }

        fn show(&mut self, payload: &NotificationPayload) -> anyhow::Result<()> {
            self.shown.push(payload.tag.clone());
            Ok(())
        }

        fn retain_tags(&mut self, live: &HashSet<String>) {
            self.shown.retain(|tag| live.contains(tag));
        }
    }

    fn at(d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .and_then(|date| date.and_hms_opt(hh, mm, 0))
            .expect("valid instant")
    }

    fn key(id: &str) -> ScheduleKey {
        ScheduleKey::new(ItemKind::Reminder, id, "2024-03-01")
    }

    fn payload(key: &ScheduleKey) -> NotificationPayload {
        NotificationPayload {
            title: "Reminder".to_string(),
            body: String::new(),
            emoji: String::new(),
            icon: "x-office-calendar".to_string(),
            url: "index.html#reminders".to_string(),
            tag: key.to_string(),
        }
    }

    fn scheduler(notifier: FakeNotifier) -> Scheduler<FakeTimers, FakeNotifier> {
        Scheduler::new(FakeTimers::default(), notifier, NotifySettings::default())
    }

    #[test]
    fn two_minutes_late_fires_immediately() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("a");
        let outcome = s.schedule_at(k.clone(), at(1, 9, 0), payload(&k), at(1, 9, 2));
        assert_eq!(outcome, ScheduleOutcome::FiredNow);
        assert_eq!(s.notifier().shown, vec![k.to_string()]);
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn ten_minutes_late_is_dropped() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("a");
        let outcome = s.schedule_at(k.clone(), at(1, 9, 0), payload(&k), at(1, 9, 10));
        assert_eq!(outcome, ScheduleOutcome::Dropped);
        assert!(s.notifier().shown.is_empty());
        assert!(s.driver().armed.is_empty());
    }

    #[test]
    fn scheduling_a_key_twice_keeps_one_timer() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("a");
        s.schedule_at(k.clone(), at(1, 10, 0), payload(&k), at(1, 9, 0));
        s.schedule_at(k.clone(), at(1, 11, 0), payload(&k), at(1, 9, 0));

        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.driver().live.len(), 1);
        assert_eq!(s.driver().cancelled, vec![1]);
    }

    #[test]
    fn cancel_wins_over_an_elapsed_timer() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("a");
        s.schedule_at(k.clone(), at(1, 10, 0), payload(&k), at(1, 9, 0));
        let (_, token, _) = s.driver().armed[0].clone();

        assert!(s.cancel(&k));
        assert!(!s.on_timer_fired(&k, token, at(1, 10, 0)));
        assert!(s.notifier().shown.is_empty());
    }

    #[test]
    fn replaced_timer_token_is_stale() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("a");
        s.schedule_at(k.clone(), at(1, 10, 0), payload(&k), at(1, 9, 0));
        s.schedule_at(k.clone(), at(1, 10, 0), payload(&k), at(1, 9, 0));
        let first = s.driver().armed[0].1;
        let second = s.driver().armed[1].1;

        assert!(!s.on_timer_fired(&k, first, at(1, 10, 0)));
        assert!(s.on_timer_fired(&k, second, at(1, 10, 0)));
        assert_eq!(s.notifier().shown.len(), 1);
    }

    #[test]
    fn long_delays_are_clamped_and_rearmed() {
        let mut s = scheduler(FakeNotifier::granted());
        let k = key("far");
        let now = at(1, 0, 0);
        let when = now + chrono::Duration::days(40);

        let outcome = s.schedule_at(k.clone(), when, payload(&k), now);
        assert_eq!(
            outcome,
            ScheduleOutcome::Armed {
                delay: MAX_TIMER_DELAY,
                clamped: true
            }
        );

        let (_, token, _) = s.driver().armed[0].clone();
        let woke = now + chrono::Duration::milliseconds(0x7FFF_FFFF);
        assert!(!s.on_timer_fired(&k, token, woke));
        assert!(s.notifier().shown.is_empty());
        assert_eq!(s.driver().armed.len(), 2);
        assert_eq!(s.pending_count(), 1);

        let (_, second, delay) = s.driver().armed[1].clone();
        assert_eq!(
            delay,
            (when - woke).to_std().expect("remaining delay is positive")
        );
        assert!(s.on_timer_fired(&k, second, when));
        assert_eq!(s.notifier().shown, vec![k.to_string()]);
    }

    #[test]
    fn denied_permission_suppresses_delivery() {
        let mut s = scheduler(FakeNotifier {
            permission: Permission::Denied,
            shown: vec![],
        });
        let k = key("a");
        s.schedule_at(k.clone(), at(1, 9, 0), payload(&k), at(1, 9, 1));
        assert!(s.notifier().shown.is_empty());
        assert_eq!(s.permission_status(), Permission::Denied);
    }

    #[test]
    fn reschedule_all_is_idempotent() {
        let mut s = scheduler(FakeNotifier::granted());
        let mut reminder = Reminder::new(ItemId::from("rem:1"), "2024-03-05".to_string(), "Call".to_string());
        reminder.notify = Some("at".to_string());
        let mut event = Event::new(ItemId::Int(1), "Gym".to_string(), "2024-03-02".to_string());
        event.start_time = Some("18:00".to_string());
        event.notify = Some("30m".to_string());
        let now = at(1, 12, 0);

        let first = s.reschedule_all(&[event.clone()], &[reminder.clone()], now);
        let keys = s.pending_keys();
        let second = s.reschedule_all(&[event], &[reminder], now);

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        assert_eq!(s.pending_keys(), keys);
        assert_eq!(s.driver().live.len(), 2);
        assert_eq!(s.driver().cancelled.len(), 2);
    }

    #[test]
    fn rescheduling_forgets_tags_that_left_the_plan() {
        let mut s = scheduler(FakeNotifier::granted());
        let mut reminder = Reminder::new(ItemId::from("rem:1"), "2024-03-01".to_string(), "Call".to_string());
        reminder.time = Some("09:00".to_string());
        reminder.notify = Some("at".to_string());

        s.reschedule_all(&[], &[reminder.clone()], at(1, 9, 2));
        assert_eq!(s.notifier().shown, vec!["reminder|rem:1|2024-03-01".to_string()]);

        s.reschedule_all(&[], &[reminder], at(1, 9, 3));
        assert_eq!(s.notifier().shown.len(), 2);

        s.reschedule_all(&[], &[], at(1, 9, 4));
        assert!(s.notifier().shown.is_empty());
    }
}
