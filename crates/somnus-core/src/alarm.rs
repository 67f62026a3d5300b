//! Alarm evaluation: the one-second polling state machine and the in-memory
//! alarm list that writes through to the record store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use tracing::{debug, info, warn};

use crate::config::AlarmConfig;
use crate::db::{with_db, SharedDatabase};
use crate::error::{CoreError, Result};
use crate::schema::{Alarm, AlarmTime, NewAlarm};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing matched this tick.
    Idle,
    /// An alarm is already ringing; evaluation was skipped.
    AlreadyRinging,
    /// `alarm` started ringing. `deactivated` is set for one-shot alarms,
    /// which are switched off the moment they fire.
    Fired { alarm: Alarm, deactivated: bool },
}

#[derive(Debug, Clone)]
struct Snooze {
    alarm_id: String,
    due: NaiveDateTime,
    /// The alarm switched itself off when it fired, so its inactive flag
    /// does not cancel the snooze.
    one_shot: bool,
}

/// Pure alarm state machine driven by wall-clock ticks.
pub struct AlarmEvaluator {
    alarms: Vec<Alarm>,
    ringing: Option<Alarm>,
    /// alarm id -> end of its suppression window
    suppressed: HashMap<String, NaiveDateTime>,
    snoozed: Vec<Snooze>,
    suppression: Duration,
    snooze: Duration,
    catch_up_minutes: i64,
    last_evaluated: Option<NaiveDateTime>,
}

impl AlarmEvaluator {
    pub fn new(config: &AlarmConfig) -> Self {
        Self {
            alarms: Vec::new(),
            ringing: None,
            suppressed: HashMap::new(),
            snoozed: Vec::new(),
            suppression: Duration::seconds(
                config
                    .suppression_seconds
                    .clamp(
                        AlarmConfig::MIN_SUPPRESSION_SECONDS,
                        AlarmConfig::MAX_SUPPRESSION_SECONDS,
                    ),
            ),
            snooze: Duration::minutes(
                config
                    .snooze_minutes
                    .clamp(1, AlarmConfig::MAX_SNOOZE_MINUTES),
            ),
            catch_up_minutes: config
                .catch_up_minutes
                .clamp(0, AlarmConfig::MAX_CATCH_UP_MINUTES),
            last_evaluated: None,
        }
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn set_alarms(&mut self, alarms: Vec<Alarm>) {
        self.alarms = alarms;
        self.sort();
    }

    /// Replace an alarm by id, or add it. Switching an alarm off or moving
    /// its schedule cancels a pending snooze.
    pub fn upsert(&mut self, alarm: Alarm) {
        match self.alarms.iter_mut().find(|a| a.id == alarm.id) {
            Some(existing) => {
                let switched_off = existing.is_active && !alarm.is_active;
                let rescheduled = existing.time != alarm.time || existing.days != alarm.days;
                if switched_off || rescheduled {
                    self.snoozed.retain(|s| s.alarm_id != alarm.id);
                }
                *existing = alarm;
            }
            None => self.alarms.push(alarm),
        }
        self.sort();
    }

    pub fn remove(&mut self, id: &str) -> Option<Alarm> {
        self.snoozed.retain(|s| s.alarm_id != id);
        let idx = self.alarms.iter().position(|a| a.id == id)?;
        Some(self.alarms.remove(idx))
    }

    pub fn ringing(&self) -> Option<&Alarm> {
        self.ringing.as_ref()
    }

    pub fn is_suppressed(&self, id: &str, now: NaiveDateTime) -> bool {
        self.suppressed.get(id).is_some_and(|until| *until > now)
    }

    /// Evaluate the alarm list against `now` (local wall-clock time).
    pub fn tick(&mut self, now: NaiveDateTime) -> TickOutcome {
        self.suppressed.retain(|_, until| *until > now);

        if self.ringing.is_some() {
            return TickOutcome::AlreadyRinging;
        }

        if let Some(idx) = self.snoozed.iter().position(|s| s.due <= now) {
            let snooze = self.snoozed.remove(idx);
            let due = self
                .alarms
                .iter()
                .find(|a| a.id == snooze.alarm_id && (a.is_active || snooze.one_shot))
                .cloned();
            if let Some(alarm) = due {
                debug!(alarm_id = %alarm.id, "snoozed alarm due");
                self.ringing = Some(alarm.clone());
                return TickOutcome::Fired {
                    alarm,
                    deactivated: false,
                };
            }
        }

        let minute = truncate_to_minute(now);
        for candidate in self.minutes_to_check(minute) {
            let Ok(time) = AlarmTime::new(candidate.hour() as u8, candidate.minute() as u8) else {
                continue;
            };
            let weekday = candidate.weekday().num_days_from_sunday() as u8;

            let hit = self
                .alarms
                .iter()
                .position(|a| a.is_due(time, weekday) && !self.suppressed.contains_key(&a.id));

            if let Some(idx) = hit {
                let deactivated = self.alarms[idx].is_one_shot();
                if deactivated {
                    self.alarms[idx].is_active = false;
                }
                let alarm = self.alarms[idx].clone();
                if candidate != minute {
                    info!(alarm_id = %alarm.id, time = %time, "firing alarm missed by a clock jump");
                }
                self.ringing = Some(alarm.clone());
                self.last_evaluated = Some(candidate);
                return TickOutcome::Fired { alarm, deactivated };
            }
        }

        self.last_evaluated = Some(minute);
        TickOutcome::Idle
    }

    /// Stop the ringing alarm and keep it from re-firing inside the suppression window.
    pub fn dismiss(&mut self, now: NaiveDateTime) -> Option<Alarm> {
        let alarm = self.ringing.take()?;
        self.suppressed
            .insert(alarm.id.clone(), now + self.suppression);
        Some(alarm)
    }

    /// Dismiss the ringing alarm and ring it again after the snooze interval.
    pub fn snooze(&mut self, now: NaiveDateTime) -> Option<(Alarm, NaiveDateTime)> {
        let alarm = self.dismiss(now)?;
        let due = now + self.snooze;
        self.snoozed.push(Snooze {
            alarm_id: alarm.id.clone(),
            due,
            one_shot: alarm.is_one_shot(),
        });
        Some((alarm, due))
    }

    fn minutes_to_check(&self, minute: NaiveDateTime) -> Vec<NaiveDateTime> {
        match self.last_evaluated {
            Some(last) if self.catch_up_minutes > 0 && minute - last > Duration::minutes(1) => {
                let earliest = minute - Duration::minutes(self.catch_up_minutes);
                let mut cursor = (last + Duration::minutes(1)).max(earliest);
                let mut minutes = Vec::new();
                while cursor <= minute {
                    minutes.push(cursor);
                    cursor += Duration::minutes(1);
                }
                minutes
            }
            _ => vec![minute],
        }
    }

    fn sort(&mut self) {
        self.alarms
            .sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    }
}

fn truncate_to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// The alarm list the alarm view works with: an in-memory cache over the
/// record store, kept in sync by writing through on every mutation.
pub struct AlarmManager {
    db: SharedDatabase,
    evaluator: Mutex<AlarmEvaluator>,
}

impl AlarmManager {
    pub fn new(db: SharedDatabase, config: &AlarmConfig) -> Self {
        Self {
            db,
            evaluator: Mutex::new(AlarmEvaluator::new(config)),
        }
    }

    fn evaluator(&self) -> MutexGuard<'_, AlarmEvaluator> {
        self.evaluator.lock().unwrap_or_else(|e| {
            warn!("alarm evaluator mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Replace the cache with the store's contents. Returns the alarm count.
    pub async fn load(&self) -> Result<usize> {
        let alarms = with_db(&self.db, |db| db.get_all_alarms()).await?;
        let count = alarms.len();
        self.evaluator().set_alarms(alarms);
        info!(count, "alarms loaded");
        Ok(count)
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.evaluator().alarms().to_vec()
    }

    pub fn ringing(&self) -> Option<Alarm> {
        self.evaluator().ringing().cloned()
    }

    pub async fn create(&self, new: NewAlarm) -> Result<Alarm> {
        new.validate()?;
        let alarm = new.into_alarm();
        let stored = alarm.clone();
        with_db(&self.db, move |db| db.add_alarm(&stored)).await?;
        info!(alarm_id = %alarm.id, time = %alarm.time, "alarm created");
        self.evaluator().upsert(alarm.clone());
        Ok(alarm)
    }

    /// Change time, label and days of an existing alarm, keeping its active flag.
    pub async fn update(&self, id: &str, changes: NewAlarm) -> Result<Alarm> {
        changes.validate()?;
        let mut alarm = self.cached(id)?;
        alarm.time = changes.time;
        alarm.label = changes.label;
        alarm.days = changes.days;
        self.write_through(alarm).await
    }

    pub async fn toggle(&self, id: &str) -> Result<Alarm> {
        let mut alarm = self.cached(id)?;
        alarm.is_active = !alarm.is_active;
        self.write_through(alarm).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = id.to_string();
        let removed = with_db(&self.db, move |db| db.delete_alarm(&key)).await?;
        if !removed {
            return Err(CoreError::NotFound(id.to_string()));
        }
        self.evaluator().remove(id);
        info!(alarm_id = %id, "alarm deleted");
        Ok(())
    }

    /// Run one evaluation. One-shot alarms that fire are persisted as inactive
    /// right away; a failed write is logged and not retried.
    pub async fn tick(&self, now: NaiveDateTime) -> TickOutcome {
        let outcome = self.evaluator().tick(now);

        if let TickOutcome::Fired { alarm, deactivated } = &outcome {
            info!(alarm_id = %alarm.id, label = %alarm.label, time = %alarm.time, "alarm ringing");
            if *deactivated {
                let stored = alarm.clone();
                if let Err(e) = with_db(&self.db, move |db| db.put_alarm(&stored)).await {
                    warn!(alarm_id = %alarm.id, error = %e, "failed to persist one-shot deactivation");
                }
            }
        }

        outcome
    }

    pub fn dismiss(&self, now: NaiveDateTime) -> Option<Alarm> {
        let alarm = self.evaluator().dismiss(now);
        if let Some(ref a) = alarm {
            info!(alarm_id = %a.id, "alarm dismissed");
        }
        alarm
    }

    pub fn snooze(&self, now: NaiveDateTime) -> Option<(Alarm, NaiveDateTime)> {
        let snoozed = self.evaluator().snooze(now);
        if let Some((ref a, due)) = snoozed {
            info!(alarm_id = %a.id, due = %due, "alarm snoozed");
        }
        snoozed
    }

    fn cached(&self, id: &str) -> Result<Alarm> {
        self.evaluator()
            .alarms()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    async fn write_through(&self, alarm: Alarm) -> Result<Alarm> {
        let stored = alarm.clone();
        with_db(&self.db, move |db| db.put_alarm(&stored)).await?;
        self.evaluator().upsert(alarm.clone());
        Ok(alarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{lock_db, Database};
    use chrono::NaiveDate;

    // 2024-05-06 is a Monday (weekday index 1).
    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn alarm(id: &str, time: &str, days: &[u8]) -> Alarm {
        Alarm {
            id: id.to_string(),
            time: time.parse().unwrap(),
            label: String::new(),
            is_active: true,
            days: days.iter().copied().collect(),
        }
    }

    fn evaluator(alarms: Vec<Alarm>) -> AlarmEvaluator {
        let mut e = AlarmEvaluator::new(&AlarmConfig::default());
        e.set_alarms(alarms);
        e
    }

    fn fired_id(outcome: &TickOutcome) -> Option<&str> {
        match outcome {
            TickOutcome::Fired { alarm, .. } => Some(alarm.id.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_fires_on_matching_minute_and_day() {
        let mut e = evaluator(vec![alarm("weekday", "07:00", &[1, 2, 3, 4, 5])]);
        assert_eq!(e.tick(at(6, 6, 59, 59)), TickOutcome::Idle);
        assert_eq!(fired_id(&e.tick(at(6, 7, 0, 12))), Some("weekday"));
        assert_eq!(e.ringing().map(|a| a.id.as_str()), Some("weekday"));
    }

    #[test]
    fn test_does_not_fire_on_other_days() {
        let mut e = evaluator(vec![alarm("weekday", "07:00", &[1, 2, 3, 4, 5])]);
        // 2024-05-05 is a Sunday.
        assert_eq!(e.tick(at(5, 7, 0, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_inactive_alarm_never_fires() {
        let mut a = alarm("off", "07:00", &[]);
        a.is_active = false;
        let mut e = evaluator(vec![a]);
        assert_eq!(e.tick(at(6, 7, 0, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_one_shot_deactivates_on_fire() {
        let mut e = evaluator(vec![alarm("once", "07:00", &[])]);
        match e.tick(at(6, 7, 0, 0)) {
            TickOutcome::Fired { alarm, deactivated } => {
                assert!(deactivated);
                assert!(!alarm.is_active);
            }
            other => panic!("expected fire, got {other:?}"),
        }
        assert!(!e.alarms()[0].is_active);
    }

    #[test]
    fn test_first_match_wins_and_ringing_blocks() {
        let mut e = evaluator(vec![
            alarm("b", "07:00", &[]),
            alarm("a", "07:00", &[]),
        ]);
        assert_eq!(fired_id(&e.tick(at(6, 7, 0, 0))), Some("a"));
        assert_eq!(e.tick(at(6, 7, 0, 1)), TickOutcome::AlreadyRinging);

        e.dismiss(at(6, 7, 0, 5));
        assert_eq!(fired_id(&e.tick(at(6, 7, 0, 6))), Some("b"));
    }

    #[test]
    fn test_dismiss_suppresses_for_window() {
        let mut e = evaluator(vec![alarm("daily", "07:00", &[0, 1, 2, 3, 4, 5, 6])]);
        e.tick(at(6, 7, 0, 0));
        let dismissed_at = at(6, 7, 0, 2);
        assert!(e.dismiss(dismissed_at).is_some());

        assert_eq!(e.tick(at(6, 7, 0, 30)), TickOutcome::Idle);
        assert_eq!(e.tick(at(6, 7, 0, 59)), TickOutcome::Idle);
        assert!(e.is_suppressed("daily", dismissed_at + Duration::seconds(60)));
        assert!(!e.is_suppressed("daily", dismissed_at + Duration::seconds(61)));
    }

    #[test]
    fn test_eligible_again_after_suppression() {
        let mut config = AlarmConfig::default();
        config.suppression_seconds = 61;
        let mut e = AlarmEvaluator::new(&config);
        e.set_alarms(vec![alarm("daily", "07:00", &[])]);
        e.tick(at(6, 7, 0, 0));
        e.dismiss(at(6, 7, 0, 0));
        // Same alarm switched back on for the next day still fires.
        e.upsert(alarm("daily", "07:00", &[]));
        assert_eq!(fired_id(&e.tick(at(7, 7, 0, 0))), Some("daily"));
    }

    #[test]
    fn test_dismiss_without_ringing_is_noop() {
        let mut e = evaluator(vec![]);
        assert!(e.dismiss(at(6, 7, 0, 0)).is_none());
        assert!(e.snooze(at(6, 7, 0, 0)).is_none());
    }

    #[test]
    fn test_snooze_rings_again_later() {
        let mut e = evaluator(vec![alarm("daily", "07:00", &[1])]);
        e.tick(at(6, 7, 0, 0));
        let (_, due) = e.snooze(at(6, 7, 0, 10)).unwrap();
        assert_eq!(due, at(6, 7, 9, 10));

        assert_eq!(e.tick(at(6, 7, 5, 0)), TickOutcome::Idle);
        assert_eq!(fired_id(&e.tick(at(6, 7, 9, 10))), Some("daily"));
    }

    #[test]
    fn test_missed_minute_without_catch_up() {
        let mut e = evaluator(vec![alarm("once", "07:00", &[])]);
        e.tick(at(6, 6, 59, 58));
        // Device slept through 07:00.
        assert_eq!(e.tick(at(6, 7, 2, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_missed_minute_with_catch_up() {
        let mut config = AlarmConfig::default();
        config.catch_up_minutes = 5;
        let mut e = AlarmEvaluator::new(&config);
        e.set_alarms(vec![alarm("once", "07:00", &[])]);
        e.tick(at(6, 6, 59, 58));
        assert_eq!(fired_id(&e.tick(at(6, 7, 2, 0))), Some("once"));

        // Outside the window the alarm stays missed.
        let mut e = AlarmEvaluator::new(&config);
        e.set_alarms(vec![alarm("once", "07:00", &[])]);
        e.tick(at(6, 6, 50, 0));
        assert_eq!(e.tick(at(6, 7, 10, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_remove_drops_pending_snooze() {
        let mut e = evaluator(vec![alarm("daily", "07:00", &[])]);
        e.tick(at(6, 7, 0, 0));
        e.snooze(at(6, 7, 0, 0));
        e.remove("daily");
        assert_eq!(e.tick(at(6, 7, 9, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_switching_off_cancels_snooze() {
        let mut e = evaluator(vec![alarm("daily", "07:00", &[0, 1, 2, 3, 4, 5, 6])]);
        e.tick(at(6, 7, 0, 0));
        e.snooze(at(6, 7, 0, 10));

        let mut off = alarm("daily", "07:00", &[0, 1, 2, 3, 4, 5, 6]);
        off.is_active = false;
        e.upsert(off);
        assert_eq!(e.tick(at(6, 7, 9, 10)), TickOutcome::Idle);
        assert_eq!(e.tick(at(6, 7, 12, 0)), TickOutcome::Idle);
    }

    #[test]
    fn test_rescheduling_cancels_snooze() {
        let mut e = evaluator(vec![alarm("daily", "07:00", &[1])]);
        e.tick(at(6, 7, 0, 0));
        e.snooze(at(6, 7, 0, 10));
        e.upsert(alarm("daily", "08:00", &[1]));
        assert_eq!(e.tick(at(6, 7, 9, 10)), TickOutcome::Idle);
    }

    #[test]
    fn test_snoozed_one_shot_still_rings() {
        let mut e = evaluator(vec![alarm("once", "07:00", &[])]);
        e.tick(at(6, 7, 0, 0));
        e.snooze(at(6, 7, 0, 10));
        // A label edit keeps the snooze even though the one-shot is inactive.
        let mut relabeled = e.alarms()[0].clone();
        relabeled.label = "up".to_string();
        e.upsert(relabeled);

        match e.tick(at(6, 7, 9, 10)) {
            TickOutcome::Fired { alarm, deactivated } => {
                assert_eq!(alarm.id, "once");
                assert!(!deactivated);
            }
            other => panic!("expected snoozed fire, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_settings_are_clamped() {
        let mut config = AlarmConfig::default();
        config.suppression_seconds = -30;
        config.catch_up_minutes = i64::MAX;
        let mut e = AlarmEvaluator::new(&config);
        e.set_alarms(vec![alarm("daily", "07:00", &[0, 1, 2, 3, 4, 5, 6])]);

        e.tick(at(6, 6, 0, 0));
        // Large catch-up window does not overflow.
        assert_eq!(fired_id(&e.tick(at(6, 7, 0, 0))), Some("daily"));
        e.dismiss(at(6, 7, 0, 0));
        assert_eq!(e.tick(at(6, 7, 0, 1)), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_manager_toggle_off_cancels_snooze() {
        let (m, _db) = manager();
        let created = m.create(new_alarm("07:00", &[1])).await.unwrap();
        m.tick(at(6, 7, 0, 0)).await;
        assert!(m.snooze(at(6, 7, 0, 10)).is_some());

        m.toggle(&created.id).await.unwrap();
        assert_eq!(m.tick(at(6, 7, 9, 10)).await, TickOutcome::Idle);
    }

    fn manager() -> (AlarmManager, SharedDatabase) {
        let db = Database::open_in_memory().unwrap().into_shared();
        (AlarmManager::new(db.clone(), &AlarmConfig::default()), db)
    }

    fn new_alarm(time: &str, days: &[u8]) -> NewAlarm {
        NewAlarm {
            time: time.parse().unwrap(),
            label: "wake".to_string(),
            days: days.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_manager_writes_through() {
        let (m, db) = manager();
        let created = m.create(new_alarm("06:30", &[1, 2])).await.unwrap();
        assert_eq!(lock_db(&db).get_all_alarms().unwrap(), vec![created.clone()]);

        let toggled = m.toggle(&created.id).await.unwrap();
        assert!(!toggled.is_active);
        assert!(!lock_db(&db).get_alarm(&created.id).unwrap().unwrap().is_active);

        let updated = m.update(&created.id, new_alarm("06:45", &[])).await.unwrap();
        assert_eq!(updated.time.to_string(), "06:45");
        assert!(!updated.is_active);

        m.delete(&created.id).await.unwrap();
        assert!(m.alarms().is_empty());
        assert!(lock_db(&db).get_all_alarms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manager_one_shot_persisted_on_fire() {
        let (m, db) = manager();
        let created = m.create(new_alarm("07:00", &[])).await.unwrap();

        let outcome = m.tick(at(6, 7, 0, 0)).await;
        assert!(matches!(outcome, TickOutcome::Fired { deactivated: true, .. }));
        // Persisted before anyone dismisses it.
        assert!(m.ringing().is_some());
        assert!(!lock_db(&db).get_alarm(&created.id).unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_manager_unknown_id() {
        let (m, _db) = manager();
        assert!(matches!(m.toggle("nope").await, Err(CoreError::NotFound(_))));
        assert!(matches!(m.delete("nope").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manager_rejects_bad_weekday() {
        let (m, db) = manager();
        assert!(m.create(new_alarm("07:00", &[9])).await.is_err());
        assert!(m.alarms().is_empty());
        assert!(lock_db(&db).get_all_alarms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manager_load_orders_by_time() {
        let (m, db) = manager();
        {
            let db = lock_db(&db);
            db.put_alarm(&alarm("x", "21:00", &[])).unwrap();
            db.put_alarm(&alarm("y", "05:00", &[])).unwrap();
        }
        assert_eq!(m.load().await.unwrap(), 2);
        let ids: Vec<String> = m.alarms().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["y", "x"]);
    }
}
