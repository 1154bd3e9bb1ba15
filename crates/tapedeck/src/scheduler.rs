//! Cron-driven trigger firing with admission control.
//!
//! Trigger state lives in the [`Store`] and is re-read on every tick, so
//! edits made through the admin CLI take effect without a restart. The
//! concurrent-session limit is a semaphore: a fire holds an owned permit
//! from the admission decision until the session's slot is released, so
//! the check and the increment are one atomic step.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cron::{CronError, CronExpr, CronZone};
use crate::store::{Store, StoreError};
use crate::types::{
    RecordingSession, ScheduleTrigger, SessionId, SessionStage, StreamId, TriggerId,
};

pub use crate::cron::validate_cron;

pub const MAX_DURATION_MINUTES: u32 = 1440;
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("duration must be between 1 and 1440 minutes, got {0}")]
    InvalidDuration(u32),

    #[error("max retries must be at most 10, got {0}")]
    InvalidRetries(u32),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("trigger {0} not found")]
    TriggerNotFound(TriggerId),

    #[error("cron expression {0:?} never fires")]
    NeverFires(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counting gate for concurrently active sessions.
#[derive(Debug, Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<SessionSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionSlot { _permit: permit })
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One occupied concurrent-session slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
}

/// Starts a persisted session on its own task.
///
/// Implementations must return promptly and must not panic; the scheduler
/// loop waits on this call.
#[async_trait]
pub trait SessionStarter: Send + Sync {
    async fn start_session(
        &self,
        trigger: &ScheduleTrigger,
        session: RecordingSession,
        slot: SessionSlot,
    ) -> anyhow::Result<SessionId>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Executed {
        trigger_id: TriggerId,
        session_id: SessionId,
        scheduled_for: DateTime<Utc>,
    },
    /// At capacity; nothing was created.
    Skipped {
        trigger_id: TriggerId,
        active: usize,
        limit: usize,
    },
    /// A fire older than the grace window was dropped.
    Missed {
        trigger_id: TriggerId,
        scheduled_for: DateTime<Utc>,
    },
    Error {
        trigger_id: TriggerId,
        message: String,
    },
}

pub trait SchedulerObserver: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

/// Writes scheduler events to the log.
pub struct LoggingObserver;

impl SchedulerObserver for LoggingObserver {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Executed {
                trigger_id,
                session_id,
                scheduled_for,
            } => tracing::info!(
                trigger.id = %trigger_id,
                session.id = %session_id,
                %scheduled_for,
                "Trigger fired"
            ),
            SchedulerEvent::Skipped {
                trigger_id,
                active,
                limit,
            } => tracing::warn!(
                trigger.id = %trigger_id,
                active,
                limit,
                "At session capacity, skipping fire"
            ),
            SchedulerEvent::Missed {
                trigger_id,
                scheduled_for,
            } => tracing::warn!(
                trigger.id = %trigger_id,
                %scheduled_for,
                "Fire missed beyond grace window, dropped"
            ),
            SchedulerEvent::Error {
                trigger_id,
                message,
            } => tracing::error!(trigger.id = %trigger_id, error = %message, "Trigger fire failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_sessions: usize,
    /// Late fires within this window still run once; older ones are dropped.
    pub misfire_grace: Duration,
    pub zone: CronZone,
    pub tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 3,
            misfire_grace: Duration::from_secs(300),
            zone: CronZone::Local,
            tick: Duration::from_secs(1),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &tapeconf::TapeConfig) -> Self {
        let recording = &config.defaults.recording;
        Self {
            max_concurrent_sessions: recording.max_concurrent_sessions,
            misfire_grace: recording.misfire_grace(),
            ..Self::default()
        }
    }
}

/// Fields an operator supplies when adding a trigger.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub stream_id: StreamId,
    pub name: String,
    pub cron: String,
    pub duration_minutes: u32,
    pub max_retries: u32,
    pub active: bool,
}

pub struct JobScheduler {
    store: Arc<dyn Store>,
    starter: Arc<dyn SessionStarter>,
    observer: Arc<dyn SchedulerObserver>,
    admission: Admission,
    settings: SchedulerSettings,
    // serializes fires so admission checks never interleave
    firing: tokio::sync::Mutex<()>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        starter: Arc<dyn SessionStarter>,
        admission: Admission,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            starter,
            observer: Arc::new(LoggingObserver),
            admission,
            settings,
            firing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Next fire of `expr` strictly after `base`.
    pub fn compute_next_fire(
        &self,
        expr: &str,
        base: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        compute_next_fire(self.settings.zone, expr, base)
    }

    pub fn add_trigger(&self, new: NewTrigger) -> Result<ScheduleTrigger, SchedulerError> {
        self.validate(&new.stream_id, &new.cron, new.duration_minutes, new.max_retries)?;

        let now = Utc::now();
        let next_fire = if new.active {
            Some(self.compute_next_fire(&new.cron, now)?)
        } else {
            None
        };
        let trigger = ScheduleTrigger {
            id: TriggerId::new(),
            stream_id: new.stream_id,
            name: new.name,
            cron: CronExpr::parse(&new.cron)?.to_string(),
            duration_minutes: new.duration_minutes,
            active: new.active,
            max_retries: new.max_retries,
            next_fire,
            last_fire: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_trigger(&trigger)?;

        tracing::info!(
            trigger.id = %trigger.id,
            cron = %trigger.cron,
            next_fire = ?trigger.next_fire,
            "Trigger added"
        );
        Ok(trigger)
    }

    /// Replace a trigger's definition; the next fire is recomputed.
    pub fn update_trigger(&self, mut trigger: ScheduleTrigger) -> Result<ScheduleTrigger, SchedulerError> {
        if self.store.get_trigger(&trigger.id)?.is_none() {
            return Err(SchedulerError::TriggerNotFound(trigger.id));
        }
        self.validate(
            &trigger.stream_id,
            &trigger.cron,
            trigger.duration_minutes,
            trigger.max_retries,
        )?;

        let now = Utc::now();
        trigger.cron = CronExpr::parse(&trigger.cron)?.to_string();
        trigger.next_fire = if trigger.active {
            Some(self.compute_next_fire(&trigger.cron, now)?)
        } else {
            None
        };
        trigger.updated_at = now;
        self.store.update_trigger(&trigger)?;

        tracing::info!(trigger.id = %trigger.id, next_fire = ?trigger.next_fire, "Trigger updated");
        Ok(trigger)
    }

    pub fn set_active(&self, id: &TriggerId, active: bool) -> Result<ScheduleTrigger, SchedulerError> {
        let mut trigger = self
            .store
            .get_trigger(id)?
            .ok_or_else(|| SchedulerError::TriggerNotFound(id.clone()))?;
        trigger.active = active;
        self.update_trigger(trigger)
    }

    /// Refused while a non-terminal session references the trigger.
    pub fn remove_trigger(&self, id: &TriggerId) -> Result<bool, SchedulerError> {
        let removed = self.store.delete_trigger(id)?;
        if removed {
            tracing::info!(trigger.id = %id, "Trigger removed");
        }
        Ok(removed)
    }

    pub fn list_triggers(&self) -> Result<Vec<ScheduleTrigger>, SchedulerError> {
        Ok(self.store.list_triggers()?)
    }

    fn validate(
        &self,
        stream_id: &StreamId,
        cron: &str,
        duration_minutes: u32,
        max_retries: u32,
    ) -> Result<(), SchedulerError> {
        let expr = CronExpr::parse(cron)?;
        if !(1..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
            return Err(SchedulerError::InvalidDuration(duration_minutes));
        }
        if max_retries > MAX_RETRIES {
            return Err(SchedulerError::InvalidRetries(max_retries));
        }
        if self.settings.zone.next_fire(&expr, Utc::now()).is_none() {
            return Err(SchedulerError::NeverFires(cron.to_string()));
        }
        if self.store.get_stream(stream_id)?.is_none() {
            return Err(SchedulerError::StreamNotFound(stream_id.clone()));
        }
        Ok(())
    }

    /// Reload active triggers after a restart.
    ///
    /// Triggers with no next fire get one. A fire missed by more than the
    /// grace window is reported and rescheduled from `now`; one inside the
    /// window is left due so the next tick runs it once.
    pub fn start(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let triggers = self.store.list_active_triggers()?;
        for mut trigger in triggers.iter().cloned() {
            match trigger.next_fire {
                None => {
                    self.reschedule(&mut trigger, now)?;
                }
                Some(due) if due <= now && !self.within_grace(due, now) => {
                    self.emit(SchedulerEvent::Missed {
                        trigger_id: trigger.id.clone(),
                        scheduled_for: due,
                    });
                    self.reschedule(&mut trigger, now)?;
                }
                Some(_) => {}
            }
        }
        tracing::info!(
            triggers = triggers.len(),
            limit = self.admission.limit(),
            "Scheduler loaded triggers"
        );
        Ok(triggers.len())
    }

    fn within_grace(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - due).to_std().map_or(true, |late| late <= self.settings.misfire_grace)
    }

    fn reschedule(&self, trigger: &mut ScheduleTrigger, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        trigger.next_fire = Some(self.compute_next_fire(&trigger.cron, now)?);
        trigger.updated_at = Utc::now();
        self.store.update_trigger(trigger)?;
        Ok(())
    }

    /// Fire every due trigger once. Returns the events produced.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<SchedulerEvent> {
        let _firing = self.firing.lock().await;

        let triggers = match self.store.list_active_triggers() {
            Ok(triggers) => triggers,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load triggers");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for mut trigger in triggers {
            let Some(due) = trigger.next_fire else { continue };
            if due > now {
                continue;
            }

            let event = if self.within_grace(due, now) {
                trigger.last_fire = Some(now);
                self.fire(&trigger, due).await
            } else {
                SchedulerEvent::Missed {
                    trigger_id: trigger.id.clone(),
                    scheduled_for: due,
                }
            };

            // the next fire is always computed from this evaluation, so any
            // backlog collapses into the one fire above
            if let Err(e) = self.reschedule(&mut trigger, now) {
                tracing::error!(trigger.id = %trigger.id, error = %e, "Failed to reschedule trigger");
            }

            self.emit(event.clone());
            events.push(event);
        }
        events
    }

    /// Fire a trigger immediately, outside its schedule.
    ///
    /// `Ok(None)` means the fire was skipped at capacity.
    pub async fn run_now(&self, id: &TriggerId) -> Result<Option<SessionId>, SchedulerError> {
        let trigger = self
            .store
            .get_trigger(id)?
            .ok_or_else(|| SchedulerError::TriggerNotFound(id.clone()))?;

        let _firing = self.firing.lock().await;
        let event = self.fire(&trigger, Utc::now()).await;
        self.emit(event.clone());
        match event {
            SchedulerEvent::Executed { session_id, .. } => Ok(Some(session_id)),
            _ => Ok(None),
        }
    }

    async fn fire(&self, trigger: &ScheduleTrigger, scheduled_for: DateTime<Utc>) -> SchedulerEvent {
        let Some(slot) = self.admission.try_acquire() else {
            return SchedulerEvent::Skipped {
                trigger_id: trigger.id.clone(),
                active: self.admission.in_use(),
                limit: self.admission.limit(),
            };
        };

        let session = RecordingSession::new(trigger.id.clone());
        if let Err(e) = self.store.create_session(&session) {
            return SchedulerEvent::Error {
                trigger_id: trigger.id.clone(),
                message: format!("failed to persist session: {}", e),
            };
        }

        let session_id = session.id.clone();
        match self.starter.start_session(trigger, session, slot).await {
            Ok(session_id) => SchedulerEvent::Executed {
                trigger_id: trigger.id.clone(),
                session_id,
                scheduled_for,
            },
            Err(e) => {
                let message = format!("{:#}", e);
                self.fail_unstarted(&session_id, &message);
                SchedulerEvent::Error {
                    trigger_id: trigger.id.clone(),
                    message,
                }
            }
        }
    }

    fn fail_unstarted(&self, id: &SessionId, reason: &str) {
        let result = self.store.get_session(id).and_then(|session| {
            let Some(mut session) = session else { return Ok(()) };
            if session.stage.is_terminal() {
                return Ok(());
            }
            let now = Utc::now();
            session.stage = SessionStage::Failed;
            session.failure_reason = Some(format!("failed to start: {}", reason));
            session.finished_at = Some(now);
            session.updated_at = now;
            self.store.update_session(&session)
        });
        if let Err(e) = result {
            tracing::error!(session.id = %id, error = %e, "Failed to record start failure");
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let observer = Arc::clone(&self.observer);
        if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
            tracing::error!(?event, "Scheduler observer panicked");
        }
    }

    /// Tick once per `settings.tick` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.start(Utc::now()) {
            tracing::error!(error = %e, "Scheduler failed to load triggers");
        }

        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

pub fn compute_next_fire(
    zone: CronZone,
    expr: &str,
    base: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let parsed = CronExpr::parse(expr)?;
    zone.next_fire(&parsed, base)
        .ok_or_else(|| SchedulerError::NeverFires(expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::StreamConfig;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Keeps every slot it is handed, so admitted sessions stay active.
    #[derive(Default)]
    struct HoldingStarter {
        held: Mutex<Vec<(SessionId, SessionSlot)>>,
        fail: bool,
    }

    #[async_trait]
    impl SessionStarter for HoldingStarter {
        async fn start_session(
            &self,
            _trigger: &ScheduleTrigger,
            session: RecordingSession,
            slot: SessionSlot,
        ) -> anyhow::Result<SessionId> {
            if self.fail {
                anyhow::bail!("stream vanished");
            }
            self.held.lock().unwrap().push((session.id.clone(), slot));
            Ok(session.id)
        }
    }

    impl HoldingStarter {
        fn started(&self) -> usize {
            self.held.lock().unwrap().len()
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        starter: Arc<HoldingStarter>,
        scheduler: JobScheduler,
        stream: StreamConfig,
    }

    fn fixture(limit: usize, fail: bool) -> Fixture {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let stream = StreamConfig::new("Morning Show", "http://radio.example/live", "u@h:/in/");
        store.create_stream(&stream).unwrap();
        let starter = Arc::new(HoldingStarter {
            fail,
            ..Default::default()
        });
        let settings = SchedulerSettings {
            max_concurrent_sessions: limit,
            zone: CronZone::Utc,
            ..SchedulerSettings::default()
        };
        let scheduler = JobScheduler::new(
            store.clone(),
            starter.clone(),
            Admission::new(limit),
            settings,
        );
        Fixture {
            store,
            starter,
            scheduler,
            stream,
        }
    }

    fn new_trigger(stream: &StreamConfig, cron: &str) -> NewTrigger {
        NewTrigger {
            stream_id: stream.id.clone(),
            name: "hourly".to_string(),
            cron: cron.to_string(),
            duration_minutes: 30,
            max_retries: 2,
            active: true,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, h, m, 0).unwrap()
    }

    /// Force a trigger due at `due`.
    fn make_due(store: &SqliteStore, trigger: &ScheduleTrigger, due: DateTime<Utc>) {
        let mut t = store.get_trigger(&trigger.id).unwrap().unwrap();
        t.next_fire = Some(due);
        store.update_trigger(&t).unwrap();
    }

    #[test]
    fn test_add_trigger_validation() {
        let f = fixture(2, false);
        let ok = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
        assert!(ok.next_fire.unwrap() > Utc::now());

        let err = f
            .scheduler
            .add_trigger(new_trigger(&f.stream, "60 * * * *"))
            .unwrap_err();
        assert!(err.to_string().contains("minute"), "{}", err);

        let err = f.scheduler.add_trigger(new_trigger(&f.stream, "* * * *")).unwrap_err();
        assert!(matches!(err, SchedulerError::Cron(CronError::FieldCount(4))));

        let mut long = new_trigger(&f.stream, "0 * * * *");
        long.duration_minutes = 1441;
        assert!(matches!(
            f.scheduler.add_trigger(long),
            Err(SchedulerError::InvalidDuration(1441))
        ));

        let mut retries = new_trigger(&f.stream, "0 * * * *");
        retries.max_retries = 11;
        assert!(matches!(
            f.scheduler.add_trigger(retries),
            Err(SchedulerError::InvalidRetries(11))
        ));

        let mut orphan = new_trigger(&f.stream, "0 * * * *");
        orphan.stream_id = StreamId::from("missing");
        assert!(matches!(
            f.scheduler.add_trigger(orphan),
            Err(SchedulerError::StreamNotFound(_))
        ));

        assert_eq!(f.scheduler.list_triggers().unwrap().len(), 1);
    }

    #[test]
    fn test_compute_next_fire_is_strictly_after() {
        let f = fixture(1, false);
        let next = f.scheduler.compute_next_fire("0 * * * *", at(10, 0)).unwrap();
        assert_eq!(next, at(11, 0));
        let next = f.scheduler.compute_next_fire("*/15 * * * *", at(10, 7)).unwrap();
        assert_eq!(next, at(10, 15));
        assert!(f.scheduler.compute_next_fire("0 0 30 2 *", at(10, 0)).is_err());
    }

    #[tokio::test]
    async fn test_capacity_two_with_three_fires() {
        let f = fixture(2, false);
        let mut triggers = Vec::new();
        for _ in 0..3 {
            let t = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
            make_due(&f.store, &t, at(10, 0));
            triggers.push(t);
        }

        let events = f.scheduler.tick(at(10, 0)).await;
        let executed = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Executed { .. }))
            .count();
        let skipped = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Skipped { active: 2, limit: 2, .. }))
            .count();
        assert_eq!(executed, 2);
        assert_eq!(skipped, 1);
        assert_eq!(f.starter.started(), 2);
        // skipped fires create nothing
        assert_eq!(f.store.list_sessions(10).unwrap().len(), 2);

        for t in &triggers {
            let reloaded = f.store.get_trigger(&t.id).unwrap().unwrap();
            assert_eq!(reloaded.next_fire, Some(at(11, 0)));
        }
    }

    #[tokio::test]
    async fn test_slot_release_readmits() {
        let f = fixture(1, false);
        let t = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
        make_due(&f.store, &t, at(10, 0));
        f.scheduler.tick(at(10, 0)).await;
        assert_eq!(f.scheduler.admission().in_use(), 1);

        f.starter.held.lock().unwrap().clear();
        assert_eq!(f.scheduler.admission().in_use(), 0);
        assert!(f.scheduler.run_now(&t.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_fire_within_grace_runs_once() {
        let f = fixture(3, false);
        let t = f.scheduler.add_trigger(new_trigger(&f.stream, "* * * * *")).unwrap();
        // three minutes of missed per-minute fires
        make_due(&f.store, &t, at(10, 0));

        assert_eq!(f.scheduler.start(at(10, 3)).unwrap(), 1);
        let events = f.scheduler.tick(at(10, 3)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SchedulerEvent::Executed { .. }));
        assert_eq!(
            f.store.get_trigger(&t.id).unwrap().unwrap().next_fire,
            Some(at(10, 4))
        );
    }

    #[tokio::test]
    async fn test_fire_beyond_grace_is_dropped() {
        let f = fixture(3, false);
        let t = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
        make_due(&f.store, &t, at(10, 0));

        let events = f.scheduler.tick(at(10, 30)).await;
        assert_eq!(
            events,
            vec![SchedulerEvent::Missed {
                trigger_id: t.id.clone(),
                scheduled_for: at(10, 0),
            }]
        );
        assert_eq!(f.starter.started(), 0);
        let reloaded = f.store.get_trigger(&t.id).unwrap().unwrap();
        assert_eq!(reloaded.next_fire, Some(at(11, 0)));
    }

    #[tokio::test]
    async fn test_start_failure_marks_session_failed() {
        let f = fixture(2, true);
        let t = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
        make_due(&f.store, &t, at(10, 0));

        let events = f.scheduler.tick(at(10, 0)).await;
        assert!(matches!(&events[0], SchedulerEvent::Error { message, .. } if message.contains("vanished")));
        let sessions = f.store.list_sessions(10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].stage, SessionStage::Failed);
        assert!(sessions[0].failure_reason.as_deref().unwrap().contains("stream vanished"));
        // the slot went back
        assert_eq!(f.scheduler.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_inactive_triggers_never_fire() {
        let f = fixture(2, false);
        let t = f.scheduler.add_trigger(new_trigger(&f.stream, "0 * * * *")).unwrap();
        let disabled = f.scheduler.set_active(&t.id, false).unwrap();
        assert!(disabled.next_fire.is_none());
        assert!(f.scheduler.tick(Utc::now() + chrono::Duration::days(1)).await.is_empty());
    }

    #[test]
    fn test_observer_panic_is_contained() {
        struct Exploding;
        impl SchedulerObserver for Exploding {
            fn on_event(&self, _event: &SchedulerEvent) {
                panic!("observer bug");
            }
        }
        let f = fixture(1, false);
        let scheduler = f.scheduler.with_observer(Arc::new(Exploding));
        scheduler.emit(SchedulerEvent::Error {
            trigger_id: TriggerId::from("t"),
            message: "x".to_string(),
        });
    }
}
