use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    content::ResolvedPopupContent,
    recorder::VisitInfo,
    trigger::{PopupTrigger, TriggerEvent, TriggerState},
};

const TICK: Duration = Duration::from_secs(1);

/// Called once when the popup becomes visible.
pub type OnShow = Box<dyn FnOnce() + Send + 'static>;

// ── Trigger session ────────────────────────────────────────────────────────

/// Runs one visit's [`PopupTrigger`] on a background task.
///
/// Events go in through [`TriggerSession::send`]; the current state comes
/// out through a watch channel. The one-second countdown tick exists only
/// while the machine is counting. A visit left armed or showing with no
/// event for the idle period is closed as expired. Dropping the session
/// aborts the task, so a torn-down visit never leaves a timer behind.
pub struct TriggerSession {
    events: mpsc::UnboundedSender<TriggerEvent>,
    state: watch::Receiver<TriggerState>,
    task: JoinHandle<()>,
}

impl TriggerSession {
    /// Start a session whose popup content is already resolved. The visit
    /// sits in `Loading` until the page reports the frame as loaded, and is
    /// abandoned if that does not happen within `timers.loading_grace`.
    pub fn start(
        content: ResolvedPopupContent,
        timers: SessionTimers,
        on_show: Option<OnShow>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TriggerState::Loading);

        let task = tokio::spawn(drive(PopupTrigger::new(), rx, state_tx, timers, on_show));

        // The receiver is alive until the task ends, which cannot have
        // happened yet.
        let _ = events.send(TriggerEvent::DataReady(Box::new(content)));

        Self {
            events,
            state,
            task,
        }
    }

    /// Queue an event. Returns `false` once the session has finished.
    pub fn send(&self, event: TriggerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn state(&self) -> TriggerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TriggerState> {
        self.state.clone()
    }

    /// `true` once the machine reached a terminal state or was torn down.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TriggerSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive(
    mut machine: PopupTrigger,
    mut events: mpsc::UnboundedReceiver<TriggerEvent>,
    state_tx: watch::Sender<TriggerState>,
    timers: SessionTimers,
    mut on_show: Option<OnShow>,
) {
    let grace_deadline = time::sleep(timers.loading_grace);
    tokio::pin!(grace_deadline);
    let idle_deadline = time::sleep(timers.idle);
    tokio::pin!(idle_deadline);

    let mut ticker: Option<Interval> = None;

    loop {
        let loading = matches!(machine.state(), TriggerState::Loading);
        let waiting = matches!(
            machine.state(),
            TriggerState::Armed | TriggerState::ShowingPopup
        );

        let event = tokio::select! {
            received = events.recv() => match received {
                Some(event) => event,
                None => break,
            },
            _ = next_tick(&mut ticker), if ticker.is_some() => TriggerEvent::Tick,
            _ = &mut grace_deadline, if loading => TriggerEvent::GraceElapsed,
            _ = &mut idle_deadline, if waiting => TriggerEvent::IdleElapsed,
        };

        // Any word from the page restarts the idle period.
        idle_deadline.as_mut().reset(Instant::now() + timers.idle);

        for state in machine.handle(event) {
            if state == TriggerState::ShowingPopup {
                if let Some(callback) = on_show.take() {
                    callback();
                }
            }
            state_tx.send_replace(state);
        }

        match machine.state() {
            TriggerState::Counting { .. } => {
                if ticker.is_none() {
                    let mut interval = time::interval_at(Instant::now() + TICK, TICK);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker = Some(interval);
                }
            }
            state if state.is_terminal() => break,
            _ => ticker = None,
        }
    }
}

/// Deadlines a session enforces on its own.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    /// How long the visit may stay in `Loading`.
    pub loading_grace: Duration,
    /// How long the visit may sit armed or showing without any event.
    pub idle: Duration,
}

impl SessionTimers {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            loading_grace: config.loading_grace,
            idle: config.visit_idle,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ── Visit registry ─────────────────────────────────────────────────────────

/// A live visit: its trigger session plus what is needed to attribute the
/// popup events it produces.
pub struct Visit {
    pub session: TriggerSession,
    pub info: VisitInfo,
}

/// Thread-safe map of visit id -> live visit.
///
/// Finished visits are pruned opportunistically whenever a new one is
/// inserted. Removing a visit drops its session, which cancels its timers.
#[derive(Clone, Default)]
pub struct VisitRegistry {
    inner: Arc<DashMap<Uuid, Arc<Visit>>>,
}

impl VisitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, visit: Visit) -> Uuid {
        self.inner.retain(|_, v| !v.session.is_finished());
        let id = Uuid::new_v4();
        self.inner.insert(id, Arc::new(visit));
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Visit>> {
        self.inner.get(id).map(|v| Arc::clone(v.value()))
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        content,
        models::{Popup, ShortLink},
        trigger::CloseReason,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delayed(seconds: u32) -> ResolvedPopupContent {
        let link = ShortLink::new("user-1", "abc123", "https://example.com");
        let mut popup = Popup::new("user-1", "Promo");
        popup.content = Some(format!(r#"{{"delay_seconds":{seconds}}}"#));
        content::resolve(&popup, &link)
    }

    fn timers(grace_secs: u64) -> SessionTimers {
        SessionTimers {
            loading_grace: Duration::from_secs(grace_secs),
            idle: Duration::from_secs(600),
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_runs_from_frame_load() {
        let shown = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shown);
        let session = TriggerSession::start(
            delayed(3),
            timers(60),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        // Time passing before the frame loads does not count.
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state(), TriggerState::Loading);

        assert!(session.send(TriggerEvent::FrameLoaded));
        settle().await;
        assert_eq!(session.state(), TriggerState::Counting { remaining: 3 });

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(session.state(), TriggerState::Counting { remaining: 1 });
        assert_eq!(shown.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(session.state(), TriggerState::ShowingPopup);
        assert_eq!(shown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_shows_immediately() {
        let session = TriggerSession::start(delayed(0), timers(60), None);
        session.send(TriggerEvent::FrameLoaded);
        settle().await;
        assert_eq!(session.state(), TriggerState::ShowingPopup);

        session.send(TriggerEvent::Dismiss);
        settle().await;
        assert_eq!(
            session.state(),
            TriggerState::Closed {
                reason: CloseReason::Dismissed
            }
        );
        assert!(session.is_finished());
        assert!(!session.send(TriggerEvent::Tick));
    }

    #[tokio::test(start_paused = true)]
    async fn visit_is_abandoned_when_frame_never_loads() {
        let session = TriggerSession::start(delayed(3), timers(20), None);
        let mut states = session.subscribe();

        time::sleep(Duration::from_secs(21)).await;
        settle().await;

        assert_eq!(session.state(), TriggerState::Abandoned);
        assert!(session.is_finished());
        // The final state is still observable after the task has ended.
        assert_eq!(*states.borrow_and_update(), TriggerState::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn popup_left_open_without_activity_expires() {
        let session = TriggerSession::start(delayed(0), timers(60), None);
        session.send(TriggerEvent::FrameLoaded);
        settle().await;
        assert_eq!(session.state(), TriggerState::ShowingPopup);

        // A late event pushes the deadline back.
        time::sleep(Duration::from_secs(400)).await;
        session.send(TriggerEvent::Scrolled { percent: 10 });
        settle().await;
        time::sleep(Duration::from_secs(400)).await;
        assert_eq!(session.state(), TriggerState::ShowingPopup);

        time::sleep(Duration::from_secs(201)).await;
        settle().await;
        assert_eq!(
            session.state(),
            TriggerState::Closed {
                reason: CloseReason::Expired
            }
        );
        assert!(session.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_cancels_the_countdown() {
        let shown = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shown);
        let session = TriggerSession::start(
            delayed(5),
            timers(60),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let mut states = session.subscribe();
        session.send(TriggerEvent::FrameLoaded);
        settle().await;
        assert_eq!(session.state(), TriggerState::Counting { remaining: 5 });

        drop(session);
        settle().await;

        // The aborted task dropped its sender; no further states arrive.
        states.borrow_and_update();
        assert!(states.changed().await.is_err());

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(shown.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_prunes_finished_visits() {
        let registry = VisitRegistry::new();

        let finished = TriggerSession::start(delayed(0), timers(60), None);
        finished.send(TriggerEvent::FrameLoaded);
        finished.send(TriggerEvent::Dismiss);
        let first = registry.insert(Visit {
            session: finished,
            info: VisitInfo::default(),
        });
        settle().await;

        let live = TriggerSession::start(delayed(3), timers(60), None);
        let second = registry.insert(Visit {
            session: live,
            info: VisitInfo::default(),
        });

        assert!(registry.get(&first).is_none());
        assert!(registry.get(&second).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(&second);
        assert!(registry.is_empty());
    }
}
