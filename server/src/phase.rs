//! Round phase scheduler
//!
//! Drives the endless `PRE_GAME → GAME → GAME_BREAK → PRE_GAME` cycle. Each
//! phase lasts a fixed configured duration measured from the moment it is
//! actually entered, and every entry is announced to a listener together with
//! the absolute time the phase ends.
//!
//! A single tokio task owns the pending transition. Restarting or stopping the
//! scheduler aborts that task and bumps a generation counter, so a transition
//! that was already in flight cannot fire against the new schedule.

use log::{debug, info};
use shared::{timestamp_millis, PhaseName, RoundPhase};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        timestamp_millis()
    }
}

/// Receives every phase entry
///
/// Called while the scheduler's state lock is held, which is what guarantees
/// that nothing is delivered after `stop()` returns. Implementations must not
/// call back into the scheduler.
pub trait PhaseListener: Send + Sync + 'static {
    fn on_phase_change(&self, phase: RoundPhase);
}

/// Configured length of each phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub pre_game: Duration,
    pub game: Duration,
    pub game_break: Duration,
}

impl PhaseDurations {
    pub fn of(&self, name: PhaseName) -> Duration {
        match name {
            PhaseName::PreGame => self.pre_game,
            PhaseName::Game => self.game,
            PhaseName::GameBreak => self.game_break,
        }
    }
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            pre_game: Duration::from_secs(10),
            game: Duration::from_secs(150),
            game_break: Duration::from_secs(2),
        }
    }
}

struct SchedulerState {
    current: RoundPhase,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    durations: PhaseDurations,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn PhaseListener>,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `name` the live phase, notifies the listener and returns how
    /// long to wait before the next transition.
    fn enter(&self, state: &mut SchedulerState, name: PhaseName) -> Duration {
        let duration = self.durations.of(name);
        let ends_at = self
            .clock
            .now_millis()
            .saturating_add(duration.as_millis() as u64);
        let phase = RoundPhase { name, ends_at };

        state.current = phase;
        info!("Phase changed to: {} (ends at {})", name, ends_at);
        self.listener.on_phase_change(phase);
        duration
    }
}

/// Self-driving round phase state machine
pub struct PhaseScheduler {
    shared: Arc<Shared>,
}

impl PhaseScheduler {
    /// Creates an idle scheduler. Nothing is announced until `start()`.
    pub fn new(
        durations: PhaseDurations,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn PhaseListener>,
    ) -> Self {
        let current = RoundPhase {
            name: PhaseName::PreGame,
            ends_at: clock
                .now_millis()
                .saturating_add(durations.pre_game.as_millis() as u64),
        };

        Self {
            shared: Arc::new(Shared {
                durations,
                clock,
                listener,
                state: Mutex::new(SchedulerState {
                    current,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Enters `PRE_GAME` and schedules the cycle
    ///
    /// Must be called from within a tokio runtime. Calling it again restarts
    /// the cycle; the previously pending transition is cancelled first.
    pub fn start(&self) {
        let mut state = self.shared.lock_state();
        if let Some(timer) = state.timer.take() {
            debug!("Cancelling pending phase transition before restart");
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let wait = self.shared.enter(&mut state, PhaseName::PreGame);
        state.timer = Some(tokio::spawn(drive(
            Arc::clone(&self.shared),
            generation,
            wait,
        )));
    }

    /// Cancels the pending transition. No notification fires afterwards.
    pub fn stop(&self) {
        let mut state = self.shared.lock_state();
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
            info!("Phase scheduler stopped");
        }
    }

    /// The live phase, for clients that join between broadcasts
    pub fn current_phase(&self) -> RoundPhase {
        self.shared.lock_state().current
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_state().timer.is_some()
    }
}

impl Drop for PhaseScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Waits out the current phase, then advances, forever
async fn drive(shared: Arc<Shared>, generation: u64, mut wait: Duration) {
    loop {
        sleep(wait).await;

        wait = {
            let mut state = shared.lock_state();
            if state.generation != generation {
                return;
            }
            let next = state.current.name.next();
            shared.enter(&mut state, next)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    const TOLERANCE_MS: u64 = 5;

    /// Wall clock that follows tokio's (pausable) time
    struct TestClock {
        origin: Instant,
        base: u64,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                origin: Instant::now(),
                base: 1_000_000,
            })
        }
    }

    impl Clock for TestClock {
        fn now_millis(&self) -> u64 {
            self.base + self.origin.elapsed().as_millis() as u64
        }
    }

    /// Records each notification with the time it was delivered
    struct Recorder {
        clock: Arc<TestClock>,
        seen: Mutex<Vec<(u64, RoundPhase)>>,
    }

    impl Recorder {
        fn new(clock: Arc<TestClock>) -> Arc<Self> {
            Arc::new(Self {
                clock,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<PhaseName> {
            self.seen.lock().unwrap().iter().map(|(_, p)| p.name).collect()
        }

        fn entries(&self) -> Vec<(u64, RoundPhase)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PhaseListener for Recorder {
        fn on_phase_change(&self, phase: RoundPhase) {
            let now = self.clock.now_millis();
            self.seen.lock().unwrap().push((now, phase));
        }
    }

    fn durations() -> PhaseDurations {
        PhaseDurations {
            pre_game: Duration::from_secs(10),
            game: Duration::from_secs(150),
            game_break: Duration::from_secs(2),
        }
    }

    fn scheduler() -> (PhaseScheduler, Arc<Recorder>, Arc<TestClock>) {
        let clock = TestClock::new();
        let recorder = Recorder::new(Arc::clone(&clock));
        let scheduler = PhaseScheduler::new(durations(), clock.clone(), recorder.clone());
        (scheduler, recorder, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_started() {
        let (scheduler, recorder, _) = scheduler();

        sleep(Duration::from_secs(500)).await;
        assert!(recorder.names().is_empty());
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.current_phase().name, PhaseName::PreGame);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_announces_pre_game() {
        let (scheduler, recorder, clock) = scheduler();

        scheduler.start();
        let phase = scheduler.current_phase();

        assert_eq!(recorder.names(), vec![PhaseName::PreGame]);
        assert_eq!(phase.name, PhaseName::PreGame);
        assert_eq!(phase.ends_at, clock.now_millis() + 10_000);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_order() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();

        // Two full cycles plus the first phase of the third.
        let cycle = Duration::from_secs(10 + 150 + 2);
        sleep(cycle * 2 + Duration::from_millis(500)).await;

        assert_eq!(
            recorder.names(),
            vec![
                PhaseName::PreGame,
                PhaseName::Game,
                PhaseName::GameBreak,
                PhaseName::PreGame,
                PhaseName::Game,
                PhaseName::GameBreak,
                PhaseName::PreGame,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_follow_durations() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();

        sleep(Duration::from_millis(9_900)).await;
        assert_eq!(scheduler.current_phase().name, PhaseName::PreGame);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.current_phase().name, PhaseName::Game);

        sleep(Duration::from_millis(149_800)).await;
        assert_eq!(scheduler.current_phase().name, PhaseName::Game);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.current_phase().name, PhaseName::GameBreak);

        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(scheduler.current_phase().name, PhaseName::PreGame);
        assert_eq!(recorder.names().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_time_is_entry_plus_duration() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();
        sleep(Duration::from_secs(3 * 162)).await;

        let entries = recorder.entries();
        assert!(entries.len() >= 9);
        for (notified_at, phase) in &entries {
            let expected = durations().of(phase.name).as_millis() as u64;
            assert_eq!(phase.ends_at - notified_at, expected);
        }

        // Each phase starts where the previous one was announced to end.
        for pair in entries.windows(2) {
            let (_, previous) = pair[0];
            let (entered_at, _) = pair[1];
            assert!(entered_at >= previous.ends_at);
            assert!(entered_at - previous.ends_at <= TOLERANCE_MS);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_scheduler() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();
        sleep(Duration::from_millis(10_500)).await;
        assert_eq!(recorder.names().len(), 2);

        scheduler.stop();
        assert!(!scheduler.is_running());
        sleep(Duration::from_secs(1_000)).await;

        assert_eq!(recorder.names().len(), 2);
        assert_eq!(scheduler.current_phase().name, PhaseName::Game);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_leaves_single_timer() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();
        sleep(Duration::from_secs(5)).await;
        scheduler.start();

        // The stale timer from the first start would have fired at t=10s.
        sleep(Duration::from_millis(9_000)).await;
        assert_eq!(
            recorder.names(),
            vec![PhaseName::PreGame, PhaseName::PreGame]
        );

        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(
            recorder.names(),
            vec![PhaseName::PreGame, PhaseName::PreGame, PhaseName::Game]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_resumes_from_pre_game() {
        let (scheduler, recorder, _) = scheduler();
        scheduler.start();
        sleep(Duration::from_millis(10_500)).await;
        scheduler.stop();

        scheduler.start();
        assert_eq!(scheduler.current_phase().name, PhaseName::PreGame);
        sleep(Duration::from_millis(10_500)).await;
        assert_eq!(
            recorder.names(),
            vec![
                PhaseName::PreGame,
                PhaseName::Game,
                PhaseName::PreGame,
                PhaseName::Game,
            ]
        );
    }

    #[test]
    fn test_default_durations() {
        let defaults = PhaseDurations::default();
        assert_eq!(defaults.of(PhaseName::PreGame), Duration::from_secs(10));
        assert_eq!(defaults.of(PhaseName::Game), Duration::from_secs(150));
        assert_eq!(defaults.of(PhaseName::GameBreak), Duration::from_secs(2));
    }
}
