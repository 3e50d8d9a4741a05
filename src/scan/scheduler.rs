//! Scan scheduling
//!
//! At most one scan runs at a time. Automatic scans come from a background
//! loop; manual scans are started on request and never queued.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{ScanError, ScanRunner};
use crate::models::{ScanMode, ScanStatus};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scan interval must be at least one minute, got {0}")]
    InvalidInterval(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Idle,
    Running {
        mode: ScanMode,
        started: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct SchedulerState {
    phase: ScanPhase,
    interval: ChronoDuration,
    last_started: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
    next_scheduled: Option<DateTime<Utc>>,
    last_processed: usize,
}

impl SchedulerState {
    fn until_next(&self, now: DateTime<Utc>) -> Duration {
        let next = self.next_scheduled.unwrap_or(now + self.interval);
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

struct Shared {
    runner: Arc<dyn ScanRunner>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    stopping: AtomicBool,
}

impl Shared {
    // Critical sections only assign plain fields, so a poisoned lock still
    // holds consistent state.
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The only way into `Running`; refused once shutdown has begun
    fn try_begin(self: &Arc<Self>, mode: ScanMode) -> Option<ScanTicket> {
        let mut state = self.lock_state();
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        if let ScanPhase::Running { .. } = state.phase {
            return None;
        }

        let now = Utc::now();
        state.phase = ScanPhase::Running { mode, started: now };
        state.last_started = Some(now);
        state.last_processed = 0;

        Some(ScanTicket {
            shared: Arc::clone(self),
            mode,
            finished: false,
        })
    }

    fn finish(&self, mode: ScanMode, processed: usize) {
        let mut state = self.lock_state();
        let now = Utc::now();
        state.phase = ScanPhase::Idle;
        state.last_finished = Some(now);
        state.last_processed = processed;
        state.next_scheduled = Some(now + state.interval);

        log::info!(
            "{} scan finished (processed={}). Next scan at {}",
            mode,
            processed,
            now + state.interval
        );
    }

    /// Push the next auto scan one interval out
    fn defer_next(&self) {
        let mut state = self.lock_state();
        state.next_scheduled = Some(Utc::now() + state.interval);
    }
}

/// Proof of holding the running slot
///
/// Not clonable. Finishing consumes it; dropping an unfinished ticket (for
/// example while unwinding from a panicking scan) finishes with zero
/// processed events, so the scheduler never stays stuck in `Running`.
pub struct ScanTicket {
    shared: Arc<Shared>,
    mode: ScanMode,
    finished: bool,
}

impl ScanTicket {
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn complete(mut self, processed: usize) {
        self.finished = true;
        self.shared.finish(self.mode, processed);
    }
}

impl Drop for ScanTicket {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.finish(self.mode, 0);
        }
    }
}

#[derive(Default)]
struct Tasks {
    scheduler_loop: Option<JoinHandle<()>>,
    manual: Option<JoinHandle<()>>,
}

pub struct ScanScheduler {
    shared: Arc<Shared>,
    runtime: Handle,
    tasks: Mutex<Tasks>,
}

impl ScanScheduler {
    /// The first automatic scan is due one interval from now
    pub fn new(
        runner: Arc<dyn ScanRunner>,
        interval_minutes: u32,
        runtime: Handle,
    ) -> Result<Self, SchedulerError> {
        let interval = interval(interval_minutes)?;
        let state = SchedulerState {
            phase: ScanPhase::Idle,
            interval,
            last_started: None,
            last_finished: None,
            next_scheduled: Some(Utc::now() + interval),
            last_processed: 0,
        };

        Ok(ScanScheduler {
            shared: Arc::new(Shared {
                runner,
                state: Mutex::new(state),
                wake: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
            runtime,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the background loop; calling it again is a no-op
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if tasks.scheduler_loop.is_some() {
            return;
        }
        tasks.scheduler_loop = Some(self.runtime.spawn(run_loop(Arc::clone(&self.shared))));

        let next = self.shared.lock_state().next_scheduled;
        log::info!(
            "Automatic scan scheduler started; next scan at {}",
            next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unscheduled".to_string())
        );
    }

    /// Start a manual scan in the background
    ///
    /// Returns false without queueing anything if a scan is already running
    /// or the scheduler is shutting down.
    pub fn trigger_manual(&self) -> bool {
        // Held until the handle is stored, so `shutdown` either sees the
        // handle or makes `try_begin` refuse
        let mut tasks = self.lock_tasks();
        let ticket = match self.shared.try_begin(ScanMode::Manual) {
            Some(ticket) => ticket,
            None => {
                log::info!("Skipping manual scan; another scan is in progress or shutdown has begun");
                return false;
            }
        };

        tasks.manual = Some(self.runtime.spawn(execute(Arc::clone(&self.shared), ticket)));
        true
    }

    /// Run a scan on the calling thread; `None` if one is already running
    /// or shutdown has begun
    pub fn run_blocking(&self, mode: ScanMode) -> Result<Option<usize>, ScanError> {
        let ticket = match self.shared.try_begin(mode) {
            Some(ticket) => ticket,
            None => return Ok(None),
        };

        log::info!("{} scan initiated", mode);
        match self.shared.runner.run_scan(mode) {
            Ok(processed) => {
                ticket.complete(processed);
                Ok(Some(processed))
            }
            Err(e) => {
                ticket.complete(0);
                Err(e)
            }
        }
    }

    pub fn status(&self) -> ScanStatus {
        let state = self.shared.lock_state();
        let (running, mode) = match state.phase {
            ScanPhase::Idle => (false, None),
            ScanPhase::Running { mode, .. } => (true, Some(mode)),
        };

        ScanStatus {
            running,
            mode,
            last_started: state.last_started,
            last_finished: state.last_finished,
            next_scheduled: state.next_scheduled,
            last_processed: state.last_processed,
        }
    }

    /// When the current scan started, if one is running
    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        match self.shared.lock_state().phase {
            ScanPhase::Running { started, .. } => Some(started),
            ScanPhase::Idle => None,
        }
    }

    pub fn interval_minutes(&self) -> i64 {
        self.shared.lock_state().interval.num_minutes()
    }

    /// Change the interval and reschedule the next scan from now
    pub fn update_interval(&self, minutes: u32) -> Result<(), SchedulerError> {
        let interval = interval(minutes)?;
        {
            let mut state = self.shared.lock_state();
            state.interval = interval;
            state.next_scheduled = Some(Utc::now() + interval);
        }
        self.shared.wake.notify_one();
        log::info!("Scan interval updated to {} minutes", minutes);
        Ok(())
    }

    /// Stop the loop and wait for the in-flight scan, at most `grace`
    ///
    /// A running scan is never cancelled. Returns false if the grace period
    /// ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        {
            let _state = self.shared.lock_state();
            self.shared.stopping.store(true, Ordering::SeqCst);
        }
        self.shared.wake.notify_one();

        let (scheduler_loop, manual) = {
            let mut tasks = self.lock_tasks();
            (tasks.scheduler_loop.take(), tasks.manual.take())
        };

        let drain = async {
            for handle in [scheduler_loop, manual].into_iter().flatten() {
                if let Err(e) = handle.await {
                    log::error!("Scheduler task failed: {}", e);
                }
            }
        };

        match tokio::time::timeout(grace, drain).await {
            Ok(()) => {
                log::info!("Scan scheduler stopped");
                true
            }
            Err(_) => {
                log::warn!("Scan still running after {:?}; not waiting any longer", grace);
                false
            }
        }
    }

    #[cfg(test)]
    fn schedule_now(&self) {
        self.shared.lock_state().next_scheduled = Some(Utc::now());
        self.shared.wake.notify_one();
    }
}

fn interval(minutes: u32) -> Result<ChronoDuration, SchedulerError> {
    if minutes == 0 {
        return Err(SchedulerError::InvalidInterval(minutes));
    }
    Ok(ChronoDuration::minutes(minutes as i64))
}

/// Run the ticket's scan on the blocking pool and release the slot
async fn execute(shared: Arc<Shared>, ticket: ScanTicket) {
    let mode = ticket.mode();
    let runner = Arc::clone(&shared.runner);
    log::info!("{} scan initiated", mode);

    let processed = match tokio::task::spawn_blocking(move || runner.run_scan(mode)).await {
        Ok(Ok(processed)) => processed,
        Ok(Err(e)) => {
            log::error!("{} scan failed: {}", mode, e);
            0
        }
        Err(e) => {
            log::error!("{} scan aborted: {}", mode, e);
            0
        }
    };
    ticket.complete(processed);
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let wait = shared.lock_state().until_next(Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            // Interval change or shutdown; recompute the wait
            _ = shared.wake.notified() => continue,
        }

        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        match shared.try_begin(ScanMode::Auto) {
            Some(ticket) => execute(Arc::clone(&shared), ticket).await,
            None => {
                log::debug!("Skipping auto scan; another scan is in progress");
                shared.defer_next();
            }
        }
    }
    log::debug!("Scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Runner that sleeps, counts runs and tracks overlap
    #[derive(Default)]
    struct FakeRunner {
        delay_ms: u64,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    impl FakeRunner {
        fn with_delay(delay_ms: u64) -> Self {
            FakeRunner {
                delay_ms,
                ..Default::default()
            }
        }
    }

    impl ScanRunner for FakeRunner {
        fn run_scan(&self, _mode: ScanMode) -> Result<usize, ScanError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panic {
                panic!("scan exploded");
            }
            if self.fail {
                return Err(ScanError::LockPoisoned);
            }
            Ok(7)
        }
    }

    fn scheduler(runner: Arc<FakeRunner>, minutes: u32) -> ScanScheduler {
        ScanScheduler::new(runner, minutes, Handle::current()).unwrap()
    }

    async fn wait_idle(scheduler: &ScanScheduler) {
        for _ in 0..200 {
            if !scheduler.status().running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan did not finish");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_trigger_is_exclusive() {
        let runner = Arc::new(FakeRunner::with_delay(100));
        let scheduler = scheduler(runner.clone(), 5);

        assert!(scheduler.trigger_manual());
        assert!(!scheduler.trigger_manual());

        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.mode, Some(ScanMode::Manual));
        assert!(scheduler.running_since().is_some());

        wait_idle(&scheduler).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_triggers_start_one_scan() {
        let runner = Arc::new(FakeRunner::with_delay(200));
        let scheduler = Arc::new(scheduler(runner.clone(), 5));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                std::thread::spawn(move || scheduler.trigger_manual())
            })
            .collect();
        let started = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|started| *started)
            .count();

        assert_eq!(started, 1);
        wait_idle(&scheduler).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_updates_status() {
        let runner = Arc::new(FakeRunner::with_delay(0));
        let scheduler = scheduler(runner, 5);

        assert!(scheduler.trigger_manual());
        wait_idle(&scheduler).await;

        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.mode, None);
        assert_eq!(status.last_processed, 7);
        let finished = status.last_finished.unwrap();
        assert!(status.last_started.unwrap() <= finished);
        assert_eq!(status.next_scheduled.unwrap(), finished + ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn test_failed_scan_releases_slot() {
        let runner = Arc::new(FakeRunner {
            fail: true,
            ..Default::default()
        });
        let scheduler = scheduler(runner, 5);

        assert!(scheduler.trigger_manual());
        wait_idle(&scheduler).await;
        assert_eq!(scheduler.status().last_processed, 0);
        assert!(scheduler.trigger_manual());
    }

    #[tokio::test]
    async fn test_panicking_scan_releases_slot() {
        let runner = Arc::new(FakeRunner {
            panic: true,
            ..Default::default()
        });
        let scheduler = scheduler(runner, 5);

        assert!(scheduler.trigger_manual());
        wait_idle(&scheduler).await;
        assert!(scheduler.status().last_finished.is_some());
    }

    #[tokio::test]
    async fn test_update_interval() {
        let scheduler = scheduler(Arc::new(FakeRunner::default()), 5);

        assert_eq!(scheduler.update_interval(0), Err(SchedulerError::InvalidInterval(0)));
        assert_eq!(scheduler.interval_minutes(), 5);

        let before = Utc::now();
        scheduler.update_interval(15).unwrap();
        assert_eq!(scheduler.interval_minutes(), 15);
        let next = scheduler.status().next_scheduled.unwrap();
        assert!(next >= before + ChronoDuration::minutes(15));
        assert!(next <= Utc::now() + ChronoDuration::minutes(15));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = ScanScheduler::new(Arc::new(FakeRunner::default()), 0, runtime.handle().clone());
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(0))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_runs_auto_scan() {
        let runner = Arc::new(FakeRunner::with_delay(0));
        let scheduler = scheduler(runner.clone(), 60);
        scheduler.start();
        scheduler.start();

        scheduler.schedule_now();
        for _ in 0..200 {
            if runner.runs.load(Ordering::SeqCst) > 0 && !scheduler.status().running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        let status = scheduler.status();
        assert_eq!(status.last_processed, 7);
        assert!(status.next_scheduled.unwrap() > Utc::now() + ChronoDuration::minutes(59));

        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_inflight_scan() {
        let runner = Arc::new(FakeRunner::with_delay(150));
        let scheduler = scheduler(runner.clone(), 5);
        scheduler.start();

        assert!(scheduler.trigger_manual());
        assert!(scheduler.shutdown(Duration::from_secs(2)).await);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.status().running);

        // No new scans after shutdown
        assert!(!scheduler.trigger_manual());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_awaits_every_started_scan() {
        let runner = Arc::new(FakeRunner::with_delay(30));
        let scheduler = Arc::new(scheduler(runner.clone(), 5));
        let started = Arc::new(AtomicUsize::new(0));

        let trigger = {
            let scheduler = Arc::clone(&scheduler);
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                for _ in 0..300 {
                    if scheduler.trigger_manual() {
                        started.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.shutdown(Duration::from_secs(2)).await);

        // Every scan started before shutdown returned has finished
        assert!(!scheduler.status().running);
        let finished = runner.runs.load(Ordering::SeqCst);
        tokio::task::spawn_blocking(move || trigger.join().unwrap()).await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), finished);
        assert!(finished >= 1);

        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            tokio::task::spawn_blocking(move || scheduler.run_blocking(ScanMode::Manual))
                .await
                .unwrap()
        };
        assert!(matches!(blocked, Ok(None)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_grace_expires() {
        let runner = Arc::new(FakeRunner::with_delay(500));
        let scheduler = scheduler(runner, 5);

        assert!(scheduler.trigger_manual());
        assert!(!scheduler.shutdown(Duration::from_millis(20)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_respects_running_scan() {
        let runner = Arc::new(FakeRunner::with_delay(100));
        let scheduler = Arc::new(scheduler(runner, 5));

        assert!(scheduler.trigger_manual());
        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            tokio::task::spawn_blocking(move || scheduler.run_blocking(ScanMode::Manual))
                .await
                .unwrap()
        };
        assert!(matches!(blocked, Ok(None)));

        wait_idle(&scheduler).await;
        let ran = {
            let scheduler = Arc::clone(&scheduler);
            tokio::task::spawn_blocking(move || scheduler.run_blocking(ScanMode::Manual))
                .await
                .unwrap()
        };
        assert!(matches!(ran, Ok(Some(7))));
    }
}
