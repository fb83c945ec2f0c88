use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How long a stopped timer may finish its current tick before it is
/// cancelled.
const TIMER_GRACE: Duration = Duration::from_millis(500);

struct TimerTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TimerTask {
    async fn shutdown(self) {
        let TimerTask { stop, mut handle } = self;
        let _ = stop.send(());
        if tokio::time::timeout(TIMER_GRACE, &mut handle).await.is_err() {
            warn!("Heartbeat timer still busy after {TIMER_GRACE:?}, cancelling it");
            handle.abort();
        }
    }
}

/// Failure detector and leader-side ticker in one.
///
/// While following, [`start_monitoring`](Self::start_monitoring) checks once
/// per window whether any heartbeat arrived and runs the callback if none
/// did. Once leader, [`start_scheduling`](Self::start_scheduling) replaces
/// the detector with a fixed-rate task. At most one timer runs at a time.
///
/// A disabled service ignores every call.
pub struct HeartbeatService {
    enabled: bool,
    epoch: Instant,
    last_heartbeat_ms: Arc<AtomicU64>,
    timer: Mutex<Option<TimerTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

impl HeartbeatService {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            epoch: Instant::now(),
            last_heartbeat_ms: Arc::new(AtomicU64::new(0)),
            timer: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn heartbeat_received(&self) {
        if !self.enabled {
            return;
        }
        self.last_heartbeat_ms
            .store(millis_since(self.epoch), Ordering::Relaxed);
    }

    pub fn since_last_heartbeat(&self) -> Duration {
        let silent_ms =
            millis_since(self.epoch).saturating_sub(self.last_heartbeat_ms.load(Ordering::Relaxed));
        Duration::from_millis(silent_ms)
    }

    /// Whether a monitoring or scheduling task is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.timer)
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// Runs `on_missed_heartbeat` once per `heartbeat_timeout` window in which
    /// no heartbeat was received. Stops any running timer first.
    pub async fn start_monitoring<F, Fut>(&self, on_missed_heartbeat: F, heartbeat_timeout: Duration)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.enabled {
            return;
        }

        let epoch = self.epoch;
        let last_heartbeat_ms = Arc::clone(&self.last_heartbeat_ms);
        let timeout_ms = heartbeat_timeout.as_millis() as u64;
        let check = move || {
            let silent_ms =
                millis_since(epoch).saturating_sub(last_heartbeat_ms.load(Ordering::Relaxed));
            let missed = (silent_ms > timeout_ms).then(|| {
                debug!("No heartbeat for {silent_ms} ms (timeout {timeout_ms} ms)");
                on_missed_heartbeat()
            });
            async move {
                if let Some(on_missed) = missed {
                    on_missed.await;
                }
            }
        };

        self.replace_timer(Duration::ZERO, heartbeat_timeout, check)
            .await;
    }

    /// Runs `on_heartbeat` every `period` after `initial_delay`. Stops any
    /// running timer first.
    pub async fn start_scheduling<F, Fut>(&self, on_heartbeat: F, period: Duration, initial_delay: Duration)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.enabled {
            return;
        }
        self.replace_timer(initial_delay, period, on_heartbeat).await;
    }

    /// Stops the running timer, cancelling it if it does not finish its
    /// current tick within the grace period.
    pub async fn stop(&self) {
        if !self.enabled {
            return;
        }
        let timer = lock(&self.timer).take();
        if let Some(timer) = timer {
            timer.shutdown().await;
        }
    }

    async fn replace_timer<T, Fut>(&self, initial_delay: Duration, period: Duration, tick: T)
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop().await;

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(run_timer(stopped, initial_delay, period, tick));
        let raced = lock(&self.timer).replace(TimerTask { stop, handle });
        if let Some(raced) = raced {
            raced.shutdown().await;
        }
    }
}

async fn run_timer<T, Fut>(
    mut stopped: oneshot::Receiver<()>,
    initial_delay: Duration,
    period: Duration,
    mut tick: T,
) where
    T: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => tick().await,
        }
    }
}
