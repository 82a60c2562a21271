//! Elapsed-time counters
//!
//! Each [`Stopwatch`] ticks on its own tokio task and publishes
//! [`TimerState`] values through a `watch` channel. Owners only read ticks;
//! the counter itself is never shared.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use shared_types::TimerState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tick period; the display resolution is hundredths of a second.
pub const TICK: Duration = Duration::from_millis(10);

struct Running {
    started: Instant,
    handle: JoinHandle<()>,
}

pub struct Stopwatch {
    tx: watch::Sender<TimerState>,
    running: Option<Running>,
    frozen: Duration,
}

impl Stopwatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TimerState::zero());
        Self {
            tx,
            running: None,
            frozen: Duration::ZERO,
        }
    }

    /// Start counting from zero. No-op while already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        self.frozen = Duration::ZERO;
        self.tx.send_replace(TimerState::zero());

        let started = Instant::now();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                ticker.tick().await;
                tx.send_replace(TimerState::from_elapsed(started.elapsed()));
            }
        });
        self.running = Some(Running { started, handle });
    }

    /// Freeze the counter at its current value.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
            self.frozen = running.started.elapsed();
            self.tx.send_replace(TimerState::from_elapsed(self.frozen));
        }
    }

    /// Stop and show zero again.
    pub fn reset(&mut self) {
        self.stop();
        self.frozen = Duration::ZERO;
        self.tx.send_replace(TimerState::zero());
    }

    /// Kill the ticking task outright and zero the display.
    pub fn terminate(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
        self.frozen = Duration::ZERO;
        self.tx.send_replace(TimerState::zero());
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        match &self.running {
            Some(running) => running.started.elapsed(),
            None => self.frozen,
        }
    }

    pub fn current(&self) -> TimerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerState> {
        self.tx.subscribe()
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

/// A fixed set of named stopwatches, one per tracked phase
pub struct TimerBank<K> {
    timers: HashMap<K, Stopwatch>,
}

impl<K: Eq + Hash + Clone> TimerBank<K> {
    pub fn new(phases: impl IntoIterator<Item = K>) -> Self {
        Self {
            timers: phases.into_iter().map(|k| (k, Stopwatch::new())).collect(),
        }
    }

    pub fn start(&mut self, phase: &K) {
        if let Some(timer) = self.timers.get_mut(phase) {
            timer.start();
        }
    }

    pub fn stop(&mut self, phase: &K) {
        if let Some(timer) = self.timers.get_mut(phase) {
            timer.stop();
        }
    }

    pub fn reset_all(&mut self) {
        self.timers.values_mut().for_each(Stopwatch::reset);
    }

    pub fn terminate_all(&mut self) {
        self.timers.values_mut().for_each(Stopwatch::terminate);
    }

    pub fn get(&self, phase: &K) -> Option<&Stopwatch> {
        self.timers.get(phase)
    }

    pub fn snapshot(&self) -> HashMap<K, TimerState> {
        self.timers
            .iter()
            .map(|(k, timer)| (k.clone(), timer.current()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stopwatch_counts_and_freezes() {
        let mut sw = Stopwatch::new();
        let mut ticks = sw.subscribe();
        sw.start();
        assert!(sw.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        ticks.changed().await.unwrap();
        sw.stop();

        assert!(!sw.is_running());
        assert_eq!(sw.elapsed(), Duration::from_millis(1500));
        let state = sw.current();
        assert_eq!(state.sec, "01");
        assert_eq!(state.msec, "50");

        // Frozen after stop
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sw.current().sec, "01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_counts_from_zero() {
        let mut sw = Stopwatch::new();
        sw.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        sw.stop();

        sw.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sw.stop();
        assert_eq!(sw.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bank_terminate_zeroes_everything() {
        let mut bank = TimerBank::new(["total", "step1"]);
        bank.start(&"total");
        bank.start(&"step1");
        tokio::time::sleep(Duration::from_secs(2)).await;
        bank.stop(&"step1");
        assert!(bank.get(&"total").is_some_and(Stopwatch::is_running));
        assert!(!bank.get(&"step1").is_some_and(Stopwatch::is_running));

        bank.terminate_all();
        assert!(!bank.get(&"total").is_some_and(Stopwatch::is_running));
        for state in bank.snapshot().values() {
            assert_eq!(*state, TimerState::zero());
        }
    }
}
