//! Connection heartbeat.
//!
//! Each pool slot pings its connection every `ping_interval`. The last
//! `window_size` results form a sliding window; a window with at least
//! `invalidation_threshold` failures marks the slot unhealthy, and
//! `death_threshold` consecutive unhealthy windows close the connection so
//! the slot reconnects.

use crate::config::HeartbeatConfig;
use crate::pool::Slot;
use std::collections::VecDeque;
use std::sync::Weak;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Healthy,
    Unhealthy,
    Dead,
}

#[derive(Debug)]
pub(crate) struct HeartbeatWindow {
    size: usize,
    invalidation_threshold: usize,
    death_threshold: usize,
    results: VecDeque<bool>,
    failed_windows: usize,
}

impl HeartbeatWindow {
    pub(crate) fn new(config: &HeartbeatConfig) -> Self {
        Self {
            size: config.window_size,
            invalidation_threshold: config.invalidation_threshold,
            death_threshold: config.death_threshold,
            results: VecDeque::with_capacity(config.window_size),
            failed_windows: 0,
        }
    }

    /// Records one ping result.
    pub(crate) fn record(&mut self, ok: bool) -> Verdict {
        if self.results.len() == self.size {
            self.results.pop_front();
        }
        self.results.push_back(ok);

        let failures = self.results.iter().filter(|ok| !**ok).count();
        if failures < self.invalidation_threshold {
            self.failed_windows = 0;
            return Verdict::Healthy;
        }

        self.failed_windows += 1;
        if self.failed_windows >= self.death_threshold {
            Verdict::Dead
        } else {
            Verdict::Unhealthy
        }
    }

    pub(crate) fn reset(&mut self) {
        self.results.clear();
        self.failed_windows = 0;
    }
}

/// Spawns the heartbeat task of `slot`. The task exits once the slot is
/// closed or dropped.
pub(crate) fn spawn(slot: Weak<Slot>, config: HeartbeatConfig) -> JoinHandle<()> {
    tokio::spawn(run(slot, config))
}

async fn run(slot: Weak<Slot>, config: HeartbeatConfig) {
    let interval = config.ping_interval();
    let mut window = HeartbeatWindow::new(&config);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(slot) = slot.upgrade() else {
            return;
        };
        if slot.is_closed() {
            return;
        }

        let Some(connection) = slot.current() else {
            // not connected yet, or invalidated by the previous round
            if let Err(e) = slot.acquire().await {
                tracing::debug!("Reconnect of {}[{}] failed: {}", slot.tag(), slot.index(), e);
            }
            continue;
        };

        let ok = connection.ping(interval).await.is_ok();
        match window.record(ok) {
            Verdict::Healthy => slot.set_healthy(true),
            Verdict::Unhealthy => {
                tracing::warn!(
                    "Connection {}[{}] is unhealthy, missed heartbeats",
                    slot.tag(),
                    slot.index()
                );
                slot.set_healthy(false);
            }
            Verdict::Dead => {
                tracing::warn!(
                    "Connection {}[{}] is dead, reconnecting",
                    slot.tag(),
                    slot.index()
                );
                window.reset();
                slot.invalidate().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(size: usize, invalidation: usize, death: usize) -> HeartbeatWindow {
        HeartbeatWindow::new(&HeartbeatConfig {
            ping_interval_ms: 10,
            window_size: size,
            invalidation_threshold: invalidation,
            death_threshold: death,
        })
    }

    #[test]
    fn test_healthy_when_below_threshold() {
        let mut w = window(4, 2, 3);
        assert_eq!(w.record(true), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(true), Verdict::Healthy);
    }

    #[test]
    fn test_unhealthy_then_dead() {
        let mut w = window(4, 2, 3);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
        assert_eq!(w.record(false), Verdict::Dead);
    }

    #[test]
    fn test_recovery_resets_failed_windows() {
        let mut w = window(2, 2, 3);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
        assert_eq!(w.record(true), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
    }

    #[test]
    fn test_window_slides() {
        let mut w = window(3, 2, 10);
        w.record(false);
        w.record(true);
        w.record(true);
        // the first failure has left the window
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
    }

    #[test]
    fn test_reset() {
        let mut w = window(2, 1, 2);
        assert_eq!(w.record(false), Verdict::Unhealthy);
        w.reset();
        assert_eq!(w.record(true), Verdict::Healthy);
    }

    #[test]
    fn test_threshold_equal_to_window() {
        let mut w = window(3, 3, 2);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Healthy);
        // window just filled, every slot failed
        assert_eq!(w.record(false), Verdict::Unhealthy);
        assert_eq!(w.record(false), Verdict::Dead);

        // one success drops below the threshold and clears the count
        assert_eq!(w.record(true), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Healthy);
        assert_eq!(w.record(false), Verdict::Unhealthy);
    }
}
