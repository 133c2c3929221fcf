//! Coalescing of remote-change notifications.

use crate::context::Liveness;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Turns bursts of "remote data changed" signals into at most one tick
/// per window.
///
/// The first signal after a quiet period opens a window; signals arriving
/// inside it are absorbed, and a single tick fires when the window closes.
/// The background task ends once every handle is dropped or the engine
/// shuts down.
#[derive(Debug, Clone)]
pub(crate) struct ChangeNotificationThrottle {
    signals: mpsc::UnboundedSender<()>,
}

impl ChangeNotificationThrottle {
    /// Spawns the throttle task on the current runtime.
    pub(crate) fn spawn<F>(window: Duration, liveness: Arc<Liveness>, on_tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (signals, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                    _ = liveness.cancelled() => break,
                }

                let deadline = Instant::now() + window;
                let mut coalesced = 1u32;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break,
                        signal = rx.recv() => match signal {
                            Some(()) => coalesced += 1,
                            None => return,
                        },
                        _ = liveness.cancelled() => return,
                    }
                }

                if !liveness.is_live() {
                    break;
                }
                debug!(coalesced, "remote change notifications coalesced");
                on_tick();
            }
            debug!("notification throttle stopped");
        });

        Self { signals }
    }

    /// Records one remote-change signal.
    pub(crate) fn notify(&self) {
        // A closed channel means the task already stopped.
        let _ = self.signals.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(window: Duration) -> (ChangeNotificationThrottle, Arc<AtomicUsize>, Arc<Liveness>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let liveness = Arc::new(Liveness::default());
        let counter = Arc::clone(&ticks);
        let throttle = ChangeNotificationThrottle::spawn(window, Arc::clone(&liveness), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (throttle, ticks, liveness)
    }

    #[tokio::test(start_paused = true)]
    async fn storm_fires_once() {
        let (throttle, ticks, _) = counting(Duration::from_secs(2));

        for _ in 0..10 {
            throttle.notify();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_trailing_edge() {
        let (throttle, ticks, _) = counting(Duration::from_secs(2));

        throttle.notify();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_fire_separately() {
        let (throttle, ticks, _) = counting(Duration::from_secs(2));

        throttle.notify();
        tokio::time::sleep(Duration::from_secs(3)).await;
        throttle.notify();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_tick() {
        let (throttle, ticks, liveness) = counting(Duration::from_secs(2));

        throttle.notify();
        tokio::time::sleep(Duration::from_millis(500)).await;
        liveness.shut_down();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
