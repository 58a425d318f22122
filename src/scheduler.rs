//! Fixed-interval timers for the reconciliation passes.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

use crate::error::Result;

/// Run `pass` every `period`, starting immediately.
///
/// Each pass is awaited before the next tick is taken, so passes never
/// overlap; ticks that fire while a pass is still running are skipped.
/// A failed pass is logged and the timer keeps going.
pub fn spawn_every<F, Fut, T>(name: &'static str, period: Duration, mut pass: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: std::fmt::Debug + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match pass().await {
                Ok(summary) => debug!(timer = name, summary = ?summary, "pass complete"),
                Err(e) => error!(timer = name, error = %e, "pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn slow_passes_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let handle = {
            let (running, max_running, passes) =
                (running.clone(), max_running.clone(), passes.clone());
            spawn_every("test", Duration::from_secs(10), move || {
                let (running, max_running, passes) =
                    (running.clone(), max_running.clone(), passes.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    // Each pass outlasts two ticks.
                    tokio::time::sleep(Duration::from_secs(25)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    passes.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            })
        };

        tokio::time::sleep(Duration::from_secs(100)).await;
        handle.abort();

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        let done = passes.load(Ordering::SeqCst);
        assert!((3..=4).contains(&done), "completed {} passes", done);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pass_does_not_stop_the_timer() {
        let passes = Arc::new(AtomicUsize::new(0));
        let handle = {
            let passes = passes.clone();
            spawn_every("failing", Duration::from_secs(1), move || {
                let passes = passes.clone();
                async move {
                    passes.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::config("boom"))
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        handle.abort();
        assert_eq!(passes.load(Ordering::SeqCst), 4);
    }
}
