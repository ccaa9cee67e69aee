//! Background garbage collection workers.
//!
//! A worker sleeps for its interval (or until woken early), then runs its
//! sweep on the blocking pool. Sweeps never overlap for one worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StoreError;

/// Spawns a periodic sweep.
///
/// `wakeup`, when given, triggers a sweep before the interval elapses.
/// The worker exits when `cancel` fires.
pub fn spawn_gc_worker<F>(
    name: &'static str,
    interval: Duration,
    wakeup: Option<Arc<Notify>>,
    cancel: CancellationToken,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Result<usize, StoreError> + Send + Sync + 'static,
{
    let sweep = Arc::new(sweep);

    tokio::spawn(async move {
        loop {
            let woken = async {
                match &wakeup {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = woken => {
                    debug!(worker = name, "Early sweep requested");
                }
            }

            let sweep = Arc::clone(&sweep);
            match tokio::task::spawn_blocking(move || sweep()).await {
                Ok(Ok(removed)) => debug!(worker = name, removed, "Sweep complete"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "Sweep failed"),
                Err(e) => warn!(worker = name, error = %e, "Sweep task aborted"),
            }
        }
        debug!(worker = name, "GC worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_worker_wakes_early_and_stops() {
        let runs = Arc::new(AtomicUsize::new(0));
        let wakeup = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&runs);
        let handle = spawn_gc_worker(
            "test",
            Duration::from_secs(3600),
            Some(Arc::clone(&wakeup)),
            cancel.clone(),
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
        );

        wakeup.notify_one();
        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_runs_on_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&runs);
        let handle = spawn_gc_worker(
            "test",
            Duration::from_millis(10),
            None,
            cancel.clone(),
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
        );

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runs.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
