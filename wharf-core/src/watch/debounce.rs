//! Coalesces bursts of watch events into single [`ChangeSignal`]s.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, trace};

use super::WatchEvent;

/// Quiet period used when the caller does not configure one.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// "Something may have changed, recheck." Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSignal;

/// Spawn the aggregator task.
///
/// Every event restarts the window; once `window` passes without a new
/// event one signal is offered to `signal_tx`. The offer never blocks: if a
/// signal is still outstanding the new one is dropped, since the pending
/// recheck will observe the same state. A signal can still follow one that
/// was just consumed when events race the window; rechecks are idempotent.
///
/// The task ends when `events` closes, flushing a pending signal first.
pub fn spawn_debouncer(
    mut events: mpsc::Receiver<WatchEvent>,
    signal_tx: mpsc::Sender<ChangeSignal>,
    window: Duration,
) -> JoinHandle<()> {
    let window = window.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut pending = 0usize;

        loop {
            let next = if pending == 0 {
                events.recv().await
            } else {
                match timeout(window, events.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        emit(&signal_tx, pending);
                        pending = 0;
                        continue;
                    }
                }
            };

            let Some(event) = next else {
                if pending > 0 {
                    emit(&signal_tx, pending);
                }
                debug!("event stream closed; debouncer exiting");
                break;
            };

            trace!(path = %event.path.display(), op = %event.op, "debounce window restarted");
            pending += 1;
        }
    })
}

fn emit(signal_tx: &mpsc::Sender<ChangeSignal>, coalesced: usize) {
    match signal_tx.try_send(ChangeSignal) {
        Ok(()) => debug!(coalesced, "change signal emitted"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(coalesced, "recheck already pending; signal dropped")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("change signal receiver gone")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{Mask, Op};
    use std::path::PathBuf;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{Instant, sleep};

    fn event() -> WatchEvent {
        WatchEvent {
            path: PathBuf::from("/cfg/app.toml"),
            op: Op::CLOSE_WRITE,
            mask: Mask::IN_CLOSE_WRITE,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_yields_one_signal() {
        let (tx, rx) = mpsc::channel(64);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let _task = spawn_debouncer(rx, signal_tx, DEFAULT_DEBOUNCE_WINDOW);

        for _ in 0..5 {
            tx.send(event()).await.unwrap();
        }

        assert_eq!(signal_rx.recv().await, Some(ChangeSignal));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(signal_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn window_restarts_on_each_event() {
        let (tx, rx) = mpsc::channel(64);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let _task = spawn_debouncer(rx, signal_tx, DEFAULT_DEBOUNCE_WINDOW);

        let start = Instant::now();
        for _ in 0..3 {
            tx.send(event()).await.unwrap();
            sleep(Duration::from_millis(150)).await;
            assert_eq!(signal_rx.try_recv(), Err(TryRecvError::Empty));
        }

        signal_rx.recv().await.unwrap();
        // last event at 300ms, window 200ms
        assert!(start.elapsed() >= Duration::from_millis(500));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(signal_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_signal_separately() {
        let (tx, rx) = mpsc::channel(64);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let _task = spawn_debouncer(rx, signal_tx, DEFAULT_DEBOUNCE_WINDOW);

        tx.send(event()).await.unwrap();
        signal_rx.recv().await.unwrap();

        tx.send(event()).await.unwrap();
        tx.send(event()).await.unwrap();
        signal_rx.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_stream_flushes_pending_signal() {
        let (tx, rx) = mpsc::channel(64);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let task = spawn_debouncer(rx, signal_tx, DEFAULT_DEBOUNCE_WINDOW);

        tx.send(event()).await.unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(signal_rx.recv().await, Some(ChangeSignal));
        assert_eq!(signal_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_signal_is_not_queued_twice() {
        let (tx, rx) = mpsc::channel(64);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let _task = spawn_debouncer(rx, signal_tx, DEFAULT_DEBOUNCE_WINDOW);

        tx.send(event()).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        tx.send(event()).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(signal_rx.try_recv(), Ok(ChangeSignal));
        assert_eq!(signal_rx.try_recv(), Err(TryRecvError::Empty));
    }
}
