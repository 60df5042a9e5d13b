//! Per-run event sink and cancellation token.
//!
//! Each run writes through its own [`EventSink`]. The sink closes itself
//! when it delivers the run's terminal event, so a superseded run cannot
//! leak events into the next run's stream no matter which thread still
//! holds a handle to it.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, broadcast};

use quill_core::CancelFlag;

use crate::events::ExecutionEvent;

/// Terminal outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finished normally (runtime errors included; they are events, not
    /// pipeline faults).
    Completed,
    /// The pipeline failed: restore errors, compile errors, or the
    /// process-level failure carried here.
    Faulted(Option<String>),
    /// Cancelled or superseded.
    Cancelled,
}

impl RunOutcome {
    fn into_event(self) -> ExecutionEvent {
        match self {
            RunOutcome::Completed => ExecutionEvent::Completed,
            RunOutcome::Faulted(error) => ExecutionEvent::Faulted { error },
            RunOutcome::Cancelled => ExecutionEvent::Cancelled,
        }
    }
}

/// Write side of one run's event stream.
///
/// Clones share the closed flag: after `finish` delivers the terminal
/// event, every later emission through any clone is dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ExecutionEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit a non-terminal event.
    ///
    /// Dropped silently after the terminal event or when no subscriber is
    /// listening.
    pub fn emit(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }

    /// Deliver the terminal event and close the sink.
    ///
    /// Only the first call wins; returns whether this call delivered it.
    pub fn finish(&self, outcome: RunOutcome) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(outcome.into_event());
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Cancellation token carried by one run request.
///
/// Wraps the engine's [`CancelFlag`] (checked synchronously at stage
/// boundaries) with an async notifier for tasks that need to wake on
/// cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: CancelFlag,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    /// The synchronous flag, for blocking stages.
    pub fn flag(&self) -> CancelFlag {
        self.flag.clone()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.flag.is_cancelled() {
                return;
            }
            let mut notified = pin!(self.notify.notified());
            // Register interest before re-checking, so a cancel between
            // the check and the await still wakes this task.
            notified.as_mut().enable();
            if self.flag.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_delivers_events_in_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let sink = EventSink::new(tx);

        sink.emit(ExecutionEvent::RestoreStarted);
        sink.emit(ExecutionEvent::Output {
            text: "hi".to_string(),
        });
        assert!(sink.finish(RunOutcome::Completed));

        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::RestoreStarted
        ));
        assert!(matches!(rx.try_recv().unwrap(), ExecutionEvent::Output { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ExecutionEvent::Completed));
    }

    #[test]
    fn test_sink_closes_after_terminal() {
        let (tx, mut rx) = broadcast::channel(16);
        let sink = EventSink::new(tx);

        assert!(sink.finish(RunOutcome::Cancelled));
        assert!(!sink.finish(RunOutcome::Completed));
        sink.emit(ExecutionEvent::Output {
            text: "late".to_string(),
        });

        assert!(matches!(rx.try_recv().unwrap(), ExecutionEvent::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_clones_share_closed_state() {
        let (tx, _rx) = broadcast::channel(16);
        let sink = EventSink::new(tx);
        let other = sink.clone();

        assert!(sink.finish(RunOutcome::Completed));
        assert!(other.is_closed());
        assert!(!other.finish(RunOutcome::Faulted(None)));
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on cancel")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
