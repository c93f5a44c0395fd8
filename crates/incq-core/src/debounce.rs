//! Debounced filter input gate.
//!
//! Free-text filter inputs arrive per keystroke; each distinct value would
//! otherwise be a new query key and a new fetch. [`FilterGate`] coalesces
//! a burst into a single emission of the *last* value after a quiet
//! period. Dropping the gate cancels any pending emission outright — an
//! unmount during the quiet window must never trigger a late, orphaned
//! query-key transition.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Debouncer emitting only the last value of each input burst.
///
/// One worker task owns the quiet-period deadline. Deadlines are stamped
/// at submission time, so a value whose quiet period has already elapsed
/// emits before a later input can displace it, regardless of when the
/// worker gets scheduled.
pub struct FilterGate<T> {
    tx: mpsc::UnboundedSender<(T, Instant)>,
    worker: JoinHandle<()>,
}

impl<T: Send + 'static> FilterGate<T> {
    /// Create a gate with the given quiet period, returning the receiver
    /// the consumer drains resolved values from.
    #[must_use]
    pub fn new(quiet: Duration) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, input) = mpsc::unbounded_channel();
        let (out, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_gate(input, out, quiet));
        (Self { tx, worker }, rx)
    }

    /// Submit a raw input value, displacing any value still waiting out
    /// its quiet period.
    pub fn submit(&self, value: T) {
        // A closed channel means teardown already happened.
        let _ = self.tx.send((value, Instant::now()));
    }
}

impl<T> Drop for FilterGate<T> {
    fn drop(&mut self) {
        // Cancel, never flush: a torn-down gate must stay silent.
        self.worker.abort();
    }
}

async fn run_gate<T>(
    mut input: mpsc::UnboundedReceiver<(T, Instant)>,
    out: mpsc::UnboundedSender<T>,
    quiet: Duration,
) {
    // An input submitted after an already-due deadline belongs to the
    // next burst; it is carried over rather than displacing the emission.
    let mut carry: Option<(T, Instant)> = None;
    loop {
        let (first, submitted) = match carry.take() {
            Some(item) => item,
            None => match input.recv().await {
                Some(item) => item,
                None => return,
            },
        };
        let mut held = first;
        let mut deadline = submitted + quiet;
        'burst: loop {
            tokio::select! {
                biased;
                () = tokio::time::sleep_until(deadline) => {
                    // The clock passed the deadline, but inputs are judged
                    // by submission time: one submitted before the
                    // deadline still displaces the held value.
                    match input.try_recv() {
                        Ok((value, at)) if at < deadline => {
                            debug!("displacing pending filter emission");
                            held = value;
                            deadline = at + quiet;
                        },
                        Ok(item) => {
                            carry = Some(item);
                            if out.send(held).is_err() {
                                return;
                            }
                            break 'burst;
                        },
                        Err(mpsc::error::TryRecvError::Empty) => {
                            if out.send(held).is_err() {
                                return;
                            }
                            break 'burst;
                        },
                        Err(mpsc::error::TryRecvError::Disconnected) => return,
                    }
                },
                next = input.recv() => match next {
                    Some((value, at)) => {
                        debug!("displacing pending filter emission");
                        held = value;
                        deadline = at + quiet;
                    },
                    None => return,
                },
            }
        }
    }
}
