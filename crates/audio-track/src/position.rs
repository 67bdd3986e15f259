//! Observable playback position.
//!
//! [`PositionSignal`] is the producer side: a single millisecond value that changes as the
//! sink reports progress and can be closed once playback ends. Each [`PositionReceiver`]
//! starts with the current value and then sees every change until the signal closes.
//!
//! The signal is written from the sink's notification thread and read from any number of
//! consumer threads; a mutex plus condition variable keeps updates ordered.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

struct PositionInner {
    value: i64,
    version: u64,
    closed: bool,
}

struct PositionShared {
    inner: Mutex<PositionInner>,
    cv: Condvar,
}

/// Producer handle for a millisecond position stream. Cloning shares the same cell.
#[derive(Clone)]
pub struct PositionSignal {
    shared: Arc<PositionShared>,
}

impl PositionSignal {
    pub fn new(initial: i64) -> Self {
        Self {
            shared: Arc::new(PositionShared {
                inner: Mutex::new(PositionInner {
                    value: initial,
                    version: 0,
                    closed: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Publish a new position. Equal values and writes after [`close`](Self::close) are dropped.
    pub fn set(&self, ms: i64) {
        let mut g = self.shared.inner.lock().unwrap();
        if g.closed || g.value == ms {
            return;
        }
        g.value = ms;
        g.version += 1;
        drop(g);
        self.shared.cv.notify_all();
    }

    /// Stop the stream. The last value stays readable through [`last`](Self::last).
    pub fn close(&self) {
        let mut g = self.shared.inner.lock().unwrap();
        if g.closed {
            return;
        }
        g.closed = true;
        drop(g);
        self.shared.cv.notify_all();
    }

    pub fn last(&self) -> i64 {
        self.shared.inner.lock().unwrap().value
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed
    }

    /// Start a new receiver. It yields the current value first unless the signal is closed.
    pub fn subscribe(&self) -> PositionReceiver {
        PositionReceiver {
            shared: self.shared.clone(),
            seen: None,
        }
    }
}

/// Consumer side of a [`PositionSignal`].
pub struct PositionReceiver {
    shared: Arc<PositionShared>,
    seen: Option<u64>,
}

impl PositionReceiver {
    /// Block until a value this receiver has not seen is available.
    ///
    /// Returns `None` once the signal is closed and nothing new remains.
    pub fn recv(&mut self) -> Option<i64> {
        let mut g = self.shared.inner.lock().unwrap();
        loop {
            if let Some(value) = take_unseen(&mut self.seen, &g) {
                return Some(value);
            }
            if g.closed {
                return None;
            }
            g = self.shared.cv.wait(g).unwrap();
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    ///
    /// A closed signal reports [`RecvTimeoutError::Disconnected`].
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<i64, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut g = self.shared.inner.lock().unwrap();
        loop {
            if let Some(value) = take_unseen(&mut self.seen, &g) {
                return Ok(value);
            }
            if g.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvTimeoutError::Timeout);
            }
            let (next, _timeout) = self.shared.cv.wait_timeout(g, deadline - now).unwrap();
            g = next;
        }
    }

    /// Non-blocking poll for an unseen value.
    pub fn try_recv(&mut self) -> Option<i64> {
        let g = self.shared.inner.lock().unwrap();
        take_unseen(&mut self.seen, &g)
    }

    /// Current value regardless of what this receiver has seen.
    pub fn latest(&self) -> i64 {
        self.shared.inner.lock().unwrap().value
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed
    }
}

fn take_unseen(seen: &mut Option<u64>, g: &PositionInner) -> Option<i64> {
    match *seen {
        Some(version) if version >= g.version => None,
        None if g.closed => None,
        _ => {
            *seen = Some(g.version);
            Some(g.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn receiver_starts_with_current_value() {
        let signal = PositionSignal::new(250);
        let mut rx = signal.subscribe();
        assert_eq!(rx.try_recv(), Some(250));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn equal_values_do_not_emit() {
        let signal = PositionSignal::new(0);
        let mut rx = signal.subscribe();
        assert_eq!(rx.try_recv(), Some(0));
        signal.set(0);
        assert_eq!(rx.try_recv(), None);
        signal.set(10);
        assert_eq!(rx.try_recv(), Some(10));
    }

    #[test]
    fn close_keeps_last_value_and_ends_stream() {
        let signal = PositionSignal::new(0);
        let mut rx = signal.subscribe();
        assert_eq!(rx.recv(), Some(0));
        signal.set(40);
        signal.close();
        signal.set(80);

        assert_eq!(rx.recv(), Some(40));
        assert_eq!(rx.recv(), None);
        assert_eq!(signal.last(), 40);
        assert!(rx.is_closed());
        assert_eq!(rx.latest(), 40);
    }

    #[test]
    fn subscribe_after_close_yields_nothing() {
        let signal = PositionSignal::new(5);
        signal.close();
        let mut rx = signal.subscribe();
        assert_eq!(rx.recv(), None);
        assert_eq!(rx.latest(), 5);
    }

    #[test]
    fn recv_wakes_on_update_from_other_thread() {
        let signal = PositionSignal::new(0);
        let mut rx = signal.subscribe();
        assert_eq!(rx.recv(), Some(0));

        let producer = signal.clone();
        let handle = thread::spawn(move || {
            producer.set(100);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(100));
        handle.join().unwrap();
    }

    #[test]
    fn recv_timeout_reports_elapsed() {
        let signal = PositionSignal::new(0);
        let mut rx = signal.subscribe();
        assert_eq!(rx.try_recv(), Some(0));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
        signal.close();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
