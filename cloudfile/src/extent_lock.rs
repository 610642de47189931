//! Byte-range extent locks (spec §4.2). Readers take shared locks,
//! writers take exclusive locks; two ranges conflict iff `a<d && c<b`.
//! Writer-preference fairness: once an exclusive request is queued for a
//! range, later shared requests for an overlapping range queue behind it
//! rather than jumping ahead, so a steady stream of readers can't starve
//! a writer (spec §4.2, "wait_for_exclusive").

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

fn overlaps(a: u64, b: u64, c: u64, d: u64) -> bool {
    a < d && c < b
}

struct Held {
    start: u64,
    end: u64,
    mode: Mode,
}

struct Waiter {
    start: u64,
    end: u64,
    mode: Mode,
    wake: oneshot::Sender<()>,
}

struct State {
    held: Vec<Held>,
    waiters: VecDeque<Waiter>,
}

impl State {
    /// A request for `[start,end)`/`mode` can proceed now iff it doesn't
    /// overlap anything held, AND (when shared) no already-queued waiter
    /// for an overlapping range is exclusive (writer preference).
    fn can_grant(&self, start: u64, end: u64, mode: Mode) -> bool {
        for h in &self.held {
            if overlaps(start, end, h.start, h.end) {
                if !(mode == Mode::Shared && h.mode == Mode::Shared) {
                    return false;
                }
            }
        }
        if mode == Mode::Shared {
            for w in &self.waiters {
                if w.mode == Mode::Exclusive && overlaps(start, end, w.start, w.end) {
                    return false;
                }
            }
        }
        true
    }

    /// Wake every queued waiter that can now proceed, in FIFO order,
    /// stopping scans for exclusive waiters as soon as one is blocked.
    fn wake_eligible(&mut self) {
        let mut i = 0;
        while i < self.waiters.len() {
            let w = &self.waiters[i];
            if self.can_grant(w.start, w.end, w.mode) {
                let w = self.waiters.remove(i).unwrap();
                self.held.push(Held {
                    start: w.start,
                    end: w.end,
                    mode: w.mode,
                });
                let _ = w.wake.send(());
            } else {
                i += 1;
            }
        }
    }
}

/// RAII guard: dropping it releases the extent and wakes any waiters that
/// can now proceed.
pub struct ExtentGuard {
    table: Arc<ExtentLockTable>,
    start: u64,
    end: u64,
    mode: Mode,
}

impl Drop for ExtentGuard {
    fn drop(&mut self) {
        self.table.release(self.start, self.end, self.mode);
    }
}

#[derive(Default)]
pub struct ExtentLockTable {
    state: Mutex<State>,
}

impl ExtentLockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                held: Vec::new(),
                waiters: VecDeque::new(),
            }),
        })
    }

    pub async fn lock_shared(self: &Arc<Self>, start: u64, end: u64) -> ExtentGuard {
        self.lock(start, end, Mode::Shared).await
    }

    pub async fn lock_exclusive(self: &Arc<Self>, start: u64, end: u64) -> ExtentGuard {
        self.lock(start, end, Mode::Exclusive).await
    }

    async fn lock(self: &Arc<Self>, start: u64, end: u64, mode: Mode) -> ExtentGuard {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if state.waiters.is_empty() && state.can_grant(start, end, mode) {
                    state.held.push(Held { start, end, mode });
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { start, end, mode, wake: tx });
                    Some(rx)
                }
            };
            match rx {
                None => {
                    return ExtentGuard {
                        table: Arc::clone(self),
                        start,
                        end,
                        mode,
                    };
                }
                Some(rx) => {
                    // Woken by `release`, which already pushed us into `held`.
                    let _ = rx.await;
                    return ExtentGuard {
                        table: Arc::clone(self),
                        start,
                        end,
                        mode,
                    };
                }
            }
        }
    }

    fn release(&self, start: u64, end: u64, mode: Mode) {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .held
            .iter()
            .position(|h| h.start == start && h.end == end && h.mode == mode)
        {
            state.held.remove(pos);
        }
        state.wake_eligible();
    }

    pub fn has_conflict(&self, start: u64, end: u64) -> bool {
        let state = self.state.lock();
        state.held.iter().any(|h| overlaps(start, end, h.start, h.end))
    }
}
