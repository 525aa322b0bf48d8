//! Buffered, deduplicating hanging-get observer for link status.
//!
//! Direct behavioral port of `status_watcher.cc`: at most one pending "watch" request is parked at
//! a time, consecutive equal statuses are deduplicated, and the bounded queue drops the *oldest*
//! entry on overflow rather than refusing the push.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::descriptor::MAX_STATUS_BUFFER;
use crate::status::{Result, Status};

/// A link-status snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkStatus {
    pub mtu: u32,
    pub online: bool,
}

struct State {
    queue: VecDeque<LinkStatus>,
    last_observed: Option<LinkStatus>,
    pending: bool,
    bound: bool,
}

/// A single client's hanging-get status watcher.
pub struct StatusWatcher {
    max_queue: usize,
    state: Mutex<State>,
    delivered: Condvar,
}

impl StatusWatcher {
    /// Creates a new watcher; `max_queue` is clamped to `[1, MAX_STATUS_BUFFER]`.
    pub fn new(max_queue: usize) -> Self {
        let max_queue = max_queue.clamp(1, MAX_STATUS_BUFFER);
        StatusWatcher {
            max_queue,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(max_queue),
                last_observed: None,
                pending: false,
                bound: true,
            }),
            delivered: Condvar::new(),
        }
    }

    /// Performs one hanging-get: blocks until a status is available to report, then returns it.
    ///
    /// Returns [`Status::BadState`] if another `watch` call is already pending (the client
    /// protocol only allows one outstanding watch at a time) or if the watcher has been unbound.
    pub fn watch(&self) -> Result<LinkStatus> {
        let mut state = self.state.lock().expect("status watcher mutex poisoned");
        if !state.bound {
            return Err(Status::Canceled);
        }
        if state.pending {
            return Err(Status::BadState);
        }
        state.pending = true;
        loop {
            if let Some(next) = state.queue.pop_front() {
                state.last_observed = Some(next);
                state.pending = false;
                self.delivered.notify_all();
                return Ok(next);
            }
            if !state.bound {
                state.pending = false;
                return Err(Status::Canceled);
            }
            state = self
                .delivered
                .wait(state)
                .expect("status watcher condvar poisoned");
        }
    }

    /// Pushes a new observed status, deduplicating against the most recently delivered/queued
    /// value and waking a pending [`StatusWatcher::watch`] call if one exists.
    pub fn push_status(&self, status: LinkStatus) {
        let mut state = self.state.lock().expect("status watcher mutex poisoned");
        let dedup_key = state.queue.back().copied().or(state.last_observed);
        if dedup_key == Some(status) {
            return;
        }
        state.queue.push_back(status);
        if state.queue.len() > self.max_queue {
            state.queue.pop_front();
        }
        self.delivered.notify_all();
    }

    /// Unbinds the watcher: wakes any pending `watch` call with [`Status::Canceled`] and refuses
    /// further watches.
    pub fn unbind(&self) {
        let mut state = self.state.lock().expect("status watcher mutex poisoned");
        state.bound = false;
        self.delivered.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(mtu: u32, online: bool) -> LinkStatus {
        LinkStatus { mtu, online }
    }

    #[test]
    fn first_watch_returns_immediately_pushed_status() {
        let w = StatusWatcher::new(4);
        w.push_status(status(1500, true));
        assert_eq!(w.watch().unwrap(), status(1500, true));
    }

    #[test]
    fn consecutive_duplicates_are_deduplicated() {
        let w = StatusWatcher::new(2);
        w.push_status(status(1500, true));
        w.push_status(status(1500, true));
        w.push_status(status(1500, false));
        w.push_status(status(1500, true));
        assert_eq!(w.watch().unwrap(), status(1500, true));
        assert_eq!(w.watch().unwrap(), status(1500, false));
        assert_eq!(w.watch().unwrap(), status(1500, true));
    }

    #[test]
    fn overflow_drops_oldest() {
        let w = StatusWatcher::new(1);
        // Prime last_observed so every push below is novel relative to the prior one.
        w.push_status(status(1, true));
        assert_eq!(w.watch().unwrap(), status(1, true));
        w.push_status(status(2, true));
        w.push_status(status(3, true));
        // queue capacity 1: pushing (3) should have dropped (2) already.
        assert_eq!(w.watch().unwrap(), status(3, true));
    }

    #[test]
    fn double_pending_watch_rejected() {
        let w = std::sync::Arc::new(StatusWatcher::new(2));
        let w2 = w.clone();
        let handle = std::thread::spawn(move || w2.watch());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(w.watch().unwrap_err(), Status::BadState);
        w.push_status(status(1500, true));
        assert_eq!(handle.join().unwrap().unwrap(), status(1500, true));
    }

    #[test]
    fn unbind_cancels_pending_watch() {
        let w = std::sync::Arc::new(StatusWatcher::new(2));
        let w2 = w.clone();
        let handle = std::thread::spawn(move || w2.watch());
        std::thread::sleep(std::time::Duration::from_millis(20));
        w.unbind();
        assert_eq!(handle.join().unwrap().unwrap_err(), Status::Canceled);
    }
}
