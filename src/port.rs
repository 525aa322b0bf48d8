//! A tagged-event port standing in for the kernel port-and-key wait loop.
//!
//! The device this crate generalizes drives its session tx-fetch thread and its rx-queue worker
//! thread from a `zx::port` on which distinct "keys" are armed (a FIFO readability wait, a timer,
//! a user-queued packet for quit/resume signaling). This framework wants a neutral
//! formulation of the same pattern; this is built on an `mpsc` channel carrying a tagged [`Event`]
//! enum, with FIFO readiness modeled by a dedicated blocking watcher thread per watched FIFO that
//! posts [`Event::FifoReady`] once data (or peer-close) is observed.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use crate::fifo::Fifo;

/// An opaque key identifying which wait triggered a [`Event::FifoReady`]/similar packet.
pub type Key = u64;

/// A tagged event delivered to a worker's port.
#[derive(Debug, Clone)]
pub enum Event {
    /// The worker should exit its loop.
    Quit,
    /// A paused resource should be re-examined (e.g. rearm a FIFO wait).
    Resume,
    /// The FIFO registered under `Key` became readable, or its peer closed.
    FifoReady(Key),
    /// The primary session changed; rx-queue worker should requery it.
    SessionChanged,
    /// Re-enter the rx refill phase without a specific state change.
    RxTrigger,
}

/// The sending half of a port; cheaply cloned and handed to any thread that needs to wake the
/// owning worker.
#[derive(Clone)]
pub struct PortSender {
    tx: Sender<Event>,
}

impl PortSender {
    /// Posts an event to the port. Never blocks; a full channel simply grows (the mpsc channel is
    /// unbounded, matching the original's queued-user-packet port semantics where posting never
    /// fails due to backpressure).
    pub fn post(&self, event: Event) {
        // A closed receiver means the worker already exited; posting to it is a benign no-op.
        let _ = self.tx.send(event);
    }
}

/// The receiving half of a port, owned by the single worker thread that waits on it.
pub struct Port {
    rx: Receiver<Event>,
    sender: PortSender,
}

impl Port {
    /// Creates a new, empty port.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Port {
            rx,
            sender: PortSender { tx },
        }
    }

    /// Returns a cloneable sender for this port.
    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    /// Blocks until the next event is available.
    pub fn wait(&self) -> Event {
        // The port's own sender is always alive (held by `self`), so `recv` only errs if every
        // sender were dropped, which cannot happen here.
        self.rx.recv().expect("port sender outlives its receiver")
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

/// A background thread that blocks on a [`Fifo`] and posts [`Event::FifoReady`] to a port when
/// the FIFO becomes readable or its peer closes.
///
/// Stands in for arming an async `ZX_FIFO_READABLE | ZX_FIFO_PEER_CLOSED` wait on a kernel port:
/// rather than a single thread waiting on many objects, each watched FIFO gets a dedicated reader
/// thread that blocks until there is something to report, then posts exactly one event and exits.
/// Workers rearm a new watch after consuming the packet, mirroring the original's one-shot async
/// wait semantics.
pub struct FifoWatch {
    handle: Option<JoinHandle<()>>,
}

impl FifoWatch {
    /// Spawns a watcher for `fifo`, reporting readiness or peer-close under `key` on `sender`.
    pub fn spawn(fifo: Fifo, key: Key, sender: PortSender) -> Self {
        let handle = std::thread::Builder::new()
            .name(format!("fifo-watch-{key}"))
            .spawn(move || {
                // Either outcome (data arrived, or peer closed) is reported the same way; the
                // woken worker distinguishes them by checking `fifo.is_peer_closed()` itself.
                let _ = fifo.wait_readable();
                sender.post(Event::FifoReady(key));
            })
            .expect("failed to spawn fifo watch thread");
        FifoWatch {
            handle: Some(handle),
        }
    }
}

impl Drop for FifoWatch {
    fn drop(&mut self) {
        // Detach rather than join: a watch is routinely dropped (superseded by a fresh one on the
        // next `SESSION_CHANGED`/`Resume`) while its thread is still blocked in `wait_readable`,
        // which only returns once the watched FIFO has data or its peer closes — neither of which
        // this drop can force. Joining here would risk the owning worker thread hanging on a FIFO
        // nothing will ever write to or close. The same tradeoff `Session::kill` makes for its tx
        // worker. The detached thread posts one (now unwanted) event and exits once its FIFO
        // eventually does become readable or closes.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_event_is_delivered() {
        let port = Port::new();
        port.sender().post(Event::Quit);
        assert!(matches!(port.wait(), Event::Quit));
    }

    #[test]
    fn fifo_ready_posted_after_peer_close() {
        let (client, server) = Fifo::pair(2).unwrap();
        let port = Port::new();
        let _watch = FifoWatch::spawn(server, 42, port.sender());
        client.close();
        match port.wait() {
            Event::FifoReady(key) => assert_eq!(key, 42),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
