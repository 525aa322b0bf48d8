//! The device-wide tx queue: an in-flight slab of buffers submitted but not yet completed, and the
//! RAII transaction a session uses to submit a batch.
//!
//! The commit-outside-the-lock discipline mirrors an AF_XDP socket binding's `WriteTx`/`WriteFill`
//! writer guards, which stage entries under a lock and only touch the kernel ring (here: call the
//! device implementation) once the guard is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::contract::{BufferRegion, DeviceImplementation, TxBuffer, TxResult};
use crate::ds::{IndexedSlab, RingQueue};
use crate::port::{Event, PortSender};
use crate::session::{Session, TxCompletion};

struct InFlightTxBuffer {
    session: Arc<Session>,
    descriptor_index: u16,
}

struct State {
    in_flight: IndexedSlab<InFlightTxBuffer>,
    /// Transient bookkeeping ring holding a "return queue of ids"; drained in
    /// full within the same call that fills it, so it never carries state across calls.
    return_queue: RingQueue<u32>,
    resume_targets: IndexedSlab<PortSender>,
}

/// Opaque handle returned by [`TxQueue::register_session`], needed to unregister later.
pub struct SessionKey(u32);

/// The device-wide pool of in-flight tx buffers.
pub struct TxQueue {
    state: Mutex<State>,
    device: Arc<dyn DeviceImplementation>,
    /// Mirrors `device_status == Started`, checked lock-free by [`TxQueue::is_started`] so a
    /// session's tx-fetch worker can bounce descriptors with `UNAVAILABLE` instead of forwarding
    /// them to the device while it is starting, stopping, or stopped.
    started: AtomicBool,
}

impl TxQueue {
    /// Creates a queue sized to the device's reported tx depth.
    pub fn new(tx_depth: u32, device: Arc<dyn DeviceImplementation>) -> Arc<Self> {
        Arc::new(TxQueue {
            state: Mutex::new(State {
                in_flight: IndexedSlab::new(tx_depth).expect("tx_depth validated nonzero by DeviceConfig"),
                return_queue: RingQueue::new(tx_depth).expect("tx_depth validated nonzero by DeviceConfig"),
                resume_targets: IndexedSlab::new(tx_depth.max(1)).expect("nonzero capacity"),
            }),
            device,
            started: AtomicBool::new(false),
        })
    }

    /// Whether the device is currently `Started` — the only state in which tx submission is
    /// accepted. Checked without locking `state` so it's cheap to call from the hot tx path.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Updates the started flag. Called by the device state machine in lockstep with its own
    /// `device_status` transitions.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
        if started {
            self.notify_tx_queue_available();
        }
    }

    /// Registers a session's resume notifier, returning a key to unregister it with.
    ///
    /// Called once per session at open time so that a later [`TxQueue::complete_tx_list`] freeing a
    /// slot can wake any session that was blocked on `IO_OVERRUN`.
    pub fn register_session(&self, sender: PortSender) -> SessionKey {
        let mut state = self.state.lock().expect("tx_queue mutex poisoned");
        SessionKey(state.resume_targets.push(sender))
    }

    /// Unregisters a session's resume notifier.
    pub fn unregister_session(&self, key: SessionKey) {
        let mut state = self.state.lock().expect("tx_queue mutex poisoned");
        state.resume_targets.free(key.0);
    }

    /// Opens a transaction for attaching one batch of tx buffers. Holds the tx lock for the
    /// transaction's entire lifetime — from this snapshot of the free slot count through every
    /// `attach` call below — so no other session's tx-fetch thread can shrink capacity out from
    /// under it; the submission to the device implementation happens on drop, outside the lock.
    pub fn begin_transaction(&self) -> SessionTransaction<'_> {
        let guard = self.state.lock().expect("tx_queue mutex poisoned");
        let available = guard.in_flight.available();
        SessionTransaction {
            queue: self,
            locked: Some(guard),
            buffers: Vec::new(),
            available,
        }
    }

    /// Frees each completed buffer's slab entry, groups consecutive completions by owning session,
    /// and returns each group to its session.
    ///
    /// Returns `true` if the queue was completely full (no available slots) immediately before this
    /// call — the "was there anyone waiting on `Resume`?" signal the caller uses to decide whether
    /// to wake registered sessions.
    pub fn complete_tx_list(&self, results: &[TxResult]) -> bool {
        let mut entries: Vec<(Arc<Session>, u16, crate::status::Status)> = Vec::with_capacity(results.len());
        let was_full;
        {
            let mut state = self.state.lock().expect("tx_queue mutex poisoned");
            was_full = state.in_flight.available() == 0;
            for r in results {
                let buf = state.in_flight.free(r.id);
                state.return_queue.push(r.id);
                entries.push((buf.session, buf.descriptor_index, r.status));
            }
            while !state.return_queue.is_empty() {
                state.return_queue.pop();
            }
        }

        let mut i = 0;
        while i < entries.len() {
            let mut j = i + 1;
            while j < entries.len() && Arc::ptr_eq(&entries[j].0, &entries[i].0) {
                j += 1;
            }
            let session = entries[i].0.clone();
            let completions: Vec<TxCompletion> = entries[i..j]
                .iter()
                .map(|(_, idx, status)| TxCompletion {
                    descriptor_index: *idx,
                    status: *status,
                })
                .collect();
            session.return_tx_descriptors(&completions);
            i = j;
        }

        if was_full {
            self.notify_tx_queue_available();
        }
        was_full
    }

    /// Returns every currently in-flight buffer to its owning session with
    /// `ERROR|NOT_AVAILABLE`, per the device's Reclaim policy. Called while the device is
    /// locked at STOPPED; after this call the queue holds no device-owned entries.
    pub fn reclaim(&self) {
        let mut entries: Vec<(Arc<Session>, u16)> = Vec::new();
        {
            let mut state = self.state.lock().expect("tx_queue mutex poisoned");
            let indices: Vec<u32> = state.in_flight.iter().collect();
            for idx in indices {
                let buf = state.in_flight.free(idx);
                entries.push((buf.session, buf.descriptor_index));
            }
        }
        let mut i = 0;
        while i < entries.len() {
            let mut j = i + 1;
            while j < entries.len() && Arc::ptr_eq(&entries[j].0, &entries[i].0) {
                j += 1;
            }
            let session = entries[i].0.clone();
            let completions: Vec<TxCompletion> = entries[i..j]
                .iter()
                .map(|(_, idx)| TxCompletion {
                    descriptor_index: *idx,
                    status: crate::status::Status::Unavailable,
                })
                .collect();
            session.return_tx_descriptors(&completions);
            i = j;
        }
        self.notify_tx_queue_available();
    }

    fn notify_tx_queue_available(&self) {
        let state = self.state.lock().expect("tx_queue mutex poisoned");
        let senders: Vec<PortSender> = state.resume_targets.iter().map(|i| state.resume_targets.get(i).clone()).collect();
        drop(state);
        for s in senders {
            s.post(Event::Resume);
        }
    }
}

/// An in-progress batch of tx buffers attached under the tx lock, committed to the device
/// implementation on drop (outside the lock).
pub struct SessionTransaction<'q> {
    queue: &'q TxQueue,
    locked: Option<MutexGuard<'q, State>>,
    buffers: Vec<TxBuffer>,
    /// Free in-flight slots, snapshotted under the same lock `attach` pushes into; stable for the
    /// whole transaction since the lock is held throughout.
    available: u32,
}

impl<'q> SessionTransaction<'q> {
    /// The number of free in-flight slots this transaction may still attach into.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Whether this transaction has no room left to attach another buffer.
    pub fn overrun(&self) -> bool {
        self.queued() as u32 >= self.available
    }

    /// Attaches one accepted tx descriptor to this transaction.
    ///
    /// Returns `false` (IO_OVERRUN) without attaching anything if the transaction's snapshotted
    /// slot count is already exhausted; the caller must stop attaching for this batch.
    pub fn attach(&mut self, session: Arc<Session>, descriptor_index: u16, frame_type: u8, regions: Vec<BufferRegion>) -> bool {
        if self.overrun() {
            return false;
        }
        let id = self
            .locked
            .as_mut()
            .expect("transaction used after commit")
            .in_flight
            .push(InFlightTxBuffer {
                session,
                descriptor_index,
            });
        self.buffers.push(TxBuffer {
            id,
            frame_type,
            data: regions,
        });
        true
    }

    /// The number of buffers attached so far.
    pub fn queued(&self) -> usize {
        self.buffers.len()
    }
}

impl<'q> Drop for SessionTransaction<'q> {
    fn drop(&mut self) {
        // Release the tx lock before calling into the device implementation: callers must never
        // hold it across a device call, the same commit-outside-the-lock discipline as the
        // writer guards this is modeled on.
        drop(self.locked.take());
        if !self.buffers.is_empty() {
            self.queue.device.queue_tx(&self.buffers);
        }
    }
}
