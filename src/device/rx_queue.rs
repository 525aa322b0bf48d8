//! The device-wide rx queue: a shared pool of rx-space buffers fed from whichever session is
//! currently primary, refilled by one dedicated worker thread.
//!
//! Unlike tx (one worker per session), rx has exactly one worker
//! per device, because only the primary session's rx FIFO ever supplies space to the device —
//! mirroring the original's single `rx_queue_t` thread versus per-session `tx_queue_t` callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::contract::{DeviceImplementation, RxSpaceBuffer};
use crate::ds::{IndexedSlab, RingQueue};
use crate::fifo::Fifo;
use crate::port::{Event, FifoWatch, Key, Port, PortSender};
use crate::session::Session;

struct InFlightRxBuffer {
    session: Arc<Session>,
    descriptor_index: u16,
}

#[derive(Clone)]
struct AvailableEntry {
    session: Arc<Session>,
    index: u16,
}

struct State {
    in_flight: IndexedSlab<InFlightRxBuffer>,
    available: RingQueue<AvailableEntry>,
    device_buffer_count: u32,
}

const KEY_FIFO_READY: Key = 1;

/// The device-wide pool of rx-space buffers, refilled from the current primary session.
pub struct RxQueue {
    state: Mutex<State>,
    primary: Mutex<Option<(Arc<Session>, Fifo)>>,
    device: Arc<dyn DeviceImplementation>,
    rx_depth: u32,
    rx_notify_threshold: u32,
    sender: PortSender,
    fifo_watch: Mutex<Option<FifoWatch>>,
    data_plane_open: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RxQueue {
    /// Creates the queue and starts its worker thread.
    pub fn new(config: &DeviceConfig, device: Arc<dyn DeviceImplementation>) -> Arc<Self> {
        let rx_depth = config.info.rx_depth as u32;
        let port = Port::new();
        let sender = port.sender();
        let rx_queue = Arc::new(RxQueue {
            state: Mutex::new(State {
                in_flight: IndexedSlab::new(rx_depth).expect("rx_depth validated nonzero by DeviceConfig"),
                available: RingQueue::new(config.rx_fifo_depth).expect("rx_fifo_depth validated nonzero"),
                device_buffer_count: 0,
            }),
            primary: Mutex::new(None),
            device,
            rx_depth,
            rx_notify_threshold: config.rx_notify_threshold,
            sender,
            fifo_watch: Mutex::new(None),
            data_plane_open: AtomicBool::new(true),
            worker: Mutex::new(None),
        });

        let worker_queue = rx_queue.clone();
        let handle = std::thread::Builder::new()
            .name("rx-queue".into())
            .spawn(move || run_worker(worker_queue, port))
            .expect("failed to spawn rx-queue worker");
        *rx_queue.worker.lock().expect("worker mutex poisoned") = Some(handle);
        rx_queue
    }

    /// Stops the worker thread. Called once by the device interface during teardown.
    pub fn shutdown(&self) {
        self.sender.post(Event::Quit);
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Opens or closes the data plane: while closed, the worker never rearms a FIFO wait (used
    /// while the device is STOPPED/STOPPING).
    pub fn set_data_plane_open(&self, open: bool) {
        self.data_plane_open.store(open, Ordering::Release);
        self.sender.post(Event::RxTrigger);
    }

    /// Asks the worker to re-enter its refill phase, e.g. once the device transitions to STARTED
    /// and rx-space submission becomes possible again.
    pub fn trigger_refill(&self) {
        self.sender.post(Event::RxTrigger);
    }

    /// Notifies the worker that the primary session changed (or was cleared).
    pub fn notify_session_changed(&self, new_primary: Option<Arc<Session>>) {
        *self.primary.lock().expect("primary mutex poisoned") =
            new_primary.map(|s| (s.clone(), s.rx_fifo_handle()));
        self.sender.post(Event::SessionChanged);
    }

    /// Removes any queued-but-not-yet-device-owned entries belonging to `session` from the
    /// available pool (called when a session dies while not primary, or loses primacy).
    pub fn purge_session(&self, session: &Arc<Session>) {
        session.invalidate_rx();
        let mut state = self.state.lock().expect("rx_queue mutex poisoned");
        let n = state.available.count();
        for _ in 0..n {
            let entry = state.available.pop();
            if !Arc::ptr_eq(&entry.session, session) {
                state.available.push(entry);
            }
        }
    }

    /// Reports a batch of completed rx buffers, frees their slab slots, hands each back to its
    /// owning session, and commits every session's (in `sessions_in_order`) pending writebacks.
    ///
    /// `sessions_in_order` should list the primary session first, matching the required
    /// commit ordering.
    pub fn complete_rx_list(&self, sessions_in_order: &[Arc<Session>], results: &[crate::contract::RxBuffer]) {
        let mut total_freed = 0u32;
        {
            let mut state = self.state.lock().expect("rx_queue mutex poisoned");
            for buff in results {
                for (pi, part) in buff.parts.iter().enumerate() {
                    let entry = state.in_flight.free(part.id);
                    total_freed += 1;
                    if pi == 0 {
                        let reusable = entry.session.complete_rx(entry.descriptor_index, buff);
                        if reusable && state.available.count() < state.available.capacity() {
                            state.available.push(AvailableEntry {
                                session: entry.session,
                                index: entry.descriptor_index,
                            });
                        }
                    } else if state.available.count() < state.available.capacity() {
                        state.available.push(AvailableEntry {
                            session: entry.session,
                            index: entry.descriptor_index,
                        });
                    }
                }
            }
            state.device_buffer_count = state.device_buffer_count.saturating_sub(total_freed);
        }

        for s in sessions_in_order {
            s.commit_rx();
        }

        let below_threshold = {
            let state = self.state.lock().expect("rx_queue mutex poisoned");
            state.device_buffer_count <= self.rx_notify_threshold
        };
        if below_threshold {
            self.sender.post(Event::RxTrigger);
        }
    }

    /// Returns every currently device-owned rx-space buffer to its session as reusable (length 0),
    /// per the device's Reclaim policy. Called while the device is locked at STOPPED; after
    /// this call the queue holds no device-owned entries.
    pub fn reclaim(&self) {
        let zero = crate::contract::RxBuffer {
            frame_type: 0,
            info_type: 0,
            inbound_flags: 0,
            total_length: 0,
            parts: Vec::new(),
        };
        let mut state = self.state.lock().expect("rx_queue mutex poisoned");
        let indices: Vec<u32> = state.in_flight.iter().collect();
        for idx in indices {
            let entry = state.in_flight.free(idx);
            let reusable = entry.session.complete_rx(entry.descriptor_index, &zero);
            if reusable && state.available.count() < state.available.capacity() {
                state.available.push(AvailableEntry {
                    session: entry.session,
                    index: entry.descriptor_index,
                });
            }
        }
        state.device_buffer_count = 0;
    }

    fn prepare_buff(state: &mut State, primary: &Option<(Arc<Session>, Fifo)>) -> Option<(Arc<Session>, u16, Vec<crate::contract::BufferRegion>)> {
        loop {
            if !state.available.is_empty() {
                let entry = state.available.pop();
                match entry.session.fill_rx_space(entry.index) {
                    Ok(regions) => return Some((entry.session, entry.index, regions)),
                    Err(_) => {
                        entry.session.kill("rx descriptor contract breach");
                        continue;
                    }
                }
            }
            let (session, fifo) = primary.as_ref()?;
            if state.available.count() >= state.available.capacity() {
                return None;
            }
            let mut buf = [0u16; 1];
            let read = fifo.read_nonblocking(&mut buf).unwrap_or(0);
            if read == 0 {
                return None;
            }
            state.available.push(AvailableEntry {
                session: session.clone(),
                index: buf[0],
            });
        }
    }

    fn refill(self: &Arc<Self>) {
        if !self.data_plane_open.load(Ordering::Acquire) {
            return;
        }
        let primary_snapshot = self.primary.lock().expect("primary mutex poisoned").clone();
        let mut scratch: Vec<RxSpaceBuffer> = Vec::new();
        {
            let mut state = self.state.lock().expect("rx_queue mutex poisoned");
            let push_count = self.rx_depth.saturating_sub(state.device_buffer_count);
            for _ in 0..push_count {
                match Self::prepare_buff(&mut state, &primary_snapshot) {
                    Some((session, index, regions)) => {
                        let id = state.in_flight.push(InFlightRxBuffer {
                            session,
                            descriptor_index: index,
                        });
                        scratch.push(RxSpaceBuffer { id, regions });
                        state.device_buffer_count += 1;
                    }
                    None => break,
                }
            }
        }

        if !scratch.is_empty() {
            self.device.queue_rx_space(&scratch);
        }

        let device_buffer_count = self.state.lock().expect("rx_queue mutex poisoned").device_buffer_count;
        let should_wait = device_buffer_count < self.rx_depth && self.data_plane_open.load(Ordering::Acquire);
        if should_wait {
            if let Some((_, fifo)) = &primary_snapshot {
                let mut watch = self.fifo_watch.lock().expect("fifo_watch mutex poisoned");
                if watch.is_none() {
                    *watch = Some(FifoWatch::spawn(fifo.clone(), KEY_FIFO_READY, self.sender.clone()));
                }
            }
        }
    }
}

impl Clone for AvailableEntry {
    fn clone(&self) -> Self {
        AvailableEntry {
            session: self.session.clone(),
            index: self.index,
        }
    }
}

fn run_worker(rx_queue: Arc<RxQueue>, port: Port) {
    loop {
        match port.wait() {
            Event::Quit => break,
            Event::SessionChanged => {
                rx_queue.fifo_watch.lock().expect("fifo_watch mutex poisoned").take();
                rx_queue.refill();
            }
            Event::FifoReady(KEY_FIFO_READY) => {
                rx_queue.fifo_watch.lock().expect("fifo_watch mutex poisoned").take();
                let primary_dead = rx_queue
                    .primary
                    .lock()
                    .expect("primary mutex poisoned")
                    .as_ref()
                    .map(|(_, f)| f.is_peer_closed())
                    .unwrap_or(true);
                if primary_dead {
                    *rx_queue.primary.lock().expect("primary mutex poisoned") = None;
                }
                rx_queue.refill();
            }
            Event::RxTrigger => rx_queue.refill(),
            Event::Resume | Event::FifoReady(_) => {}
        }
    }
}
