//! One client's view of the device: a pair of descriptor FIFOs plus the validation/fan-out
//! pipeline that turns descriptor indices into [`crate::contract`] buffers and back.
//!
//! A session owns exactly one worker thread (the tx-fetch loop);
//! its rx side is driven by the device interface's shared [`crate::device::rx_queue::RxQueue`]
//! worker instead, the same split the original draws between a per-session tx thread and one
//! dedicated rx thread shared by all sessions on a device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::contract::{BufferRegion, RxBuffer, TxFrameType};
use crate::descriptor::{rx_flags, Descriptor, SessionFlags, MAX_DESCRIPTOR_CHAIN};
use crate::device::DeviceInterface;
use crate::fifo::Fifo;
use crate::port::{Event, Port, PortSender};
use crate::status::{Result, Status};
use crate::vmo::Vmo;

/// A session's lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    /// Normal operation.
    Alive,
    /// Killed: tx worker stopped, tx FIFO closed, no longer eligible for primacy or fan-out, but
    /// still has in-flight buffers the device hasn't returned yet.
    Killed,
    /// Removed from the device interface's active registry; waiting for in-flight buffers to
    /// drain before its VMO can be released.
    Dead,
    /// Fully torn down: VMO released, both FIFOs closed.
    Destroyed,
}

/// One link in a validated descriptor chain.
#[derive(Clone, Copy)]
struct ChainLink {
    index: u16,
    descriptor: Descriptor,
}

struct RxScratch {
    /// Descriptor indices fetched from the rx FIFO but not yet consumed by the device (primary) or
    /// by fan-out (non-primary).
    available: VecDeque<u16>,
    /// Completed descriptor indices awaiting write-back to the rx FIFO.
    returning: Vec<u16>,
}

/// Parameters a [`crate::device::DeviceInterface`] supplies when opening a session; these are the
/// device-wide quantities the validation pipeline needs but that a session has no other way to
/// learn (the validated [`crate::config::DeviceConfig`]).
#[derive(Clone)]
pub struct SessionDeviceParams {
    pub required_tx_head: u16,
    pub required_tx_tail: u16,
    pub tx_types: Vec<TxFrameType>,
    pub tx_batch_cap: u32,
}

/// One open session.
pub struct Session {
    name: String,
    vmo_id: u8,
    descriptor_count: u32,
    descriptor_length: u16,
    flags: SessionFlags,
    rx_frame_types: Vec<u8>,
    data_vmo: Vmo,
    descriptor_vmo: Vmo,
    rx_fifo: Fifo,
    tx_fifo: Fifo,
    device: SessionDeviceParams,

    paused: AtomicBool,
    rx_valid: AtomicBool,
    counted_as_active: AtomicBool,
    in_flight_tx: AtomicU32,
    in_flight_rx: AtomicU32,

    rx_scratch: Mutex<RxScratch>,
    lifecycle: Mutex<LifecycleState>,

    tx_sender: PortSender,
    tx_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    tx_fifo_watch: Mutex<Option<crate::port::FifoWatch>>,

    host: Weak<DeviceInterface>,
    tx_queue: Arc<crate::device::tx_queue::TxQueue>,
    tx_queue_key: Mutex<Option<crate::device::tx_queue::SessionKey>>,
}

const KEY_TX_FIFO_READY: crate::port::Key = 1;

/// Everything needed to open a new session, gathered by the device interface from the client's
/// open request and its own validated configuration.
pub struct OpenParams {
    pub name: String,
    pub vmo_id: u8,
    pub descriptor_count: u32,
    pub descriptor_length: u16,
    pub flags: SessionFlags,
    pub rx_frame_types: Vec<u8>,
    pub data_vmo: Vmo,
    pub descriptor_vmo: Vmo,
    pub rx_fifo_depth: u32,
    pub tx_fifo_depth: u32,
    pub device: SessionDeviceParams,
}

impl Session {
    /// Opens a new session: allocates both FIFOs and starts the tx-fetch worker thread.
    ///
    /// Returns the new session together with the client-facing FIFO endpoints (the framework keeps
    /// the other endpoint of each pair for itself).
    pub fn open(
        params: OpenParams,
        host: Weak<DeviceInterface>,
        tx_queue: Arc<crate::device::tx_queue::TxQueue>,
    ) -> Result<(Arc<Session>, Fifo, Fifo)> {
        if params.name.as_bytes().len() > crate::descriptor::MAX_SESSION_NAME {
            return Err(Status::InvalidArgs);
        }
        let (rx_fifo, rx_client) = Fifo::pair(params.rx_fifo_depth)?;
        let (tx_fifo, tx_client) = Fifo::pair(params.tx_fifo_depth)?;

        let port = Port::new();
        let tx_sender = port.sender();

        let session = Arc::new(Session {
            name: params.name,
            vmo_id: params.vmo_id,
            descriptor_count: params.descriptor_count,
            descriptor_length: params.descriptor_length,
            flags: params.flags,
            rx_frame_types: params.rx_frame_types,
            data_vmo: params.data_vmo,
            descriptor_vmo: params.descriptor_vmo,
            rx_fifo,
            tx_fifo,
            device: params.device,
            // Sessions open paused; only an explicit `set_paused(false)` (or promotion while
            // already unpaused, which can't happen before that first call) triggers the
            // session-started event that may start the device.
            paused: AtomicBool::new(true),
            rx_valid: AtomicBool::new(true),
            counted_as_active: AtomicBool::new(false),
            in_flight_tx: AtomicU32::new(0),
            in_flight_rx: AtomicU32::new(0),
            rx_scratch: Mutex::new(RxScratch {
                available: VecDeque::new(),
                returning: Vec::new(),
            }),
            lifecycle: Mutex::new(LifecycleState::Alive),
            tx_sender,
            tx_worker: Mutex::new(None),
            tx_fifo_watch: Mutex::new(None),
            host,
            tx_queue,
            tx_queue_key: Mutex::new(None),
        });

        let key = session.tx_queue.register_session(session.tx_sender.clone());
        *session.tx_queue_key.lock().expect("tx_queue_key poisoned") = Some(key);

        let worker_session = session.clone();
        let handle = std::thread::Builder::new()
            .name(format!("session-tx-{}", worker_session.name))
            .spawn(move || run_tx_worker(worker_session, port))
            .expect("failed to spawn session tx worker");
        *session.tx_worker.lock().expect("tx_worker poisoned") = Some(handle);
        session.tx_sender.post(Event::Resume);

        Ok((session, rx_client, tx_client))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vmo_id(&self) -> u8 {
        self.vmo_id
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn descriptor_count(&self) -> u32 {
        self.descriptor_count
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().expect("lifecycle mutex poisoned")
    }

    pub fn in_flight_total(&self) -> u32 {
        self.in_flight_tx.load(Ordering::Relaxed) + self.in_flight_rx.load(Ordering::Relaxed)
    }

    pub(crate) fn counted_as_active_flag(&self) -> &AtomicBool {
        &self.counted_as_active
    }

    /// The framework-side rx FIFO endpoint, used by the rx-queue worker to fetch descriptor
    /// indices from whichever session is currently primary.
    pub(crate) fn rx_fifo_handle(&self) -> Fifo {
        self.rx_fifo.clone()
    }

    fn walk_chain(&self, head_index: u16) -> Result<Vec<ChainLink>> {
        if head_index as u32 >= self.descriptor_count {
            return Err(Status::OutOfRange);
        }
        let head = Descriptor::read_from(&self.descriptor_vmo, head_index, self.descriptor_length)?;
        if head.chain_length as usize >= MAX_DESCRIPTOR_CHAIN {
            return Err(Status::InvalidArgs);
        }
        let mut links = Vec::with_capacity(head.chain_length as usize + 1);
        links.push(ChainLink {
            index: head_index,
            descriptor: head,
        });
        let mut remaining = head.chain_length;
        let mut cur = head;
        while remaining > 0 {
            let nxt_index = cur.nxt;
            if nxt_index as u32 >= self.descriptor_count {
                return Err(Status::OutOfRange);
            }
            let nxt = Descriptor::read_from(&self.descriptor_vmo, nxt_index, self.descriptor_length)?;
            if nxt.chain_length != remaining - 1 {
                return Err(Status::InvalidArgs);
            }
            links.push(ChainLink {
                index: nxt_index,
                descriptor: nxt,
            });
            remaining -= 1;
            cur = nxt;
        }
        Ok(links)
    }

    /// Computes the device-facing buffer regions for a tx chain, validating that each end has at
    /// least the device's required head/tail reservation.
    ///
    /// The device sees exactly `required_tx_head`/`required_tx_tail` bytes of padding, even if the
    /// client reserved more: excess head bytes are skipped over by offsetting into the buffer
    /// excess head bytes are skipped over by offsetting into the buffer.
    fn tx_regions(&self, links: &[ChainLink]) -> Result<Vec<BufferRegion>> {
        let last = links.len() - 1;
        let mut regions = Vec::with_capacity(links.len());
        for (i, link) in links.iter().enumerate() {
            let d = &link.descriptor;
            if i == 0 && (d.head_length as u32) < self.device.required_tx_head as u32 {
                return Err(Status::InvalidArgs);
            }
            if i == last && (d.tail_length as u32) < self.device.required_tx_tail as u32 {
                return Err(Status::InvalidArgs);
            }
            let mut offset = d.offset;
            let mut length = d.data_length;
            if i == 0 {
                offset = offset + d.head_length as u64 - self.device.required_tx_head as u64;
                length += self.device.required_tx_head as u32;
            }
            if i == last {
                length += self.device.required_tx_tail as u32;
            }
            regions.push(BufferRegion {
                vmo_id: self.vmo_id,
                offset,
                length,
            });
        }
        Ok(regions)
    }

    /// Computes the device-facing buffer regions for an rx-space chain: each link's own declared
    /// `head_length` (not a device minimum — rx has none) is skipped over before the device starts
    /// writing.
    fn rx_space_regions(&self, links: &[ChainLink]) -> Vec<BufferRegion> {
        links
            .iter()
            .map(|l| BufferRegion {
                vmo_id: self.vmo_id,
                offset: l.descriptor.offset + l.descriptor.head_length as u64,
                length: l.descriptor.data_length,
            })
            .collect()
    }

    fn device_tx_type_supported(&self, frame_type: u8) -> bool {
        self.device.tx_types.iter().any(|t| t.frame_type == frame_type)
    }

    /// Validates and computes the device buffer for one tx descriptor chain.
    fn prepare_tx_buffer(&self, desc_index: u16) -> Result<(u8, Vec<BufferRegion>)> {
        let links = self.walk_chain(desc_index)?;
        let frame_type = links[0].descriptor.frame_type;
        if !self.device_tx_type_supported(frame_type) {
            return Err(Status::InvalidArgs);
        }
        let regions = self.tx_regions(&links)?;
        Ok((frame_type, regions))
    }

    /// Walks a chain's payload ranges in the data VMO: `(offset, length)` per link, where the head
    /// link's range starts past its own declared `head_length` (not a device minimum — this is the
    /// client-declared payload start used uniformly for tx sources and rx destinations).
    fn chain_payload_ranges(&self, head_index: u16) -> Result<Vec<(u64, u32)>> {
        let links = self.walk_chain(head_index)?;
        Ok(links
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let start = l.descriptor.offset
                    + if i == 0 {
                        l.descriptor.head_length as u64
                    } else {
                        0
                    };
                (start, l.descriptor.data_length)
            })
            .collect())
    }

    /// Pulls a batch of tx descriptor indices from the tx FIFO and runs them through the
    /// validation/fan-out pipeline, attaching accepted ones to a [`crate::device::tx_queue`]
    /// transaction.
    ///
    /// Returns `true` if the caller should rearm the FIFO-readiness wait (the FIFO drained cleanly
    /// or the session was killed), `false` if the tx queue is out of slots (IO_OVERRUN) and the
    /// caller must instead wait for a `Resume` event once the queue frees up.
    fn drain_tx(self: &Arc<Self>) -> bool {
        loop {
            if self.lifecycle() != LifecycleState::Alive || self.paused.load(Ordering::Acquire) {
                return true;
            }
            // The transaction's lock is acquired before the slot count is read and held through
            // the FIFO read and the whole attach loop below, so `available` can never go stale:
            // no other session's tx-fetch thread can attach into this queue while it's held.
            let mut txn = self.tx_queue.begin_transaction();
            let available = txn.available();
            if available == 0 {
                return false;
            }
            let want = available.min(self.device.tx_batch_cap).max(1) as usize;
            let mut idx_buf = vec![0u16; want];
            let read = match self.tx_fifo.read_nonblocking(&mut idx_buf) {
                Ok(r) => r,
                Err(_) => {
                    drop(txn);
                    self.kill("tx fifo peer closed");
                    return true;
                }
            };
            if read == 0 {
                return true;
            }
            let mut breach = false;
            let mut overrun = false;
            for &desc_index in &idx_buf[..read as usize] {
                match self.prepare_tx_buffer(desc_index) {
                    Ok((frame_type, regions)) => {
                        if !self.tx_queue.is_started() {
                            self.bounce_tx_descriptor(desc_index, Status::Unavailable);
                            continue;
                        }
                        if !txn.attach(self.clone(), desc_index, frame_type, regions) {
                            // Unreachable under the locking discipline above (the read was sized
                            // to `available`, and nothing else can shrink it while `txn` holds the
                            // lock), but handled gracefully rather than dropping the descriptor.
                            overrun = true;
                            self.bounce_tx_descriptor(desc_index, Status::Unavailable);
                            continue;
                        }
                        self.in_flight_tx.fetch_add(1, Ordering::Relaxed);
                        if let Some(host) = self.host.upgrade() {
                            host.fan_out_tx_listen(self, desc_index, frame_type);
                        }
                    }
                    Err(_) => {
                        breach = true;
                        break;
                    }
                }
            }
            drop(txn);
            if breach {
                self.kill("tx descriptor contract breach");
                return true;
            }
            if overrun {
                return false;
            }
            if (read as usize) < idx_buf.len() {
                return true;
            }
        }
    }

    /// Returns a batch of tx completions to the client: maps [`Status`] to the wire return-flags
    /// bits and writes the descriptor indices back to the tx FIFO.
    pub(crate) fn return_tx_descriptors(&self, completions: &[TxCompletion]) {
        self.in_flight_tx
            .fetch_sub(completions.len() as u32, Ordering::Relaxed);
        for c in completions {
            if !c.status.is_ok() {
                if let Ok(mut d) =
                    Descriptor::read_from(&self.descriptor_vmo, c.descriptor_index, self.descriptor_length)
                {
                    d.return_flags = status_to_tx_return_flags(c.status);
                    let _ = d.write_to(&self.descriptor_vmo, c.descriptor_index, self.descriptor_length);
                }
            }
        }
        let indices: Vec<u16> = completions.iter().map(|c| c.descriptor_index).collect();
        let _ = self.tx_fifo.write_nonblocking(&indices);
        self.tx_sender.post(Event::Resume);
    }

    /// Bounces one tx descriptor straight back to the client without ever handing it to the
    /// device or counting it in-flight: used when the device isn't `Started` and so cannot accept
    /// tx submissions at all.
    fn bounce_tx_descriptor(&self, desc_index: u16, status: Status) {
        if let Ok(mut d) = Descriptor::read_from(&self.descriptor_vmo, desc_index, self.descriptor_length) {
            d.return_flags = status_to_tx_return_flags(status);
            let _ = d.write_to(&self.descriptor_vmo, desc_index, self.descriptor_length);
        }
        let _ = self.tx_fifo.write_nonblocking(&[desc_index]);
    }

    fn pop_available_rx_with_fetch(&self) -> Option<u16> {
        {
            let mut scratch = self.rx_scratch.lock().expect("rx_scratch poisoned");
            if let Some(i) = scratch.available.pop_front() {
                return Some(i);
            }
        }
        let _ = self.fetch_rx_descriptors();
        let mut scratch = self.rx_scratch.lock().expect("rx_scratch poisoned");
        scratch.available.pop_front()
    }

    fn return_rx_unused(&self, desc_index: u16) {
        self.rx_scratch
            .lock()
            .expect("rx_scratch poisoned")
            .available
            .push_back(desc_index);
    }

    /// Pulls as many descriptor indices as are currently available from the rx FIFO into the
    /// `available` scratch array.
    ///
    /// Returns [`Status::ShouldWait`] (not logged as an error) if the FIFO is currently empty.
    pub fn fetch_rx_descriptors(&self) -> Result<()> {
        if !self.rx_valid.load(Ordering::Acquire) {
            return Err(Status::BadState);
        }
        let mut buf = vec![0u16; self.descriptor_count.min(4096) as usize];
        let read = self.rx_fifo.read_nonblocking(&mut buf)?;
        if read == 0 {
            return Err(Status::ShouldWait);
        }
        let mut scratch = self.rx_scratch.lock().expect("rx_scratch poisoned");
        scratch.available.extend(buf[..read as usize].iter().copied());
        Ok(())
    }

    /// Validates the chain at `desc_index` and computes its device-facing rx-space regions,
    /// counting the buffer as in-flight.
    pub fn fill_rx_space(&self, desc_index: u16) -> Result<Vec<BufferRegion>> {
        let links = self.walk_chain(desc_index)?;
        let regions = self.rx_space_regions(&links);
        self.in_flight_rx.fetch_add(1, Ordering::Relaxed);
        Ok(regions)
    }

    /// Writes frame metadata into the head descriptor and distributes `buff.total_length` across
    /// the chain's `data_length` fields.
    ///
    /// Returns [`Status::NoResources`] if the chain's total capacity is smaller than
    /// `buff.total_length`.
    fn load_rx_info(&self, desc_index: u16, buff: &RxBuffer) -> Result<()> {
        let links = self.walk_chain(desc_index)?;
        let total_capacity: u64 = links.iter().map(|l| l.descriptor.data_length as u64).sum();
        if buff.total_length as u64 > total_capacity {
            return Err(Status::NoResources);
        }
        let mut remaining = buff.total_length;
        for (i, link) in links.iter().enumerate() {
            let mut d = link.descriptor;
            if i == 0 {
                d.frame_type = buff.frame_type;
                d.inbound_flags = buff.inbound_flags;
                d.info_type = buff.info_type;
            }
            let take = remaining.min(d.data_length);
            d.data_length = take;
            remaining -= take;
            d.write_to(&self.descriptor_vmo, link.index, self.descriptor_length)?;
        }
        Ok(())
    }

    /// Completes one rx buffer the device filled directly for this (primary) session.
    ///
    /// Returns `true` if the descriptor may be reused immediately (dropped frame): empty frame,
    /// session paused/not subscribed/no-longer-rx-valid. Otherwise writes the frame info, queues
    /// fan-out to other sessions, and appends the descriptor to the return scratch array.
    pub fn complete_rx(self: &Arc<Self>, desc_index: u16, buff: &RxBuffer) -> bool {
        self.in_flight_rx.fetch_sub(1, Ordering::Relaxed);
        let valid = self.rx_valid.load(Ordering::Acquire);
        let subscribed = self.rx_frame_types.contains(&buff.frame_type);
        let paused = self.paused.load(Ordering::Acquire);
        if buff.total_length == 0 || !valid || !subscribed || paused {
            return true;
        }
        if let Some(host) = self.host.upgrade() {
            host.copy_to_other_sessions(self, desc_index, buff);
        }
        match self.load_rx_info(desc_index, buff) {
            Ok(()) => {
                self.rx_scratch
                    .lock()
                    .expect("rx_scratch poisoned")
                    .returning
                    .push(desc_index);
                false
            }
            Err(_) => true,
        }
    }

    /// Fans a completed rx frame out to a non-owning, non-primary session: allocates one of this
    /// session's own rx descriptors, copies the payload, and queues it for return.
    ///
    /// On [`Status::NoResources`] (this session's descriptor too small) the descriptor is returned
    /// unused, not killed — the frame is simply dropped for this listener. Any other chain
    /// validation failure kills the session (contract breach).
    pub fn complete_rx_with(self: &Arc<Self>, owner: &Arc<Session>, owner_index: u16, buff: &RxBuffer) {
        if self.lifecycle() != LifecycleState::Alive || !self.rx_valid.load(Ordering::Acquire) {
            return;
        }
        if !self.rx_frame_types.contains(&buff.frame_type) {
            return;
        }
        let Some(desc_index) = self.pop_available_rx_with_fetch() else {
            return;
        };
        match self.load_rx_info(desc_index, buff) {
            Ok(()) => {
                if self.copy_payload_from(owner, owner_index, desc_index).is_err() {
                    self.return_rx_unused(desc_index);
                    return;
                }
                self.rx_scratch
                    .lock()
                    .expect("rx_scratch poisoned")
                    .returning
                    .push(desc_index);
            }
            Err(Status::NoResources) => self.return_rx_unused(desc_index),
            Err(_) => self.kill("rx descriptor contract breach during fan-out"),
        }
    }

    /// Fans a just-accepted tx frame out to a session that asked to snoop every tx frame
    /// (`listen_tx`), regardless of rx frame-type subscription.
    ///
    /// Returns `false` (no kill) if this session has no rx capacity to receive the copy right now.
    pub fn listen_from_tx(self: &Arc<Self>, owner: &Arc<Session>, owner_index: u16, frame_type: u8) -> bool {
        if self.lifecycle() != LifecycleState::Alive || !self.rx_valid.load(Ordering::Acquire) {
            return false;
        }
        let Some(desc_index) = self.pop_available_rx_with_fetch() else {
            return false;
        };
        let ranges = match owner.chain_payload_ranges(owner_index) {
            Ok(r) => r,
            Err(_) => {
                self.return_rx_unused(desc_index);
                return false;
            }
        };
        let total: u32 = ranges.iter().map(|(_, l)| l).sum();
        let buff = RxBuffer {
            frame_type,
            info_type: crate::descriptor::INFO_TYPE_NO_INFO,
            inbound_flags: rx_flags::RX_ECHOED_TX,
            total_length: total,
            parts: Vec::new(),
        };
        match self.load_rx_info(desc_index, &buff) {
            Ok(()) => {
                let dst_ranges = match self.chain_payload_ranges(desc_index) {
                    Ok(r) => r,
                    Err(_) => {
                        self.return_rx_unused(desc_index);
                        return false;
                    }
                };
                if copy_chain_payload(&owner.data_vmo, &ranges, &self.data_vmo, &dst_ranges).is_err() {
                    self.return_rx_unused(desc_index);
                    return false;
                }
                self.rx_scratch
                    .lock()
                    .expect("rx_scratch poisoned")
                    .returning
                    .push(desc_index);
                true
            }
            Err(_) => {
                self.return_rx_unused(desc_index);
                false
            }
        }
    }

    fn copy_payload_from(&self, owner: &Arc<Session>, owner_index: u16, desc_index: u16) -> Result<()> {
        let src_ranges = owner.chain_payload_ranges(owner_index)?;
        let dst_ranges = self.chain_payload_ranges(desc_index)?;
        copy_chain_payload(&owner.data_vmo, &src_ranges, &self.data_vmo, &dst_ranges)
    }

    /// Writes every descriptor index queued in the return scratch array back to the rx FIFO.
    pub fn commit_rx(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut scratch = self.rx_scratch.lock().expect("rx_scratch poisoned");
        if scratch.returning.is_empty() {
            return;
        }
        let written = self.rx_fifo.write_nonblocking(&scratch.returning).unwrap_or(0);
        scratch.returning.drain(..written as usize);
    }

    /// Marks this session's rx side invalid without touching its FIFO (used by
    /// [`crate::device::rx_queue::RxQueue::purge_session`] when a new primary takes over).
    pub(crate) fn invalidate_rx(&self) {
        self.rx_valid.store(false, Ordering::Release);
    }

    /// Pauses or resumes the session, notifying the device interface of the transition.
    pub fn set_paused(self: &Arc<Self>, paused: bool) {
        let was = self.paused.swap(paused, Ordering::AcqRel);
        if was == paused {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            if paused {
                host.session_stopped(self);
            } else {
                host.session_started(self);
                self.tx_sender.post(Event::Resume);
            }
        }
    }

    /// Kills the session: stops the tx worker, closes the tx FIFO (but not rx — in-flight rx
    /// buffers may still need to drain back through it), and notifies the device interface.
    ///
    /// Idempotent: a no-op if the session is already `Killed`/`Dead`/`Destroyed`.
    pub fn kill(self: &Arc<Self>, reason: &str) {
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            if *lc != LifecycleState::Alive {
                return;
            }
            *lc = LifecycleState::Killed;
        }
        warn!("session '{}' killed: {reason}", self.name);
        self.rx_valid.store(false, Ordering::Release);
        self.tx_sender.post(Event::Quit);
        // Dropping the handle detaches the worker thread rather than joining it: `kill` may itself
        // be called from inside that thread (a contract breach detected mid-`drain_tx`), and
        // joining would deadlock.
        self.tx_worker.lock().expect("tx_worker poisoned").take();
        self.tx_fifo.close();
        if let Some(key) = self.tx_queue_key.lock().expect("tx_queue_key poisoned").take() {
            self.tx_queue.unregister_session(key);
        }
        if let Some(host) = self.host.upgrade() {
            host.notify_dead_session(self.clone());
        }
    }

    /// Marks the session fully torn down: closes the rx FIFO. Called by the device interface once
    /// both in-flight counters have reached zero.
    pub(crate) fn mark_destroyed(&self) {
        *self.lifecycle.lock().expect("lifecycle mutex poisoned") = LifecycleState::Destroyed;
        self.rx_fifo.close();
    }

    pub(crate) fn mark_dead(&self) {
        let mut lc = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        if *lc == LifecycleState::Alive {
            // Died without an explicit kill (e.g. the device interface tore down while this
            // session was still running); its tx worker is still live, stop it too.
            drop(lc);
            self.kill("device interface teardown");
            lc = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        }
        if *lc == LifecycleState::Killed {
            *lc = LifecycleState::Dead;
        }
    }
}

/// One completed tx descriptor, ready to be written back to a session's tx FIFO.
#[derive(Clone, Copy)]
pub struct TxCompletion {
    pub descriptor_index: u16,
    pub status: Status,
}

fn status_to_tx_return_flags(status: Status) -> u32 {
    use crate::descriptor::tx_return_flags::*;
    match status {
        Status::Ok => 0,
        Status::NoResources | Status::NoMemory => ERROR | OUT_OF_RESOURCES,
        Status::NotSupported => ERROR | NOT_SUPPORTED,
        Status::Unavailable | Status::BadState => ERROR | NOT_AVAILABLE,
        _ => ERROR,
    }
}

/// Copies a (possibly multi-region) payload from `src_ranges` in `src_vmo` into `dst_ranges` in
/// `dst_vmo`, treating each side as a flat byte stream regardless of how many regions it's split
/// across.
fn copy_chain_payload(
    src_vmo: &Vmo,
    src_ranges: &[(u64, u32)],
    dst_vmo: &Vmo,
    dst_ranges: &[(u64, u32)],
) -> Result<()> {
    let mut si = 0usize;
    let mut s_off = 0u32;
    let mut di = 0usize;
    let mut d_off = 0u32;
    loop {
        if si >= src_ranges.len() || di >= dst_ranges.len() {
            break;
        }
        let (s_base, s_len) = src_ranges[si];
        let (d_base, d_len) = dst_ranges[di];
        if s_off >= s_len {
            si += 1;
            s_off = 0;
            continue;
        }
        if d_off >= d_len {
            di += 1;
            d_off = 0;
            continue;
        }
        let chunk = (s_len - s_off).min(d_len - d_off);
        if chunk == 0 {
            break;
        }
        src_vmo.copy_to(s_base + s_off as u64, dst_vmo, d_base + d_off as u64, chunk as usize)?;
        s_off += chunk;
        d_off += chunk;
    }
    Ok(())
}

fn run_tx_worker(session: Arc<Session>, port: Port) {
    loop {
        match port.wait() {
            Event::Quit => break,
            Event::Resume => {
                if session.lifecycle() != LifecycleState::Alive {
                    break;
                }
                let rearm = session.drain_tx();
                if rearm && !session.tx_fifo.is_peer_closed() {
                    let watch = crate::port::FifoWatch::spawn(
                        session.tx_fifo.clone(),
                        KEY_TX_FIFO_READY,
                        session.tx_sender.clone(),
                    );
                    *session.tx_fifo_watch.lock().expect("tx_fifo_watch poisoned") = Some(watch);
                }
            }
            Event::FifoReady(KEY_TX_FIFO_READY) => {
                session.tx_fifo_watch.lock().expect("tx_fifo_watch poisoned").take();
                if session.lifecycle() != LifecycleState::Alive {
                    break;
                }
                if session.tx_fifo.is_peer_closed() {
                    session.kill("tx fifo peer closed");
                    break;
                }
                let rearm = session.drain_tx();
                if rearm && !session.tx_fifo.is_peer_closed() {
                    let watch = crate::port::FifoWatch::spawn(
                        session.tx_fifo.clone(),
                        KEY_TX_FIFO_READY,
                        session.tx_sender.clone(),
                    );
                    *session.tx_fifo_watch.lock().expect("tx_fifo_watch poisoned") = Some(watch);
                }
            }
            _ => {}
        }
    }
}
