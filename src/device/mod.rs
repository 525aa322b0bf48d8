//! The device-interface root: session registry, primacy election, the device start/stop state
//! machine, and the deterministic teardown sequence.
//!
//! Covers primacy election, the device state machine and teardown FSM, and
//! (construction/config). This is the one type an embedder constructs directly; everything else in
//! the crate is reached through it or through the [`crate::session::Session`] handles it hands
//! back from [`DeviceInterface::open_session`].

pub mod rx_queue;
pub mod tx_queue;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::config::DeviceConfig;
use crate::contract::{DeviceCallbacks, DeviceImplementation, RxBuffer, TxResult};
use crate::descriptor::{SessionFlags, MAX_VMOS};
use crate::fifo::Fifo;
use crate::session::{LifecycleState, OpenParams, Session, SessionDeviceParams};
use crate::status::{Result, Status};
use crate::status_watcher::{LinkStatus, StatusWatcher};
use crate::vmo::{Vmo, VmoStore};

use rx_queue::RxQueue;
use tx_queue::TxQueue;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DeviceStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PendingOp {
    None,
    Start,
    Stop,
}

struct DeviceState {
    status: DeviceStatus,
    pending: PendingOp,
}

/// Teardown stages, advanced strictly in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownStage {
    Running,
    Bindings,
    Watchers,
    Sessions,
    Finished,
}

struct TeardownInner {
    stage: TeardownStage,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct SessionRegistry {
    /// Non-primary, still-alive sessions.
    sessions: Vec<Arc<Session>>,
    primary: Option<Arc<Session>>,
    /// Killed sessions waiting for in-flight buffers to drain before their VMO can be released.
    dead: Vec<Arc<Session>>,
}

/// Parameters supplied by the transport layer to open a new session.
pub struct OpenSessionRequest {
    pub name: String,
    /// Id of a VMO previously registered via [`DeviceInterface::register_vmo`].
    pub vmo_id: u8,
    pub descriptor_count: u32,
    /// Declared in units of 8 bytes.
    pub descriptor_length: u16,
    /// The client's `descriptor_version`; must match [`crate::descriptor::DESCRIPTOR_VERSION`].
    pub descriptor_version: u8,
    pub flags: SessionFlags,
    pub rx_frame_types: Vec<u8>,
    pub descriptor_vmo: Vmo,
}

/// A newly opened session and the client-facing ends of its two FIFOs.
pub struct OpenedSession {
    pub session: Arc<Session>,
    pub rx_fifo: Fifo,
    pub tx_fifo: Fifo,
}

/// The device-interface root.
pub struct DeviceInterface {
    config: DeviceConfig,
    device_impl: Arc<dyn DeviceImplementation>,
    vmo_store: VmoStore,
    sessions: Mutex<SessionRegistry>,
    has_listen_sessions: AtomicBool,
    active_primary_sessions: AtomicU32,
    device_state: Mutex<DeviceState>,
    tx_queue: Arc<TxQueue>,
    rx_queue: Arc<RxQueue>,
    status_watchers: Mutex<Vec<Arc<StatusWatcher>>>,
    bindings: AtomicU32,
    teardown: Mutex<TeardownInner>,
    self_weak: Weak<DeviceInterface>,
}

impl DeviceInterface {
    /// Constructs a device interface over `device_impl`, validating its reported info and binding
    /// the reverse callback capability.
    pub fn new(device_impl: Arc<dyn DeviceImplementation>) -> Result<Arc<Self>> {
        let info = device_impl.info();
        let config = DeviceConfig::new(info)?;
        let vmo_store = VmoStore::new(MAX_VMOS)?;
        let tx_queue = TxQueue::new(config.info.tx_depth as u32, device_impl.clone());
        let rx_queue = RxQueue::new(&config, device_impl.clone());

        let iface = Arc::new_cyclic(|weak| DeviceInterface {
            config,
            device_impl: device_impl.clone(),
            vmo_store,
            sessions: Mutex::new(SessionRegistry::default()),
            has_listen_sessions: AtomicBool::new(false),
            active_primary_sessions: AtomicU32::new(0),
            device_state: Mutex::new(DeviceState {
                status: DeviceStatus::Stopped,
                pending: PendingOp::None,
            }),
            tx_queue,
            rx_queue,
            status_watchers: Mutex::new(Vec::new()),
            bindings: AtomicU32::new(0),
            teardown: Mutex::new(TeardownInner {
                stage: TeardownStage::Running,
                callback: None,
            }),
            self_weak: weak.clone(),
        });
        device_impl.bind_callbacks(iface.clone() as Arc<dyn DeviceCallbacks>);
        Ok(iface)
    }

    fn arc_self(&self) -> Arc<DeviceInterface> {
        self.self_weak
            .upgrade()
            .expect("device interface dropped while still in use")
    }

    fn is_running(&self) -> bool {
        matches!(self.teardown.lock().expect("teardown mutex poisoned").stage, TeardownStage::Running)
    }

    // --- VMO registration --------------------------------------------------------------------

    /// Registers a data VMO, returning the id sessions will reference it by.
    pub fn register_vmo(&self, vmo: Vmo) -> Result<u8> {
        let id = self.vmo_store.register(vmo.clone())?;
        let status = self.device_impl.prepare_vmo(id, vmo);
        if !status.is_ok() {
            let _ = self.vmo_store.unregister(id);
            return Err(status);
        }
        Ok(id)
    }

    // --- Sessions ------------------------------------------------------------------------------

    /// Opens a new session.
    ///
    /// Returns [`Status::BadState`] once teardown has begun.
    pub fn open_session(self: &Arc<Self>, req: OpenSessionRequest) -> Result<OpenedSession> {
        if !self.is_running() {
            return Err(Status::BadState);
        }
        if req.descriptor_version != crate::descriptor::DESCRIPTOR_VERSION {
            return Err(Status::NotSupported);
        }
        if req.descriptor_length % 8 != 0 || (req.descriptor_length as usize) < crate::descriptor::Descriptor::SIZE {
            return Err(Status::InvalidArgs);
        }
        if req
            .rx_frame_types
            .iter()
            .any(|t| !self.config.info.rx_types.contains(t))
        {
            return Err(Status::InvalidArgs);
        }
        let data_vmo = self.vmo_store.get(req.vmo_id)?;
        let params = SessionDeviceParams {
            required_tx_head: self.config.info.min_tx_buffer_head,
            required_tx_tail: self.config.info.min_tx_buffer_tail,
            tx_types: self.config.info.tx_types.clone(),
            tx_batch_cap: self.config.rx_fifo_depth,
        };
        let open_params = OpenParams {
            name: req.name,
            vmo_id: req.vmo_id,
            descriptor_count: req.descriptor_count,
            descriptor_length: req.descriptor_length,
            flags: req.flags,
            rx_frame_types: req.rx_frame_types,
            data_vmo,
            descriptor_vmo: req.descriptor_vmo,
            rx_fifo_depth: self.config.rx_fifo_depth,
            tx_fifo_depth: self.config.tx_fifo_depth,
            device: params,
        };
        let (session, rx_fifo, tx_fifo) = Session::open(open_params, Arc::downgrade(self), self.tx_queue.clone())?;
        {
            let mut reg = self.sessions.lock().expect("sessions mutex poisoned");
            reg.sessions.push(session.clone());
        }
        // Opening only performs primacy election: a session starts paused, so the full
        // session-started event (listen-sessions recompute, device start) only fires later, from
        // `Session::set_paused(false)`.
        self.maybe_elect_primary();
        Ok(OpenedSession {
            session,
            rx_fifo,
            tx_fifo,
        })
    }

    fn eligible(s: &Arc<Session>) -> bool {
        s.flags().primary && s.lifecycle() == LifecycleState::Alive
    }

    fn elect_primary(reg: &SessionRegistry) -> Option<Arc<Session>> {
        let mut all: Vec<Arc<Session>> = Vec::new();
        if let Some(p) = &reg.primary {
            all.push(p.clone());
        }
        all.extend(reg.sessions.iter().cloned());
        let incumbent = reg.primary.clone();

        let mut iter = all.into_iter().filter(Self::eligible);
        let mut best = iter.next()?;
        for candidate in iter {
            let best_is_incumbent = incumbent.as_ref().map(|p| Arc::ptr_eq(p, &best)).unwrap_or(false);
            let best_running = !best.is_paused();
            let candidate_running = !candidate.is_paused();
            let candidate_wins = if candidate_running != best_running {
                // Rule: a running session always beats a paused one.
                candidate_running
            } else if best_is_incumbent {
                // Rule: the incumbent primary keeps ties over itself.
                false
            } else {
                // Rule: otherwise the strictly larger descriptor ring wins.
                candidate.descriptor_count() > best.descriptor_count()
            };
            if candidate_wins {
                best = candidate;
            }
        }
        Some(best)
    }

    fn maybe_elect_primary(self: &Arc<Self>) {
        let mut reg = self.sessions.lock().expect("sessions mutex poisoned");
        let winner = Self::elect_primary(&reg);
        match winner {
            Some(w) => {
                let already = reg.primary.as_ref().map(|p| Arc::ptr_eq(p, &w)).unwrap_or(false);
                if already {
                    return;
                }
                if let Some(old) = reg.primary.take() {
                    reg.sessions.push(old);
                }
                reg.sessions.retain(|s| !Arc::ptr_eq(s, &w));
                reg.primary = Some(w.clone());
                drop(reg);
                debug!("session '{}' elected primary", w.name());
                self.rx_queue.notify_session_changed(Some(w));
            }
            None => {
                if let Some(old) = reg.primary.take() {
                    reg.sessions.push(old);
                    drop(reg);
                    self.rx_queue.notify_session_changed(None);
                }
            }
        }
    }

    fn recompute_has_listen_sessions(&self) {
        let reg = self.sessions.lock().expect("sessions mutex poisoned");
        let any = reg
            .primary
            .iter()
            .chain(reg.sessions.iter())
            .any(|s| s.flags().listen_tx && !s.is_paused());
        self.has_listen_sessions.store(any, Ordering::Release);
    }

    fn set_active_primary_counted(self: &Arc<Self>, session: &Arc<Session>, should_count: bool) {
        let was = session.counted_as_active_flag().swap(should_count, Ordering::AcqRel);
        if was == should_count {
            return;
        }
        if should_count {
            if self.active_primary_sessions.fetch_add(1, Ordering::AcqRel) == 0 {
                self.start_device();
            }
        } else if self.active_primary_sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop_device();
        }
    }

    /// Called by a [`Session`] when it transitions from paused to running (every session opens
    /// paused, so this is also what fires the very first time a session is unpaused).
    pub(crate) fn session_started(self: &Arc<Self>, session: &Arc<Session>) {
        self.recompute_has_listen_sessions();
        self.maybe_elect_primary();
        if session.flags().primary {
            self.set_active_primary_counted(session, true);
        }
    }

    /// Called by a [`Session`] when it is paused.
    pub(crate) fn session_stopped(self: &Arc<Self>, session: &Arc<Session>) {
        if session.flags().primary {
            self.set_active_primary_counted(session, false);
        }
        self.maybe_elect_primary();
        self.recompute_has_listen_sessions();
    }

    /// Called by a [`Session`] once it has been killed: removes it from the active registry,
    /// re-elects primary if needed, and either destroys it immediately or parks it in the dead list
    /// until its in-flight buffers drain.
    pub(crate) fn notify_dead_session(self: &Arc<Self>, session: Arc<Session>) {
        {
            let mut reg = self.sessions.lock().expect("sessions mutex poisoned");
            let was_primary = reg.primary.as_ref().map(|p| Arc::ptr_eq(p, &session)).unwrap_or(false);
            if was_primary {
                reg.primary = None;
            } else {
                reg.sessions.retain(|s| !Arc::ptr_eq(s, &session));
            }
        }
        if session.flags().primary {
            self.set_active_primary_counted(&session, false);
        }
        self.rx_queue.purge_session(&session);
        self.maybe_elect_primary();
        self.recompute_has_listen_sessions();

        session.mark_dead();
        if session.in_flight_total() == 0 {
            self.finish_destroy(&session);
        } else {
            self.sessions.lock().expect("sessions mutex poisoned").dead.push(session);
        }
        self.maybe_finish_teardown();
    }

    fn finish_destroy(&self, session: &Arc<Session>) {
        if let Ok(vmo) = self.vmo_store.unregister(session.vmo_id()) {
            drop(vmo);
            self.device_impl.release_vmo(session.vmo_id());
        }
        session.mark_destroyed();
    }

    /// Destroys any dead sessions whose in-flight buffers have since drained to zero. Called after
    /// every rx/tx completion batch.
    pub fn prune_dead_sessions(&self) {
        let mut done = Vec::new();
        {
            let mut reg = self.sessions.lock().expect("sessions mutex poisoned");
            reg.dead.retain(|s| {
                if s.in_flight_total() == 0 {
                    done.push(s.clone());
                    false
                } else {
                    true
                }
            });
        }
        if done.is_empty() {
            return;
        }
        for s in &done {
            self.finish_destroy(s);
        }
        self.maybe_finish_teardown();
    }

    fn ordered_sessions(&self) -> Vec<Arc<Session>> {
        let reg = self.sessions.lock().expect("sessions mutex poisoned");
        let mut out = Vec::with_capacity(reg.sessions.len() + 1);
        out.extend(reg.primary.iter().cloned());
        out.extend(reg.sessions.iter().cloned());
        out
    }

    /// Fans a just-accepted tx frame out to every other session that requested `listen_tx`.
    pub(crate) fn fan_out_tx_listen(self: &Arc<Self>, owner: &Arc<Session>, owner_index: u16, frame_type: u8) {
        if !self.has_listen_sessions.load(Ordering::Acquire) {
            return;
        }
        let listeners: Vec<Arc<Session>> = {
            let reg = self.sessions.lock().expect("sessions mutex poisoned");
            reg.primary
                .iter()
                .chain(reg.sessions.iter())
                .filter(|s| !Arc::ptr_eq(s, owner) && s.flags().listen_tx && !s.is_paused())
                .cloned()
                .collect()
        };
        for listener in listeners {
            listener.listen_from_tx(owner, owner_index, frame_type);
        }
    }

    /// Fans a completed rx frame out to every session other than the one the device delivered it
    /// to directly.
    pub(crate) fn copy_to_other_sessions(self: &Arc<Self>, owner: &Arc<Session>, owner_index: u16, buff: &RxBuffer) {
        let others: Vec<Arc<Session>> = {
            let reg = self.sessions.lock().expect("sessions mutex poisoned");
            reg.primary
                .iter()
                .chain(reg.sessions.iter())
                .filter(|s| !Arc::ptr_eq(s, owner))
                .cloned()
                .collect()
        };
        for s in others {
            s.complete_rx_with(owner, owner_index, buff);
        }
    }

    // --- Device start/stop state machine -------------------------------------------------------

    fn start_device(self: &Arc<Self>) {
        let mut state = self.device_state.lock().expect("device_state mutex poisoned");
        match state.status {
            DeviceStatus::Stopped => {
                state.status = DeviceStatus::Starting;
                state.pending = PendingOp::None;
                drop(state);
                self.rx_queue.set_data_plane_open(true);
                let me = self.clone();
                self.device_impl.start(Box::new(move || me.on_start_complete()));
            }
            DeviceStatus::Stopping => state.pending = PendingOp::Start,
            DeviceStatus::Starting | DeviceStatus::Started => {}
        }
    }

    fn stop_device(self: &Arc<Self>) {
        let mut state = self.device_state.lock().expect("device_state mutex poisoned");
        match state.status {
            DeviceStatus::Started => {
                state.status = DeviceStatus::Stopping;
                state.pending = PendingOp::None;
                drop(state);
                self.tx_queue.set_started(false);
                self.rx_queue.set_data_plane_open(false);
                let me = self.clone();
                self.device_impl.stop(Box::new(move || me.on_stop_complete()));
            }
            DeviceStatus::Starting => state.pending = PendingOp::Stop,
            DeviceStatus::Stopping | DeviceStatus::Stopped => {}
        }
    }

    fn on_start_complete(self: Arc<Self>) {
        let pending = {
            let mut state = self.device_state.lock().expect("device_state mutex poisoned");
            state.status = DeviceStatus::Started;
            std::mem::replace(&mut state.pending, PendingOp::None)
        };
        if pending == PendingOp::Stop {
            // `stop_device` below flips `tx_queue`'s started flag back to false as part of its own
            // Started -> Stopping transition; marking it started here too would race that and
            // leave it wrongly `true` once this function returns.
            self.stop_device();
        } else {
            self.tx_queue.set_started(true);
            self.rx_queue.trigger_refill();
        }
    }

    fn on_stop_complete(self: Arc<Self>) {
        let pending = {
            let mut state = self.device_state.lock().expect("device_state mutex poisoned");
            state.status = DeviceStatus::Stopped;
            let pending = std::mem::replace(&mut state.pending, PendingOp::None);
            // Reclaim while STOPPED is set and the device-state lock is held: after this,
            // neither queue holds any buffer the device still owns.
            self.tx_queue.reclaim();
            self.rx_queue.reclaim();
            pending
        };
        self.prune_dead_sessions();
        if let TeardownStage::Sessions = self.teardown.lock().expect("teardown mutex poisoned").stage {
            self.maybe_finish_teardown();
        } else if pending == PendingOp::Start {
            self.start_device();
        }
    }

    // --- Bindings / watchers / teardown ---------------------------------------------------------

    /// Registers one open transport binding. Returns [`Status::BadState`] once teardown has begun.
    pub fn register_binding(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Status::BadState);
        }
        self.bindings.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Unregisters a transport binding, potentially advancing teardown past the BINDINGS stage.
    pub fn unregister_binding(self: &Arc<Self>) {
        self.bindings.fetch_sub(1, Ordering::AcqRel);
        self.maybe_advance_from_bindings();
    }

    /// Creates a new status watcher, bound to this device's link-status stream.
    pub fn watch_status(&self) -> Arc<StatusWatcher> {
        let watcher = Arc::new(StatusWatcher::new(crate::descriptor::MAX_STATUS_BUFFER));
        self.status_watchers.lock().expect("status_watchers mutex poisoned").push(watcher.clone());
        watcher
    }

    /// Begins the deterministic teardown sequence: RUNNING -> BINDINGS -> WATCHERS -> SESSIONS ->
    /// FINISHED. `callback` fires exactly once, when FINISHED is reached.
    ///
    /// A second call while teardown is already in progress is a no-op (the first callback still
    /// wins).
    pub fn teardown(self: &Arc<Self>, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut t = self.teardown.lock().expect("teardown mutex poisoned");
            if !matches!(t.stage, TeardownStage::Running) {
                return;
            }
            t.stage = TeardownStage::Bindings;
            t.callback = Some(callback);
        }
        debug!("teardown: RUNNING -> BINDINGS");
        self.maybe_advance_from_bindings();
    }

    fn maybe_advance_from_bindings(self: &Arc<Self>) {
        let should_advance = {
            let t = self.teardown.lock().expect("teardown mutex poisoned");
            matches!(t.stage, TeardownStage::Bindings) && self.bindings.load(Ordering::Acquire) == 0
        };
        if !should_advance {
            return;
        }
        {
            let mut t = self.teardown.lock().expect("teardown mutex poisoned");
            if matches!(t.stage, TeardownStage::Bindings) {
                t.stage = TeardownStage::Watchers;
            }
        }
        debug!("teardown: BINDINGS -> WATCHERS");
        self.unbind_all_watchers();
        self.advance_from_watchers();
    }

    fn unbind_all_watchers(&self) {
        let mut watchers = self.status_watchers.lock().expect("status_watchers mutex poisoned");
        for w in watchers.drain(..) {
            w.unbind();
        }
    }

    fn advance_from_watchers(self: &Arc<Self>) {
        {
            let mut t = self.teardown.lock().expect("teardown mutex poisoned");
            if matches!(t.stage, TeardownStage::Watchers) {
                t.stage = TeardownStage::Sessions;
            }
        }
        debug!("teardown: WATCHERS -> SESSIONS");
        self.kill_all_sessions();
        self.maybe_finish_teardown();
    }

    fn kill_all_sessions(self: &Arc<Self>) {
        let all = self.ordered_sessions();
        for s in all {
            s.kill("device interface teardown");
        }
    }

    fn maybe_finish_teardown(self: &Arc<Self>) {
        let done = {
            let t = self.teardown.lock().expect("teardown mutex poisoned");
            if !matches!(t.stage, TeardownStage::Sessions) {
                return;
            }
            let reg = self.sessions.lock().expect("sessions mutex poisoned");
            let sessions_gone = reg.sessions.is_empty() && reg.primary.is_none() && reg.dead.is_empty();
            let device_stopped = matches!(
                self.device_state.lock().expect("device_state mutex poisoned").status,
                DeviceStatus::Stopped
            );
            sessions_gone && device_stopped
        };
        if !done {
            return;
        }
        let callback = {
            let mut t = self.teardown.lock().expect("teardown mutex poisoned");
            if !matches!(t.stage, TeardownStage::Sessions) {
                return;
            }
            t.stage = TeardownStage::Finished;
            t.callback.take()
        };
        debug!("teardown: SESSIONS -> FINISHED");
        self.rx_queue.shutdown();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl DeviceCallbacks for DeviceInterface {
    fn complete_tx(&self, results: &[TxResult]) {
        self.tx_queue.complete_tx_list(results);
        self.prune_dead_sessions();
    }

    fn complete_rx(&self, buffers: &[RxBuffer]) {
        let sessions = self.ordered_sessions();
        self.rx_queue.complete_rx_list(&sessions, buffers);
        self.prune_dead_sessions();
    }

    fn status_changed(&self, status: LinkStatus) {
        let watchers = self.status_watchers.lock().expect("status_watchers mutex poisoned");
        for w in watchers.iter() {
            w.push_status(status);
        }
    }
}
