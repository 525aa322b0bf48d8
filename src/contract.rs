//! The device-implementation contract: what the framework calls into, and what it hands back.
//!
//! Two traits make up the seam: [`DeviceImplementation`]
//! is the operation set the framework invokes on the concrete driver, and [`DeviceCallbacks`] is
//! the reverse capability the driver uses to report completions and status changes back into the
//! framework. Keeping both as trait objects (rather than a single monolithic struct) is the same
//! shape an AF_XDP socket binding uses to separate user-facing ring handles from the raw
//! socket/umem owner (`XskRxRing`/`XskTxRing` versus `XskUmem`).

use crate::descriptor::DeviceInfo;
use crate::status::Status;
use crate::status_watcher::LinkStatus;
use crate::vmo::Vmo;

/// One contiguous region of a registered VMO.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufferRegion {
    pub vmo_id: u8,
    pub offset: u64,
    pub length: u32,
}

/// A tx buffer submitted to the device implementation.
#[derive(Clone, Debug)]
pub struct TxBuffer {
    /// Opaque id the device must echo back unchanged in the matching [`TxResult`].
    pub id: u32,
    pub frame_type: u8,
    pub data: Vec<BufferRegion>,
}

/// The outcome of one previously-submitted [`TxBuffer`].
#[derive(Clone, Copy, Debug)]
pub struct TxResult {
    pub id: u32,
    pub status: Status,
}

/// One or more empty regions offered to the device to receive an inbound frame.
///
/// Usually a single region; more than one only when the client posted a chained rx descriptor
/// mirroring [`TxBuffer::data`]'s shape.
#[derive(Clone, Debug)]
pub struct RxSpaceBuffer {
    pub id: u32,
    pub regions: Vec<BufferRegion>,
}

/// One part of a (possibly chained) completed rx buffer.
#[derive(Clone, Copy, Debug)]
pub struct RxBufferPart {
    /// The [`RxSpaceBuffer::id`] this part filled.
    pub id: u32,
    pub length: u32,
}

/// A completed inbound frame, described as one or more [`RxBufferPart`]s.
#[derive(Clone, Debug)]
pub struct RxBuffer {
    pub frame_type: u8,
    pub info_type: u32,
    pub inbound_flags: u32,
    pub total_length: u32,
    pub parts: Vec<RxBufferPart>,
}

/// Operations the framework invokes on a concrete device implementation.
///
/// Implementors must not block the calling thread for longer than establishing the operation;
/// `start`/`stop` are explicitly asynchronous via a completion callback so the device state
/// machine never blocks a worker thread on device-internal latency.
pub trait DeviceImplementation: Send + Sync {
    /// Static capability information, queried once at construction.
    fn info(&self) -> DeviceInfo;

    /// Binds the reverse callback capability; called exactly once, before any other method, by the
    /// device interface that owns this implementation (mirrors the original's
    /// `Init(framework_interface)`).
    fn bind_callbacks(&self, callbacks: std::sync::Arc<dyn DeviceCallbacks>);

    /// Requests the device begin delivering/accepting traffic. `callback` must be invoked exactly
    /// once, from any thread, when the transition completes.
    fn start(&self, callback: Box<dyn FnOnce() + Send>);

    /// Requests the device stop delivering/accepting traffic. `callback` must be invoked exactly
    /// once, from any thread, when the transition completes (including reclaiming all in-flight
    /// buffers, per the device's Reclaim policy).
    fn stop(&self, callback: Box<dyn FnOnce() + Send>);

    /// Submits a batch of tx buffers. Completions are reported later via
    /// [`DeviceCallbacks::complete_tx`].
    fn queue_tx(&self, buffers: &[TxBuffer]);

    /// Submits a batch of empty rx-space buffers. Completions are reported later via
    /// [`DeviceCallbacks::complete_rx`].
    fn queue_rx_space(&self, buffers: &[RxSpaceBuffer]);

    /// Registers a VMO the device should be prepared to read/write by id.
    fn prepare_vmo(&self, id: u8, vmo: Vmo) -> Status;

    /// Releases a previously registered VMO; the device must not touch it again afterwards.
    fn release_vmo(&self, id: u8);
}

/// The reverse capability: how a device implementation reports completions back into the
/// framework. Implemented by the device-interface root and handed to the device implementation
/// at construction (mirroring the original's `Init(framework_interface)` call).
pub trait DeviceCallbacks: Send + Sync {
    /// Reports a batch of tx completions.
    fn complete_tx(&self, results: &[TxResult]);

    /// Reports a batch of completed rx buffers.
    fn complete_rx(&self, buffers: &[RxBuffer]);

    /// Reports a link-status change.
    fn status_changed(&self, status: LinkStatus);

    /// Offers a copy of an inbound frame for out-of-band inspection. Unimplemented upstream; kept
    /// as a no-op seam here too.
    fn snoop(&self, _frame: &RxBuffer) {}
}
