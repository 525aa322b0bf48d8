//! An in-process fake device implementation for exercising the rest of the crate in tests.
//!
//! Grounded on the role `test_util.h`/`test_util.cc`'s `FakeNetworkDeviceImpl` plays for the
//! upstream test suite: a [`DeviceImplementation`] that queues whatever it is
//! handed and lets a test script complete it back on demand, rather than a real NIC. Kept in the
//! library crate (behind `#[cfg(test)]`-only visibility via the module gate in `lib.rs`), colocated
//! with the library rather than shipped as a separate crate.

use std::sync::{Arc, Mutex};

use crate::contract::{
    DeviceCallbacks, DeviceImplementation, RxBuffer, RxBufferPart, RxSpaceBuffer, TxBuffer, TxResult,
};
use crate::descriptor::{DeviceInfo, TxFrameType, DESCRIPTOR_VERSION};
use crate::status::Status;
use crate::status_watcher::LinkStatus;
use crate::vmo::Vmo;

/// Frame type accepted by [`FakeNetworkDevice::info`] by default.
pub const FAKE_FRAME_TYPE_ETHERNET: u8 = 1;

struct Inner {
    callbacks: Option<Arc<dyn DeviceCallbacks>>,
    queued_tx: Vec<TxBuffer>,
    queued_rx_space: Vec<RxSpaceBuffer>,
    start_callback: Option<Box<dyn FnOnce() + Send>>,
    stop_callback: Option<Box<dyn FnOnce() + Send>>,
    start_calls: u32,
    stop_calls: u32,
    prepared_vmos: Vec<(u8, Vmo)>,
    released_vmos: Vec<u8>,
}

/// A [`DeviceImplementation`] whose `start`/`stop` only complete when a test explicitly fires
/// them, and whose `queue_tx`/`queue_rx_space` calls only enqueue — letting a test script drive
/// completions at its own pace instead of racing a real driver thread.
pub struct FakeNetworkDevice {
    info: DeviceInfo,
    inner: Mutex<Inner>,
}

impl FakeNetworkDevice {
    /// Builds a fake device with the given rx/tx depths and one supported tx frame type
    /// ([`FAKE_FRAME_TYPE_ETHERNET`], no head/tail reservation, no feature bits).
    pub fn new(rx_depth: u16, tx_depth: u16) -> Arc<Self> {
        Self::with_info(DeviceInfo {
            class: 0,
            min_descriptor_length: 4,
            descriptor_version: DESCRIPTOR_VERSION,
            rx_depth,
            tx_depth,
            buffer_alignment: 1,
            max_buffer_length: 65536,
            min_rx_buffer_length: 256,
            min_tx_buffer_head: 0,
            min_tx_buffer_tail: 0,
            rx_types: vec![FAKE_FRAME_TYPE_ETHERNET],
            tx_types: vec![TxFrameType {
                frame_type: FAKE_FRAME_TYPE_ETHERNET,
                features: 0,
                supported_flags: 0,
            }],
            rx_accel: vec![],
            tx_accel: vec![],
        })
    }

    /// Builds a fake device reporting exactly `info`.
    pub fn with_info(info: DeviceInfo) -> Arc<Self> {
        Arc::new(FakeNetworkDevice {
            info,
            inner: Mutex::new(Inner {
                callbacks: None,
                queued_tx: Vec::new(),
                queued_rx_space: Vec::new(),
                start_callback: None,
                stop_callback: None,
                start_calls: 0,
                stop_calls: 0,
                prepared_vmos: Vec::new(),
                released_vmos: Vec::new(),
            }),
        })
    }

    /// Drains and returns every tx buffer queued since the last call.
    pub fn take_queued_tx(&self) -> Vec<TxBuffer> {
        std::mem::take(&mut self.inner.lock().expect("fake device mutex poisoned").queued_tx)
    }

    /// Drains and returns every rx-space buffer queued since the last call.
    pub fn take_queued_rx_space(&self) -> Vec<RxSpaceBuffer> {
        std::mem::take(
            &mut self
                .inner
                .lock()
                .expect("fake device mutex poisoned")
                .queued_rx_space,
        )
    }

    /// Number of times `start` has been invoked.
    pub fn start_calls(&self) -> u32 {
        self.inner.lock().expect("fake device mutex poisoned").start_calls
    }

    /// Number of times `stop` has been invoked.
    pub fn stop_calls(&self) -> u32 {
        self.inner.lock().expect("fake device mutex poisoned").stop_calls
    }

    /// Whether a `start` call is currently outstanding (callback not yet fired).
    pub fn start_pending(&self) -> bool {
        self.inner.lock().expect("fake device mutex poisoned").start_callback.is_some()
    }

    /// Whether a `stop` call is currently outstanding (callback not yet fired).
    pub fn stop_pending(&self) -> bool {
        self.inner.lock().expect("fake device mutex poisoned").stop_callback.is_some()
    }

    /// Fires the currently outstanding `start` completion callback, if any.
    pub fn complete_start(&self) {
        let cb = self.inner.lock().expect("fake device mutex poisoned").start_callback.take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Fires the currently outstanding `stop` completion callback, if any.
    pub fn complete_stop(&self) {
        let cb = self.inner.lock().expect("fake device mutex poisoned").stop_callback.take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Reports one or more tx completions back into the framework.
    pub fn complete_tx(&self, results: &[TxResult]) {
        let cb = self.inner.lock().expect("fake device mutex poisoned").callbacks.clone();
        if let Some(cb) = cb {
            cb.complete_tx(results);
        }
    }

    /// Reports one or more rx completions back into the framework.
    pub fn complete_rx(&self, buffers: &[RxBuffer]) {
        let cb = self.inner.lock().expect("fake device mutex poisoned").callbacks.clone();
        if let Some(cb) = cb {
            cb.complete_rx(buffers);
        }
    }

    /// Pushes a link-status change into every bound status watcher.
    pub fn push_status(&self, status: LinkStatus) {
        let cb = self.inner.lock().expect("fake device mutex poisoned").callbacks.clone();
        if let Some(cb) = cb {
            cb.status_changed(status);
        }
    }

    /// Convenience: completes every currently queued rx-space buffer with a single-part frame of
    /// `payload`, delivered as if it came from the first queued buffer (mirrors a device that
    /// fills exactly one space buffer per inbound frame).
    pub fn deliver_rx_frame(&self, frame_type: u8, payload_len: u32) {
        let queued = self.take_queued_rx_space();
        let first = queued.first().expect("no rx-space buffer queued to deliver into");
        self.complete_rx(&[RxBuffer {
            frame_type,
            info_type: crate::descriptor::INFO_TYPE_NO_INFO,
            inbound_flags: 0,
            total_length: payload_len,
            parts: vec![RxBufferPart {
                id: first.id,
                length: payload_len,
            }],
        }]);
    }

    /// List of `(vmo_id, handle)` pairs passed to `prepare_vmo` so far.
    pub fn prepared_vmos(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("fake device mutex poisoned")
            .prepared_vmos
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// List of vmo ids passed to `release_vmo` so far.
    pub fn released_vmos(&self) -> Vec<u8> {
        self.inner.lock().expect("fake device mutex poisoned").released_vmos.clone()
    }
}

impl DeviceImplementation for FakeNetworkDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn bind_callbacks(&self, callbacks: Arc<dyn DeviceCallbacks>) {
        self.inner.lock().expect("fake device mutex poisoned").callbacks = Some(callbacks);
    }

    fn start(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().expect("fake device mutex poisoned");
        inner.start_calls += 1;
        inner.start_callback = Some(callback);
    }

    fn stop(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().expect("fake device mutex poisoned");
        inner.stop_calls += 1;
        inner.stop_callback = Some(callback);
    }

    fn queue_tx(&self, buffers: &[TxBuffer]) {
        self.inner
            .lock()
            .expect("fake device mutex poisoned")
            .queued_tx
            .extend_from_slice(buffers);
    }

    fn queue_rx_space(&self, buffers: &[RxSpaceBuffer]) {
        self.inner
            .lock()
            .expect("fake device mutex poisoned")
            .queued_rx_space
            .extend_from_slice(buffers);
    }

    fn prepare_vmo(&self, id: u8, vmo: Vmo) -> Status {
        self.inner
            .lock()
            .expect("fake device mutex poisoned")
            .prepared_vmos
            .push((id, vmo));
        Status::Ok
    }

    fn release_vmo(&self, id: u8) {
        self.inner.lock().expect("fake device mutex poisoned").released_vmos.push(id);
    }
}
