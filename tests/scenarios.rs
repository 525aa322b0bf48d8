//! End-to-end scenarios driving a [`DeviceInterface`] over [`FakeNetworkDevice`], the way a real
//! transport binding and a real NIC driver would, but with both endpoints in one test thread plus
//! the crate's own background worker threads.

use std::time::{Duration, Instant};

use netdevice_core::descriptor::{Descriptor, SessionFlags, DESCRIPTOR_VERSION};
use netdevice_core::device::{DeviceInterface, OpenSessionRequest, OpenedSession};
use netdevice_core::status::Status;
use netdevice_core::status_watcher::LinkStatus;
use netdevice_core::testutil::{FakeNetworkDevice, FAKE_FRAME_TYPE_ETHERNET};
use netdevice_core::vmo::Vmo;

const DESCRIPTOR_LENGTH: u16 = 32;

fn poll_until<F: FnMut() -> bool>(mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if f() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition did not become true within 2s");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct Harness {
    device: std::sync::Arc<FakeNetworkDevice>,
    iface: std::sync::Arc<DeviceInterface>,
}

impl Harness {
    fn new(rx_depth: u16, tx_depth: u16) -> Self {
        let device = FakeNetworkDevice::new(rx_depth, tx_depth);
        let iface = DeviceInterface::new(device.clone()).expect("valid fake device info");
        Harness { device, iface }
    }

    /// Opens a session with `descriptor_count` descriptors, each `DESCRIPTOR_LENGTH` bytes, backed
    /// by fresh data/descriptor VMOs. Returns the session handle, client-facing FIFOs, and test-side
    /// clones of both VMOs for writing/inspecting descriptors and payloads directly.
    fn open_session(&self, flags: SessionFlags, descriptor_count: u32) -> (OpenedSession, Vmo, Vmo) {
        let data_vmo = Vmo::create(descriptor_count as usize * 2048).unwrap();
        let descriptor_vmo = Vmo::create(descriptor_count as usize * DESCRIPTOR_LENGTH as usize).unwrap();
        let vmo_id = self.iface.register_vmo(data_vmo.clone()).unwrap();
        let opened = self
            .iface
            .open_session(OpenSessionRequest {
                name: "test-session".into(),
                vmo_id,
                descriptor_count,
                descriptor_length: DESCRIPTOR_LENGTH,
                descriptor_version: DESCRIPTOR_VERSION,
                flags,
                rx_frame_types: vec![FAKE_FRAME_TYPE_ETHERNET],
                descriptor_vmo: descriptor_vmo.clone(),
            })
            .unwrap();
        (opened, data_vmo, descriptor_vmo)
    }

    /// Unpauses a primary session and drives the device's deferred `start` to completion, waiting
    /// until the device has actually registered the call.
    fn start_primary(&self, opened: &OpenedSession) {
        opened.session.set_paused(false);
        poll_until(|| self.device.start_pending());
        self.device.complete_start();
    }
}

fn reset_descriptor(
    vmo: &Vmo,
    index: u16,
    frame_type: u8,
    data_length: u32,
) {
    let d = Descriptor {
        frame_type,
        chain_length: 0,
        nxt: 0,
        info_type: 0,
        offset: index as u64 * 2048,
        head_length: 0,
        tail_length: 0,
        data_length,
        inbound_flags: 0,
        return_flags: 0xDEAD_BEEF,
    };
    d.write_to(vmo, index, DESCRIPTOR_LENGTH).unwrap();
}

fn primary_flags() -> SessionFlags {
    SessionFlags {
        primary: true,
        listen_tx: false,
    }
}

#[test]
fn simple_tx_accepts_and_completes() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);
    h.start_primary(&opened);

    reset_descriptor(&descriptor_vmo, 0, FAKE_FRAME_TYPE_ETHERNET, 4);
    data_vmo.write(0, &[1, 2, 3, 4]).unwrap();
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    let mut queued = Vec::new();
    poll_until(|| {
        queued = h.device.take_queued_tx();
        !queued.is_empty()
    });
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].frame_type, FAKE_FRAME_TYPE_ETHERNET);
    assert_eq!(queued[0].data.len(), 1);
    assert_eq!(queued[0].data[0].length, 4);

    h.device.complete_tx(&[netdevice_core::contract::TxResult {
        id: queued[0].id,
        status: Status::Ok,
    }]);

    let mut out = [0u16; 1];
    poll_until(|| opened.tx_fifo.read_nonblocking(&mut out).unwrap() == 1);
    assert_eq!(out[0], 0);

    let completed = Descriptor::read_from(&descriptor_vmo, 0, DESCRIPTOR_LENGTH).unwrap();
    assert_eq!(completed.return_flags, 0);
}

#[test]
fn rx_fans_out_to_non_primary_session() {
    let h = Harness::new(8, 4);
    let (a, a_data, a_desc) = h.open_session(primary_flags(), 8);
    let (b, b_data, b_desc) = h.open_session(
        SessionFlags {
            primary: true,
            listen_tx: false,
        },
        8,
    );
    for i in 0..5u16 {
        reset_descriptor(&b_desc, i, FAKE_FRAME_TYPE_ETHERNET, 256);
    }
    b.rx_fifo.write_nonblocking(&[0, 1, 2, 3, 4]).unwrap();
    a.session.set_paused(false);
    b.session.set_paused(false);
    poll_until(|| h.device.start_pending());
    h.device.complete_start();

    let mut queued = Vec::new();
    poll_until(|| {
        queued = h.device.take_queued_rx_space();
        !queued.is_empty()
    });

    let payload = b"hello world!!!!";
    a_data.write(0, payload).unwrap();
    h.device.complete_rx(&[netdevice_core::contract::RxBuffer {
        frame_type: FAKE_FRAME_TYPE_ETHERNET,
        info_type: 0,
        inbound_flags: 0,
        total_length: payload.len() as u32,
        parts: vec![netdevice_core::contract::RxBufferPart {
            id: queued[0].id,
            length: payload.len() as u32,
        }],
    }]);

    let _ = a_desc;
    let mut a_out = [0u16; 1];
    poll_until(|| a.rx_fifo.read_nonblocking(&mut a_out).unwrap() == 1);
    let mut b_out = [0u16; 1];
    poll_until(|| b.rx_fifo.read_nonblocking(&mut b_out).unwrap() == 1);

    let _ = b_data;
}

#[test]
fn invalid_tx_frame_type_kills_session_without_reaching_device() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);
    h.start_primary(&opened);

    // Frame type 250 is not in FakeNetworkDevice's supported tx set.
    reset_descriptor(&descriptor_vmo, 0, 250, 4);
    let _ = data_vmo.write(0, &[0, 0, 0, 0]);
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    poll_until(|| opened.tx_fifo.is_peer_closed());
    assert!(h.device.take_queued_tx().is_empty());
}

#[test]
fn coalesced_stop_then_start_issues_single_stop_and_no_tx() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);

    opened.session.set_paused(false);
    poll_until(|| h.device.start_pending());

    // Pause (and re-unpause) before the deferred `start` completes: the pending stop should
    // coalesce into exactly one `stop` call once `start` finishes, not one per toggle.
    opened.session.set_paused(true);

    reset_descriptor(&descriptor_vmo, 0, FAKE_FRAME_TYPE_ETHERNET, 4);
    data_vmo.write(0, &[9, 9, 9, 9]).unwrap();
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    h.device.complete_start();
    poll_until(|| h.device.stop_pending());
    h.device.complete_stop();

    assert_eq!(h.device.start_calls(), 1);
    assert_eq!(h.device.stop_calls(), 1);
    assert!(h.device.take_queued_tx().is_empty());
}

#[test]
fn teardown_waits_for_in_flight_buffers_to_drain() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);
    h.start_primary(&opened);

    reset_descriptor(&descriptor_vmo, 0, FAKE_FRAME_TYPE_ETHERNET, 4);
    data_vmo.write(0, &[1, 2, 3, 4]).unwrap();
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    let mut queued = Vec::new();
    poll_until(|| {
        queued = h.device.take_queued_tx();
        !queued.is_empty()
    });

    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let done_writer = done.clone();
    let iface = h.iface.clone();
    iface.teardown(Box::new(move || {
        done_writer.store(true, std::sync::atomic::Ordering::Release);
    }));

    // Teardown must not finish while the tx buffer the device is still holding hasn't been
    // returned yet.
    std::thread::sleep(Duration::from_millis(20));
    assert!(!done.load(std::sync::atomic::Ordering::Acquire));

    h.device.complete_tx(&[netdevice_core::contract::TxResult {
        id: queued[0].id,
        status: Status::Ok,
    }]);

    poll_until(|| done.load(std::sync::atomic::Ordering::Acquire));
}

#[test]
fn device_offline_tx_is_bounced_with_unavailable() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);

    // Unpausing triggers the device's (deferred, never-completed) `start`, so the device sits in
    // STARTING — never STARTED — for the rest of this test. Any tx submitted in that window must
    // bounce straight back with UNAVAILABLE instead of reaching the device.
    reset_descriptor(&descriptor_vmo, 0, FAKE_FRAME_TYPE_ETHERNET, 4);
    data_vmo.write(0, &[1, 2, 3, 4]).unwrap();
    opened.session.set_paused(false);
    poll_until(|| h.device.start_pending());
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    let mut out = [0u16; 1];
    poll_until(|| opened.tx_fifo.read_nonblocking(&mut out).unwrap() == 1);
    assert_eq!(out[0], 0);
    assert!(h.device.take_queued_tx().is_empty());

    let completed = Descriptor::read_from(&descriptor_vmo, 0, DESCRIPTOR_LENGTH).unwrap();
    assert_ne!(completed.return_flags, 0);
    assert_eq!(completed.return_flags & netdevice_core::descriptor::tx_return_flags::ERROR, netdevice_core::descriptor::tx_return_flags::ERROR);
    assert_eq!(
        completed.return_flags & netdevice_core::descriptor::tx_return_flags::NOT_AVAILABLE,
        netdevice_core::descriptor::tx_return_flags::NOT_AVAILABLE
    );
}

#[test]
fn stop_reclaims_in_flight_tx_buffer() {
    let h = Harness::new(4, 4);
    let (opened, data_vmo, descriptor_vmo) = h.open_session(primary_flags(), 8);
    h.start_primary(&opened);

    reset_descriptor(&descriptor_vmo, 0, FAKE_FRAME_TYPE_ETHERNET, 4);
    data_vmo.write(0, &[1, 2, 3, 4]).unwrap();
    opened.tx_fifo.write_nonblocking(&[0]).unwrap();

    // Let the device pick the buffer up (and never complete it) before tearing the data plane
    // down: `stop` completing must hand it straight back as NOT_AVAILABLE rather than leaving it
    // stuck in-flight forever.
    poll_until(|| !h.device.take_queued_tx().is_empty());

    opened.session.set_paused(true);
    poll_until(|| h.device.stop_pending());
    h.device.complete_stop();

    let mut tx_out = [0u16; 1];
    poll_until(|| opened.tx_fifo.read_nonblocking(&mut tx_out).unwrap() == 1);
    assert_eq!(tx_out[0], 0);
    let completed = Descriptor::read_from(&descriptor_vmo, 0, DESCRIPTOR_LENGTH).unwrap();
    assert_eq!(
        completed.return_flags & netdevice_core::descriptor::tx_return_flags::NOT_AVAILABLE,
        netdevice_core::descriptor::tx_return_flags::NOT_AVAILABLE
    );
}

#[test]
fn status_watcher_observes_link_changes_through_the_device() {
    let h = Harness::new(4, 4);
    let watcher = h.iface.watch_status();

    h.device.push_status(LinkStatus { mtu: 1500, online: true });
    assert_eq!(watcher.watch().unwrap(), LinkStatus { mtu: 1500, online: true });

    h.device.push_status(LinkStatus { mtu: 1500, online: true });
    h.device.push_status(LinkStatus { mtu: 1500, online: false });
    h.device.push_status(LinkStatus { mtu: 1500, online: true });
    assert_eq!(watcher.watch().unwrap(), LinkStatus { mtu: 1500, online: false });
    assert_eq!(watcher.watch().unwrap(), LinkStatus { mtu: 1500, online: true });
}

#[test]
fn rate_limited_rx_refill_batches_after_crossing_threshold() {
    let rx_depth = 8u16;
    let h = Harness::new(rx_depth, 4);
    let descriptor_count = 2 * rx_depth as u32;
    let (opened, _data_vmo, descriptor_vmo) = h.open_session(primary_flags(), descriptor_count);
    for i in 0..descriptor_count as u16 {
        reset_descriptor(&descriptor_vmo, i, FAKE_FRAME_TYPE_ETHERNET, 256);
    }
    let indices: Vec<u16> = (0..descriptor_count as u16).collect();
    assert_eq!(opened.rx_fifo.write_nonblocking(&indices).unwrap(), descriptor_count);

    h.start_primary(&opened);

    // The device only ever holds rx_depth space buffers at once, even though twice that many
    // descriptors are sitting in the client's fifo.
    let mut first_batch = Vec::new();
    poll_until(|| {
        first_batch = h.device.take_queued_rx_space();
        !first_batch.is_empty()
    });
    assert_eq!(first_batch.len(), rx_depth as usize);

    let complete_one = |id: u32| {
        h.device.complete_rx(&[netdevice_core::contract::RxBuffer {
            frame_type: FAKE_FRAME_TYPE_ETHERNET,
            info_type: 0,
            inbound_flags: 0,
            total_length: 0,
            parts: vec![netdevice_core::contract::RxBufferPart { id, length: 0 }],
        }]);
    };

    // rx_notify_threshold is rx_depth / 2 == 4. Returning buffers one at a time keeps the
    // device's held count at 7, 6, 5 — all above the threshold — so no refill should fire yet.
    for buf in &first_batch[..3] {
        complete_one(buf.id);
        std::thread::sleep(Duration::from_millis(20));
        assert!(
            h.device.take_queued_rx_space().is_empty(),
            "no refill should happen before the notify threshold is crossed"
        );
    }

    // The 4th return brings the held count down to exactly the threshold, which should trigger
    // one batched refill pulling the remaining descriptors back up to rx_depth.
    complete_one(first_batch[3].id);

    let mut second_batch = Vec::new();
    poll_until(|| {
        second_batch = h.device.take_queued_rx_space();
        !second_batch.is_empty()
    });
    assert_eq!(second_batch.len(), (rx_depth as usize) / 2);
}
