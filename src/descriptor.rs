//! Wire-format descriptor layout, flag bits, and the fixed maxima referenced throughout the crate.
//!
//! The `#[repr(C)]` layout and the const "no padding" assertion are the same idiom an AF_XDP
//! socket binding uses for its kernel-ABI structs (`XdpDesc`/`XdpUmemReg` and their
//! `_NO_PADDING` const-assertions) — here applied to the descriptor this framework exchanges with
//! clients over shared memory instead of to an XDP ring slot.

/// Maximum chain length for a single logical buffer.
pub const MAX_DESCRIPTOR_CHAIN: usize = 4;
/// Maximum number of frame types a session may subscribe to.
pub const MAX_FRAME_TYPES: usize = 4;
/// Maximum number of simultaneously registered VMOs (bounded by the `u8` `vmo_id` field width).
pub const MAX_VMOS: usize = 32;
/// Maximum number of buffered link-status updates a [`crate::status_watcher::StatusWatcher`] may
/// hold.
pub const MAX_STATUS_BUFFER: usize = 8;
/// Hard ceiling on negotiated FIFO depth, regardless of what the device implementation reports.
pub const MAX_FIFO_DEPTH: u32 = 4096;
/// Maximum session name length in bytes.
pub const MAX_SESSION_NAME: usize = 64;

/// `info_type` value meaning "no additional metadata".
pub const INFO_TYPE_NO_INFO: u32 = 0;

/// Tx return-flags bit values.
pub mod tx_return_flags {
    /// Set on any non-`OK` completion, alongside exactly one of the more specific bits below.
    pub const ERROR: u32 = 0x1;
    pub const OUT_OF_RESOURCES: u32 = 0x2;
    pub const NOT_SUPPORTED: u32 = 0x4;
    pub const NOT_AVAILABLE: u32 = 0x8;
}

/// Rx inbound-flags bit values.
pub mod rx_flags {
    /// Set on rx descriptors produced by the tx-listen fan-out rather than real device rx.
    pub const RX_ECHOED_TX: u32 = 0x1;
}

/// Session flags, set at session-open time and immutable thereafter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionFlags {
    /// The session is eligible to become primary.
    pub primary: bool,
    /// The session wants a copy of every tx frame sent by other sessions ("listen").
    pub listen_tx: bool,
}

/// A fixed-size record describing one buffer region within a session's data VMO.
///
/// Field order and widths match the wire layout exactly; total size is a multiple of 8 bytes as
/// required by `descriptor_length` being declared in units of 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Descriptor {
    pub frame_type: u8,
    pub chain_length: u8,
    pub nxt: u16,
    pub info_type: u32,
    pub offset: u64,
    pub head_length: u16,
    pub tail_length: u16,
    pub data_length: u32,
    pub inbound_flags: u32,
    pub return_flags: u32,
}

impl Descriptor {
    /// Size in bytes of one descriptor record.
    pub const SIZE: usize = core::mem::size_of::<Descriptor>();

    /// Byte offset of descriptor `index` within a descriptor VMO whose slots are `descriptor_length`
    /// bytes wide.
    pub fn offset_for(index: u16, descriptor_length: u16) -> u64 {
        index as u64 * descriptor_length as u64
    }

    /// Reads the descriptor at `index` out of `vmo`.
    pub fn read_from(
        vmo: &crate::vmo::Vmo,
        index: u16,
        descriptor_length: u16,
    ) -> crate::status::Result<Descriptor> {
        let mut buf = [0u8; Self::SIZE];
        vmo.read(Self::offset_for(index, descriptor_length), &mut buf)?;
        // SAFETY: `Descriptor` is `#[repr(C)]`, has no padding (see `_NO_PADDING` below), and every
        // bit pattern of its fields is valid, so any `Self::SIZE`-byte buffer is a valid instance.
        Ok(unsafe { core::ptr::read(buf.as_ptr() as *const Descriptor) })
    }

    /// Writes this descriptor back to `index` in `vmo`.
    pub fn write_to(
        &self,
        vmo: &crate::vmo::Vmo,
        index: u16,
        descriptor_length: u16,
    ) -> crate::status::Result<()> {
        // SAFETY: reinterpreting a `#[repr(C)]`, no-padding, `Copy` struct as its raw bytes.
        let bytes = unsafe {
            core::slice::from_raw_parts(self as *const Descriptor as *const u8, Self::SIZE)
        };
        vmo.write(Self::offset_for(index, descriptor_length), bytes)
    }
}

// Field widths are arranged so the u64 `offset` field falls on an 8-byte boundary without any
// compiler-inserted padding before or after it: 1+1+2+4 = 8 bytes precede it, and
// 2+2+4+4+4 = 16 bytes (a multiple of the struct's 8-byte alignment) follow it.
const _NO_PADDING: () = assert!(
    core::mem::size_of::<Descriptor>() == 1 + 1 + 2 + 4 + 8 + 2 + 2 + 4 + 4 + 4,
    "Descriptor must have no implicit padding"
);
const _SIZE_MULTIPLE_OF_8: () = assert!(
    core::mem::size_of::<Descriptor>() % 8 == 0,
    "Descriptor size must be a multiple of 8 bytes"
);

/// One supported tx frame type and the features/flags the device accepts for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxFrameType {
    pub frame_type: u8,
    pub features: u32,
    pub supported_flags: u32,
}

/// Static device capability information, queried once at device-interface construction
/// (matching the device's advertised capabilities).
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub class: u32,
    pub min_descriptor_length: u16,
    pub descriptor_version: u8,
    pub rx_depth: u16,
    pub tx_depth: u16,
    pub buffer_alignment: u32,
    pub max_buffer_length: u32,
    pub min_rx_buffer_length: u32,
    pub min_tx_buffer_head: u16,
    pub min_tx_buffer_tail: u16,
    pub rx_types: Vec<u8>,
    pub tx_types: Vec<TxFrameType>,
    pub rx_accel: Vec<u8>,
    pub tx_accel: Vec<u8>,
}

/// The descriptor-protocol version this implementation understands.
pub const DESCRIPTOR_VERSION: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_size_is_multiple_of_eight() {
        assert_eq!(Descriptor::SIZE % 8, 0);
    }
}
