//! Validated configuration derived from a device implementation's reported [`DeviceInfo`].
//!
//! Ambient concern: validation happens once, at device-interface
//! construction, rather than being re-checked scattered through the hot tx/rx paths.

use log::debug;

use crate::descriptor::{DeviceInfo, MAX_FIFO_DEPTH, MAX_FRAME_TYPES};
use crate::status::{Result, Status};

/// Fully validated, derived configuration for one device-interface instance.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub info: DeviceInfo,
    pub rx_fifo_depth: u32,
    pub tx_fifo_depth: u32,
    pub rx_notify_threshold: u32,
}

impl DeviceConfig {
    /// Validates `info` and derives the fixed quantities the rest of the crate depends on.
    ///
    /// Returns [`Status::InvalidArgs`] if the reported info is internally inconsistent (zero
    /// depths, too many frame types, etc).
    pub fn new(info: DeviceInfo) -> Result<Self> {
        if info.rx_depth == 0 || info.tx_depth == 0 {
            return Err(Status::InvalidArgs);
        }
        if info.rx_types.len() > MAX_FRAME_TYPES || info.tx_types.len() > MAX_FRAME_TYPES {
            return Err(Status::InvalidArgs);
        }
        if info.buffer_alignment == 0 {
            return Err(Status::InvalidArgs);
        }

        let rx_fifo_depth = MAX_FIFO_DEPTH.min(2 * info.rx_depth as u32);
        let tx_fifo_depth = MAX_FIFO_DEPTH.min(2 * info.tx_depth as u32);
        // Half the device's rx depth, not separately negotiated per device.
        let rx_notify_threshold = info.rx_depth as u32 / 2;

        debug!(
            "device config: rx_depth={} tx_depth={} rx_fifo_depth={rx_fifo_depth} tx_fifo_depth={tx_fifo_depth} rx_notify_threshold={rx_notify_threshold}",
            info.rx_depth, info.tx_depth,
        );

        Ok(DeviceConfig {
            info,
            rx_fifo_depth,
            tx_fifo_depth,
            rx_notify_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_info() -> DeviceInfo {
        DeviceInfo {
            class: 0,
            min_descriptor_length: 4,
            descriptor_version: crate::descriptor::DESCRIPTOR_VERSION,
            rx_depth: 32,
            tx_depth: 32,
            buffer_alignment: 1,
            max_buffer_length: 2048,
            min_rx_buffer_length: 256,
            min_tx_buffer_head: 0,
            min_tx_buffer_tail: 0,
            rx_types: vec![1],
            tx_types: vec![],
            rx_accel: vec![],
            tx_accel: vec![],
        }
    }

    #[test]
    fn derives_fifo_depths_and_threshold() {
        let cfg = DeviceConfig::new(base_info()).unwrap();
        assert_eq!(cfg.rx_fifo_depth, 64);
        assert_eq!(cfg.tx_fifo_depth, 64);
        assert_eq!(cfg.rx_notify_threshold, 16);
    }

    #[test]
    fn fifo_depth_clamped_to_maximum() {
        let mut info = base_info();
        info.rx_depth = u16::MAX;
        let cfg = DeviceConfig::new(info).unwrap();
        assert_eq!(cfg.rx_fifo_depth, MAX_FIFO_DEPTH);
    }

    #[test]
    fn zero_depth_rejected() {
        let mut info = base_info();
        info.tx_depth = 0;
        assert_eq!(DeviceConfig::new(info).unwrap_err(), Status::InvalidArgs);
    }

    #[test]
    fn too_many_frame_types_rejected() {
        let mut info = base_info();
        info.rx_types = vec![0; MAX_FRAME_TYPES + 1];
        assert_eq!(DeviceConfig::new(info).unwrap_err(), Status::InvalidArgs);
    }
}
