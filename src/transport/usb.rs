//! USB HID transportation.
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, Result};

use super::Transport;

const TIMEOUT_MS: u64 = 1000;

pub struct UsbTransport {
    device_handle: DeviceHandle<rusb::Context>,
    endpoint_out: u8,
    endpoint_in: u8,
}

fn matches(device: &Device<Context>, vid: u16, pid: u16) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn scan_devices(vid: u16, pid: u16) -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(|device| matches(device, vid, pid))
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found writer USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(vid: u16, pid: u16, nth: usize) -> Result<UsbTransport> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .filter(|device| matches(device, vid, pid))
            .nth(nth)
            .ok_or_else(|| {
                Error::Transport(format!(
                    "no writer found ({:04x}:{:04x} device not found at index #{})",
                    vid, pid, nth
                ))
            })?;
        log::debug!("Found USB Device {:?}", device);

        let mut device_handle = device.open()?;

        // the writer is a plain HID device with one interrupt endpoint each way
        let config = device.config_descriptor(0)?;
        let mut endpoint_out = None;
        let mut endpoint_in = None;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Interrupt {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::Out => endpoint_out = Some(endpoint.address()),
                        Direction::In => endpoint_in = Some(endpoint.address()),
                    }
                }
            }
        }

        let (Some(endpoint_out), Some(endpoint_in)) = (endpoint_out, endpoint_in) else {
            return Err(Error::Transport("USB interrupt endpoints not found".into()));
        };

        // the kernel HID driver holds the interface until detached
        if let Err(e) = device_handle.set_auto_detach_kernel_driver(true) {
            log::debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        device_handle.claim_interface(0)?;

        Ok(UsbTransport {
            device_handle,
            endpoint_out,
            endpoint_in,
        })
    }

    pub fn open_any(vid: u16, pid: u16) -> Result<UsbTransport> {
        Self::open_nth(vid, pid, 0)
    }
}

impl Transport for UsbTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.device_handle.write_interrupt(
            self.endpoint_out,
            raw,
            Duration::from_millis(TIMEOUT_MS),
        )?;
        Ok(())
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let nread = self.device_handle.read_interrupt(
            self.endpoint_in,
            &mut buf,
            Duration::from_millis(TIMEOUT_MS),
        )?;
        Ok(buf[..nread].to_vec())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.device_handle.release_interface(0);
    }
}
