//! libusb backend built on `rusb`.

use crate::backend::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, TransferType,
    UsbBackend, UsbDevice, UsbError, UsbHandle,
};
use crate::error::{Error, Result};
use rusb::UsbContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest single blocking interrupt read. Bounds how long a cancellation
/// request can go unnoticed.
const READ_SLICE: Duration = Duration::from_millis(100);

impl From<rusb::Error> for UsbError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Self::Timeout,
            rusb::Error::NoDevice => Self::NoDevice,
            rusb::Error::Access => Self::Access,
            rusb::Error::Busy => Self::Busy,
            rusb::Error::Pipe => Self::Pipe,
            rusb::Error::Overflow => Self::Overflow,
            rusb::Error::Interrupted => Self::Interrupted,
            rusb::Error::NotSupported => Self::NotSupported,
            rusb::Error::NotFound => Self::NotFound,
            rusb::Error::InvalidParam => Self::InvalidParam,
            rusb::Error::Io => Self::Io,
            other => Self::Other(other.to_string()),
        }
    }
}

/// `bcdDevice` rebuilt from rusb's decoded version triple.
fn bcd_from_version(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    let minor = u16::from(version.minor());
    let sub_minor = u16::from(version.sub_minor());
    ((((major / 10) << 4) | (major % 10)) << 8) | ((minor & 0x0F) << 4) | (sub_minor & 0x0F)
}

fn convert_transfer_type(transfer_type: rusb::TransferType) -> TransferType {
    match transfer_type {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

fn convert_config(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    let interfaces = config
        .interfaces()
        .map(|interface| {
            interface
                .descriptors()
                .map(|alt| InterfaceDescriptor {
                    number: alt.interface_number(),
                    alternate_setting: alt.setting_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            address: ep.address(),
                            transfer_type: convert_transfer_type(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                    extra: alt.extra().to_vec(),
                })
                .collect()
        })
        .collect();

    ConfigDescriptor {
        value: config.number(),
        interfaces,
    }
}

/// The system USB stack through libusb.
pub struct LibusbBackend {
    context: rusb::Context,
}

impl LibusbBackend {
    pub fn new() -> Result<Self> {
        let context =
            rusb::Context::new().map_err(|e| Error::Transport(format!("libusb init: {e}")))?;
        debug!("libusb context created");
        Ok(Self { context })
    }
}

impl UsbBackend for LibusbBackend {
    fn devices(&self) -> std::result::Result<Vec<Box<dyn UsbDevice>>, UsbError> {
        let list = self.context.devices()?;
        Ok(list
            .iter()
            .map(|device| Box::new(LibusbDevice { device }) as Box<dyn UsbDevice>)
            .collect())
    }
}

struct LibusbDevice {
    device: rusb::Device<rusb::Context>,
}

impl UsbDevice for LibusbDevice {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn port_numbers(&self) -> std::result::Result<Vec<u8>, UsbError> {
        Ok(self.device.port_numbers()?)
    }

    fn device_descriptor(&self) -> std::result::Result<DeviceDescriptor, UsbError> {
        let desc = self.device.device_descriptor()?;
        Ok(DeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            release_number: bcd_from_version(desc.device_version()),
            manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
            product_index: desc.product_string_index().unwrap_or(0),
            serial_index: desc.serial_number_string_index().unwrap_or(0),
        })
    }

    fn active_config_descriptor(&self) -> std::result::Result<ConfigDescriptor, UsbError> {
        Ok(convert_config(&self.device.active_config_descriptor()?))
    }

    fn config_descriptor(&self, index: u8) -> std::result::Result<ConfigDescriptor, UsbError> {
        Ok(convert_config(&self.device.config_descriptor(index)?))
    }

    fn open(&self) -> std::result::Result<Box<dyn UsbHandle>, UsbError> {
        let handle = self.device.open()?;
        Ok(Box::new(LibusbHandle {
            handle,
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct LibusbHandle {
    handle: rusb::DeviceHandle<rusb::Context>,
    cancelled: AtomicBool,
}

impl UsbHandle for LibusbHandle {
    fn kernel_driver_active(&self, interface: u8) -> std::result::Result<bool, UsbError> {
        Ok(self.handle.kernel_driver_active(interface)?)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> std::result::Result<(), UsbError> {
        Ok(self.handle.detach_kernel_driver(interface)?)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> std::result::Result<(), UsbError> {
        Ok(self.handle.attach_kernel_driver(interface)?)
    }

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), UsbError> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&mut self, interface: u8) -> std::result::Result<(), UsbError> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn set_alternate_setting(
        &mut self,
        interface: u8,
        setting: u8,
    ) -> std::result::Result<(), UsbError> {
        Ok(self.handle.set_alternate_setting(interface, setting)?)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, UsbError> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, UsbError> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, buf, timeout)?)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, UsbError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(UsbError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UsbError::Timeout);
            }
            match self
                .handle
                .read_interrupt(endpoint, buf, remaining.min(READ_SLICE))
            {
                Err(rusb::Error::Timeout | rusb::Error::Interrupted) => continue,
                other => return Ok(other?),
            }
        }
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        buf: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, UsbError> {
        Ok(self.handle.write_interrupt(endpoint, buf, timeout)?)
    }

    fn cancel_transfers(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_round_trips_through_version() {
        for bcd in [0x0100u16, 0x0210, 0x1234, 0x9999, 0x0001] {
            assert_eq!(bcd_from_version(rusb::Version::from_bcd(bcd)), bcd);
        }
    }

    #[test]
    fn rusb_errors_map_to_statuses() {
        assert_eq!(UsbError::from(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(UsbError::from(rusb::Error::Timeout), UsbError::Timeout);
        assert!(matches!(UsbError::from(rusb::Error::NoMem), UsbError::Other(_)));
    }

    #[test]
    fn transfer_types_convert() {
        assert_eq!(
            convert_transfer_type(rusb::TransferType::Interrupt),
            TransferType::Interrupt
        );
        assert_eq!(convert_transfer_type(rusb::TransferType::Bulk), TransferType::Bulk);
    }
}
