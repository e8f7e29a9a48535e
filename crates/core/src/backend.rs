//! Platform USB stack abstraction.
//!
//! Enumeration and sessions only talk to the USB stack through these traits,
//! so the libusb backend and the simulated backend used by the tests share
//! the same code paths above this layer.

use std::time::Duration;
use thiserror::Error;

/// Status codes reported by the platform USB stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("operation timed out")]
    Timeout,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    #[error("access denied (insufficient permissions)")]
    Access,
    #[error("resource busy")]
    Busy,
    #[error("pipe error (endpoint stalled)")]
    Pipe,
    #[error("overflow")]
    Overflow,
    #[error("system call interrupted")]
    Interrupted,
    #[error("operation not supported on this platform")]
    NotSupported,
    #[error("entity not found")]
    NotFound,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("input/output error")]
    Io,
    #[error("{0}")]
    Other(String),
}

/// Endpoint transfer type, from bits 1:0 of `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Snapshot of one endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`; bit 7 set means IN.
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn is_input(&self) -> bool {
        self.address & crate::usb::ENDPOINT_DIR_IN != 0
    }

    pub fn is_interrupt(&self) -> bool {
        self.transfer_type == TransferType::Interrupt
    }
}

/// Snapshot of one interface alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class-specific descriptors following the interface descriptor
    /// (for HID interfaces this holds the HID descriptor).
    pub extra: Vec<u8>,
}

/// Snapshot of a configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// `bConfigurationValue`.
    pub value: u8,
    /// One entry per interface, each listing its alternate settings.
    pub interfaces: Vec<Vec<InterfaceDescriptor>>,
}

/// The subset of the device descriptor the HID layer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`.
    pub release_number: u16,
    /// String descriptor indexes; 0 means the string is absent.
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
}

/// Entry point into a platform USB stack.
pub trait UsbBackend: Send + Sync {
    /// List every attached USB device.
    fn devices(&self) -> Result<Vec<Box<dyn UsbDevice>>, UsbError>;
}

/// An attached, not necessarily opened, USB device.
pub trait UsbDevice: Send + Sync {
    fn bus_number(&self) -> u8;

    /// Port chain from the root hub down to the device.
    fn port_numbers(&self) -> Result<Vec<u8>, UsbError>;

    fn device_descriptor(&self) -> Result<DeviceDescriptor, UsbError>;

    fn active_config_descriptor(&self) -> Result<ConfigDescriptor, UsbError>;

    fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor, UsbError>;

    fn open(&self) -> Result<Box<dyn UsbHandle>, UsbError>;
}

/// An open OS handle to a USB device. Dropping it closes the handle.
///
/// Interface ownership changes take `&mut self`; transfers take `&self` so the
/// read pump and the caller can use one handle at the same time.
pub trait UsbHandle: Send + Sync {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, UsbError>;

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError>;

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn write_interrupt(&self, endpoint: u8, buf: &[u8], timeout: Duration)
        -> Result<usize, UsbError>;

    /// Cancel any in-flight interrupt IN transfer. Sticky: every later
    /// `read_interrupt` on this handle fails with [`UsbError::Cancelled`].
    fn cancel_transfers(&self);
}

/// A simulated USB stack for testing.
///
/// Devices are described with [`MockDeviceBuilder`]; tests inject input
/// reports, unplug devices and inspect what the HID layer sent.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::usb;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Condvar, Mutex, MutexGuard};
    use std::time::Instant;

    /// One recorded control transfer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ControlRecord {
        pub request_type: u8,
        pub request: u8,
        pub value: u16,
        pub index: u16,
        /// Payload for OUT transfers, empty for IN transfers.
        pub data: Vec<u8>,
        pub length: usize,
    }

    struct Fixed {
        bus: u8,
        ports: Vec<u8>,
        descriptor: DeviceDescriptor,
        config: ConfigDescriptor,
        strings: HashMap<u8, String>,
        languages: Vec<u16>,
        report_descriptor: Vec<u8>,
        open_fails: bool,
        claim_fails: bool,
    }

    #[derive(Default)]
    struct Io {
        input: VecDeque<Vec<u8>>,
        disconnected: bool,
        reader_idle: bool,
        open_handles: usize,
        kernel_attached: bool,
        detach_count: usize,
        claimed: Vec<u8>,
        alt_settings: Vec<(u8, u8)>,
        control_log: Vec<ControlRecord>,
        interrupt_writes: Vec<(u8, Vec<u8>)>,
        string_reads: HashMap<u8, usize>,
        feature_response: Vec<u8>,
    }

    struct Shared {
        fixed: Fixed,
        io: Mutex<Io>,
        changed: Condvar,
    }

    fn lock(shared: &Shared) -> MutexGuard<'_, Io> {
        shared.io.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report descriptor of a plain three-button mouse (Generic Desktop / Mouse).
    pub const MOUSE_REPORT_DESCRIPTOR: &[u8] = &[
        0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0x09, 0x01, 0xA1, 0x00, 0x05, 0x09, 0x19, 0x01,
        0x29, 0x03, 0x15, 0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, 0xC0, 0xC0,
    ];

    /// HID class descriptor announcing a report descriptor of `len` bytes.
    pub fn hid_class_descriptor(len: u16) -> Vec<u8> {
        vec![
            0x09,
            usb::DT_HID,
            0x11,
            0x01,
            0x00,
            0x01,
            usb::DT_REPORT,
            (len & 0xFF) as u8,
            (len >> 8) as u8,
        ]
    }

    /// A HID interface with an interrupt IN (0x81) and interrupt OUT (0x01) endpoint.
    pub fn hid_interface(number: u8) -> InterfaceDescriptor {
        InterfaceDescriptor {
            number,
            alternate_setting: 0,
            class: usb::CLASS_HID,
            subclass: 0,
            protocol: 0,
            endpoints: vec![
                EndpointDescriptor {
                    address: 0x81 + number,
                    transfer_type: TransferType::Interrupt,
                    max_packet_size: 64,
                },
                EndpointDescriptor {
                    address: 0x01 + number,
                    transfer_type: TransferType::Interrupt,
                    max_packet_size: 64,
                },
            ],
            extra: hid_class_descriptor(MOUSE_REPORT_DESCRIPTOR.len() as u16),
        }
    }

    /// Fluent description of a simulated device.
    pub struct MockDeviceBuilder {
        fixed: Fixed,
        kernel_attached: bool,
    }

    impl MockDeviceBuilder {
        /// A single-interface HID device on bus 1, port 2, with manufacturer,
        /// product and serial strings at indexes 1, 2 and 3.
        pub fn hid(vendor_id: u16, product_id: u16) -> Self {
            let mut strings = HashMap::new();
            strings.insert(1, "Acme".to_string());
            strings.insert(2, "Widget".to_string());
            strings.insert(3, "SN0001".to_string());
            Self {
                fixed: Fixed {
                    bus: 1,
                    ports: vec![2],
                    descriptor: DeviceDescriptor {
                        vendor_id,
                        product_id,
                        release_number: 0x0100,
                        manufacturer_index: 1,
                        product_index: 2,
                        serial_index: 3,
                    },
                    config: ConfigDescriptor {
                        value: 1,
                        interfaces: vec![vec![hid_interface(0)]],
                    },
                    strings,
                    languages: vec![usb::LANG_EN_US],
                    report_descriptor: MOUSE_REPORT_DESCRIPTOR.to_vec(),
                    open_fails: false,
                    claim_fails: false,
                },
                kernel_attached: false,
            }
        }

        pub fn ports(mut self, bus: u8, ports: &[u8]) -> Self {
            self.fixed.bus = bus;
            self.fixed.ports = ports.to_vec();
            self
        }

        pub fn interfaces(mut self, interfaces: Vec<Vec<InterfaceDescriptor>>) -> Self {
            self.fixed.config.interfaces = interfaces;
            self
        }

        pub fn serial(mut self, serial: &str) -> Self {
            self.fixed.strings.insert(3, serial.to_string());
            self
        }

        pub fn languages(mut self, languages: &[u16]) -> Self {
            self.fixed.languages = languages.to_vec();
            self
        }

        pub fn without_strings(mut self) -> Self {
            self.fixed.descriptor.manufacturer_index = 0;
            self.fixed.descriptor.product_index = 0;
            self.fixed.descriptor.serial_index = 0;
            self
        }

        pub fn without_output_endpoint(mut self) -> Self {
            for alts in &mut self.fixed.config.interfaces {
                for alt in alts {
                    alt.endpoints.retain(EndpointDescriptor::is_input);
                }
            }
            self
        }

        pub fn report_descriptor(mut self, bytes: &[u8]) -> Self {
            self.fixed.report_descriptor = bytes.to_vec();
            self
        }

        pub fn kernel_driver(mut self) -> Self {
            self.kernel_attached = true;
            self
        }

        pub fn failing_open(mut self) -> Self {
            self.fixed.open_fails = true;
            self
        }

        pub fn failing_claim(mut self) -> Self {
            self.fixed.claim_fails = true;
            self
        }

        pub fn build(self) -> MockDevice {
            MockDevice {
                shared: Arc::new(Shared {
                    fixed: self.fixed,
                    io: Mutex::new(Io {
                        kernel_attached: self.kernel_attached,
                        ..Io::default()
                    }),
                    changed: Condvar::new(),
                }),
            }
        }
    }

    /// A simulated device. Clones share state, so a test can keep one clone
    /// for inspection while the backend hands another to the HID layer.
    #[derive(Clone)]
    pub struct MockDevice {
        shared: Arc<Shared>,
    }

    impl MockDevice {
        /// Queue an input report for the next interrupt IN transfer.
        pub fn push_input(&self, report: &[u8]) {
            lock(&self.shared).input.push_back(report.to_vec());
            self.shared.changed.notify_all();
        }

        /// Simulate unplugging: every later transfer fails with `NoDevice`.
        pub fn disconnect(&self) {
            lock(&self.shared).disconnected = true;
            self.shared.changed.notify_all();
        }

        /// Wait until every injected report has been consumed and the reader
        /// is blocked waiting for more.
        pub fn wait_reader_idle(&self, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            let mut io = lock(&self.shared);
            loop {
                if io.reader_idle && io.input.is_empty() {
                    return true;
                }
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                io = self
                    .shared
                    .changed
                    .wait_timeout(io, deadline - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }

        pub fn set_feature_response(&self, response: &[u8]) {
            lock(&self.shared).feature_response = response.to_vec();
        }

        pub fn open_handles(&self) -> usize {
            lock(&self.shared).open_handles
        }

        pub fn claimed(&self) -> Vec<u8> {
            lock(&self.shared).claimed.clone()
        }

        pub fn kernel_driver_attached(&self) -> bool {
            lock(&self.shared).kernel_attached
        }

        pub fn detach_count(&self) -> usize {
            lock(&self.shared).detach_count
        }

        pub fn alt_settings(&self) -> Vec<(u8, u8)> {
            lock(&self.shared).alt_settings.clone()
        }

        pub fn control_log(&self) -> Vec<ControlRecord> {
            lock(&self.shared).control_log.clone()
        }

        pub fn interrupt_writes(&self) -> Vec<(u8, Vec<u8>)> {
            lock(&self.shared).interrupt_writes.clone()
        }

        /// How many times string descriptor `index` has been fetched.
        pub fn string_reads(&self, index: u8) -> usize {
            lock(&self.shared)
                .string_reads
                .get(&index)
                .copied()
                .unwrap_or(0)
        }
    }

    impl UsbDevice for MockDevice {
        fn bus_number(&self) -> u8 {
            self.shared.fixed.bus
        }

        fn port_numbers(&self) -> Result<Vec<u8>, UsbError> {
            Ok(self.shared.fixed.ports.clone())
        }

        fn device_descriptor(&self) -> Result<DeviceDescriptor, UsbError> {
            Ok(self.shared.fixed.descriptor)
        }

        fn active_config_descriptor(&self) -> Result<ConfigDescriptor, UsbError> {
            Ok(self.shared.fixed.config.clone())
        }

        fn config_descriptor(&self, _index: u8) -> Result<ConfigDescriptor, UsbError> {
            Ok(self.shared.fixed.config.clone())
        }

        fn open(&self) -> Result<Box<dyn UsbHandle>, UsbError> {
            if self.shared.fixed.open_fails {
                return Err(UsbError::Access);
            }
            let mut io = lock(&self.shared);
            if io.disconnected {
                return Err(UsbError::NoDevice);
            }
            io.open_handles += 1;
            Ok(Box::new(MockHandle {
                shared: self.shared.clone(),
                cancelled: AtomicBool::new(false),
            }))
        }
    }

    struct MockHandle {
        shared: Arc<Shared>,
        cancelled: AtomicBool,
    }

    impl Drop for MockHandle {
        fn drop(&mut self) {
            lock(&self.shared).open_handles -= 1;
        }
    }

    fn string_descriptor(payload: impl IntoIterator<Item = u16>) -> Vec<u8> {
        let mut out = vec![0, usb::DT_STRING];
        for unit in payload {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out[0] = out.len() as u8;
        out
    }

    impl MockHandle {
        fn check_connected(&self) -> Result<MutexGuard<'_, Io>, UsbError> {
            let io = lock(&self.shared);
            if io.disconnected {
                return Err(UsbError::NoDevice);
            }
            Ok(io)
        }
    }

    impl UsbHandle for MockHandle {
        fn kernel_driver_active(&self, _interface: u8) -> Result<bool, UsbError> {
            Ok(self.check_connected()?.kernel_attached)
        }

        fn detach_kernel_driver(&mut self, _interface: u8) -> Result<(), UsbError> {
            let mut io = self.check_connected()?;
            io.kernel_attached = false;
            io.detach_count += 1;
            Ok(())
        }

        fn attach_kernel_driver(&mut self, _interface: u8) -> Result<(), UsbError> {
            self.check_connected()?.kernel_attached = true;
            Ok(())
        }

        fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
            if self.shared.fixed.claim_fails {
                return Err(UsbError::Busy);
            }
            let mut io = self.check_connected()?;
            if !io.claimed.contains(&interface) {
                io.claimed.push(interface);
            }
            Ok(())
        }

        fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
            let mut io = lock(&self.shared);
            io.claimed.retain(|&i| i != interface);
            Ok(())
        }

        fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
            self.check_connected()?
                .alt_settings
                .push((interface, setting));
            Ok(())
        }

        fn read_control(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            let mut io = self.check_connected()?;
            io.control_log.push(ControlRecord {
                request_type,
                request,
                value,
                index,
                data: Vec::new(),
                length: buf.len(),
            });

            let fixed = &self.shared.fixed;
            let response = match (request_type, request, (value >> 8) as u8) {
                (usb::REQUEST_TYPE_STANDARD_IN, usb::REQUEST_GET_DESCRIPTOR, usb::DT_STRING) => {
                    let string_index = (value & 0xFF) as u8;
                    if string_index == 0 {
                        string_descriptor(fixed.languages.iter().copied())
                    } else {
                        let text = fixed.strings.get(&string_index).ok_or(UsbError::Pipe)?;
                        *io.string_reads.entry(string_index).or_insert(0) += 1;
                        string_descriptor(text.encode_utf16())
                    }
                }
                (usb::REQUEST_TYPE_INTERFACE_IN, usb::REQUEST_GET_DESCRIPTOR, usb::DT_REPORT) => {
                    fixed.report_descriptor.clone()
                }
                (usb::REQUEST_TYPE_CLASS_IN, usb::HID_GET_REPORT, _) => io.feature_response.clone(),
                (usb::REQUEST_TYPE_VENDOR_IN, _, _) => vec![0; buf.len()],
                _ => return Err(UsbError::Pipe),
            };
            let len = response.len().min(buf.len());
            buf[..len].copy_from_slice(&response[..len]);
            Ok(len)
        }

        fn write_control(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &[u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            let mut io = self.check_connected()?;
            io.control_log.push(ControlRecord {
                request_type,
                request,
                value,
                index,
                data: buf.to_vec(),
                length: buf.len(),
            });
            Ok(buf.len())
        }

        fn read_interrupt(
            &self,
            _endpoint: u8,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<usize, UsbError> {
            let deadline = Instant::now() + timeout;
            let mut io = lock(&self.shared);
            let result = loop {
                if self.cancelled.load(Ordering::SeqCst) {
                    break Err(UsbError::Cancelled);
                }
                if io.disconnected {
                    break Err(UsbError::NoDevice);
                }
                if let Some(report) = io.input.pop_front() {
                    let len = report.len().min(buf.len());
                    buf[..len].copy_from_slice(&report[..len]);
                    break Ok(len);
                }
                if !io.reader_idle {
                    io.reader_idle = true;
                    self.shared.changed.notify_all();
                }
                let now = Instant::now();
                if now >= deadline {
                    break Err(UsbError::Timeout);
                }
                io = self
                    .shared
                    .changed
                    .wait_timeout(io, deadline - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            };
            io.reader_idle = false;
            result
        }

        fn write_interrupt(
            &self,
            endpoint: u8,
            buf: &[u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            self.check_connected()?
                .interrupt_writes
                .push((endpoint, buf.to_vec()));
            Ok(buf.len())
        }

        fn cancel_transfers(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
            let _io = lock(&self.shared);
            self.shared.changed.notify_all();
        }
    }

    /// A backend listing a fixed set of simulated devices.
    pub struct MockBackend {
        devices: Vec<MockDevice>,
        fail_listing: bool,
    }

    impl MockBackend {
        pub fn new(devices: Vec<MockDevice>) -> Self {
            Self {
                devices,
                fail_listing: false,
            }
        }

        /// A backend whose device listing always fails.
        pub fn failing() -> Self {
            Self {
                devices: Vec::new(),
                fail_listing: true,
            }
        }
    }

    impl UsbBackend for MockBackend {
        fn devices(&self) -> Result<Vec<Box<dyn UsbDevice>>, UsbError> {
            if self.fail_listing {
                return Err(UsbError::Io);
            }
            Ok(self
                .devices
                .iter()
                .map(|d| Box::new(d.clone()) as Box<dyn UsbDevice>)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_direction_from_address() {
        let ep_in = EndpointDescriptor {
            address: 0x81,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 64,
        };
        let ep_out = EndpointDescriptor {
            address: 0x02,
            transfer_type: TransferType::Bulk,
            max_packet_size: 512,
        };
        assert!(ep_in.is_input());
        assert!(ep_in.is_interrupt());
        assert!(!ep_out.is_input());
        assert!(!ep_out.is_interrupt());
    }

    #[test]
    fn mock_handles_are_tracked() {
        let device = mock::MockDeviceBuilder::hid(0x1234, 0x5678).build();
        let handle = device.open().unwrap();
        assert_eq!(device.open_handles(), 1);
        drop(handle);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn mock_read_interrupt_times_out_and_cancels() {
        let device = mock::MockDeviceBuilder::hid(0x1234, 0x5678).build();
        let handle = device.open().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            handle.read_interrupt(0x81, &mut buf, Duration::from_millis(10)),
            Err(UsbError::Timeout)
        );
        device.push_input(&[1, 2, 3]);
        assert_eq!(
            handle.read_interrupt(0x81, &mut buf, Duration::from_millis(10)),
            Ok(3)
        );
        handle.cancel_transfers();
        assert_eq!(
            handle.read_interrupt(0x81, &mut buf, Duration::from_secs(5)),
            Err(UsbError::Cancelled)
        );
    }
}
