//! Open device sessions.
//!
//! A session owns one OS handle, the claim on one interface and a background
//! read pump filling a bounded queue of input reports. The pump shares the
//! handle through an `Arc`; the claim is only released after the pump has
//! been joined, which is the only point where the session regains exclusive
//! access to the handle.

use crate::backend::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, UsbHandle,
};
use crate::context::HidContext;
use crate::descriptor;
use crate::device::DeviceInfo;
use crate::enumerate::{self, build_device_info, device_path, hid_interfaces, read_config};
use crate::error::{Error, Result};
use crate::pump::{ReadPump, ReadTimeout, ReportQueue};
use crate::quirks::{self, InitAction, Quirks};
use crate::strings;
use crate::usb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Interface claim bookkeeping, released exactly once.
#[derive(Debug, Clone, Copy)]
struct InterfaceClaim {
    interface: u8,
    /// A kernel driver was detached to claim the interface and must be
    /// reattached on release.
    detached: bool,
}

impl InterfaceClaim {
    fn acquire(handle: &mut dyn UsbHandle, interface: u8, detach: bool) -> Result<Self> {
        let mut detached = false;
        if detach && handle.kernel_driver_active(interface).unwrap_or(false) {
            handle
                .detach_kernel_driver(interface)
                .map_err(|e| Error::usb("detach kernel driver", e))?;
            detached = true;
            debug!(interface, "kernel driver detached");
        }

        let claim = Self {
            interface,
            detached,
        };
        if let Err(e) = handle.claim_interface(interface) {
            // Nothing is claimed, but a detached driver must go back.
            if detached {
                claim.reattach(handle);
            }
            return Err(Error::usb(&format!("claim interface {interface}"), e));
        }
        Ok(claim)
    }

    fn reattach(&self, handle: &mut dyn UsbHandle) {
        match handle.attach_kernel_driver(self.interface) {
            Ok(()) => debug!(interface = self.interface, "kernel driver reattached"),
            Err(e) => warn!(
                interface = self.interface,
                error = %e,
                "failed to reattach kernel driver"
            ),
        }
    }

    fn release(self, handle: &mut dyn UsbHandle) {
        if let Err(e) = handle.release_interface(self.interface) {
            debug!(interface = self.interface, error = %e, "release interface failed");
        }
        if self.detached {
            self.reattach(handle);
        }
    }
}

/// Releases the claim when dropped, unless disarmed once opening succeeded.
struct ClaimGuard<'a> {
    handle: &'a mut dyn UsbHandle,
    claim: InterfaceClaim,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn acquire(handle: &'a mut dyn UsbHandle, interface: u8, detach: bool) -> Result<Self> {
        let claim = InterfaceClaim::acquire(handle, interface, detach)?;
        Ok(Self {
            handle,
            claim,
            armed: true,
        })
    }

    fn disarm(mut self) -> InterfaceClaim {
        self.armed = false;
        self.claim
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.claim.release(self.handle);
        }
    }
}

/// An open HID interface.
pub struct DeviceSession {
    ctx: HidContext,
    /// `None` once closed. The read pump holds the other strong reference.
    handle: Option<Arc<dyn UsbHandle>>,
    queue: Arc<ReportQueue>,
    pump: ReadPump,
    claim: InterfaceClaim,
    descriptor: DeviceDescriptor,
    interface: InterfaceDescriptor,
    config_number: u8,
    path: String,
    input_endpoint: Option<EndpointDescriptor>,
    output_endpoint: Option<u8>,
    report_descriptor_size: u16,
    quirks: Quirks,
    blocking: AtomicBool,
    device_info: Mutex<Option<DeviceInfo>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("path", &self.path)
            .field("vendor_id", &self.descriptor.vendor_id)
            .field("product_id", &self.descriptor.product_id)
            .field("interface", &self.interface.number)
            .field("quirks", &self.quirks)
            .finish_non_exhaustive()
    }
}

/// Open the interface at `path`.
pub(crate) fn open_path(ctx: &HidContext, path: &str) -> Result<DeviceSession> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("empty device path".to_string()));
    }

    let devices = ctx
        .backend()
        .devices()
        .map_err(|e| Error::usb("list devices", e))?;

    for device in &devices {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let Some(config) = read_config(device.as_ref()) else {
            continue;
        };

        for iface in hid_interfaces(desc.vendor_id, &config) {
            if device_path(device.as_ref(), config.value, iface.number) != path {
                continue;
            }
            let handle = device
                .open()
                .map_err(|e| Error::usb(&format!("open {path}"), e))?;
            return DeviceSession::initialize(ctx, handle, desc, &config, iface, path.to_string());
        }
    }

    Err(Error::NotFound(path.to_string()))
}

/// First interrupt IN and first interrupt OUT endpoint of an interface.
fn find_endpoints(iface: &InterfaceDescriptor) -> (Option<EndpointDescriptor>, Option<u8>) {
    let input = iface
        .endpoints
        .iter()
        .find(|ep| ep.is_interrupt() && ep.is_input())
        .cloned();
    let output = iface
        .endpoints
        .iter()
        .find(|ep| ep.is_interrupt() && !ep.is_input())
        .map(|ep| ep.address);
    (input, output)
}

fn run_init_action(
    action: InitAction,
    handle: &mut dyn UsbHandle,
    desc: &DeviceDescriptor,
    config: &ConfigDescriptor,
    own_interface: u8,
    ctx: &HidContext,
) {
    match action {
        InitAction::Xbox360Handshake => {
            let mut data = [0u8; 20];
            if let Err(e) = handle.read_control(
                usb::REQUEST_TYPE_VENDOR_IN,
                0x01,
                0x0100,
                0,
                &mut data,
                ctx.config().init_timeout(),
            ) {
                debug!(error = %e, "Xbox 360 handshake failed");
            }
        }
        InitAction::XboxOneAltSetting => {
            for alt in config.interfaces.iter().flatten() {
                if alt.class != usb::CLASS_VENDOR_SPEC
                    || alt.subclass != quirks::XBOXONE_SUBCLASS
                    || alt.protocol != quirks::XBOXONE_PROTOCOL
                {
                    continue;
                }

                // Newer Microsoft pads stream on alternate setting 1 of
                // interface 0; the other interfaces run on setting 0.
                let select = (desc.vendor_id == quirks::VENDOR_MICROSOFT
                    && alt.number == 0
                    && alt.alternate_setting == 1)
                    || (alt.number != 0 && alt.alternate_setting == 0);
                if !select {
                    continue;
                }

                let borrowed = alt.number != own_interface;
                if borrowed {
                    if let Err(e) = handle.claim_interface(alt.number) {
                        debug!(interface = alt.number, error = %e, "cannot claim interface");
                        continue;
                    }
                }

                debug!(
                    vid = format_args!("0x{:04X}", desc.vendor_id),
                    pid = format_args!("0x{:04X}", desc.product_id),
                    interface = alt.number,
                    setting = alt.alternate_setting,
                    "setting alternate setting"
                );
                if let Err(e) = handle.set_alternate_setting(alt.number, alt.alternate_setting) {
                    debug!(interface = alt.number, error = %e, "cannot set alternate setting");
                }

                if borrowed {
                    let _ = handle.release_interface(alt.number);
                }
            }
        }
    }
}

impl DeviceSession {
    fn initialize(
        ctx: &HidContext,
        mut handle: Box<dyn UsbHandle>,
        desc: DeviceDescriptor,
        config: &ConfigDescriptor,
        iface: &InterfaceDescriptor,
        path: String,
    ) -> Result<Self> {
        let settings = ctx.config();
        let quirks = Quirks::resolve(desc.vendor_id, desc.product_id, iface);

        let claim = {
            let mut guard =
                ClaimGuard::acquire(handle.as_mut(), iface.number, settings.detach_kernel_driver)?;
            for action in &quirks.init {
                run_init_action(*action, &mut *guard.handle, &desc, config, iface.number, ctx);
            }
            guard.disarm()
        };

        let (input_endpoint, output_endpoint) = find_endpoints(iface);
        let queue = Arc::new(ReportQueue::new(settings.max_queued_reports));
        let mut handle: Arc<dyn UsbHandle> = Arc::from(handle);

        let pump = match &input_endpoint {
            Some(ep) => match ReadPump::spawn(
                handle.clone(),
                ep.address,
                ep.max_packet_size,
                settings.pump_timeout(),
                queue.clone(),
            ) {
                Ok(pump) => pump,
                Err(e) => {
                    match Arc::get_mut(&mut handle) {
                        Some(h) => claim.release(h),
                        None => warn!(
                            interface = iface.number,
                            "handle still shared after failed pump start"
                        ),
                    }
                    return Err(e);
                }
            },
            None => {
                debug!(
                    interface = iface.number,
                    "no interrupt IN endpoint, input reports unavailable"
                );
                ReadPump::idle()
            }
        };

        info!(
            vid = format_args!("0x{:04X}", desc.vendor_id),
            pid = format_args!("0x{:04X}", desc.product_id),
            path = %path,
            interface = iface.number,
            "device opened"
        );

        Ok(Self {
            ctx: ctx.clone(),
            handle: Some(handle),
            queue,
            pump,
            claim,
            descriptor: desc,
            interface: iface.clone(),
            config_number: config.value,
            path,
            input_endpoint,
            output_endpoint,
            report_descriptor_size: descriptor::report_descriptor_size(&iface.extra),
            quirks,
            blocking: AtomicBool::new(true),
            device_info: Mutex::new(None),
        })
    }

    /// The handle, as long as the device has not gone away.
    fn live_handle(&self) -> Result<&dyn UsbHandle> {
        let handle = self.handle.as_deref().ok_or(Error::Disconnected)?;
        if self.input_endpoint.is_some() && self.queue.is_shutdown() {
            return Err(Error::Disconnected);
        }
        Ok(handle)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn interface_number(&self) -> u8 {
        self.interface.number
    }

    pub fn config_number(&self) -> u8 {
        self.config_number
    }

    pub fn quirks(&self) -> &Quirks {
        &self.quirks
    }

    /// Number of input reports waiting to be read.
    pub fn pending_reports(&self) -> usize {
        self.queue.len()
    }

    /// False once the device has been removed or the read pump stopped.
    pub fn is_connected(&self) -> bool {
        self.live_handle().is_ok()
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    /// Read one input report, waiting according to the blocking mode.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = if self.is_blocking() {
            ReadTimeout::Blocking
        } else {
            ReadTimeout::NonBlocking
        };
        self.read_with(buf, timeout)
    }

    /// Read one input report, waiting at most `timeout_ms` milliseconds
    /// (negative waits forever, 0 returns immediately).
    pub fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        self.read_with(buf, ReadTimeout::from_millis(timeout_ms))
    }

    /// Pop the oldest queued report into `buf`.
    ///
    /// Returns `Ok(0)` when no report arrived in time. Reports longer than
    /// `buf` are truncated. Once the device is gone, queued reports are still
    /// returned and [`Error::Disconnected`] follows.
    pub fn read_with(&self, buf: &mut [u8], timeout: ReadTimeout) -> Result<usize> {
        if self.input_endpoint.is_none() {
            return Err(Error::Unsupported(
                "interface has no interrupt IN endpoint".to_string(),
            ));
        }
        self.queue.pop_into(buf, timeout)
    }

    /// Send an output report. Byte 0 is the report id.
    ///
    /// Returns the number of bytes accepted, counting a stripped report id.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let handle = self.live_handle()?;
        let Some(&report_id) = data.first() else {
            return Err(Error::InvalidArgument("empty output report".to_string()));
        };

        let skipped = self.quirks.flags.strips_report_id(report_id);
        let payload = if skipped { &data[1..] } else { data };
        let timeout = self.ctx.config().control_timeout();

        let sent = match self.output_endpoint {
            Some(endpoint) if !self.quirks.flags.no_output_reports_on_intr_ep => {
                trace!(
                    endpoint = format_args!("0x{:02X}", endpoint),
                    report_hex = format_args!("{:02X?}", payload),
                    "output report"
                );
                handle
                    .write_interrupt(endpoint, payload, timeout)
                    .map_err(|e| Error::usb("interrupt write", e))?
            }
            _ => handle
                .write_control(
                    usb::REQUEST_TYPE_CLASS_OUT,
                    usb::HID_SET_REPORT,
                    report_value(usb::REPORT_TYPE_OUTPUT, report_id),
                    self.interface.number.into(),
                    payload,
                    timeout,
                )
                .map_err(|e| Error::usb("set output report", e))?,
        };

        Ok(if skipped { sent + 1 } else { sent })
    }

    /// Send a feature report. Byte 0 is the report id; id 0 is not sent.
    pub fn send_feature_report(&self, data: &[u8]) -> Result<usize> {
        let handle = self.live_handle()?;
        let Some(&report_id) = data.first() else {
            return Err(Error::InvalidArgument("empty feature report".to_string()));
        };

        let skipped = report_id == 0;
        let payload = if skipped { &data[1..] } else { data };
        let sent = handle
            .write_control(
                usb::REQUEST_TYPE_CLASS_OUT,
                usb::HID_SET_REPORT,
                report_value(usb::REPORT_TYPE_FEATURE, report_id),
                self.interface.number.into(),
                payload,
                self.ctx.config().control_timeout(),
            )
            .map_err(|e| Error::usb("set feature report", e))?;

        Ok(if skipped { sent + 1 } else { sent })
    }

    /// Fetch a feature report. Set `buf[0]` to the report id; the report is
    /// returned in `buf` starting with that id.
    pub fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        self.get_report(usb::REPORT_TYPE_FEATURE, buf, "get feature report")
    }

    /// Fetch an input report over the control endpoint, bypassing the queue.
    pub fn get_input_report(&self, buf: &mut [u8]) -> Result<usize> {
        self.get_report(usb::REPORT_TYPE_INPUT, buf, "get input report")
    }

    fn get_report(&self, report_type: u8, buf: &mut [u8], op: &str) -> Result<usize> {
        let handle = self.live_handle()?;
        let Some(&report_id) = buf.first() else {
            return Err(Error::InvalidArgument(format!("{op}: empty buffer")));
        };

        // Report id 0 is not part of the transfer; keep byte 0 for the caller.
        let skipped = report_id == 0;
        let target = if skipped { &mut buf[1..] } else { &mut buf[..] };
        let received = handle
            .read_control(
                usb::REQUEST_TYPE_CLASS_IN,
                usb::HID_GET_REPORT,
                report_value(report_type, report_id),
                self.interface.number.into(),
                target,
                self.ctx.config().control_timeout(),
            )
            .map_err(|e| Error::usb(op, e))?;

        Ok(if skipped { received + 1 } else { received })
    }

    /// Raw report descriptor, as announced by the interface's HID descriptor
    /// (capped at 4096 bytes).
    pub fn report_descriptor(&self) -> Result<Vec<u8>> {
        let handle = self.live_handle()?;
        let len = self
            .report_descriptor_size
            .min(usb::MAX_REPORT_DESCRIPTOR_SIZE);
        let mut buf = vec![0u8; usize::from(len)];
        let received = handle
            .read_control(
                usb::REQUEST_TYPE_INTERFACE_IN,
                usb::REQUEST_GET_DESCRIPTOR,
                u16::from(usb::DT_REPORT) << 8,
                self.interface.number.into(),
                &mut buf,
                self.ctx.config().descriptor_timeout(),
            )
            .map_err(|e| Error::usb("get report descriptor", e))?;
        buf.truncate(received);
        Ok(buf)
    }

    /// Copy the report descriptor into `buf`, truncating it to fit.
    pub fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize> {
        let descriptor = self.report_descriptor()?;
        let len = descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&descriptor[..len]);
        Ok(len)
    }

    /// Read string descriptor `index` in the context's language.
    pub fn get_indexed_string(&self, index: u8) -> Result<String> {
        let handle = self.live_handle()?;
        strings::read_string(
            handle,
            index,
            self.ctx.lang_id(),
            self.ctx.config().descriptor_timeout(),
        )
        .map_err(|e| Error::usb(&format!("read string {index}"), e))
    }

    fn optional_string(&self, index: u8) -> Result<Option<String>> {
        if index == 0 {
            return Ok(None);
        }
        self.get_indexed_string(index).map(Some)
    }

    pub fn manufacturer_string(&self) -> Result<Option<String>> {
        self.optional_string(self.descriptor.manufacturer_index)
    }

    pub fn product_string(&self) -> Result<Option<String>> {
        self.optional_string(self.descriptor.product_index)
    }

    pub fn serial_number_string(&self) -> Result<Option<String>> {
        self.optional_string(self.descriptor.serial_index)
    }

    /// The record of this interface, including the usage page and usage of
    /// its top-level collection. Built on first call, then cached.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let mut cached = self
            .device_info
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }

        let handle = self.live_handle()?;
        let mut info = build_device_info(
            &self.ctx,
            &self.descriptor,
            Some(handle),
            self.path.clone(),
            &self.interface,
        );
        match self.report_descriptor() {
            Ok(bytes) => {
                if let Some(usage) = descriptor::extract_usage(&bytes) {
                    info.usage_page = Some(usage.page);
                    info.usage = Some(usage.usage);
                }
            }
            Err(e) => debug!(path = %self.path, error = %e, "report descriptor unavailable"),
        }

        *cached = Some(info.clone());
        Ok(info)
    }

    /// Stop the pump and give the interface back to the OS.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        self.queue.mark_shutdown();
        handle.cancel_transfers();
        self.pump.join();

        match Arc::get_mut(&mut handle) {
            Some(exclusive) => self.claim.release(exclusive),
            None => warn!(path = %self.path, "device handle still shared, interface left claimed"),
        }
        drop(handle);
        self.queue.clear();

        debug!(path = %self.path, "device closed");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `wValue` of a GET_REPORT/SET_REPORT request.
fn report_value(report_type: u8, report_id: u8) -> u16 {
    (u16::from(report_type) << 8) | u16::from(report_id)
}

/// Open the first interface matching the vendor/product filter and, when
/// given, the serial number.
pub(crate) fn open_first(
    ctx: &HidContext,
    vendor_id: u16,
    product_id: u16,
    serial: Option<&str>,
) -> Result<DeviceSession> {
    let found = enumerate::enumerate(ctx, vendor_id, product_id)
        .into_iter()
        .find(|info| match serial {
            Some(serial) => info.serial_number.as_deref() == Some(serial),
            None => true,
        });

    match found {
        Some(info) => open_path(ctx, &info.path),
        None => Err(Error::NotFound(format!(
            "{vendor_id:04x}:{product_id:04x}{}",
            serial.map(|s| format!(" serial {s}")).unwrap_or_default()
        ))),
    }
}
