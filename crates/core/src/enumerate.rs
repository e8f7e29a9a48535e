//! Device discovery.

use crate::backend::{ConfigDescriptor, DeviceDescriptor, InterfaceDescriptor, UsbDevice, UsbHandle};
use crate::context::HidContext;
use crate::device::{BusType, DeviceInfo};
use crate::{quirks, strings};
use tracing::{debug, trace, warn};

/// Build the path of one interface: `<bus>-<port>[.<port>...]:<config>.<interface>`.
///
/// Devices reporting no port chain get an empty path; they cannot be
/// reopened by path.
pub fn make_path(bus: u8, ports: &[u8], config: u8, interface: u8) -> String {
    let Some((first, rest)) = ports.split_first() else {
        return String::new();
    };
    let mut path = format!("{bus}-{first}");
    for port in rest {
        path.push('.');
        path.push_str(&port.to_string());
    }
    path.push_str(&format!(":{config}.{interface}"));
    path
}

/// Path of one interface of an attached device.
pub(crate) fn device_path(device: &dyn UsbDevice, config: u8, interface: u8) -> String {
    match device.port_numbers() {
        Ok(ports) => make_path(device.bus_number(), &ports, config, interface),
        Err(e) => {
            debug!(error = %e, "port numbers unavailable");
            String::new()
        }
    }
}

/// The active configuration, falling back to the first one.
pub(crate) fn read_config(device: &dyn UsbDevice) -> Option<ConfigDescriptor> {
    device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .ok()
}

/// For each interface, the first alternate setting exposed as HID.
pub(crate) fn hid_interfaces(
    vendor_id: u16,
    config: &ConfigDescriptor,
) -> impl Iterator<Item = &InterfaceDescriptor> {
    config.interfaces.iter().filter_map(move |alts| {
        alts.iter()
            .find(|alt| quirks::should_enumerate_interface(vendor_id, alt))
    })
}

/// Fetch a string descriptor, logging and discarding failures.
pub(crate) fn fetch_string(ctx: &HidContext, handle: &dyn UsbHandle, index: u8) -> Option<String> {
    match strings::read_string(
        handle,
        index,
        ctx.lang_id(),
        ctx.config().descriptor_timeout(),
    ) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(index, error = %e, "string descriptor unavailable");
            None
        }
    }
}

/// Fill in a record for one interface. Usage page and usage are left empty.
///
/// Without a handle only the descriptor fields are available. The serial
/// number is read fresh every time; manufacturer and product go through the
/// context's string cache.
pub(crate) fn build_device_info(
    ctx: &HidContext,
    desc: &DeviceDescriptor,
    handle: Option<&dyn UsbHandle>,
    path: String,
    iface: &InterfaceDescriptor,
) -> DeviceInfo {
    let mut info = DeviceInfo {
        path,
        vendor_id: desc.vendor_id,
        product_id: desc.product_id,
        release_number: desc.release_number,
        interface_number: iface.number,
        interface_class: iface.class,
        interface_subclass: iface.subclass,
        interface_protocol: iface.protocol,
        bus_type: BusType::Usb,
        manufacturer: None,
        product: None,
        serial_number: None,
        usage_page: None,
        usage: None,
    };

    let Some(handle) = handle else {
        return info;
    };

    if desc.serial_index > 0 {
        info.serial_number = fetch_string(ctx, handle, desc.serial_index);
    }

    let (manufacturer, product) = ctx
        .with_cache(|cache| cache.strings_for(desc, |index| fetch_string(ctx, handle, index)));
    info.manufacturer = manufacturer;
    info.product = product;
    info
}

/// Walk every attached device and list its HID interfaces.
///
/// Vendor/product ids of 0 match anything. Listing failures yield an empty
/// result.
pub(crate) fn enumerate(ctx: &HidContext, vendor_id: u16, product_id: u16) -> Vec<DeviceInfo> {
    let devices = match ctx.backend().devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "USB device listing failed");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for device in &devices {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };

        if (vendor_id != 0 && vendor_id != desc.vendor_id)
            || (product_id != 0 && product_id != desc.product_id)
            || quirks::is_blacklisted(desc.vendor_id, desc.product_id)
        {
            continue;
        }

        let Some(config) = read_config(device.as_ref()) else {
            continue;
        };

        for iface in hid_interfaces(desc.vendor_id, &config) {
            let handle = match device.open() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    debug!(
                        vid = format_args!("0x{:04X}", desc.vendor_id),
                        pid = format_args!("0x{:04X}", desc.product_id),
                        error = %e,
                        "cannot open device during enumeration"
                    );
                    None
                }
            };

            let path = device_path(device.as_ref(), config.value, iface.number);
            let info = build_device_info(ctx, &desc, handle.as_deref(), path, iface);
            trace!(
                vid = format_args!("0x{:04X}", info.vendor_id),
                pid = format_args!("0x{:04X}", info.product_id),
                path = %info.path,
                "found HID interface"
            );
            found.push(info);
        }
    }

    debug!(count = found.len(), "enumeration complete");
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_with_single_port() {
        assert_eq!(make_path(1, &[2], 1, 0), "1-2:1.0");
    }

    #[test]
    fn path_with_hub_chain() {
        assert_eq!(make_path(3, &[1, 4, 2], 1, 2), "3-1.4.2:1.2");
    }

    #[test]
    fn path_without_ports_is_empty() {
        assert_eq!(make_path(1, &[], 1, 0), "");
    }
}
