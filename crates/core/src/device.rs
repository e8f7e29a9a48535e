//! Device records produced by enumeration.

use serde::Serialize;
use std::fmt;

/// Transport a HID device is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    Unknown,
    Usb,
    Bluetooth,
    I2c,
    Spi,
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Usb => "usb",
            Self::Bluetooth => "bluetooth",
            Self::I2c => "i2c",
            Self::Spi => "spi",
        };
        f.write_str(name)
    }
}

/// Snapshot of one discoverable HID interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// `<bus>-<port>[.<port>...]:<config>.<interface>`; opaque to callers
    /// and only meaningful to [`crate::HidContext::open_path`].
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`.
    pub release_number: u16,
    pub interface_number: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub bus_type: BusType,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Top-level collection usage, only known once the report descriptor
    /// has been read from an open session.
    pub usage_page: Option<u16>,
    pub usage: Option<u16>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} [{} {}]",
            self.vendor_id,
            self.product_id,
            self.path,
            self.manufacturer.as_deref().unwrap_or("-"),
            self.product.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeviceInfo {
        DeviceInfo {
            path: "1-2:1.0".to_string(),
            vendor_id: 0x046d,
            product_id: 0xc08b,
            release_number: 0x0100,
            interface_number: 0,
            interface_class: 3,
            interface_subclass: 1,
            interface_protocol: 2,
            bus_type: BusType::Usb,
            manufacturer: Some("Logitech".to_string()),
            product: None,
            serial_number: None,
            usage_page: None,
            usage: None,
        }
    }

    #[test]
    fn display_shows_ids_and_strings() {
        assert_eq!(record().to_string(), "046d:c08b 1-2:1.0 [Logitech -]");
    }

    #[test]
    fn serializes_bus_type_lowercase() {
        let json = serde_json::to_value(record()).expect("serialize record");
        assert_eq!(json["bus_type"], "usb");
        assert_eq!(json["usage_page"], serde_json::Value::Null);
    }
}
