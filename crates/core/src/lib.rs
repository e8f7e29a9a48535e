//! usbhid-core: user-space USB HID transport.
//!
//! Enumerates HID interfaces through a platform USB stack, opens them as
//! sessions with a dedicated background read pump, and exposes the HID
//! report protocol (input reads, output writes, feature and input reports).

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod libusb;
pub mod pump;
pub mod quirks;
pub mod session;
pub mod strings;

pub use context::HidContext;
pub use device::{BusType, DeviceInfo};
pub use error::{Error, Result};
pub use session::DeviceSession;

/// USB and HID class constants used on the wire.
pub mod usb {
    /// Direction bit of an endpoint address (set = IN).
    pub const ENDPOINT_DIR_IN: u8 = 0x80;

    /// Interface class codes.
    pub const CLASS_HID: u8 = 0x03;
    pub const CLASS_VENDOR_SPEC: u8 = 0xFF;

    /// Descriptor types.
    pub const DT_STRING: u8 = 0x03;
    pub const DT_HID: u8 = 0x21;
    pub const DT_REPORT: u8 = 0x22;

    /// Standard request GET_DESCRIPTOR.
    pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

    /// bmRequestType values: direction | type | recipient.
    pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
    pub const REQUEST_TYPE_INTERFACE_IN: u8 = 0x81;
    pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;
    pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
    pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC1;

    /// HID class-specific requests.
    pub const HID_GET_REPORT: u8 = 0x01;
    pub const HID_SET_REPORT: u8 = 0x09;

    /// HID report types, encoded in the high byte of wValue.
    pub const REPORT_TYPE_INPUT: u8 = 1;
    pub const REPORT_TYPE_OUTPUT: u8 = 2;
    pub const REPORT_TYPE_FEATURE: u8 = 3;

    /// English (United States) language id.
    pub const LANG_EN_US: u16 = 0x0409;

    /// Upper bound for a report descriptor transfer.
    pub const MAX_REPORT_DESCRIPTOR_SIZE: u16 = 4096;
}
