//! Per-vendor/product behavioural overrides.
//!
//! Quirks are expressed as a declarative rule table. A session resolves the
//! table once at open time into a [`Quirks`] value holding the merged flags
//! and the init sequences to run before the read pump starts.

use crate::backend::InterfaceDescriptor;
use crate::usb;
use serde::Serialize;

/// Game-controller families that expose vendor-specific (non-HID class)
/// interfaces but still speak the HID report protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerFamily {
    Xbox360,
    XboxOne,
}

const XBOX360_SUBCLASS: u8 = 93;
const XBOX360_PROTOCOL_WIRED: u8 = 1;
const XBOX360_PROTOCOL_WIRELESS: u8 = 129;

const XBOX360_VENDORS: &[u16] = &[
    0x0079, // GPD Win 2
    0x044f, // Thrustmaster
    0x045e, // Microsoft
    0x046d, // Logitech
    0x056e, // Elecom
    0x06a3, // Saitek
    0x0738, // Mad Catz
    0x07ff, // Mad Catz
    0x0e6f, // PDP
    0x0f0d, // Hori
    0x1038, // SteelSeries
    0x11c9, // Nacon
    0x12ab, // Unknown
    0x1430, // RedOctane
    0x146b, // BigBen
    0x1532, // Razer Sabertooth
    0x15e4, // Numark
    0x162e, // Joytech
    0x1689, // Razer Onza
    0x1949, // Lab126
    0x1bad, // Harmonix
    0x20d6, // PowerA
    0x24c6, // PowerA
    0x2c22, // Qanba
    0x2dc8, // 8BitDo
    0x9886, // ASTRO Gaming
];

pub(crate) const XBOXONE_SUBCLASS: u8 = 71;
pub(crate) const XBOXONE_PROTOCOL: u8 = 208;

const XBOXONE_VENDORS: &[u16] = &[
    0x03f0, // HP
    0x044f, // Thrustmaster
    0x045e, // Microsoft
    0x0738, // Mad Catz
    0x0b05, // ASUS
    0x0e6f, // PDP
    0x0f0d, // Hori
    0x10f5, // Turtle Beach
    0x1532, // Razer Wildcat
    0x20d6, // PowerA
    0x24c6, // PowerA
    0x2dc8, // 8BitDo
    0x2e24, // Hyperkin
    0x3537, // GameSir
];

pub(crate) const VENDOR_MICROSOFT: u16 = 0x045e;

/// Devices skipped during enumeration. A product id of 0 matches every
/// product of the vendor.
const ENUMERATION_BLACKLIST: &[(u16, u16)] = &[
    (0x1532, 0x0227), // Razer Huntsman: long delay answering descriptor requests
];

/// Vendor/product pairs shared by many distinct products. Their strings must
/// never be served from the cache.
const NON_UNIQUE_IDS: &[(u16, u16)] = &[
    (0x0f0d, 0x00dc), // HORI controllers
];

/// Identify the controller family of a vendor-specific interface.
pub fn controller_family(vendor_id: u16, iface: &InterfaceDescriptor) -> Option<ControllerFamily> {
    if iface.class != usb::CLASS_VENDOR_SPEC {
        return None;
    }

    if iface.subclass == XBOX360_SUBCLASS
        && (iface.protocol == XBOX360_PROTOCOL_WIRED
            || iface.protocol == XBOX360_PROTOCOL_WIRELESS)
        && XBOX360_VENDORS.contains(&vendor_id)
    {
        return Some(ControllerFamily::Xbox360);
    }

    if iface.number == 0
        && iface.subclass == XBOXONE_SUBCLASS
        && iface.protocol == XBOXONE_PROTOCOL
        && XBOXONE_VENDORS.contains(&vendor_id)
    {
        return Some(ControllerFamily::XboxOne);
    }

    None
}

/// Whether an interface alternate setting is exposed as a HID device.
pub fn should_enumerate_interface(vendor_id: u16, iface: &InterfaceDescriptor) -> bool {
    iface.class == usb::CLASS_HID || controller_family(vendor_id, iface).is_some()
}

/// Whether enumeration must skip this device entirely.
pub fn is_blacklisted(vendor_id: u16, product_id: u16) -> bool {
    ENUMERATION_BLACKLIST
        .iter()
        .any(|&(vid, pid)| vid == vendor_id && (pid == product_id || pid == 0))
}

/// Whether manufacturer/product strings of this pair may be cached.
pub fn can_cache(vendor_id: u16, product_id: u16) -> bool {
    vendor_id != 0 && product_id != 0 && !NON_UNIQUE_IDS.contains(&(vendor_id, product_id))
}

/// Report-id and output-path overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuirkFlags {
    /// Always strip byte 0 of output reports, whatever the report id.
    pub skip_output_report_id: bool,
    /// Never strip byte 0 of output reports, even when the id is 0.
    pub no_skip_output_report_id: bool,
    /// The device ignores output reports on its interrupt OUT endpoint;
    /// send them as SET_REPORT control transfers instead.
    pub no_output_reports_on_intr_ep: bool,
}

impl QuirkFlags {
    const NONE: Self = Self {
        skip_output_report_id: false,
        no_skip_output_report_id: false,
        no_output_reports_on_intr_ep: false,
    };

    fn merge(self, other: Self) -> Self {
        Self {
            skip_output_report_id: self.skip_output_report_id || other.skip_output_report_id,
            no_skip_output_report_id: self.no_skip_output_report_id
                || other.no_skip_output_report_id,
            no_output_reports_on_intr_ep: self.no_output_reports_on_intr_ep
                || other.no_output_reports_on_intr_ep,
        }
    }

    /// Whether byte 0 (the report id) is dropped before an output transfer.
    pub fn strips_report_id(&self, report_id: u8) -> bool {
        (!self.no_skip_output_report_id && report_id == 0) || self.skip_output_report_id
    }
}

/// Vendor init sequence run once after the interface is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InitAction {
    /// Vendor IN control transfer some Xbox 360 compatibles need before they
    /// emit input reports.
    Xbox360Handshake,
    /// Select the alternate settings Xbox One controllers stream on.
    XboxOneAltSetting,
}

/// One row of the quirk table. `None` fields match anything.
#[derive(Debug, Clone, Copy)]
pub struct QuirkRule {
    pub family: Option<ControllerFamily>,
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub flags: QuirkFlags,
    pub init: Option<InitAction>,
}

impl QuirkRule {
    fn matches(&self, vendor_id: u16, product_id: u16, family: Option<ControllerFamily>) -> bool {
        self.family.map_or(true, |f| family == Some(f))
            && self.vendor.map_or(true, |v| v == vendor_id)
            && self.product.map_or(true, |p| p == product_id)
    }
}

const VENDOR_SONY: u16 = 0x054c;

pub const QUIRK_RULES: &[QuirkRule] = &[
    // Xbox 360 compatibles use report id 0 as real payload.
    QuirkRule {
        family: Some(ControllerFamily::Xbox360),
        vendor: None,
        product: None,
        flags: QuirkFlags {
            no_skip_output_report_id: true,
            ..QuirkFlags::NONE
        },
        init: None,
    },
    // GameSir G3w
    QuirkRule {
        family: Some(ControllerFamily::Xbox360),
        vendor: Some(0x05ac),
        product: Some(0x055b),
        flags: QuirkFlags::NONE,
        init: Some(InitAction::Xbox360Handshake),
    },
    // PowerA Battle Dragon Advanced Wireless
    QuirkRule {
        family: Some(ControllerFamily::Xbox360),
        vendor: Some(0x20d6),
        product: Some(0x4010),
        flags: QuirkFlags::NONE,
        init: Some(InitAction::Xbox360Handshake),
    },
    // HORI Xbox controllers
    QuirkRule {
        family: Some(ControllerFamily::Xbox360),
        vendor: Some(0x0f0d),
        product: None,
        flags: QuirkFlags::NONE,
        init: Some(InitAction::Xbox360Handshake),
    },
    QuirkRule {
        family: Some(ControllerFamily::XboxOne),
        vendor: None,
        product: None,
        flags: QuirkFlags::NONE,
        init: Some(InitAction::XboxOneAltSetting),
    },
    // PS3 controller
    QuirkRule {
        family: None,
        vendor: Some(VENDOR_SONY),
        product: Some(0x0268),
        flags: QuirkFlags {
            skip_output_report_id: true,
            no_output_reports_on_intr_ep: true,
            ..QuirkFlags::NONE
        },
        init: None,
    },
    // PS3 Navigation controller
    QuirkRule {
        family: None,
        vendor: Some(VENDOR_SONY),
        product: Some(0x042f),
        flags: QuirkFlags {
            skip_output_report_id: true,
            no_output_reports_on_intr_ep: true,
            ..QuirkFlags::NONE
        },
        init: None,
    },
];

/// Quirks resolved for one opened interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Quirks {
    pub family: Option<ControllerFamily>,
    pub flags: QuirkFlags,
    /// Init sequences in table order, each at most once.
    pub init: Vec<InitAction>,
}

impl Quirks {
    /// Evaluate [`QUIRK_RULES`] for a device and the interface being opened.
    pub fn resolve(vendor_id: u16, product_id: u16, iface: &InterfaceDescriptor) -> Self {
        Self::resolve_with(QUIRK_RULES, vendor_id, product_id, iface)
    }

    pub fn resolve_with(
        rules: &[QuirkRule],
        vendor_id: u16,
        product_id: u16,
        iface: &InterfaceDescriptor,
    ) -> Self {
        let family = controller_family(vendor_id, iface);
        let mut quirks = Self {
            family,
            ..Self::default()
        };
        for rule in rules
            .iter()
            .filter(|rule| rule.matches(vendor_id, product_id, family))
        {
            quirks.flags = quirks.flags.merge(rule.flags);
            if let Some(action) = rule.init {
                if !quirks.init.contains(&action) {
                    quirks.init.push(action);
                }
            }
        }
        quirks
    }
}
