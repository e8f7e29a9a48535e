//! HID report descriptor decoding.
//!
//! Report descriptors are a stream of items. A short item is a one-byte
//! prefix followed by 0, 1, 2 or 4 data bytes (size code in bits 1:0, where
//! code 3 means 4 bytes). A long item starts with prefix 0xFE, then a data
//! length byte and a long-item tag byte.
//!
//! Only the first Usage Page and Usage are of interest here; they identify
//! what kind of device the top-level collection is.

use crate::usb;
use serde::Serialize;
use tracing::debug;

/// Prefix of a Usage Page item, with the size bits masked off.
const ITEM_USAGE_PAGE: u8 = 0x04;
/// Prefix of a (local) Usage item, with the size bits masked off.
const ITEM_USAGE: u8 = 0x08;

/// Usage page and usage of a device's top-level collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub page: u16,
    pub usage: u16,
}

/// Little-endian value of the `num_bytes` data bytes following the item
/// prefix at `cur`. Returns 0 when the item would run past the buffer.
fn item_data(rpt: &[u8], num_bytes: usize, cur: usize) -> u32 {
    if cur + num_bytes >= rpt.len() {
        return 0;
    }
    match num_bytes {
        1 => rpt[cur + 1] as u32,
        2 => u16::from_le_bytes([rpt[cur + 1], rpt[cur + 2]]) as u32,
        4 => u32::from_le_bytes([rpt[cur + 1], rpt[cur + 2], rpt[cur + 3], rpt[cur + 4]]),
        _ => 0,
    }
}

/// Extract the first Usage Page and Usage from a report descriptor.
///
/// A 4-byte Usage item carries an extended usage (page in the high word),
/// which supplies both values at once. Returns `None` if the stream ends
/// before both were seen.
pub fn extract_usage(rpt: &[u8]) -> Option<Usage> {
    let mut page = None;
    let mut usage = None;
    let mut i = 0usize;

    while i < rpt.len() {
        let key = rpt[i];
        let key_cmd = key & 0xFC;

        let (data_len, key_size) = if key & 0xF0 == 0xF0 {
            // Long item: next byte holds the data length.
            let len = rpt.get(i + 1).copied().unwrap_or(0) as usize;
            (len, 3)
        } else {
            let len = match key & 0x03 {
                3 => 4,
                code => code as usize,
            };
            (len, 1)
        };

        if key_cmd == ITEM_USAGE_PAGE {
            page = Some(item_data(rpt, data_len, i) as u16);
        }
        if key_cmd == ITEM_USAGE {
            if data_len == 4 {
                page = Some(item_data(rpt, 2, i + 2) as u16);
                usage = Some(item_data(rpt, 2, i) as u16);
            } else {
                usage = Some(item_data(rpt, data_len, i) as u16);
            }
        }

        if let (Some(page), Some(usage)) = (page, usage) {
            return Some(Usage { page, usage });
        }

        i += data_len + key_size;
    }

    None
}

/// Length of the report descriptor announced by the HID class descriptor in
/// an interface's extra bytes.
///
/// Falls back to [`usb::MAX_REPORT_DESCRIPTOR_SIZE`] when the HID descriptor
/// is missing or malformed.
pub fn report_descriptor_size(extra: &[u8]) -> u16 {
    let mut rest = extra;

    while rest.len() >= 2 {
        if rest[1] == usb::DT_HID {
            if rest.len() < 6 {
                debug!("broken HID descriptor: not enough data");
                break;
            }
            let num_descriptors = rest[5] as usize;
            if rest.len() < 6 + 3 * num_descriptors {
                debug!("broken HID descriptor: not enough data for report metadata");
                break;
            }
            for entry in rest[6..6 + 3 * num_descriptors].chunks_exact(3) {
                if entry[0] == usb::DT_REPORT {
                    return u16::from_le_bytes([entry[1], entry[2]]);
                }
            }
            debug!("broken HID descriptor: missing report descriptor entry");
            break;
        }

        let len = rest[0] as usize;
        if len == 0 {
            debug!("broken interface descriptors: zero-sized descriptor");
            break;
        }
        rest = rest.get(len..).unwrap_or(&[]);
    }

    usb::MAX_REPORT_DESCRIPTOR_SIZE
}
