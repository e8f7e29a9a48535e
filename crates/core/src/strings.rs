//! Locale resolution and USB string descriptor decoding.

use crate::backend::{UsbError, UsbHandle};
use crate::usb;
use std::time::Duration;
use tracing::trace;

/// Locale code (lowercase, encoding stripped) to USB language id.
///
/// Where several languages share a code, the first entry wins.
const LANG_MAP: &[(&str, u16)] = &[
    ("af", 0x0436),
    ("sq", 0x041C),
    ("ar_ae", 0x3801),
    ("ar_bh", 0x3C01),
    ("ar_dz", 0x1401),
    ("ar_eg", 0x0C01),
    ("ar_iq", 0x0801),
    ("ar_jo", 0x2C01),
    ("ar_kw", 0x3401),
    ("ar_lb", 0x3001),
    ("ar_ly", 0x1001),
    ("ar_ma", 0x1801),
    ("ar_om", 0x2001),
    ("ar_qa", 0x4001),
    ("ar_sa", 0x0401),
    ("ar_sy", 0x2801),
    ("ar_tn", 0x1C01),
    ("ar_ye", 0x2401),
    ("hy", 0x042B),
    ("az_az", 0x042C),
    ("eu", 0x042D),
    ("be", 0x0423),
    ("bg", 0x0402),
    ("ca", 0x0403),
    ("zh_cn", 0x0804),
    ("zh_hk", 0x0C04),
    ("zh_mo", 0x1404),
    ("zh_sg", 0x1004),
    ("zh_tw", 0x0404),
    ("hr", 0x041A),
    ("cs", 0x0405),
    ("da", 0x0406),
    ("nl_nl", 0x0413),
    ("nl_be", 0x0813),
    ("en_au", 0x0C09),
    ("en_bz", 0x2809),
    ("en_ca", 0x1009),
    ("en_cb", 0x2409),
    ("en_ie", 0x1809),
    ("en_jm", 0x2009),
    ("en_nz", 0x1409),
    ("en_ph", 0x3409),
    ("en_za", 0x1C09),
    ("en_tt", 0x2C09),
    ("en_gb", 0x0809),
    ("en_us", 0x0409),
    ("et", 0x0425),
    ("fa", 0x0429),
    ("fi", 0x040B),
    ("fo", 0x0438),
    ("fr_fr", 0x040C),
    ("fr_be", 0x080C),
    ("fr_ca", 0x0C0C),
    ("fr_lu", 0x140C),
    ("fr_ch", 0x100C),
    ("gd_ie", 0x083C),
    ("gd", 0x043C),
    ("de_de", 0x0407),
    ("de_at", 0x0C07),
    ("de_li", 0x1407),
    ("de_lu", 0x1007),
    ("de_ch", 0x0807),
    ("el", 0x0408),
    ("he", 0x040D),
    ("hi", 0x0439),
    ("hu", 0x040E),
    ("is", 0x040F),
    ("id", 0x0421),
    ("it_it", 0x0410),
    ("it_ch", 0x0810),
    ("ja", 0x0411),
    ("ko", 0x0412),
    ("lv", 0x0426),
    ("lt", 0x0427),
    ("mk", 0x042F),
    ("ms_my", 0x043E),
    ("ms_bn", 0x083E),
    ("mt", 0x043A),
    ("mr", 0x044E),
    ("no_no", 0x0414),
    ("pl", 0x0415),
    ("pt_pt", 0x0816),
    ("pt_br", 0x0416),
    ("rm", 0x0417),
    ("ro", 0x0418),
    ("ro_mo", 0x0818),
    ("ru", 0x0419),
    ("ru_mo", 0x0819),
    ("sa", 0x044F),
    ("sr_sp", 0x0C1A),
    ("tn", 0x0432),
    ("sl", 0x0424),
    ("sk", 0x041B),
    ("sb", 0x042E),
    ("es_es", 0x040A),
    ("es_ar", 0x2C0A),
    ("es_bo", 0x400A),
    ("es_cl", 0x340A),
    ("es_co", 0x240A),
    ("es_cr", 0x140A),
    ("es_do", 0x1C0A),
    ("es_ec", 0x300A),
    ("es_gt", 0x100A),
    ("es_hn", 0x480A),
    ("es_mx", 0x080A),
    ("es_ni", 0x4C0A),
    ("es_pa", 0x180A),
    ("es_pe", 0x280A),
    ("es_pr", 0x500A),
    ("es_py", 0x3C0A),
    ("es_sv", 0x440A),
    ("es_uy", 0x380A),
    ("es_ve", 0x200A),
    ("st", 0x0430),
    ("sw", 0x0441),
    ("sv_se", 0x041D),
    ("sv_fi", 0x081D),
    ("ta", 0x0449),
    ("tt", 0x0444),
    ("th", 0x041E),
    ("tr", 0x041F),
    ("ts", 0x0431),
    ("uk", 0x0422),
    ("ur", 0x0420),
    ("uz_uz", 0x0843),
    ("vi", 0x042A),
    ("xh", 0x0434),
    ("yi", 0x043D),
    ("zu", 0x0435),
];

/// Size of the buffer used for string descriptor transfers.
const STRING_BUF_LEN: usize = 512;

/// Size of the buffer used for the language id table (string 0).
const LANGID_BUF_LEN: usize = 64;

/// Map a POSIX locale string such as `en_US.UTF-8` to a USB language id.
///
/// Returns 0 when the locale has no entry.
pub fn lang_id_for_locale(locale: &str) -> u16 {
    let code = locale
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    LANG_MAP
        .iter()
        .find(|(name, _)| *name == code)
        .map(|&(_, id)| id)
        .unwrap_or(0)
}

/// The process locale for character handling, following POSIX precedence
/// (`LC_ALL`, then `LC_CTYPE`, then `LANG`).
pub fn current_locale() -> Option<String> {
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
}

/// USB language id of the process locale, or 0 if it cannot be mapped.
pub fn current_lang_id() -> u16 {
    current_locale()
        .map(|locale| lang_id_for_locale(&locale))
        .unwrap_or(0)
}

fn get_string_descriptor(
    handle: &dyn UsbHandle,
    index: u8,
    lang: u16,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    handle.read_control(
        usb::REQUEST_TYPE_STANDARD_IN,
        usb::REQUEST_GET_DESCRIPTOR,
        (u16::from(usb::DT_STRING) << 8) | u16::from(index),
        lang,
        buf,
        timeout,
    )
}

/// Language ids the device lists in string descriptor 0.
pub fn language_ids(handle: &dyn UsbHandle, timeout: Duration) -> Vec<u16> {
    let mut buf = [0u8; LANGID_BUF_LEN];
    let len = match get_string_descriptor(handle, 0, 0, &mut buf, timeout) {
        Ok(len) if len >= 4 => len,
        _ => return Vec::new(),
    };
    buf[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Pick the language to request strings in: `preferred` if the device
/// supports it, otherwise the device's first language (0 if it lists none).
pub fn select_language(handle: &dyn UsbHandle, preferred: u16, timeout: Duration) -> u16 {
    let languages = language_ids(handle, timeout);
    if languages.contains(&preferred) {
        preferred
    } else {
        languages.first().copied().unwrap_or(0)
    }
}

/// Decode a raw string descriptor (2-byte header, then UTF-16LE text).
pub fn decode_string_descriptor(raw: &[u8]) -> Option<String> {
    let payload = raw.get(2..)?;
    let units = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let text: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Some(text.trim_end_matches('\0').to_string())
}

/// Fetch and decode string descriptor `index`.
pub fn read_string(
    handle: &dyn UsbHandle,
    index: u8,
    preferred_lang: u16,
    timeout: Duration,
) -> Result<String, UsbError> {
    let lang = select_language(handle, preferred_lang, timeout);
    let mut buf = [0u8; STRING_BUF_LEN];
    let len = get_string_descriptor(handle, index, lang, &mut buf, timeout)?;
    let text = decode_string_descriptor(&buf[..len]).ok_or(UsbError::Io)?;
    trace!(index, lang = format_args!("0x{:04X}", lang), text = %text, "string descriptor");
    Ok(text)
}
