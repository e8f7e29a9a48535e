//! Process-wide HID context.
//!
//! Holds what would otherwise be global: the USB stack handle, the string
//! cache, the session tunables and the locale's language id. Clones share
//! all of it.

use crate::backend::UsbBackend;
use crate::cache::StringCache;
use crate::config::SessionConfig;
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::libusb::LibusbBackend;
use crate::session::{self, DeviceSession};
use crate::{enumerate, strings};
use std::sync::{Arc, Mutex};
use tracing::debug;

struct Inner {
    backend: Arc<dyn UsbBackend>,
    cache: Mutex<StringCache>,
    config: SessionConfig,
    lang_id: u16,
}

#[derive(Clone)]
pub struct HidContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HidContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidContext")
            .field("config", &self.inner.config)
            .field("lang_id", &format_args!("0x{:04X}", self.inner.lang_id))
            .finish_non_exhaustive()
    }
}

impl HidContext {
    /// Initialise libusb with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    /// Initialise libusb with the given settings.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        let backend = LibusbBackend::new()?;
        Self::with_backend(Arc::new(backend), config)
    }

    /// Use any USB stack implementation. The locale's language id is
    /// resolved once here.
    pub fn with_backend(backend: Arc<dyn UsbBackend>, config: SessionConfig) -> Result<Self> {
        Self::with_backend_and_lang(backend, config, strings::current_lang_id())
    }

    /// Like [`with_backend`](Self::with_backend), with an explicit string
    /// language instead of the locale's.
    pub fn with_backend_and_lang(
        backend: Arc<dyn UsbBackend>,
        config: SessionConfig,
        lang_id: u16,
    ) -> Result<Self> {
        config.validate()?;
        debug!(lang_id = format_args!("0x{:04X}", lang_id), "HID context initialised");
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                cache: Mutex::new(StringCache::new()),
                config,
                lang_id,
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Preferred language for string descriptors (0 if the locale is unknown).
    pub fn lang_id(&self) -> u16 {
        self.inner.lang_id
    }

    pub(crate) fn backend(&self) -> &dyn UsbBackend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut StringCache) -> R) -> R {
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut cache)
    }

    /// Number of vendor/product pairs in the string cache.
    pub fn cached_strings(&self) -> usize {
        self.with_cache(|cache| cache.len())
    }

    /// List HID interfaces, optionally filtered by vendor and product id
    /// (0 = any). Returns an empty list if the USB stack cannot be queried.
    pub fn enumerate(&self, vendor_id: u16, product_id: u16) -> Vec<DeviceInfo> {
        enumerate::enumerate(self, vendor_id, product_id)
    }

    /// Open the interface with the given enumeration path.
    pub fn open_path(&self, path: &str) -> Result<DeviceSession> {
        session::open_path(self, path)
    }

    /// Open the first interface matching vendor, product and (if given)
    /// serial number.
    pub fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial: Option<&str>,
    ) -> Result<DeviceSession> {
        session::open_first(self, vendor_id, product_id, serial)
    }

    /// Release process-wide state. Open sessions stay usable.
    pub fn shutdown(&self) {
        self.with_cache(|cache| cache.clear());
        debug!("HID context shut down");
    }
}
