//! Process-wide cache of manufacturer and product strings.
//!
//! Reading string descriptors is slow (two control transfers each, and some
//! devices stall for tens of milliseconds), so the strings are memoized per
//! vendor/product pair. Entries are never evicted; [`StringCache::clear`]
//! drops them all at context shutdown.

use crate::backend::DeviceDescriptor;
use crate::quirks;
use tracing::trace;

/// Cached strings for one vendor/product pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringCacheEntry {
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, Default)]
pub struct StringCache {
    entries: Vec<StringCacheEntry>,
}

impl StringCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for the descriptor's vendor/product pair, fetching
    /// both strings with `fetch` on a miss.
    ///
    /// `fetch` is only called for non-zero string indexes. Returns `None`
    /// when the pair must not be cached; the caller then fetches directly.
    pub fn find_or_create<F>(
        &mut self,
        desc: &DeviceDescriptor,
        fetch: F,
    ) -> Option<&StringCacheEntry>
    where
        F: FnMut(u8) -> Option<String>,
    {
        if !quirks::can_cache(desc.vendor_id, desc.product_id) {
            return None;
        }

        let pos = match self
            .entries
            .iter()
            .position(|e| e.vendor_id == desc.vendor_id && e.product_id == desc.product_id)
        {
            Some(pos) => pos,
            None => {
                let (vendor, product) = fetch_pair(desc, fetch);
                trace!(
                    vid = format_args!("0x{:04X}", desc.vendor_id),
                    pid = format_args!("0x{:04X}", desc.product_id),
                    "caching device strings"
                );
                self.entries.push(StringCacheEntry {
                    vendor_id: desc.vendor_id,
                    product_id: desc.product_id,
                    vendor,
                    product,
                });
                self.entries.len() - 1
            }
        };
        self.entries.get(pos)
    }

    /// Manufacturer and product strings, from the cache when allowed and
    /// freshly fetched otherwise.
    pub fn strings_for<F>(
        &mut self,
        desc: &DeviceDescriptor,
        mut fetch: F,
    ) -> (Option<String>, Option<String>)
    where
        F: FnMut(u8) -> Option<String>,
    {
        match self.find_or_create(desc, &mut fetch) {
            Some(entry) => (entry.vendor.clone(), entry.product.clone()),
            None => fetch_pair(desc, fetch),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn fetch_pair<F>(desc: &DeviceDescriptor, mut fetch: F) -> (Option<String>, Option<String>)
where
    F: FnMut(u8) -> Option<String>,
{
    let vendor = match desc.manufacturer_index {
        0 => None,
        index => fetch(index),
    };
    let product = match desc.product_index {
        0 => None,
        index => fetch(index),
    };
    (vendor, product)
}
