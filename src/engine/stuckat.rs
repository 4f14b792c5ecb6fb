use indexmap::IndexMap;

use super::bus::GuestBus;

/// Table of permanent corruption patterns, keyed by guest address.
///
/// Each entry is the XOR between the clean and the faulty content of a
/// cell. The refresh pass re-applies the pattern so a permanent fault
/// survives the guest overwriting the cell; inserting for an address that
/// already has an entry replaces the old pattern.
#[derive(Debug, Default)]
pub struct StuckAtTable {
    entries: IndexMap<u64, Vec<u8>>,
}

impl StuckAtTable {
    pub fn insert(&mut self, vaddr: u64, pattern: &[u8]) {
        tracing::debug!(vaddr, bytes = pattern.len(), "stuck-at pattern recorded");
        self.entries.insert(vaddr, pattern.to_vec());
    }

    pub fn remove(&mut self, vaddr: u64) -> bool {
        self.entries.shift_remove(&vaddr).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        self.entries.contains_key(&vaddr)
    }

    /// XOR every stored pattern back into guest memory. Entries whose
    /// mapping is not resident right now are skipped silently; they get
    /// another chance on the next pass.
    pub fn refresh(&self, bus: &mut dyn GuestBus) {
        for (&vaddr, pattern) in &self.entries {
            let mut buf = vec![0u8; pattern.len()];
            if bus.mem_rw(vaddr, &mut buf, false).is_err() {
                tracing::trace!(vaddr, "stuck-at refresh: cell unreadable, skipped");
                continue;
            }
            for (byte, patch) in buf.iter_mut().zip(pattern) {
                *byte ^= patch;
            }
            if bus.mem_rw(vaddr, &mut buf, true).is_err() {
                tracing::trace!(vaddr, "stuck-at refresh: cell unwritable, skipped");
            }
        }
    }

    /// Drop cached translations for every patched address so the guest
    /// sees re-injected values. Called after a catalog reload.
    pub fn flush_pages(&self, bus: &mut dyn GuestBus) {
        for &vaddr in self.entries.keys() {
            bus.tlb_flush_page(vaddr);
        }
    }
}
