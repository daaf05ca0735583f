//! Speculative memory mirror.
//!
//! A per-context overlay over the real image, used while a context executes
//! in speculative mode. Reads hit the overlay first and fall through to the
//! base image; writes are buffered in the overlay and are discardable
//! without touching the real image. A page is copied from the base into the
//! overlay the first time the speculative path touches it.

use std::cell::RefCell;
use std::rc::Rc;

use super::Memory;
use crate::common::{PAGE_MASK, PAGE_SIZE};
use std::collections::HashMap;

/// The overlay. Exclusively owned by its context; the base image may be
/// shared.
pub struct SpecMem {
    base: Rc<RefCell<Memory>>,
    pages: HashMap<u32, Box<[u8; PAGE_SIZE as usize]>>,
}

impl SpecMem {
    /// Creates an empty overlay over `base`.
    pub fn new(base: Rc<RefCell<Memory>>) -> Self {
        Self {
            base,
            pages: HashMap::new(),
        }
    }

    fn page_mut(&mut self, page_base: u32) -> &mut [u8; PAGE_SIZE as usize] {
        let base = &self.base;
        self.pages.entry(page_base).or_insert_with(|| {
            let mut data = Box::new([0u8; PAGE_SIZE as usize]);
            // Seed from the real image when the page exists there; pages
            // the base has never seen start zeroed.
            let mut mem = base.borrow_mut();
            let _ = mem.read_init(page_base, &mut data[..]);
            data
        })
    }

    /// Speculative read: overlay first, base image otherwise.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) {
        let mut done = 0usize;
        let len = buf.len();
        while done < len {
            let cur = addr.wrapping_add(done as u32);
            let page_base = cur & PAGE_MASK;
            let offset = (cur - page_base) as usize;
            let chunk = ((PAGE_SIZE as usize) - offset).min(len - done);
            if let Some(page) = self.pages.get(&page_base) {
                buf[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            } else {
                let mut mem = self.base.borrow_mut();
                // Wrong-path reads of unmapped memory yield zeros rather
                // than faulting.
                if mem.read_init(cur, &mut buf[done..done + chunk]).is_err() {
                    buf[done..done + chunk].fill(0);
                }
            }
            done += chunk;
        }
    }

    /// Speculative write: buffered in the overlay only.
    pub fn write(&mut self, addr: u32, buf: &[u8]) {
        let mut done = 0usize;
        let len = buf.len();
        while done < len {
            let cur = addr.wrapping_add(done as u32);
            let page_base = cur & PAGE_MASK;
            let offset = (cur - page_base) as usize;
            let chunk = ((PAGE_SIZE as usize) - offset).min(len - done);
            let page = self.page_mut(page_base);
            page[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            done += chunk;
        }
    }

    /// Discards every buffered page. Called on speculation recovery.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Number of dirtied pages, for diagnostics.
    pub fn dirty_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::perm;

    fn base_with_value() -> Rc<RefCell<Memory>> {
        let mut m = Memory::new();
        m.map(0x1000, PAGE_SIZE, perm::INIT | perm::READ | perm::WRITE);
        m.write_u32(0x1000, 0xaaaa_5555).unwrap();
        Rc::new(RefCell::new(m))
    }

    /// Speculative writes are visible to speculative reads but never to
    /// the base image; clear() discards them.
    #[test]
    fn overlay_isolation_and_clear() {
        let base = base_with_value();
        let mut spec = SpecMem::new(base.clone());

        let mut buf = [0u8; 4];
        spec.read(0x1000, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 0xaaaa_5555);

        spec.write(0x1000, &0xdead_beefu32.to_le_bytes());
        spec.read(0x1000, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 0xdead_beef);
        assert_eq!(base.borrow_mut().read_u32(0x1000).unwrap(), 0xaaaa_5555);

        spec.clear();
        spec.read(0x1000, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 0xaaaa_5555);
    }

    /// Wrong-path reads of unmapped memory return zeros instead of
    /// faulting.
    #[test]
    fn unmapped_speculative_read_is_zero() {
        let base = base_with_value();
        let mut spec = SpecMem::new(base);

        let mut buf = [0xffu8; 8];
        spec.read(0x9000_0000, &mut buf);
        assert_eq!(buf, [0; 8]);
    }
}
