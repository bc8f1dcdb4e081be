//! Slab freelist of fixed-size byte buffers with optional bulk memory
//! registration. Backing storage grows in arenas; when a registrar is
//! supplied each arena is registered with the fabric as a unit and every
//! entry carries the arena's descriptors, so recovering the registration
//! for an entry is O(1).

use crate::error::{RailError, RailResult};
use crate::fabric::MrDesc;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Arc, Mutex};

const PAGE_SIZE: usize = 4096;

/// Registers an arena with every rail of the owning endpoint. Internal
/// registrations must cover whole pages; the freelist guarantees its arenas
/// do.
pub trait Registrar: Send + Sync {
    /// Returns one descriptor per rail.
    fn register_block(&self, addr: usize, len: usize) -> RailResult<Vec<MrDesc>>;

    fn deregister_block(&self, descs: &[MrDesc]) -> RailResult<()>;
}

/// A leased freelist entry. The pointer stays valid until the entry is
/// returned with `Freelist::free`; arenas never move or shrink while the
/// freelist is alive.
#[derive(Clone)]
pub struct FlEntry {
    ptr: *mut u8,
    len: usize,
    token: u32,
    mrs: Arc<Vec<MrDesc>>,
}

// Entries point into arenas owned (and never moved) by the freelist.
unsafe impl Send for FlEntry {}
unsafe impl Sync for FlEntry {}

impl FlEntry {
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Stable identity of this entry within its freelist, usable to park a
    /// reference and re-derive the entry later.
    #[inline]
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Registration descriptor for the given rail, if the freelist
    /// registers its arenas.
    #[inline]
    pub fn mr(&self, rail_id: usize) -> Option<&MrDesc> {
        self.mrs.get(rail_id)
    }

    /// The entry's bytes. Callers must not hold this across a `free` of the
    /// same entry.
    #[inline]
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    #[inline]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

struct Arena {
    base: *mut u8,
    layout: Layout,
    entries: usize,
    mrs: Arc<Vec<MrDesc>>,
}

unsafe impl Send for Arena {}

struct Inner {
    arenas: Vec<Arena>,
    free: Vec<u32>,
    total: usize,
}

pub struct Freelist {
    entry_size: usize,
    growth: usize,
    cap: usize,
    registrar: Option<Arc<dyn Registrar>>,
    inner: Mutex<Inner>,
}

impl Freelist {
    /// `entry_size` is rounded up to `alignment`; arenas are padded to whole
    /// pages so bulk registrations never cover partial pages.
    pub fn new(
        entry_size: usize,
        initial: usize,
        growth: usize,
        cap: usize,
        alignment: usize,
        registrar: Option<Arc<dyn Registrar>>,
    ) -> RailResult<Freelist> {
        if entry_size == 0 || growth == 0 || cap == 0 || initial > cap {
            return Err(RailError::Invalid("bad freelist geometry"));
        }
        if !alignment.is_power_of_two() {
            return Err(RailError::Invalid("freelist alignment not a power of two"));
        }

        let aligned = (entry_size + alignment - 1) & !(alignment - 1);
        let list = Freelist {
            entry_size: aligned,
            growth,
            cap,
            registrar,
            inner: Mutex::new(Inner {
                arenas: Vec::new(),
                free: Vec::new(),
                total: 0,
            }),
        };

        if initial > 0 {
            let mut inner = list.inner.lock().unwrap();
            list.grow(&mut inner, initial)?;
        }

        Ok(list)
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Entries currently leased out.
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.total - inner.free.len()
    }

    /// Lease an entry, growing the backing storage up to the cap. Returns
    /// `None` when the cap is reached and nothing is free.
    pub fn alloc(&self) -> RailResult<Option<FlEntry>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.free.is_empty() {
            if inner.total >= self.cap {
                return Ok(None);
            }
            let want = self.growth.min(self.cap - inner.total);
            self.grow(&mut inner, want)?;
        }

        let token = inner.free.pop().expect("Grown freelist must have entries");
        Ok(Some(self.entry_from_token(&inner, token)))
    }

    /// Re-derive an entry from a parked token.
    pub fn lookup(&self, token: u32) -> FlEntry {
        let inner = self.inner.lock().unwrap();
        self.entry_from_token(&inner, token)
    }

    /// Return an entry to the list.
    pub fn free(&self, entry: FlEntry) {
        self.free_token(entry.token)
    }

    pub fn free_token(&self, token: u32) {
        let mut inner = self.inner.lock().unwrap();

        // Reset guard: poison recycled entries so use-after-free reads are
        // loud under memory tooling.
        #[cfg(debug_assertions)]
        {
            let entry = self.entry_from_token(&inner, token);
            unsafe {
                std::ptr::write_bytes(entry.ptr, 0xa5, entry.len);
            }
        }

        debug_assert!(!inner.free.contains(&token), "double free of freelist entry");
        inner.free.push(token);
    }

    fn entry_from_token(&self, inner: &Inner, token: u32) -> FlEntry {
        let arena_idx = (token >> 16) as usize;
        let slot = (token & 0xffff) as usize;
        let arena = &inner.arenas[arena_idx];
        debug_assert!(slot < arena.entries);

        FlEntry {
            ptr: unsafe { arena.base.add(slot * self.entry_size) },
            len: self.entry_size,
            token,
            mrs: arena.mrs.clone(),
        }
    }

    fn grow(&self, inner: &mut Inner, entries: usize) -> RailResult<()> {
        if inner.arenas.len() >= u16::MAX as usize || entries > u16::MAX as usize {
            return Err(RailError::Resource("freelist arena limit reached"));
        }

        let bytes = entries * self.entry_size;
        let padded = (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let layout = Layout::from_size_align(padded, PAGE_SIZE)
            .map_err(|_| RailError::Invalid("bad arena layout"))?;

        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(RailError::Resource("arena allocation failed"));
        }

        let mrs = match &self.registrar {
            Some(registrar) => match registrar.register_block(base as usize, padded) {
                Ok(descs) => Arc::new(descs),
                Err(err) => {
                    unsafe { dealloc(base, layout) };
                    return Err(err);
                }
            },
            None => Arc::new(Vec::new()),
        };

        let arena_idx = inner.arenas.len() as u32;
        inner.arenas.push(Arena {
            base,
            layout,
            entries,
            mrs,
        });

        for slot in (0..entries as u32).rev() {
            inner.free.push((arena_idx << 16) | slot);
        }
        inner.total += entries;

        Ok(())
    }
}

impl Drop for Freelist {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();

        for arena in inner.arenas.drain(..) {
            if let Some(registrar) = &self.registrar {
                // Best effort; teardown has nowhere to report to.
                let _ = registrar.deregister_block(&arena.mrs);
            }
            unsafe { dealloc(arena.base, arena.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockRegistrar {
        registered: AtomicUsize,
        deregistered: AtomicUsize,
    }

    impl MockRegistrar {
        fn new() -> Arc<MockRegistrar> {
            Arc::new(MockRegistrar {
                registered: AtomicUsize::new(0),
                deregistered: AtomicUsize::new(0),
            })
        }
    }

    impl Registrar for MockRegistrar {
        fn register_block(&self, addr: usize, len: usize) -> RailResult<Vec<MrDesc>> {
            assert_eq!(addr % PAGE_SIZE, 0);
            assert_eq!(len % PAGE_SIZE, 0);
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MrDesc { key: 7, handle: addr as u64 }])
        }

        fn deregister_block(&self, _descs: &[MrDesc]) -> RailResult<()> {
            self.deregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_alloc_free_recycle() {
        let fl = Freelist::new(64, 2, 2, 8, 8, None).unwrap();

        let a = fl.alloc().unwrap().unwrap();
        let b = fl.alloc().unwrap().unwrap();
        assert_ne!(a.ptr(), b.ptr());
        assert_eq!(fl.outstanding(), 2);

        let token = a.token();
        fl.free(a);
        let c = fl.alloc().unwrap().unwrap();
        assert_eq!(c.token(), token);
    }

    #[test]
    fn test_cap_enforced() {
        let fl = Freelist::new(32, 0, 4, 4, 8, None).unwrap();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(fl.alloc().unwrap().unwrap());
        }
        assert!(fl.alloc().unwrap().is_none());

        fl.free(held.pop().unwrap());
        assert!(fl.alloc().unwrap().is_some());
    }

    #[test]
    fn test_entry_alignment() {
        let fl = Freelist::new(100, 4, 4, 8, 128, None).unwrap();
        assert_eq!(fl.entry_size(), 128);

        let entry = fl.alloc().unwrap().unwrap();
        assert_eq!(entry.ptr() as usize % 128, 0);
    }

    #[test]
    fn test_registrar_called_per_arena() {
        let registrar = MockRegistrar::new();
        let fl = Freelist::new(64, 2, 2, 6, 8, Some(registrar.clone())).unwrap();

        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(fl.alloc().unwrap().unwrap());
        }

        // 3 arenas of 2 entries each.
        assert_eq!(registrar.registered.load(Ordering::SeqCst), 3);
        assert_eq!(held[0].mr(0).unwrap().key, 7);

        for entry in held.drain(..) {
            fl.free(entry);
        }
        drop(fl);
        assert_eq!(registrar.deregistered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_lookup_matches_entry() {
        let fl = Freelist::new(64, 1, 1, 2, 8, None).unwrap();
        let entry = fl.alloc().unwrap().unwrap();

        let again = fl.lookup(entry.token());
        assert_eq!(again.ptr(), entry.ptr());
        assert_eq!(again.len(), entry.len());
    }

    #[test]
    fn test_bad_geometry() {
        assert!(Freelist::new(0, 1, 1, 1, 8, None).is_err());
        assert!(Freelist::new(8, 4, 1, 2, 8, None).is_err());
        assert!(Freelist::new(8, 1, 1, 2, 3, None).is_err());
    }
}
