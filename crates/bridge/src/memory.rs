//! Instrumented allocator handed to the engine.
//!
//! Every engine allocation passes through [`engine_alloc`], which keeps a
//! running byte count and refuses growth past the configured limit. A refused
//! request surfaces inside the engine as a memory error, which the fault
//! barrier turns into `Error::OutOfMemory`.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::os::raw::c_void;
use std::ptr;

const ALLOC_ALIGN: usize = 16;

pub(crate) struct MemoryState {
    used: Cell<usize>,
    peak: Cell<usize>,
    limit: Cell<Option<usize>>,
}

impl MemoryState {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            used: Cell::new(0),
            peak: Cell::new(0),
            limit: Cell::new(limit),
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.get()
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.get()
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.limit.get()
    }

    pub(crate) fn set_limit(&self, limit: Option<usize>) {
        self.limit.set(limit);
    }

    fn record(&self, freed: usize, allocated: usize) {
        let used = self.used.get().saturating_sub(freed) + allocated;
        self.used.set(used);
        if used > self.peak.get() {
            self.peak.set(used);
        }
    }
}

/// `lua_Alloc` implementation. `ud` points at the session's `MemoryState`.
pub(crate) unsafe extern "C-unwind" fn engine_alloc(
    ud: *mut c_void,
    block: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let memory = &*(ud as *const MemoryState);
    // For a fresh allocation `osize` carries a type tag, not a size.
    let osize = if block.is_null() { 0 } else { osize };

    if nsize == 0 {
        if !block.is_null() {
            alloc::dealloc(
                block as *mut u8,
                Layout::from_size_align_unchecked(osize, ALLOC_ALIGN),
            );
            memory.record(osize, 0);
        }
        return ptr::null_mut();
    }

    if nsize > osize {
        if let Some(limit) = memory.limit.get() {
            if memory.used.get().saturating_sub(osize) + nsize > limit {
                return ptr::null_mut();
            }
        }
    }

    let new_block = if block.is_null() {
        match Layout::from_size_align(nsize, ALLOC_ALIGN) {
            Ok(layout) => alloc::alloc(layout),
            Err(_) => return ptr::null_mut(),
        }
    } else {
        alloc::realloc(
            block as *mut u8,
            Layout::from_size_align_unchecked(osize, ALLOC_ALIGN),
            nsize,
        )
    };
    if new_block.is_null() {
        return ptr::null_mut();
    }
    memory.record(osize, nsize);
    new_block as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ud(memory: &MemoryState) -> *mut c_void {
        memory as *const MemoryState as *mut c_void
    }

    #[test]
    fn test_alloc_realloc_free_accounting() {
        let memory = MemoryState::new(None);
        unsafe {
            let block = engine_alloc(ud(&memory), ptr::null_mut(), 5, 64);
            assert!(!block.is_null());
            assert_eq!(memory.used(), 64);

            let block = engine_alloc(ud(&memory), block, 64, 256);
            assert!(!block.is_null());
            assert_eq!(memory.used(), 256);

            let block = engine_alloc(ud(&memory), block, 256, 32);
            assert!(!block.is_null());
            assert_eq!(memory.used(), 32);

            assert!(engine_alloc(ud(&memory), block, 32, 0).is_null());
        }
        assert_eq!(memory.used(), 0);
        assert_eq!(memory.peak(), 256);
    }

    #[test]
    fn test_limit_refuses_growth_only() {
        let memory = MemoryState::new(Some(100));
        unsafe {
            let block = engine_alloc(ud(&memory), ptr::null_mut(), 0, 80);
            assert!(!block.is_null());

            // Growing past the limit fails and leaves the block intact.
            assert!(engine_alloc(ud(&memory), block, 80, 200).is_null());
            assert_eq!(memory.used(), 80);

            // Shrinking is always allowed, even over a lowered limit.
            memory.set_limit(Some(10));
            let block = engine_alloc(ud(&memory), block, 80, 40);
            assert!(!block.is_null());
            assert_eq!(memory.used(), 40);

            engine_alloc(ud(&memory), block, 40, 0);
        }
        assert_eq!(memory.used(), 0);
    }
}
