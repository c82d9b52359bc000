//! A segregated free-list allocator for embedded Rust and `#![no_std]`.
//!
//! This crate provides a single type called [`Allocator`]. This type implements
//! the [`core::alloc::GlobalAlloc`]-trait, which is required to use the
//! [`alloc`-crate][alloc] on `#![no_std]`-targets.
//!
//! # Usage
//! Copy and paste the following into your binary crate, adjusting the heap size
//! (here 4K) to your needs:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the static
//! `ALLOCATOR` anymore; `use alloc::vec::Vec`, `use alloc::collections::BTreeMap`,
//! etc. all work normally.
//!
//! The minimal heap size is [`raw_allocator::MIN_HEAP_SIZE`] bytes, which is
//! mostly fixed bookkeeping overhead (the bin array and an initial chunk); size
//! the heap for your actual worst-case live-byte usage plus some headroom, the
//! same way you would for any other allocator.
//!
//! # Implementation
//! Every block, free or used, carries a 4-byte header (and, while free, a
//! matching 4-byte footer) packing its size together with two tag bits: whether
//! the block itself is allocated, and whether its physical predecessor is
//! (`palloc`) - the latter lets an allocated block's *successor* skip looking for
//! a footer that isn't there, saving 4 bytes per live allocation.
//!
//! Free blocks are additionally kept in one of 14 segregated size-class lists
//! ("bins"): exact-size bins for 16, 24, ..., 56 bytes, power-of-two bins
//! covering 64 up to 8191 bytes, and one catch-all bin for anything larger.
//! Allocating walks the bins starting from the requested size's own class,
//! taking the first exact match it sees or, failing that, the smallest-overhead
//! fit within the first non-empty bin it reaches - a bounded best-fit, not an
//! exhaustive one, which keeps allocation cost independent of how fragmented the
//! heap has become.
//!
//! Freeing a block immediately coalesces it with any free physical neighbor(s) -
//! there are four cases, depending on whether the previous and next blocks are
//! themselves free - before reinserting the result into the appropriate bin.
//! This keeps fragmentation from accumulating the way it would under a
//! free-but-never-merge policy, at the cost of doing the coalescing work
//! eagerly on every `dealloc` rather than lazily.
//!
//! The heap only grows when no free block anywhere is big enough: it extends by
//! whatever is bigger, the request or a fixed minimum chunk, reusing the
//! sentinel "epilogue" block's header slot as the new free block's header and
//! writing a fresh (zero-size, permanently allocated) epilogue past it, then
//! coalesces the new block with its predecessor exactly like a `dealloc` would.
//!
//! This allocator does not promise anything about thread-safety at the
//! algorithm level - the [`spin::Mutex`] wrapping it is what makes `Allocator`
//! safe to use as a `#[global_allocator]` from multiple threads, not any
//! property of the free-list code itself - nor does it defragment memory beyond
//! the immediate coalescing described above, nor does it guarantee alignment
//! stronger than 8 bytes on the fast path (see [`Allocator::alloc`] for how
//! stronger alignments are still honored, just less cheaply).
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

mod raw_allocator;

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;
use raw_allocator::RawAllocator;

/// The strongest alignment the segregated free-list itself can satisfy directly;
/// every block's payload is placed on an 8-byte boundary, so anything up to and
/// including that needs no special handling.
const NATURAL_ALIGN: usize = 8;

/// The memory allocator for embedded systems.
///
/// This is the core type of this crate: an allocator with a predefined heap
/// size. The heap memory usage is therefore statically bounded, which also
/// helps avoid issues with heap/stack smashes, since the heap is counted among
/// the static memory (e.g. `.bss`). A smash might still happen if the stack
/// grows into the heap, but the heap cannot grow into the stack.
///
/// Usage is simple: copy and paste the following into the binary crate you're
/// developing, adjusting the heap size (`4096`, or 4K, in this example) to your
/// needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<4096> = segalloc::Allocator::new();
/// ```
/// Also see the [crate-level](crate) documentation for the allocator's design
/// and general usage recommendations.
pub struct Allocator<const N: usize>(spin::Mutex<RawAllocator<N>>);

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This is a `const fn`, so it can be called directly in a `static`
    /// initializer, as shown above. The heap itself is laid out lazily on the
    /// first allocation, not here.
    ///
    /// # Panics
    /// Panics if `N` is smaller than [`raw_allocator::MIN_HEAP_SIZE`] or is not
    /// a multiple of 8.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self(spin::Mutex::new(RawAllocator::new()))
    }

    /// Validate every internal invariant of the heap: block alignment and
    /// minimum size, header/footer agreement, `palloc`-bit consistency, the
    /// absence of two physically adjacent free blocks, and agreement between
    /// the physical block chain and the segregated free lists.
    ///
    /// This locks the allocator for the duration of the check. It is meant for
    /// debugging and tests, not for use on a hot path: call it after a
    /// suspicious sequence of operations, not after every allocation.
    ///
    /// # Panics
    /// Panics, describing the specific invariant violated and the call site's
    /// line number, on the first inconsistency found.
    #[track_caller]
    pub fn check(&self) {
        self.0.lock().check(core::panic::Location::caller().line());
    }

    /// Over-aligned slow path: allocate extra room, shift the returned pointer
    /// forward to the requested alignment, and stash the true block address in
    /// the `usize` immediately before it so [`Allocator::dealloc`] and
    /// [`Allocator::realloc`] can recover it.
    ///
    /// # Safety
    /// This is the one place in the crate that performs raw pointer arithmetic
    /// beyond `RawAllocator`'s bounds-checked byte accessors: it computes a
    /// shifted pointer inside a larger allocation and writes through it.
    unsafe fn alloc_over_aligned(raw: &mut RawAllocator<N>, layout: Layout) -> *mut u8 {
        let stash = mem::size_of::<usize>();
        let total = match layout.size().checked_add(layout.align()).and_then(|n| n.checked_add(stash)) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let offset = match raw.allocate(total) {
            Some(offset) => offset,
            None => return ptr::null_mut(),
        };
        let block_addr = raw.base_addr() + offset;
        let unaligned = block_addr + stash;
        let aligned = (unaligned + layout.align() - 1) & !(layout.align() - 1);

        // SAFETY: `aligned - stash` lies within the `total` bytes we just
        // allocated (since `aligned < block_addr + stash + layout.align()` and
        // `total >= layout.align() + stash`), is `usize`-aligned (`stash` and
        // `layout.align()` are both powers of two and `block_addr` is at least
        // 8-aligned), and nothing else has a reference into this fresh
        // allocation yet.
        unsafe {
            (aligned as *mut usize).sub(1).write(block_addr);
        }
        aligned as *mut u8
    }
}
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.0.lock();
        if layout.align() <= NATURAL_ALIGN {
            match raw.allocate(layout.size()) {
                Some(offset) => (raw.base_addr() + offset) as *mut u8,
                None => ptr::null_mut(),
            }
        } else {
            // SAFETY: see `alloc_over_aligned`.
            unsafe { Self::alloc_over_aligned(&mut raw, layout) }
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= NATURAL_ALIGN {
            let mut raw = self.0.lock();
            match raw.zero_allocate(layout.size()) {
                Some(offset) => (raw.base_addr() + offset) as *mut u8,
                None => ptr::null_mut(),
            }
        } else {
            // SAFETY: `ptr` was just returned by `alloc` (or is null, handled
            // below) and is valid for `layout.size()` bytes.
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
            }
            ptr
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut raw = self.0.lock();
        let base = raw.base_addr();
        if layout.align() <= NATURAL_ALIGN {
            raw.deallocate(ptr as usize - base);
        } else {
            // SAFETY: `ptr` was returned by `alloc_over_aligned`, which always
            // writes the true block address to the `usize` just before it.
            let block_addr = unsafe { (ptr as *const usize).sub(1).read() };
            raw.deallocate(block_addr - base);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= NATURAL_ALIGN {
            let mut raw = self.0.lock();
            let base = raw.base_addr();
            let offset = ptr as usize - base;
            match raw.reallocate(offset, layout.size(), new_size) {
                Some(new_offset) => (raw.base_addr() + new_offset) as *mut u8,
                None => ptr::null_mut(),
            }
        } else {
            // Over-aligned requests are rare enough not to be worth a
            // dedicated in-place-growth path: fall back to allocate, copy,
            // free, the same strategy `GlobalAlloc`'s own default `realloc`
            // uses.
            let new_layout = match Layout::from_size_align(new_size, layout.align()) {
                Ok(layout) => layout,
                Err(_) => return ptr::null_mut(),
            };
            // SAFETY: `new_layout` has a non-zero size (guaranteed by the
            // caller's `layout`/`new_size` contract) and the same alignment as
            // `layout`.
            let new_ptr = unsafe { self.alloc(new_layout) };
            if !new_ptr.is_null() {
                // SAFETY: `ptr` is valid for `layout.size()` bytes and `new_ptr`
                // for at least that many too, both non-overlapping.
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            new_ptr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    #[test]
    fn basic_alloc_and_dealloc() {
        let allocator = Allocator::<512>::new();
        let layout = Layout::from_size_align(32, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, layout);
        }
        allocator.check();
    }

    #[test]
    fn zeroed_alloc_is_actually_zero() {
        let allocator = Allocator::<512>::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            for i in 0..64 {
                assert_eq!(*ptr.add(i), 0);
            }
            allocator.dealloc(ptr, layout);
        }
    }

    #[test]
    fn over_aligned_request_is_actually_aligned() {
        let allocator = Allocator::<1024>::new();
        let layout = Layout::from_size_align(24, 64).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 64, 0);
            allocator.dealloc(ptr, layout);
        }
        allocator.check();
    }

    #[test]
    fn realloc_grow_moves_but_preserves_data() {
        let allocator = Allocator::<1024>::new();
        let layout = Layout::from_size_align(8, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            *ptr = 0x42;
            let grown = allocator.realloc(ptr, layout, 200);
            assert!(!grown.is_null());
            assert_eq!(*grown, 0x42);
            allocator.dealloc(grown, Layout::from_size_align(200, 8).unwrap());
        }
        allocator.check();
    }
}
