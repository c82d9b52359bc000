//! The segregated-fit, boundary-tag raw allocator.
//!
//! A "raw allocator" is one that gets a request for a specific byte count but
//! does not need to worry about pointer alignment (that is the outer
//! [`crate::Allocator`]'s job). This one keeps every block - free or used - in a
//! single physically contiguous chain inside its backing [`Buffer`], threaded
//! with 4-byte header/footer tags, and keeps every *free* block additionally
//! linked into one of 14 segregated size-class lists so that finding a fit never
//! has to scan used memory.
//!
//! The heap begins with a small fixed prologue: one padding word (so the bin
//! array that follows is 8-byte aligned relative to the first real block), a
//! synthetic header/footer pair that permanently claims the prologue region as
//! "allocated" (so it is never considered for coalescing), and the 14-bin array
//! itself. The first real block's payload always starts at [`FIRST_PAYLOAD`].
//! The heap always ends with a zero-sized, permanently allocated "epilogue"
//! block, so that every real block's successor lookup (needed to read its
//! `palloc` bit) is unconditional - there is no special case for "last block".
mod bins;
mod block;
mod buffer;
mod coalesce;
mod placement;

use buffer::Buffer;

/// Extension granularity when the heap has to grow to satisfy a request: the
/// smallest chunk ever requested from the backing buffer, matching the
/// `CHUNKSIZE` of the segregated-fit allocator this design is drawn from.
const CHUNK_SIZE: usize = 64;

/// Byte 0 of the heap is left as padding so the bin array starts 8-byte aligned;
/// the prologue's synthetic header follows immediately at this offset.
const PROLOGUE_HEADER_OFF: usize = 4;

/// Payload offset of the first real block in the heap.
const FIRST_PAYLOAD: usize = bins::BIN_ARRAY_END + 8;

/// The smallest buffer this allocator can run on: room for the prologue, one
/// initial [`CHUNK_SIZE`]-byte free block, and the epilogue header.
pub const MIN_HEAP_SIZE: usize = FIRST_PAYLOAD + CHUNK_SIZE + block::WSIZE;

fn round_up_dsize(n: usize) -> usize {
    (n + block::DSIZE - 1) / block::DSIZE * block::DSIZE
}

/// A raw memory allocator working over a fixed-size buffer, without any notion of
/// pointer alignment.
pub struct RawAllocator<const N: usize> {
    buf: Buffer<N>,
    /// Payload offset of the epilogue (a permanently-allocated, zero-size block
    /// marking the current high-water end of the heap).
    end: usize,
    initialized: bool,
}

impl<const N: usize> RawAllocator<N> {
    /// Create a new, un-initialized [`RawAllocator`].
    ///
    /// The heap layout is written lazily on the first call that needs it, not
    /// here, so that `new()` stays a cheap `const fn`.
    ///
    /// # Panics
    /// Panics if `N` is smaller than [`MIN_HEAP_SIZE`] or not a multiple of 8.
    pub const fn new() -> Self {
        assert!(N >= MIN_HEAP_SIZE, "heap too small for the prologue and an initial chunk");
        assert!(N % 8 == 0, "heap size must be a multiple of 8");
        Self {
            buf: Buffer::new(),
            end: 0,
            initialized: false,
        }
    }

    fn ensure_init(&mut self) {
        if !self.initialized {
            self.init();
        }
    }

    fn init(&mut self) {
        let first_header_off = block::header_off(FIRST_PAYLOAD);
        let prologue_size = first_header_off - PROLOGUE_HEADER_OFF;
        let prologue_word = block::pack(prologue_size, true, true);
        self.buf.write_u32(PROLOGUE_HEADER_OFF, prologue_word);
        self.buf.write_u32(first_header_off - block::WSIZE, prologue_word);

        block::write_block(&mut self.buf, FIRST_PAYLOAD, CHUNK_SIZE, false, true);
        self.end = FIRST_PAYLOAD + CHUNK_SIZE;
        self.buf
            .write_u32(block::header_off(self.end), block::pack(0, true, false));
        bins::insert_at_root(&mut self.buf, FIRST_PAYLOAD);

        self.initialized = true;
    }

    /// Grow the heap by at least `min_bytes`, rounded up to a whole number of
    /// chunks, reusing the old epilogue's header slot as the new free block's
    /// header and writing a fresh epilogue past it. Returns the payload offset
    /// of the (possibly further coalesced) grown block, or `None` if the
    /// backing buffer has no room left.
    fn extend(&mut self, min_bytes: usize) -> Option<usize> {
        let bytes = round_up_dsize(min_bytes.max(CHUNK_SIZE));
        let old_epilogue = self.end;
        if old_epilogue + bytes + block::WSIZE > N {
            return None;
        }

        let epilogue_word = block::read_header(&self.buf, old_epilogue);
        let palloc = block::is_palloc(epilogue_word);
        block::write_block(&mut self.buf, old_epilogue, bytes, false, palloc);
        self.end = old_epilogue + bytes;
        self.buf
            .write_u32(block::header_off(self.end), block::pack(0, true, false));

        Some(coalesce::coalesce(&mut self.buf, old_epilogue))
    }

    /// Allocate `size` bytes, returning the payload offset of the new block.
    /// A request for zero bytes always returns `None`, matching `free`/`malloc`
    /// convention rather than handing out a live zero-sized block.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        self.ensure_init();
        let asize = block::block_size_for(size);

        if let Some(payload) = placement::find_fit(&self.buf, asize) {
            placement::place(&mut self.buf, payload, asize);
            return Some(payload);
        }

        let grown = self.extend(asize)?;
        placement::place(&mut self.buf, grown, asize);
        Some(grown)
    }

    /// Allocate `size` zeroed bytes.
    pub fn zero_allocate(&mut self, size: usize) -> Option<usize> {
        let payload = self.allocate(size)?;
        self.buf.zero(payload..payload + size);
        Some(payload)
    }

    /// Free the block at `payload`. Undefined behavior (per this allocator's
    /// contract, enforced by its callers rather than checked here) if `payload`
    /// is not the offset of a currently-allocated block.
    pub fn deallocate(&mut self, payload: usize) {
        coalesce::coalesce(&mut self.buf, payload);
    }

    /// Resize the block at `payload`, previously allocated for `old_user_size`
    /// bytes, to hold `new_user_size` bytes, preserving the first
    /// `min(old_user_size, new_user_size)` bytes. Returns the payload offset of
    /// the (possibly moved) result.
    pub fn reallocate(
        &mut self,
        payload: usize,
        old_user_size: usize,
        new_user_size: usize,
    ) -> Option<usize> {
        self.ensure_init();
        let asize = block::block_size_for(new_user_size);
        let word = block::read_header(&self.buf, payload);
        let size = block::size_of(word);
        let palloc = block::is_palloc(word);

        if asize <= size {
            let remainder = size - asize;
            if remainder >= block::MIN_BLOCK {
                block::write_block(&mut self.buf, payload, asize, true, palloc);
                let free_payload = payload + asize;
                block::write_block(&mut self.buf, free_payload, remainder, false, true);
                coalesce::coalesce(&mut self.buf, free_payload);
            }
            return Some(payload);
        }

        let new_payload = self.allocate(new_user_size)?;
        let copy_len = old_user_size.min(new_user_size);
        self.buf.copy_within(payload..payload + copy_len, new_payload);
        coalesce::coalesce(&mut self.buf, payload);
        Some(new_payload)
    }

    /// The address of byte offset 0 of the backing buffer.
    pub fn base_addr(&self) -> usize {
        self.buf.base_addr()
    }

    /// A raw pointer to the backing buffer, for the outer allocator to hand
    /// payload pointers out through.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    /// The total backing buffer size.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Validate the heap's internal invariants, panicking with `line_hint` (the
    /// caller's choice of a diagnostic marker, typically a call-site line
    /// number) on the first violation found. A no-op before the heap has ever
    /// been touched.
    ///
    /// Walks the full physical block chain checking alignment, minimum size,
    /// header/footer agreement on free blocks, `palloc`-bit consistency with the
    /// actual allocation state of the previous block, and the absence of two
    /// physically adjacent free blocks; then walks every bin checking that each
    /// free block it holds actually maps to that bin, that its `prev` link
    /// agrees with the node that reached it (and the bin's `tail` cell agrees
    /// with the last node reached), and that the free block count matches the
    /// one found by the physical walk.
    pub fn check(&self, line_hint: u32) {
        if !self.initialized {
            return;
        }

        let mut offset = FIRST_PAYLOAD;
        let mut prev_alloc = true;
        let mut free_count_physical = 0usize;
        while offset < self.end {
            assert!(
                offset % 8 == 0,
                "segalloc: block at {} is not 8-byte aligned (check at line {})",
                offset,
                line_hint
            );
            let word = block::read_header(&self.buf, offset);
            let size = block::size_of(word);
            assert!(
                size >= block::MIN_BLOCK,
                "segalloc: block at {} is smaller than the minimum block size (check at line {})",
                offset,
                line_hint
            );
            assert_eq!(
                block::is_palloc(word),
                prev_alloc,
                "segalloc: palloc bit at {} disagrees with the previous block's state (check at line {})",
                offset,
                line_hint
            );
            if !block::is_alloc(word) {
                let footer = block::read_footer(&self.buf, offset, size);
                assert_eq!(
                    word, footer,
                    "segalloc: header/footer mismatch for free block at {} (check at line {})",
                    offset, line_hint
                );
                assert!(
                    prev_alloc,
                    "segalloc: two physically adjacent free blocks ending at {} (check at line {})",
                    offset,
                    line_hint
                );
                free_count_physical += 1;
            }
            prev_alloc = block::is_alloc(word);
            offset = block::next_block(&self.buf, offset);
        }
        assert_eq!(
            offset, self.end,
            "segalloc: block chain did not land exactly on the heap end (check at line {})",
            line_hint
        );

        let mut free_count_bins = 0usize;
        for bin in 0..bins::BIN_COUNT {
            let mut node = bins::head(&self.buf, bin);
            let mut prev_link = 0u32;
            let mut last = 0u32;
            while node != 0 {
                let node_offset = node as usize;
                let size = block::size_of(block::read_header(&self.buf, node_offset));
                assert_eq!(
                    bins::bin_index(size),
                    bin,
                    "segalloc: block {} is linked into the wrong bin (check at line {})",
                    node_offset,
                    line_hint
                );
                assert_eq!(
                    block::read_link_prev(&self.buf, node_offset),
                    prev_link,
                    "segalloc: block {} in bin {} has a prev link that disagrees with its predecessor (check at line {})",
                    node_offset,
                    bin,
                    line_hint
                );
                free_count_bins += 1;
                prev_link = node;
                last = node;
                node = block::read_link_next(&self.buf, node_offset);
            }
            assert_eq!(
                bins::tail(&self.buf, bin),
                last,
                "segalloc: bin {} tail disagrees with its list's last node (check at line {})",
                bin,
                line_hint
            );
        }
        assert_eq!(
            free_count_physical, free_count_bins,
            "segalloc: free block count disagrees between the heap scan and the bins (check at line {})",
            line_hint
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heap_passes_check() {
        let mut allocator = RawAllocator::<256>::new();
        allocator.ensure_init();
        allocator.check(line!());
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut allocator = RawAllocator::<256>::new();
        let a = allocator.allocate(20).unwrap();
        allocator.check(line!());
        allocator.deallocate(a);
        allocator.check(line!());
    }

    #[test]
    fn allocate_exhausts_and_then_extends() {
        let mut allocator = RawAllocator::<256>::new();
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(400).unwrap();
        allocator.check(line!());
        assert_ne!(a, b);
    }

    #[test]
    fn shrinking_reallocate_keeps_payload_offset() {
        let mut allocator = RawAllocator::<256>::new();
        let a = allocator.allocate(64).unwrap();
        let a2 = allocator.reallocate(a, 64, 8).unwrap();
        assert_eq!(a, a2);
        allocator.check(line!());
    }

    #[test]
    fn growing_reallocate_always_moves_to_a_freshly_allocated_block() {
        let mut allocator = RawAllocator::<512>::new();
        let a = allocator.allocate(8).unwrap();
        let grown = allocator.reallocate(a, 8, 300).unwrap();
        assert_ne!(a, grown);
        allocator.check(line!());
    }

    #[test]
    fn out_of_memory_returns_none_without_corrupting_state() {
        let mut allocator = RawAllocator::<{ MIN_HEAP_SIZE }>::new();
        assert!(allocator.allocate(CHUNK_SIZE * 4).is_none());
        allocator.check(line!());
    }

    #[test]
    fn zero_size_allocate_returns_none() {
        let mut allocator = RawAllocator::<256>::new();
        assert!(allocator.allocate(0).is_none());
        assert!(allocator.zero_allocate(0).is_none());
        allocator.check(line!());
    }

    #[test]
    #[should_panic(expected = "prev link")]
    fn check_catches_a_corrupted_prev_link() {
        let mut allocator = RawAllocator::<256>::new();
        let a = allocator.allocate(16).unwrap();
        let mid = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();
        let _ = mid; // kept allocated so `a` and `b` stay physically separate
        allocator.deallocate(a);
        allocator.deallocate(b);
        let bin = bins::bin_index(16);
        let head = bins::head(&allocator.buf, bin) as usize;
        block::write_link_prev(&mut allocator.buf, head, 0xdead);
        allocator.check(line!());
    }
}
