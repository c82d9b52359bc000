//! Immediate coalescing of a freshly-freed block with its physical neighbors.
//!
//! There are four cases, distinguished by whether the previous and next physical
//! blocks are themselves free (`palloc`/the next header's alloc bit tell us which
//! without a bin lookup):
//!
//! 1. both neighbors allocated: the block stands alone.
//! 2. next free, previous allocated: merge with the next block.
//! 3. previous free, next allocated: merge with the previous block.
//! 4. both neighbors free: merge all three into one block.
//!
//! In cases 2-4, if the absorbed free block's size class is unchanged by the
//! merge, the block is left in its existing list position instead of being
//! unlinked and reinserted: its bin-list neighbors don't move just because its
//! header grew, so touching the list would be pure overhead.

use super::bins;
use super::block;
use super::buffer::Buffer;

/// Coalesce the free block at `payload` with any free physical neighbors and
/// insert the resulting block into the free lists. `payload`'s header (and
/// footer) must already describe it as free, and it must *not* already be
/// linked into a bin. Returns the payload offset of the block that ends up
/// holding the merged memory.
pub fn coalesce<const N: usize>(buf: &mut Buffer<N>, payload: usize) -> usize {
    let size = block::size_of(block::read_header(buf, payload));
    let prev = block::prev_block(buf, payload);
    let next = block::next_block(buf, payload);
    let next_header = block::read_header(buf, next);
    let next_free = !block::is_alloc(next_header);
    let next_size = block::size_of(next_header);

    let merged_payload = match (prev, next_free) {
        (None, false) => {
            block::write_block(buf, payload, size, false, true);
            bins::insert_at_root(buf, payload);
            payload
        }
        (None, true) => {
            absorb_next(buf, payload, size, next, next_size);
            payload
        }
        (Some(prev_payload), false) => absorb_prev(buf, prev_payload, size),
        (Some(prev_payload), true) => {
            let prev_size = block::size_of(block::read_header(buf, prev_payload));
            bins::unlink(buf, next);
            let total = prev_size + size + next_size;
            reseat(buf, prev_payload, total, bins::bin_index(prev_size));
            prev_payload
        }
    };

    let successor = block::next_block(buf, merged_payload);
    block::set_palloc(buf, successor, false);
    merged_payload
}

fn absorb_next<const N: usize>(
    buf: &mut Buffer<N>,
    payload: usize,
    size: usize,
    next: usize,
    next_size: usize,
) {
    bins::unlink(buf, next);
    let total = size + next_size;
    block::write_block(buf, payload, total, false, true);
    bins::insert_at_root(buf, payload);
}

/// Merge a just-freed block of `size` bytes (whose next neighbor is allocated)
/// into the free block preceding it, returning the previous block's payload
/// offset.
fn absorb_prev<const N: usize>(buf: &mut Buffer<N>, prev_payload: usize, size: usize) -> usize {
    let prev_size = block::size_of(block::read_header(buf, prev_payload));
    let total = prev_size + size;
    reseat(buf, prev_payload, total, bins::bin_index(prev_size));
    prev_payload
}

/// Rewrite a merged free block's header/footer and keep it correctly placed in
/// the bin list: if the merge didn't change its bin, leave its list links alone;
/// otherwise unlink and reinsert at the new bin's root.
fn reseat<const N: usize>(buf: &mut Buffer<N>, payload: usize, new_size: usize, old_bin: usize) {
    let new_bin = bins::bin_index(new_size);
    if new_bin == old_bin {
        block::write_block(buf, payload, new_size, false, true);
    } else {
        bins::unlink(buf, payload);
        block::write_block(buf, payload, new_size, false, true);
        bins::insert_at_root(buf, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny three-block physical layout used by all four cases below:
    // payload offsets 128, 160, 192, each spanning 32 bytes, followed by a
    // trailing allocated sentinel block at 224 so `coalesce` always has a real
    // successor header to update.
    fn three_blocks<const N: usize>(buf: &mut Buffer<N>) {
        block::write_block(buf, 128, 32, true, true);
        block::write_block(buf, 160, 32, true, false);
        block::write_block(buf, 192, 32, true, false);
        block::write_block(buf, 224, 32, true, false);
    }

    #[test]
    fn case1_no_free_neighbors_just_inserts() {
        let mut buf = Buffer::<256>::new();
        three_blocks(&mut buf);
        block::write_block(&mut buf, 160, 32, false, true); // freeing 160
        let merged = coalesce(&mut buf, 160);
        assert_eq!(merged, 160);
        assert_eq!(block::size_of(block::read_header(&buf, 160)), 32);
        assert_eq!(bins::head(&buf, bins::bin_index(32)), 160);
        assert!(!block::is_palloc(block::read_header(&buf, 192)));
    }

    #[test]
    fn case2_merges_with_free_successor() {
        let mut buf = Buffer::<256>::new();
        three_blocks(&mut buf);
        block::write_block(&mut buf, 192, 32, false, false);
        bins::insert_at_root(&mut buf, 192);
        block::write_block(&mut buf, 160, 32, false, true); // freeing 160
        let merged = coalesce(&mut buf, 160);
        assert_eq!(merged, 160);
        assert_eq!(block::size_of(block::read_header(&buf, 160)), 64);
        assert!(!block::is_palloc(block::read_header(&buf, 224)));
    }

    #[test]
    fn case3_merges_with_free_predecessor() {
        let mut buf = Buffer::<256>::new();
        three_blocks(&mut buf);
        block::write_block(&mut buf, 128, 32, false, true);
        bins::insert_at_root(&mut buf, 128);
        block::write_header(&mut buf, 160, block::pack(32, true, false));
        block::write_block(&mut buf, 160, 32, false, false); // freeing 160
        let merged = coalesce(&mut buf, 160);
        assert_eq!(merged, 128);
        assert_eq!(block::size_of(block::read_header(&buf, 128)), 64);
        assert!(!block::is_palloc(block::read_header(&buf, 192)));
    }

    #[test]
    fn case4_merges_both_neighbors() {
        let mut buf = Buffer::<256>::new();
        three_blocks(&mut buf);
        block::write_block(&mut buf, 128, 32, false, true);
        bins::insert_at_root(&mut buf, 128);
        block::write_block(&mut buf, 192, 32, false, false);
        bins::insert_at_root(&mut buf, 192);
        block::write_block(&mut buf, 160, 32, false, false); // freeing 160
        let merged = coalesce(&mut buf, 160);
        assert_eq!(merged, 128);
        assert_eq!(block::size_of(block::read_header(&buf, 128)), 96);
        assert!(!block::is_palloc(block::read_header(&buf, 224)));
    }
}
