//! Finding a free block to satisfy a request, and splitting it down to size.

use super::bins;
use super::block;
use super::buffer::Buffer;

/// Bounded best-fit search: walk the bins from `bin_index(asize)` upward: Return
/// the first exact match seen. Otherwise, within the first bin that contains any
/// block big enough, remember the one with the smallest size overhead and return
/// it — without looking further up the bin array, since a later bin only holds
/// strictly larger blocks and is by definition a worse (or equal) fit.
pub fn find_fit<const N: usize>(buf: &Buffer<N>, asize: usize) -> Option<usize> {
    for bin in bins::bin_index(asize)..bins::BIN_COUNT {
        let mut node = bins::head(buf, bin);
        let mut best: Option<(usize, usize)> = None;
        while node != 0 {
            let payload = node as usize;
            let size = block::size_of(block::read_header(buf, payload));
            if size >= asize {
                let diff = size - asize;
                if diff == 0 {
                    return Some(payload);
                }
                let better = match best {
                    Some((_, best_diff)) => diff < best_diff,
                    None => true,
                };
                if better {
                    best = Some((payload, diff));
                }
            }
            node = block::read_link_next(buf, payload);
        }
        if let Some((payload, _)) = best {
            return Some(payload);
        }
    }
    None
}

/// Place a request of `asize` bytes into the free block at `payload`, which must
/// currently be linked into its bin's free list. Splits off and re-inserts a
/// trailing free remainder if it would be at least [`block::MIN_BLOCK`] bytes,
/// otherwise hands out the whole block.
pub fn place<const N: usize>(buf: &mut Buffer<N>, payload: usize, asize: usize) {
    bins::unlink(buf, payload);
    let word = block::read_header(buf, payload);
    let size = block::size_of(word);
    let palloc = block::is_palloc(word);
    let remainder = size - asize;

    if remainder >= block::MIN_BLOCK {
        block::write_block(buf, payload, asize, true, palloc);
        let free_payload = payload + asize;
        block::write_block(buf, free_payload, remainder, false, true);
        bins::insert_at_root(buf, free_payload);
        let successor = block::next_block(buf, free_payload);
        block::set_palloc(buf, successor, false);
    } else {
        block::write_block(buf, payload, size, true, palloc);
        let successor = block::next_block(buf, payload);
        block::set_palloc(buf, successor, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_fit_prefers_exact_match_in_first_viable_bin() {
        let mut buf = Buffer::<256>::new();
        block::write_block(&mut buf, 128, 32, false, true);
        bins::insert_at_root(&mut buf, 128);
        block::write_block(&mut buf, 168, 24, false, false);
        bins::insert_at_root(&mut buf, 168);

        assert_eq!(find_fit(&buf, 24), Some(168));
    }

    #[test]
    fn find_fit_falls_back_to_smallest_overhead_within_a_bin() {
        let mut buf = Buffer::<256>::new();
        block::write_block(&mut buf, 128, 120, false, true);
        bins::insert_at_root(&mut buf, 128);
        block::write_block(&mut buf, 256 - 80, 72, false, false);
        bins::insert_at_root(&mut buf, 256 - 80);

        assert_eq!(find_fit(&buf, 70), Some(256 - 80));
    }

    #[test]
    fn find_fit_returns_none_when_nothing_fits() {
        let mut buf = Buffer::<256>::new();
        block::write_block(&mut buf, 128, 16, false, true);
        bins::insert_at_root(&mut buf, 128);
        assert_eq!(find_fit(&buf, 64), None);
    }

    #[test]
    fn place_splits_when_remainder_is_large_enough() {
        let mut buf = Buffer::<256>::new();
        block::write_block(&mut buf, 128, 64, false, true);
        bins::insert_at_root(&mut buf, 128);

        place(&mut buf, 128, 24);
        assert_eq!(block::size_of(block::read_header(&buf, 128)), 24);
        assert!(block::is_alloc(block::read_header(&buf, 128)));
        assert_eq!(bins::head(&buf, bins::bin_index(40)), 152);
    }

    #[test]
    fn place_keeps_whole_block_when_remainder_too_small() {
        let mut buf = Buffer::<256>::new();
        block::write_block(&mut buf, 128, 24, false, true);
        bins::insert_at_root(&mut buf, 128);

        place(&mut buf, 128, 16);
        assert_eq!(block::size_of(block::read_header(&buf, 128)), 24);
    }
}
