//! Block-metadata codec.
//!
//! Every block (free or used) starts with a 4-byte header word packing its size
//! together with two tag bits: whether the block itself is allocated, and whether
//! its physical predecessor is allocated (`palloc`). A free block additionally
//! carries a matching 4-byte footer at its far end, so that a predecessor can be
//! located from a successor in constant time; an allocated block has no footer,
//! since the `palloc` bit on its *successor* is what lets that successor skip
//! looking for one. Free blocks reuse their first 8 payload bytes as an intrusive
//! doubly-linked list cell (see [`super::bins`]), which is the reason the minimum
//! block size is 16: 4 header + 4 footer + 8 link cell.

use super::buffer::Buffer;

pub const WSIZE: usize = 4;
pub const DSIZE: usize = 8;
pub const MIN_BLOCK: usize = 16;

const ALLOC_BIT: u32 = 0x1;
const PALLOC_BIT: u32 = 0x2;
const SIZE_MASK: u32 = !0x7;

/// Pack a block size and its two tag bits into a header/footer word.
pub fn pack(size: usize, alloc: bool, palloc: bool) -> u32 {
    debug_assert_eq!(size & 0x7, 0, "block size must be a multiple of 8");
    size as u32 | if alloc { ALLOC_BIT } else { 0 } | if palloc { PALLOC_BIT } else { 0 }
}

pub fn size_of(word: u32) -> usize {
    (word & SIZE_MASK) as usize
}

pub fn is_alloc(word: u32) -> bool {
    word & ALLOC_BIT != 0
}

pub fn is_palloc(word: u32) -> bool {
    word & PALLOC_BIT != 0
}

/// Offset of a block's header given its payload offset.
pub fn header_off(payload: usize) -> usize {
    payload - WSIZE
}

/// Offset of a block's footer given its payload offset and total size.
pub fn footer_off(payload: usize, size: usize) -> usize {
    payload + size - DSIZE
}

pub fn read_header<const N: usize>(buf: &Buffer<N>, payload: usize) -> u32 {
    buf.read_u32(header_off(payload))
}

pub fn write_header<const N: usize>(buf: &mut Buffer<N>, payload: usize, word: u32) {
    buf.write_u32(header_off(payload), word);
}

pub fn read_footer<const N: usize>(buf: &Buffer<N>, payload: usize, size: usize) -> u32 {
    buf.read_u32(footer_off(payload, size))
}

pub fn write_footer<const N: usize>(buf: &mut Buffer<N>, payload: usize, size: usize, word: u32) {
    buf.write_u32(footer_off(payload, size), word);
}

/// Write header and (for a free block) footer for a block of the given size and
/// state at `payload`.
pub fn write_block<const N: usize>(
    buf: &mut Buffer<N>,
    payload: usize,
    size: usize,
    alloc: bool,
    palloc: bool,
) {
    let word = pack(size, alloc, palloc);
    write_header(buf, payload, word);
    if !alloc {
        write_footer(buf, payload, size, word);
    }
}

/// Flip the `palloc` bit of the block at `payload`, keeping its footer (if any) in
/// sync. Used when a physical neighbor transitions between allocated and free.
pub fn set_palloc<const N: usize>(buf: &mut Buffer<N>, payload: usize, palloc: bool) {
    let word = read_header(buf, payload);
    let size = size_of(word);
    let alloc = is_alloc(word);
    write_block(buf, payload, size, alloc, palloc);
}

/// Payload offset of the block physically following `payload`.
pub fn next_block<const N: usize>(buf: &Buffer<N>, payload: usize) -> usize {
    let size = size_of(read_header(buf, payload));
    header_off(payload) + size + WSIZE
}

/// Payload offset of the block physically preceding `payload`, or `None` if that
/// predecessor is allocated (and therefore has no footer to read).
pub fn prev_block<const N: usize>(buf: &Buffer<N>, payload: usize) -> Option<usize> {
    if is_palloc(read_header(buf, payload)) {
        None
    } else {
        let prev_footer = header_off(payload) - WSIZE;
        let prev_size = size_of(buf.read_u32(prev_footer));
        Some(payload - prev_size)
    }
}

/// Read the "next" free-list link of the free block at `payload`.
///
/// `0` is the sentinel meaning "no further block"; offset `0` is inside the
/// prologue and is never the payload of a real block, so it is safe to reuse as
/// the empty-link marker.
pub fn read_link_next<const N: usize>(buf: &Buffer<N>, payload: usize) -> u32 {
    buf.read_u32(payload)
}

pub fn write_link_next<const N: usize>(buf: &mut Buffer<N>, payload: usize, link: u32) {
    buf.write_u32(payload, link);
}

pub fn read_link_prev<const N: usize>(buf: &Buffer<N>, payload: usize) -> u32 {
    buf.read_u32(payload + WSIZE)
}

pub fn write_link_prev<const N: usize>(buf: &mut Buffer<N>, payload: usize, link: u32) {
    buf.write_u32(payload + WSIZE, link);
}

/// Round a requested payload size up to a valid block size: at least
/// [`MIN_BLOCK`], a multiple of 8, with room for the header and (while free) a
/// footer.
pub fn block_size_for(payload_bytes: usize) -> usize {
    let needed = payload_bytes + WSIZE; // header; footer comes out of the payload room
    let needed = (needed + DSIZE - 1) / DSIZE * DSIZE;
    needed.max(MIN_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        let word = pack(64, true, false);
        assert_eq!(size_of(word), 64);
        assert!(is_alloc(word));
        assert!(!is_palloc(word));
    }

    #[test]
    fn block_size_rounds_up_and_respects_minimum() {
        assert_eq!(block_size_for(1), MIN_BLOCK);
        assert_eq!(block_size_for(8), MIN_BLOCK);
        assert_eq!(block_size_for(9), 24);
        assert_eq!(block_size_for(20), 32);
    }

    #[test]
    fn next_and_prev_agree_across_a_free_block() {
        let mut buf = Buffer::<64>::new();
        write_block(&mut buf, 16, 24, false, true);
        assert_eq!(next_block(&buf, 16), 40);
        write_block(&mut buf, 40, 16, true, false);
        assert_eq!(prev_block(&buf, 40), Some(16));
    }
}
