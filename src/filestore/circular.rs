//! Pure arithmetic for circular (ring-buffer) files: wrap indexing, window
//! clamping, and the "drop/trim bytes that have already scrolled out of the
//! readable window" rules from `SPEC_FULL.md` §4.2.
//!
//! Kept free of any locking or I/O so it can be exhaustively unit tested on
//! its own.

/// Round `max_size` up to the next multiple of `part_size` (never down to
/// zero: a non-zero `max_size` always yields at least one part).
pub fn round_up_max_size(max_size: u64, part_size: usize) -> u64 {
    let part_size = part_size as u64;
    if max_size == 0 {
        return 0;
    }
    let parts = (max_size + part_size - 1) / part_size;
    parts * part_size
}

/// First readable logical offset for a circular file of the given total
/// `size` and `max_size` (0 if the file hasn't filled its window yet).
pub fn window_start(size: u64, max_size: u64) -> u64 {
    size.saturating_sub(max_size)
}

/// Map a logical offset to `(part_idx, part_offset)` for a circular file
/// whose window holds `part_count` parts of `part_size` bytes each.
pub fn wrap_index(offset: u64, part_size: usize, part_count: u64) -> (u64, u64) {
    let part_size = part_size as u64;
    let part_idx = (offset / part_size) % part_count.max(1);
    let part_offset = offset % part_size;
    (part_idx, part_offset)
}

/// Apply the circular "drop what's already scrolled out" rule to an
/// incoming write `(offset, data)` against a file whose *current* size is
/// `cur_size` and whose ring holds `max_size` bytes.
///
/// Returns `None` if the entire write is behind the readable window (fully
/// dropped). Otherwise returns the possibly-truncated `(offset, data)` to
/// actually apply.
pub fn clamp_circular_write(
    cur_size: u64,
    max_size: u64,
    offset: u64,
    data: &[u8],
) -> Option<(u64, Vec<u8>)> {
    if data.is_empty() {
        return Some((offset, Vec::new()));
    }

    let end_offset = offset + data.len() as u64;
    // size *after* this write determines the readable window against which
    // we clamp — a write that extends size moves the window forward too.
    let new_size = cur_size.max(end_offset);
    let start = window_start(new_size, max_size);

    if end_offset <= start {
        return None; // entirely scrolled out before it was ever readable
    }

    let (mut offset, mut data) = (offset, data.to_vec());
    if offset < start {
        let drop = (start - offset) as usize;
        data.drain(0..drop.min(data.len()));
        offset = start;
    }

    if data.len() as u64 > max_size {
        let keep_from = data.len() - max_size as usize;
        data.drain(0..keep_from);
        offset = end_offset - data.len() as u64;
    }

    Some((offset, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_multiple() {
        assert_eq!(round_up_max_size(50, 64 * 1024), 64 * 1024);
        assert_eq!(round_up_max_size(64 * 1024, 64 * 1024), 64 * 1024);
        assert_eq!(round_up_max_size(64 * 1024 + 1, 64 * 1024), 128 * 1024);
        assert_eq!(round_up_max_size(0, 64 * 1024), 0);
    }

    #[test]
    fn window_start_clamps_at_zero() {
        assert_eq!(window_start(10, 50), 0);
        assert_eq!(window_start(60, 50), 10);
    }

    #[test]
    fn wrap_index_cycles() {
        assert_eq!(wrap_index(0, 10, 5), (0, 0));
        assert_eq!(wrap_index(49, 10, 5), (4, 9));
        assert_eq!(wrap_index(50, 10, 5), (0, 0));
        assert_eq!(wrap_index(103, 10, 5), (0, 3));
    }

    #[test]
    fn clamp_drops_fully_stale_write() {
        // window will be [50,100) once this write (at offset 0..10) lands,
        // but size only reaches 10 here, so nothing is stale yet.
        let r = clamp_circular_write(0, 50, 0, b"0123456789");
        assert_eq!(r, Some((0, b"0123456789".to_vec())));
    }

    #[test]
    fn clamp_truncates_leading_portion() {
        // cur_size=40, max=50 -> window currently [0,40). A 20-byte append
        // at offset 40 makes new_size=60, window becomes [10,60).
        let r = clamp_circular_write(40, 50, 40, &vec![1u8; 20]);
        let (offset, data) = r.unwrap();
        assert_eq!(offset, 40);
        assert_eq!(data.len(), 20);
    }

    #[test]
    fn clamp_keeps_only_tail_when_longer_than_window() {
        let data = vec![7u8; 100];
        let r = clamp_circular_write(0, 50, 0, &data).unwrap();
        assert_eq!(r.1.len(), 50);
        assert_eq!(r.0, 50);
    }
}
