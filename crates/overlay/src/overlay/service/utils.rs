use ssz::Encode;

/// Pops elements off the end of the list until its SSZ-encoded size no longer exceeds
/// `max_size`. Keeps responses within the frame budget of the transport.
pub fn pop_while_ssz_bytes_len_gt<T: Encode>(items: &mut Vec<T>, max_size: usize) {
    while items.ssz_bytes_len() > max_size {
        items.pop();
    }
}
