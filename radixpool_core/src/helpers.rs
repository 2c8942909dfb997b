//! Helper functions for radix tree operations

/// Length of the longest shared prefix of `a` and `b`.
#[inline]
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Big-endian encoding, so integer order matches key order.
#[inline(always)]
pub fn key_from_u64(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_lengths() {
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"ab", b"abc"), 2);
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"xyz", b"xyz"), 3);
    }

    #[test]
    fn integer_keys_sort_numerically() {
        assert!(key_from_u64(255) < key_from_u64(256));
        assert!(key_from_u64(1 << 40) > key_from_u64(u32::MAX as u64));
    }
}
