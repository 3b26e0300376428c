use num_traits::{PrimInt, Unsigned};

/// Rounds `size_or_address` up to the next multiple of `alignment`, which
/// must be a power of two.
pub fn align<T: PrimInt + Unsigned + From<u8>>(size_or_address: T, alignment: T) -> T {
    debug_assert!(alignment.count_ones() == 1, "alignment must be a power of two");

    (size_or_address + (alignment - <T as From<u8>>::from(1)))
        & !(alignment - <T as From<u8>>::from(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align(0u64, 64), 0);
        assert_eq!(align(1u64, 64), 64);
        assert_eq!(align(40u32, 32), 64);
        assert_eq!(align(64usize, 64), 64);
        assert_eq!(align(0x1_0001u64, 256), 0x1_0100);
    }
}
