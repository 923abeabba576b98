//! Size classes for slab blocks
//!
//! Small requests are rounded up to one of a fixed, strictly increasing
//! set of block sizes. Spacing grows with size so rounding waste stays
//! bounded: 8-byte steps up to 512 bytes, then 64, 512, 1 KiB, 2 KiB and
//! finally 16 KiB steps up to 240 KiB.

/// Block size of every class, indexed by class number
pub const SIZE_CLASSES: [usize; 115] = [
    // 8 to 512, step 8
    8, 16, 24, 32, 40, 48, 56, 64, 72, 80,
    88, 96, 104, 112, 120, 128, 136, 144, 152, 160,
    168, 176, 184, 192, 200, 208, 216, 224, 232, 240,
    248, 256, 264, 272, 280, 288, 296, 304, 312, 320,
    328, 336, 344, 352, 360, 368, 376, 384, 392, 400,
    408, 416, 424, 432, 440, 448, 456, 464, 472, 480,
    488, 496, 504, 512,
    // 576 to 1024, step 64
    576, 640, 704, 768, 832, 896, 960, 1024,
    // 1536 to 8192, step 512
    1536, 2048, 2560, 3072, 3584, 4096, 4608, 5120, 5632, 6144,
    6656, 7168, 7680, 8192,
    // 9216 to 16384, step 1024
    9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384,
    // 18432 to 30720, step 2048
    18432, 20480, 22528, 24576, 26624, 28672, 30720,
    // 32768 to 245760, step 16384
    32768, 49152, 65536, 81920, 98304, 114688, 131072, 147456, 163840, 180224,
    196608, 212992, 229376, 245760,
];

pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Largest size served by a slab block
pub const MAX_CLASS_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

/// Smallest class whose block holds `size` bytes
///
/// Returns `None` when `size` exceeds [`MAX_CLASS_SIZE`].
pub fn size_class(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    Some(SIZE_CLASSES.partition_point(|&block_size| block_size < size))
}

/// Block size of `class`
pub fn size_from_class(class: usize) -> Option<usize> {
    SIZE_CLASSES.get(class).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_strictly_increasing() {
        assert!(SIZE_CLASSES.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(SIZE_CLASSES[0], 8);
        assert_eq!(MAX_CLASS_SIZE, 245760);
    }

    #[test]
    fn test_exact_sizes_map_to_their_class() {
        for (class, &size) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(size_class(size), Some(class));
            assert_eq!(size_from_class(class), Some(size));
        }
    }

    #[test]
    fn test_sizes_round_up() {
        assert_eq!(size_class(1).and_then(size_from_class), Some(8));
        assert_eq!(size_class(130).and_then(size_from_class), Some(136));
        assert_eq!(size_class(513).and_then(size_from_class), Some(576));
        assert_eq!(size_class(1025).and_then(size_from_class), Some(1536));
        assert_eq!(size_class(8193).and_then(size_from_class), Some(9216));
        assert_eq!(size_class(16385).and_then(size_from_class), Some(18432));
        assert_eq!(size_class(30721).and_then(size_from_class), Some(32768));
    }

    #[test]
    fn test_oversized_requests_have_no_class() {
        assert_eq!(size_class(MAX_CLASS_SIZE + 1), None);
        assert_eq!(size_from_class(NUM_SIZE_CLASSES), None);
    }

    #[test]
    fn test_rounding_waste_is_bounded() {
        for size in (1..=MAX_CLASS_SIZE).step_by(97) {
            let block = size_class(size).and_then(size_from_class).unwrap();
            assert!(block >= size);
            assert!(block - size < 16384, "size {} rounds to {}", size, block);
        }
    }
}
