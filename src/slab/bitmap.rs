//! Persistent bitmap, one bit per slab block

use crate::region::{RPtr, Region};

/// View of a bitmap stored in a region
///
/// Bit `i` lives in byte `i / 8` at position `i % 8`.
#[derive(Clone, Copy)]
pub struct Bitmap<'r> {
    region: &'r Region,
    base: RPtr,
    len: usize,
}

impl<'r> Bitmap<'r> {
    /// Bytes needed for `len` bits
    pub fn size_of(len: usize) -> usize {
        len.div_ceil(8)
    }

    /// Format a bitmap of `len` bits at `base`, all clear
    pub fn make(region: &'r Region, base: RPtr, len: usize) -> Self {
        let bitmap = Self::load(region, base, len);
        for byte in 0..Self::size_of(len) {
            region.store_u8(base + byte, 0);
        }
        region.persist(base, Self::size_of(len));
        bitmap
    }

    /// View an existing bitmap of `len` bits at `base`
    pub fn load(region: &'r Region, base: RPtr, len: usize) -> Self {
        assert!(
            region.contains(base, Self::size_of(len)),
            "bitmap at {} overruns the region",
            base
        );
        Self { region, base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&self, i: usize) {
        let (byte, mask) = self.locate(i);
        self.region.fetch_or_u8(byte, mask);
        self.region.persist(byte, 1);
    }

    pub fn clear(&self, i: usize) {
        let (byte, mask) = self.locate(i);
        self.region.fetch_and_u8(byte, !mask);
        self.region.persist(byte, 1);
    }

    pub fn is_set(&self, i: usize) -> bool {
        let (byte, mask) = self.locate(i);
        self.region.load_u8(byte) & mask != 0
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.is_set(i)).count()
    }

    fn locate(&self, i: usize) -> (RPtr, u8) {
        assert!(i < self.len, "bit {} out of range for bitmap of {}", i, self.len);
        (self.base + i / 8, 1 << (i % 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn dirty_region() -> Result<Region> {
        let region = Region::new(64)?;
        region.write_bytes(RPtr::new(0), &[0xff; 64])?;
        Ok(region)
    }

    #[test]
    fn test_make_clears_all_bits() -> Result<()> {
        for len in [4, 8, 12, 16, 256] {
            let region = dirty_region()?;
            let bitmap = Bitmap::make(&region, RPtr::new(0), len);
            assert!((0..len).all(|i| !bitmap.is_set(i)), "len {}", len);
        }
        Ok(())
    }

    #[test]
    fn test_make_leaves_trailing_bytes_alone() -> Result<()> {
        let region = dirty_region()?;
        Bitmap::make(&region, RPtr::new(0), 12);
        assert_eq!(region.load_u8(RPtr::new(1)), 0);
        assert_eq!(region.load_u8(RPtr::new(2)), 0xff);
        Ok(())
    }

    #[test]
    fn test_set_and_clear() -> Result<()> {
        for len in [4, 8, 12, 16, 256] {
            let region = Region::new(64)?;
            let bitmap = Bitmap::make(&region, RPtr::new(0), len);
            for i in 0..len {
                bitmap.set(i);
                assert!(bitmap.is_set(i));
            }
            assert_eq!(bitmap.count_set(), len);
            for i in 0..len {
                bitmap.clear(i);
                assert!(!bitmap.is_set(i));
            }
            assert_eq!(bitmap.count_set(), 0);
        }
        Ok(())
    }

    #[test]
    fn test_bits_are_independent() -> Result<()> {
        let region = Region::new(64)?;
        let bitmap = Bitmap::make(&region, RPtr::new(8), 20);
        bitmap.set(3);
        bitmap.set(9);
        bitmap.clear(4);
        assert_eq!(bitmap.count_set(), 2);
        assert_eq!(region.load_u8(RPtr::new(8)), 0b1000);
        assert_eq!(region.load_u8(RPtr::new(9)), 0b10);

        let reopened = Bitmap::load(&region, RPtr::new(8), 20);
        assert!(reopened.is_set(9));
        assert_eq!(Bitmap::size_of(20), 3);
        Ok(())
    }
}
