//! Bit-set primitives backing the discrete configuration-space masks.

use crate::format::{SampleFormat, ALL_FORMATS};

/// Trait for types which can represent bitsets.
///
/// A bit set is a type which encodes a boolean value per index, functioning
/// similarly in principle to a `HashSet<usize>`.
pub trait Bitset: Sized {
    /// Return the capacity of this bitset, that is, how many indices can be
    /// used with this type.
    fn capacity(&self) -> usize;

    /// Get the value for a specific index. Implementations should panic when
    /// this value is out of range.
    fn get_index(&self, index: usize) -> bool;

    /// Sets the value for a specific index. Implementations should panic when
    /// this value is out of range.
    fn set_index(&mut self, index: usize, value: bool);

    /// Returns an iterator of indices for which the value has been set `true`.
    fn indices(&self) -> impl IntoIterator<Item = usize> {
        (0..self.capacity()).filter_map(|i| self.get_index(i).then_some(i))
    }

    /// Count the number of `true` elements in this bit set.
    fn count(&self) -> usize {
        self.indices().into_iter().count()
    }

    /// Builder-like method for setting all provided indices to `true`.
    fn with_indices(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        for ix in indices {
            self.set_index(ix, true);
        }
        self
    }
}

#[duplicate::duplicate_item(
    ty;
    [u8];
    [u16];
    [u32];
    [u64];
)]
impl Bitset for ty {
    fn capacity(&self) -> usize {
        ty::BITS as usize
    }

    fn get_index(&self, index: usize) -> bool {
        let mask = 1 << index;
        self & mask > 0
    }

    fn set_index(&mut self, index: usize, value: bool) {
        let mask = 1 << index;
        if value {
            *self |= mask;
        } else {
            *self &= !mask;
        }
    }

    fn count(&self) -> usize {
        self.count_ones() as _
    }
}

/// Set of sample formats, used as the format axis of the configuration space.
///
/// Refinement intersects masks; an intersection that comes out empty fails
/// the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatMask(u32);

impl Default for FormatMask {
    fn default() -> Self {
        Self::any()
    }
}

impl FormatMask {
    /// Mask with no formats set.
    pub fn none() -> Self {
        Self(0)
    }

    /// Mask with every known format set.
    pub fn any() -> Self {
        Self(0u32.with_indices(ALL_FORMATS.iter().map(|f| f.mask_bit())))
    }

    /// Mask containing exactly one format.
    pub fn single(format: SampleFormat) -> Self {
        Self(0u32.with_indices([format.mask_bit()]))
    }

    /// Whether the given format is in the mask.
    pub fn test(&self, format: SampleFormat) -> bool {
        self.0.get_index(format.mask_bit())
    }

    /// Add a format to the mask.
    pub fn set(&mut self, format: SampleFormat) {
        self.0.set_index(format.mask_bit(), true);
    }

    /// Remove a format from the mask.
    pub fn reset(&mut self, format: SampleFormat) {
        self.0.set_index(format.mask_bit(), false);
    }

    /// Intersect with another mask in place.
    pub fn intersect(&mut self, other: &FormatMask) {
        self.0 &= other.0;
    }

    /// Whether the mask has no formats left.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of formats in the mask.
    pub fn count(&self) -> usize {
        self.0.count()
    }

    /// First format in the mask, in [`ALL_FORMATS`] order.
    pub fn first(&self) -> Option<SampleFormat> {
        self.iter().next()
    }

    /// Iterate the formats present in the mask.
    pub fn iter(&self) -> impl Iterator<Item = SampleFormat> + '_ {
        let bits = self.0;
        ALL_FORMATS
            .iter()
            .copied()
            .filter(move |f| bits.get_index(f.mask_bit()))
    }
}

impl FromIterator<SampleFormat> for FormatMask {
    fn from_iter<T: IntoIterator<Item = SampleFormat>>(iter: T) -> Self {
        let mut mask = Self::none();
        for format in iter {
            mask.set(format);
        }
        mask
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_getset_index() {
        let mut bitset = 0u8;
        bitset.set_index(0, true);
        bitset.set_index(2, true);
        bitset.set_index(3, true);
        bitset.set_index(2, false);

        assert_eq!(0b1001, bitset);
        assert!(bitset.get_index(0));
        assert!(bitset.get_index(3));
        assert!(!bitset.get_index(2));
    }

    #[test]
    fn format_mask_intersection() {
        let mut a = FormatMask::from_iter([SampleFormat::S16Le, SampleFormat::U8]);
        let b = FormatMask::from_iter([SampleFormat::S16Le, SampleFormat::S32Le]);
        a.intersect(&b);
        assert!(a.test(SampleFormat::S16Le));
        assert!(!a.test(SampleFormat::U8));
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn format_mask_first_follows_declaration_order() {
        let mask = FormatMask::from_iter([SampleFormat::F32Le, SampleFormat::S8]);
        assert_eq!(mask.first(), Some(SampleFormat::S8));
        assert_eq!(FormatMask::none().first(), None);
        assert!(FormatMask::none().is_empty());
    }

    #[test]
    fn any_mask_contains_all_formats() {
        let mask = FormatMask::any();
        for &format in ALL_FORMATS {
            assert!(mask.test(format), "{format:?}");
        }
        assert_eq!(mask.count(), ALL_FORMATS.len());
    }
}
