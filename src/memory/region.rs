use std::fmt;

/// Half-open byte interval `[start, end)` in the cluster virtual address
/// space. Regions are never relocated and translate to the same addresses
/// on every node, so two regions relate purely by interval arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryRegion {
    start: u64,
    end: u64,
}

impl MemoryRegion {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "region end before start: [{start:#x}, {end:#x})");
        Self { start, end }
    }

    pub fn from_raw(ptr: *const u8, len: usize) -> Self {
        let start = ptr as u64;
        Self::new(start, start + len as u64)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Interval containment: does `self` cover all of `other`?
    pub fn contains(&self, other: &MemoryRegion) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn intersects(&self, other: &MemoryRegion) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &MemoryRegion) -> Option<MemoryRegion> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| MemoryRegion::new(start, end))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.start as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start as *mut u8
    }

    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The region must lie inside a live arena mapping of this process and
    /// no concurrent writer may alias it (the dependency system is what
    /// provides that exclusion at runtime).
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Mutable view of the region; same contract as [`MemoryRegion::as_slice`].
    ///
    /// # Safety
    ///
    /// See [`MemoryRegion::as_slice`]; additionally the caller must be the
    /// unique writer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }

    /// Split into consecutive chunks of at most `max_len` bytes. The final
    /// chunk carries the remainder.
    pub fn fragments(&self, max_len: usize) -> impl Iterator<Item = MemoryRegion> + '_ {
        assert!(max_len > 0);
        let max_len = max_len as u64;
        let mut cursor = self.start;
        std::iter::from_fn(move || {
            if cursor >= self.end {
                return None;
            }
            let end = self.end.min(cursor + max_len);
            let fragment = MemoryRegion::new(cursor, end);
            cursor = end;
            Some(fragment)
        })
    }

    pub fn fragment_count(&self, max_len: usize) -> usize {
        assert!(max_len > 0);
        (self.len() + max_len - 1) / max_len
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_containment_and_intersection() {
        let outer = MemoryRegion::new(0x1000, 0x5000);
        let inner = MemoryRegion::new(0x2000, 0x3000);
        let straddling = MemoryRegion::new(0x4000, 0x6000);
        let disjoint = MemoryRegion::new(0x6000, 0x7000);

        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains(&outer));

        assert!(outer.intersects(&straddling));
        assert_eq!(
            outer.intersect(&straddling),
            Some(MemoryRegion::new(0x4000, 0x5000))
        );
        assert!(!outer.intersects(&disjoint));
        assert_eq!(outer.intersect(&disjoint), None);
    }

    #[rstest]
    // Exactly the threshold: one fragment.
    #[case(4096, 4096, vec![4096])]
    // One byte past: two fragments, the second one byte long.
    #[case(4097, 4096, vec![4096, 1])]
    #[case(10_000, 4096, vec![4096, 4096, 1808])]
    #[case(100, 4096, vec![100])]
    fn test_fragmentation(
        #[case] len: u64,
        #[case] max: usize,
        #[case] expected: Vec<usize>,
    ) {
        let region = MemoryRegion::new(0x1000, 0x1000 + len);
        let sizes: Vec<usize> = region.fragments(max).map(|f| f.len()).collect();
        assert_eq!(sizes, expected);
        assert_eq!(region.fragment_count(max), expected.len());

        // Fragments tile the region exactly.
        let mut cursor = region.start();
        for fragment in region.fragments(max) {
            assert_eq!(fragment.start(), cursor);
            cursor = fragment.end();
        }
        assert_eq!(cursor, region.end());
    }
}
