use std::{mem, ptr::NonNull};

use crate::{
    ALIGNMENT, LARGE_SCAN_LIMIT,
    header::{HEADER_SIZE, Header},
    list::Link,
    utils::align,
};

/// Registry entry for one large allocation.
///
/// Descriptors are small allocations of the pool itself, so large object
/// bookkeeping consumes pool capacity. A descriptor carved from the first
/// block keeps its place in the registry once the large memory goes back to
/// the system, with `alloc == None`, and waits to be reused. One carved from
/// any other block is unlinked instead and its own header released, so that
/// block can drain and be recycled.
///
/// ```text
///   registry head
///        |
/// +------v-------+      +--------------+      +--------------+
/// | Descriptor   | ---> | Descriptor   | ---> | Descriptor   |
/// | alloc: Some  |      | alloc: None  |      | alloc: Some  |
/// +------|-------+      +--------------+      +------|-------+
///        v                                           v
///  system region                               system region
/// ```
pub(crate) struct Descriptor {
    pub next: Link<Descriptor>,
    /// Header at the start of the system region, `None` for a free slot.
    pub alloc: Link<Header>,
    /// Length of the system region.
    pub len: usize,
    /// Header of the descriptor's own allocation when it lives outside the
    /// first block, `None` for a pinned slot.
    pub own: Link<Header>,
}

/// Bytes a descriptor takes from the pool, header excluded.
pub(crate) const DESCRIPTOR_SIZE: usize = mem::size_of::<Descriptor>();

/// Effective size of a descriptor allocation, header included.
pub(crate) const DESCRIPTOR_LEN: usize = align(HEADER_SIZE + DESCRIPTOR_SIZE, ALIGNMENT);

/// Singly linked list of [`Descriptor`], newest first.
pub(crate) struct LargeRegistry {
    head: Link<Descriptor>,
    len: usize,
}

impl LargeRegistry {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of linked descriptors, free slots included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Attaches `alloc` to a free descriptor among the first
    /// [`LARGE_SCAN_LIMIT`] ones. Returns `false` if none was free.
    pub fn reuse_slot(&mut self, alloc: NonNull<Header>, len: usize) -> bool {
        let mut current = self.head;

        for _ in 0..LARGE_SCAN_LIMIT {
            let Some(mut node) = current else {
                break;
            };

            unsafe {
                let descriptor = node.as_mut();
                if descriptor.alloc.is_none() {
                    descriptor.alloc = Some(alloc);
                    descriptor.len = len;
                    return true;
                }
                current = descriptor.next;
            }
        }

        false
    }

    /// Writes a new descriptor for `alloc` at `addr` and pushes it on the head.
    /// `own` is the header of the allocation holding the descriptor, `None` when
    /// it was carved from the first block.
    ///
    /// **SAFETY**: `addr` must be valid for writes of a [`Descriptor`], aligned,
    /// and stay valid until the descriptor is unlinked or the registry dropped.
    /// `own`, when set, must be the header in front of `addr`.
    pub unsafe fn push(
        &mut self,
        addr: NonNull<u8>,
        alloc: NonNull<Header>,
        len: usize,
        own: Link<Header>,
    ) {
        let node = addr.cast::<Descriptor>();

        unsafe {
            node.as_ptr().write(Descriptor {
                next: self.head,
                alloc: Some(alloc),
                len,
                own,
            });
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Detaches `alloc` from its descriptor and returns the region length to
    /// give back to the system. A pinned descriptor stays linked as a free
    /// slot. Any other is unlinked and its header marked released, after which
    /// the registry never touches its memory again.
    pub fn release(&mut self, alloc: NonNull<Header>) -> Option<usize> {
        let mut prev: Link<Descriptor> = None;
        let mut current = self.head;

        while let Some(mut node) = current {
            unsafe {
                let descriptor = node.as_mut();

                if descriptor.alloc != Some(alloc) {
                    prev = current;
                    current = descriptor.next;
                    continue;
                }

                descriptor.alloc = None;
                let len = descriptor.len;

                if let Some(mut own) = descriptor.own {
                    match prev {
                        Some(mut prev) => prev.as_mut().next = descriptor.next,
                        None => self.head = descriptor.next,
                    }
                    self.len -= 1;
                    own.as_mut().release();
                }

                return Some(len);
            }
        }

        None
    }

    /// Detaches every live allocation, yielding `(header, len)` pairs. Used at
    /// teardown, before the blocks holding the descriptors are gone.
    pub fn drain(&mut self) -> impl Iterator<Item = (NonNull<Header>, usize)> + '_ {
        let mut current = self.head;

        std::iter::from_fn(move || {
            loop {
                let mut node = current?;
                unsafe {
                    let descriptor = node.as_mut();
                    current = descriptor.next;
                    if let Some(alloc) = descriptor.alloc.take() {
                        return Some((alloc, descriptor.len));
                    }
                }
            }
        })
    }

    /// Number of descriptors holding a live allocation.
    pub fn live(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;

        while let Some(node) = current {
            unsafe {
                if node.as_ref().alloc.is_some() {
                    count += 1;
                }
                current = node.as_ref().next;
            }
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    struct Fixture {
        slots: Vec<MaybeUninit<Descriptor>>,
        headers: Vec<u64>,
        owners: Vec<u64>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            Self {
                slots: (0..n).map(|_| MaybeUninit::uninit()).collect(),
                headers: vec![0; n],
                owners: vec![0; n],
            }
        }

        fn owner(&mut self, i: usize) -> NonNull<Header> {
            NonNull::from(&mut self.owners[i]).cast()
        }

        fn slot(&mut self, i: usize) -> NonNull<u8> {
            NonNull::from(&mut self.slots[i]).cast()
        }

        fn header(&mut self, i: usize) -> NonNull<Header> {
            NonNull::from(&mut self.headers[i]).cast()
        }
    }

    #[test]
    fn push_then_release_keeps_slot_linked() {
        let mut fx = Fixture::new(3);
        let mut registry = LargeRegistry::new();

        unsafe {
            for i in 0..3 {
                let (slot, header) = (fx.slot(i), fx.header(i));
                registry.push(slot, header, 4096 * (i + 1), None);
            }
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.live(), 3);

        // Middle, head and tail of the list in turn.
        assert_eq!(registry.release(fx.header(1)), Some(8192));
        assert_eq!(registry.release(fx.header(2)), Some(12288));
        assert_eq!(registry.release(fx.header(0)), Some(4096));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.live(), 0);
        assert_eq!(registry.release(fx.header(0)), None);
    }

    #[test]
    fn reuse_takes_a_free_slot() {
        let mut fx = Fixture::new(3);
        let mut registry = LargeRegistry::new();

        unsafe {
            let (slot, header) = (fx.slot(0), fx.header(0));
            registry.push(slot, header, 4096, None);
        }
        assert!(!registry.reuse_slot(fx.header(1), 4096));

        registry.release(fx.header(0));
        assert!(registry.reuse_slot(fx.header(2), 6000));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.release(fx.header(2)), Some(6000));
    }

    #[test]
    fn reuse_scan_is_bounded() {
        let n = LARGE_SCAN_LIMIT + 2;
        let mut fx = Fixture::new(n + 1);
        let mut registry = LargeRegistry::new();

        unsafe {
            for i in 0..n {
                let (slot, header) = (fx.slot(i), fx.header(i));
                registry.push(slot, header, 4096, None);
            }
        }

        // Index 0 is the oldest descriptor, the last one reached by the scan.
        registry.release(fx.header(0));
        assert!(!registry.reuse_slot(fx.header(n), 4096));

        registry.release(fx.header(n - 1));
        assert!(registry.reuse_slot(fx.header(n), 4096));
    }

    #[test]
    fn drain_yields_only_live_allocations() {
        let mut fx = Fixture::new(3);
        let mut registry = LargeRegistry::new();

        unsafe {
            for i in 0..3 {
                let (slot, header) = (fx.slot(i), fx.header(i));
                registry.push(slot, header, 100 + i, None);
            }
        }
        registry.release(fx.header(1));

        let mut drained: Vec<usize> = registry.drain().map(|(_, len)| len).collect();
        drained.sort_unstable();

        assert_eq!(drained, vec![100, 102]);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn owned_descriptors_are_unlinked_and_released() {
        let mut fx = Fixture::new(4);
        let mut registry = LargeRegistry::new();

        unsafe {
            // Index 0 is pinned, the others live outside the first block.
            let (slot, header) = (fx.slot(0), fx.header(0));
            registry.push(slot, header, 100, None);
            for i in 1..4 {
                let (slot, header, owner) = (fx.slot(i), fx.header(i), fx.owner(i));
                registry.push(slot, header, 100 + i, Some(owner));
            }
        }
        assert_eq!(registry.len(), 4);

        // Middle, head and tail of the owned ones in turn.
        assert_eq!(registry.release(fx.header(2)), Some(102));
        assert_eq!(registry.len(), 3);
        assert!(unsafe { fx.owner(2).as_ref().is_released() });
        assert!(!unsafe { fx.owner(1).as_ref().is_released() });

        assert_eq!(registry.release(fx.header(3)), Some(103));
        assert_eq!(registry.release(fx.header(1)), Some(101));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live(), 1);

        // The pinned slot stays behind and is the one reused.
        assert_eq!(registry.release(fx.header(0)), Some(100));
        assert_eq!(registry.len(), 1);
        assert!(registry.reuse_slot(fx.header(3), 200));
        assert_eq!(registry.live(), 1);
    }
}
