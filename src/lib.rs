//! Region based memory pool.
//!
//! A [`Pool`] hands out short lived, variable sized allocations in bulk. Small
//! requests are bump allocated from a chain of blocks and their release is
//! only recorded; a block goes back into service once a recycling scan proves
//! everything in it was released. Requests above the pool threshold go
//! straight to the system and are tracked in a registry so that dropping the
//! pool gives everything back at once.
//!
//! ```text
//!  Pool
//!   |  blocks (chain)                                  current
//!   |                                                     |
//! +-v--------------+      +----------------+      +-------v--------+
//! | Block (head)   | ---> | Block          | ---> | Block          |
//! | hdr|obj|hdr|...|      | hdr|obj|...    |      | hdr|obj|  free |
//! +----------------+      +----------------+      +----------------+
//!   |
//!   |  large registry (descriptors live inside the blocks)
//!   v
//! Descriptor ---> Descriptor ---> system region
//! ```

use std::{
    mem,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    block::{BLOCK_HEADER_SIZE, Block},
    header::{Header, effective_size},
    large::{DESCRIPTOR_LEN, DESCRIPTOR_SIZE, LargeRegistry},
    list::{List, Node},
    utils::{align, align_down},
};

mod block;
mod config;
mod error;
mod header;
mod kernel;
mod large;
mod list;
mod recycle;
#[cfg(test)]
mod testing;
mod utils;

pub use crate::{
    config::PoolConfig,
    error::PoolError,
    header::HEADER_SIZE,
    kernel::{Kernel, SystemMemory},
};

/// Alignment of every header and of every small allocation.
pub const ALIGNMENT: usize = mem::size_of::<usize>();

/// Alignment a [`SystemMemory`] has to give to the regions it returns.
pub const POOL_ALIGNMENT: usize = 16;

/// Smallest size a pool or a growth block may have: the block metadata plus
/// room for two large object descriptors.
pub const MIN_POOL_SIZE: usize = align(
    BLOCK_HEADER_SIZE + 2 * (HEADER_SIZE + DESCRIPTOR_SIZE),
    POOL_ALIGNMENT,
);

/// Hard ceiling on the effective size of a small allocation.
pub const MAX_ALLOC_FROM_POOL: usize = 4095;

/// Failed growth events after which a block is skipped and may be recycled.
pub const FAILURE_LIMIT: usize = 4;

/// Descriptors inspected for a free slot before a new one is allocated.
pub const LARGE_SCAN_LIMIT: usize = 4;

/// Saturation value of the per allocation retry counter.
pub const RETRY_LIMIT: u8 = 63;

/// Initial size used by [`PoolConfig::default`].
pub const DEFAULT_POOL_SIZE: usize = 16384;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`Pool::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The memory went back to the system right away (large allocation), or
    /// there was nothing to free.
    ReclaimedImmediately,
    /// The allocation is marked released, its block is reclaimed later.
    ReclaimDeferred,
}

/// A small allocation: its block and its header.
type Carved = (NonNull<Node<Block>>, NonNull<Header>);

#[derive(Debug, Clone, Copy)]
enum Placement {
    Small {
        block: NonNull<Node<Block>>,
        generation: u64,
    },
    Large,
}

/// Handle to memory obtained from a [`Pool`].
///
/// It can not be copied: [`Pool::free`] consumes it, so a span can not be
/// released twice nor read after it was released. Dropping a handle without
/// freeing it keeps the memory reserved until the pool is destroyed.
#[derive(Debug)]
pub struct Allocation {
    pool: u64,
    header: NonNull<Header>,
    size: usize,
    placement: Placement,
}

impl Allocation {
    /// Requested size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the allocation was requested with a size of zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the allocation bypassed the blocks.
    #[inline]
    pub fn is_large(&self) -> bool {
        matches!(self.placement, Placement::Large)
    }
}

/// Snapshot of a pool's footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks in the chain, the first one included.
    pub blocks: usize,
    /// Bytes held by the chain.
    pub block_bytes: usize,
    /// Large allocations currently live.
    pub large_live: usize,
    /// Registry descriptors, free slots included.
    pub large_slots: usize,
    /// Growth events served by a recycled block instead of new memory.
    pub recycled_blocks: usize,
}

/// Region based allocator. See the crate documentation for the layout.
///
/// A pool has a single owner and is not meant to be shared between threads.
pub struct Pool<M: SystemMemory = Kernel> {
    id: u64,
    memory: M,
    /// Size of the first block.
    main_size: usize,
    /// Size of every block added by growth.
    sub_size: usize,
    /// Largest effective size served from the blocks.
    max: usize,
    traced: bool,
    blocks: List<Block>,
    /// First block searched by small allocations, earlier ones are assumed full.
    current: NonNull<Node<Block>>,
    large: LargeRegistry,
    generation: u64,
    recycled: usize,
}

impl Pool {
    /// Creates a pool backed by [`Kernel`].
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_memory(config, Kernel)
    }

    /// Creates a pool of `initial_size` bytes growing by `growth_step` whose
    /// small allocations are capped at `max_alloc`. `0` leaves a parameter
    /// unconfigured.
    pub fn create(
        initial_size: usize,
        growth_step: usize,
        max_alloc: usize,
    ) -> Result<Self, PoolError> {
        Self::new(
            PoolConfig::new(initial_size)
                .growth_step(growth_step)
                .max_alloc(max_alloc),
        )
    }
}

impl<M: SystemMemory> Pool<M> {
    /// Creates a pool that takes its regions from `memory`.
    pub fn with_memory(config: PoolConfig, mut memory: M) -> Result<Self, PoolError> {
        let mut size = config.initial_size;

        if size < MIN_POOL_SIZE {
            tracing::warn!(
                requested = size,
                minimum = MIN_POOL_SIZE,
                "pool size below the minimum, clamping"
            );
            size = MIN_POOL_SIZE;
        }

        let sub_size = if config.growth_step > MIN_POOL_SIZE {
            config.growth_step
        } else {
            size
        };

        let max = threshold(size, sub_size, config.max_alloc);

        let addr = memory
            .request_memory(size)
            .ok_or(PoolError::Allocation { requested: size })?;

        let mut blocks = List::new();
        // The first block is never recycled.
        let head = unsafe { blocks.append(Block::new(size, false, 0), addr) };

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(pool = id, size, growth_step = sub_size, threshold = max, "pool created");

        Ok(Self {
            id,
            memory,
            main_size: size,
            sub_size,
            max,
            traced: config.traced,
            blocks,
            current: head,
            large: LargeRegistry::new(),
            generation: 0,
            recycled: 0,
        })
    }

    /// Allocates `size` bytes. The content is whatever the memory held before.
    pub fn alloc(&mut self, size: usize) -> Result<Allocation, PoolError> {
        let len = effective_size(size).ok_or(PoolError::OutOfMemory { requested: size })?;

        let (header, placement) = if len <= self.max {
            let (block, header) = self.alloc_small(len)?;
            let generation = unsafe { block.as_ref().data.generation };
            (header, Placement::Small { block, generation })
        } else {
            (self.alloc_large(len)?, Placement::Large)
        };

        Ok(Allocation {
            pool: self.id,
            header,
            size,
            placement,
        })
    }

    /// Same as [`Pool::alloc`] with the span zero filled.
    pub fn calloc(&mut self, size: usize) -> Result<Allocation, PoolError> {
        let allocation = self.alloc(size)?;
        self.bytes_mut(&allocation).fill(0);
        Ok(allocation)
    }

    /// Releases an allocation. `None` is accepted and does nothing.
    ///
    /// Large allocations go back to the system immediately. Their descriptor
    /// stays as a reusable slot when it lives in the first block and is
    /// released with them otherwise. Small ones are only marked released, their
    /// block is reclaimed once a recycling scan finds it entirely released.
    pub fn free(&mut self, allocation: impl Into<Option<Allocation>>) -> Release {
        let Some(allocation) = allocation.into() else {
            return Release::ReclaimedImmediately;
        };

        self.check_owner(&allocation);

        let mut header = allocation.header;

        match allocation.placement {
            Placement::Small { .. } => {
                unsafe { header.as_mut().release() };
                Release::ReclaimDeferred
            }
            Placement::Large => {
                debug_assert!(unsafe { header.as_ref().is_large() });

                match self.large.release(header) {
                    Some(len) => {
                        unsafe {
                            header.as_mut().release();
                            self.memory.return_memory(header.cast(), len);
                        }
                        Release::ReclaimedImmediately
                    }
                    None => {
                        tracing::warn!(pool = self.id, "large allocation missing from the registry");
                        Release::ReclaimDeferred
                    }
                }
            }
        }
    }

    /// Address of the first byte of the allocation.
    pub fn as_ptr(&self, allocation: &Allocation) -> NonNull<u8> {
        self.check_owner(allocation);
        Header::payload(allocation.header)
    }

    /// The allocation's bytes.
    pub fn bytes(&self, allocation: &Allocation) -> &[u8] {
        let ptr = self.as_ptr(allocation);
        // Regions come initialized from `SystemMemory` and only the owner of
        // the handle writes to this span.
        unsafe { slice::from_raw_parts(ptr.as_ptr(), allocation.size) }
    }

    /// The allocation's bytes, writable.
    pub fn bytes_mut(&mut self, allocation: &Allocation) -> &mut [u8] {
        let ptr = self.as_ptr(allocation);
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), allocation.size) }
    }

    /// Largest effective size (header included) served from the blocks.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.max
    }

    /// Size of the first block.
    #[inline]
    pub fn main_size(&self) -> usize {
        self.main_size
    }

    /// Size of every block added when the pool grows.
    #[inline]
    pub fn growth_step(&self) -> usize {
        self.sub_size
    }

    /// Current footprint: blocks, large allocations and recycling count.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            blocks: self.blocks.len(),
            block_bytes: self.blocks.iter().map(|block| block.size).sum(),
            large_live: self.large.live(),
            large_slots: self.large.len(),
            recycled_blocks: self.recycled,
        }
    }

    /// Gives every region back to the system. Dropping the pool does the same.
    pub fn destroy(self) {}

    fn check_owner(&self, allocation: &Allocation) {
        assert_eq!(
            allocation.pool, self.id,
            "allocation used with a pool that did not create it"
        );

        if let Placement::Small { block, generation } = allocation.placement {
            debug_assert_eq!(
                unsafe { block.as_ref().data.generation },
                generation,
                "allocation outlived its block"
            );
        }
    }

    /// Bump allocates `len` bytes from `current` or any later block, growing
    /// the chain when none has room.
    fn alloc_small(&mut self, len: usize) -> Result<Carved, PoolError> {
        let mut current = Some(self.current);

        while let Some(mut node) = current {
            unsafe {
                if let Some(offset) = node.as_mut().data.carve(len) {
                    let header = Header::write(Block::base(node).add(offset), len, false);
                    return Ok((node, header));
                }
                current = node.as_ref().next;
            }
        }

        self.grow(len)
    }

    /// Adds a block to the tail of the chain and carves `len` bytes from it.
    ///
    /// The block reuses the storage of the second block of the chain when it
    /// is a verified recycling candidate, otherwise it is new system memory.
    /// Every block from `current` to the old tail failed this request: those
    /// failing too often are skipped from now on by moving `current` past them.
    fn grow(&mut self, len: usize) -> Result<Carved, PoolError> {
        let (addr, size) = match self.take_recycled() {
            Some(region) => region,
            None => {
                let size = self.sub_size;
                let addr = self
                    .memory
                    .request_memory(size)
                    .ok_or(PoolError::OutOfMemory { requested: size })?;

                if self.traced {
                    tracing::info!(pool = self.id, block = ?addr, size, "new block");
                } else {
                    tracing::debug!(pool = self.id, size, "new block");
                }

                (addr, size)
            }
        };

        let mut next_current = Some(self.current);
        let mut walk = Some(self.current);

        while let Some(mut node) = walk {
            unsafe {
                let next = node.as_ref().next;
                if node.as_mut().data.record_failure() {
                    next_current = next;
                }
                walk = next;
            }
        }

        self.generation += 1;
        let mut node = unsafe { self.blocks.append(Block::new(size, true, self.generation), addr) };
        self.current = next_current.unwrap_or(node);

        let offset = unsafe { node.as_mut().data.carve(len) };
        debug_assert!(offset.is_some(), "new block can not hold a small allocation");
        let offset = offset.ok_or(PoolError::OutOfMemory { requested: len })?;

        let header = unsafe { Header::write(Block::base(node).add(offset), len, false) };

        Ok((node, header))
    }

    /// Unlinks the second block of the chain if it is a recycling candidate
    /// the scan proves entirely released, returning its storage.
    fn take_recycled(&mut self) -> Option<(NonNull<u8>, usize)> {
        let head = self.blocks.first()?;
        let candidate = unsafe { head.as_ref().next }?;

        unsafe {
            if !candidate.as_ref().data.is_candidate()
                || !recycle::check_block_free(candidate, self.traced)
            {
                return None;
            }

            debug_assert_ne!(candidate, self.current, "recycling the current block");

            let size = candidate.as_ref().data.size;
            self.blocks.remove(candidate);
            self.recycled += 1;

            if self.traced {
                tracing::info!(pool = self.id, block = ?candidate.as_ptr(), "block recycled");
            } else {
                tracing::debug!(pool = self.id, size, "block recycled");
            }

            Some((Block::base(candidate), size))
        }
    }

    /// Takes `len` bytes straight from the system and records them in the
    /// registry, reusing a free descriptor when one is close to the head.
    ///
    /// New descriptors are carved from the first block while it has room, so
    /// they never keep a recyclable block occupied. Otherwise they take the
    /// regular small path and are released together with their large memory.
    fn alloc_large(&mut self, len: usize) -> Result<NonNull<Header>, PoolError> {
        let addr = self
            .memory
            .request_memory(len)
            .ok_or(PoolError::OutOfMemory { requested: len })?;

        let header = unsafe { Header::write(addr, len, true) };

        if self.large.reuse_slot(header, len) {
            return Ok(header);
        }

        let (slot, own) = match self.carve_head(DESCRIPTOR_LEN) {
            Some(slot) => (slot, None),
            None => match self.alloc_small(DESCRIPTOR_LEN) {
                Ok((_, slot)) => (slot, Some(slot)),
                Err(err) => {
                    unsafe { self.memory.return_memory(addr, len) };
                    return Err(err);
                }
            },
        };

        unsafe { self.large.push(Header::payload(slot), header, len, own) };

        Ok(header)
    }

    /// Carves `len` bytes from the first block, which is never recycled.
    fn carve_head(&mut self, len: usize) -> Option<NonNull<Header>> {
        let mut head = self.blocks.first()?;

        unsafe {
            let offset = head.as_mut().data.carve(len)?;
            Some(Header::write(Block::base(head).add(offset), len, false))
        }
    }
}

impl<M: SystemMemory> Drop for Pool<M> {
    fn drop(&mut self) {
        let stats = self.stats();

        for (header, len) in self.large.drain() {
            unsafe { self.memory.return_memory(header.cast(), len) };
        }

        // Descriptors lived in the blocks, so blocks go last.
        for node in self.blocks.nodes() {
            unsafe {
                let size = node.as_ref().data.size;
                self.memory.return_memory(Block::base(node), size);
            }
        }

        tracing::debug!(
            pool = self.id,
            blocks = stats.blocks,
            occupied = stats.block_bytes,
            large = stats.large_live,
            "pool destroyed"
        );
    }
}

/// Small/large threshold: the smallest of the cap, the usable size of any
/// block and [`MAX_ALLOC_FROM_POOL`], aligned down, and never below what a
/// registry descriptor needs.
fn threshold(main_size: usize, sub_size: usize, cap: usize) -> usize {
    let usable = main_size.min(sub_size) - BLOCK_HEADER_SIZE;

    let mut max = usable.min(MAX_ALLOC_FROM_POOL);
    if cap != 0 {
        max = max.min(cap);
    }

    align_down(max, ALIGNMENT).max(DESCRIPTOR_LEN)
}
