use std::{mem, ptr::NonNull};

use crate::{
    ALIGNMENT, FAILURE_LIMIT,
    header::Header,
    list::Node,
    utils::align,
};

/// Overhead of a block's metadata in bytes. We need to add the overhead
/// introduced by our [`Node`] structure since every `Block` is a node of the
/// pool's chain. Rounded so the first allocation header is aligned.
pub const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Node<Block>>(), ALIGNMENT);

/// Recycling lifecycle of a block.
///
/// Transitions only go `Active -> RecycleCandidate -> Verified -> Active`. The
/// last one happens when the verified storage is reinitialised as a new block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Regular block, allocations may be carved from it.
    Active,
    /// Failed too many requests in a row, it may be entirely released.
    RecycleCandidate,
    /// The recycling scan confirmed every allocation inside was released.
    Verified,
}

/// Where the previous recycling scan stopped: the first header that was
/// still in use and how many headers precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanHint {
    pub offset: usize,
    pub index: usize,
}

/// Metadata of one contiguous region of the pool. It lives at the very start
/// of the region it describes, wrapped in a [`Node`] of the pool's chain.
///
/// ```text
/// +---------------------+ <------+
/// |     Node<Block>     |        | -> BLOCK_HEADER_SIZE
/// +---------------------+ <------+
/// | Header | payload    |        |
/// +---------------------+        |
/// | Header | payload    |        | -> bump allocated, each span aligned
/// +---------------------+ <- cursor
/// |       unused        |        |
/// +---------------------+ <- end (size)
/// ```
///
/// All positions are byte offsets from the start of the node, so the region
/// start is the only pointer a block needs.
pub(crate) struct Block {
    /// Total size of the region, which is also the end boundary.
    pub size: usize,
    /// Bump pointer: offset where the next allocation may start.
    pub cursor: usize,
    /// Number of headers carved in `[BLOCK_HEADER_SIZE, cursor)`.
    pub objs: usize,
    /// Consecutive growth events this block could not satisfy.
    pub failed: u8,
    /// Whether the block may ever be recycled. The first block never is.
    pub eligible: bool,
    pub state: BlockState,
    pub hint: Option<ScanHint>,
    /// Changes every time the storage is reinitialised, handles compare it.
    pub generation: u64,
}

impl Block {
    pub fn new(size: usize, eligible: bool, generation: u64) -> Self {
        debug_assert!(size > BLOCK_HEADER_SIZE, "block too small for its metadata");

        Self {
            size,
            cursor: BLOCK_HEADER_SIZE,
            objs: 0,
            failed: 0,
            eligible,
            state: BlockState::Active,
            hint: None,
            generation,
        }
    }

    /// Bump allocates `len` bytes (header included). Returns the offset of the
    /// new header or `None` when the block has no room left.
    pub fn carve(&mut self, len: usize) -> Option<usize> {
        debug_assert!(self.cursor <= self.size, "cursor beyond the end of the block");

        let offset = align(self.cursor, ALIGNMENT);

        if offset > self.size || self.size - offset < len {
            return None;
        }

        self.cursor = offset + len;
        self.objs += 1;

        Some(offset)
    }

    /// Counts one more growth event this block could not satisfy. Returns
    /// `true` once the block failed more than [`FAILURE_LIMIT`] times, after
    /// marking it a recycling candidate if it is allowed to be recycled.
    ///
    /// The count includes the current event, so a block turns candidate on its
    /// fifth failure. tcpcopy's `tc_palloc_block` tests the counter before
    /// bumping it (`failed++ > 4`) and waits for the sixth. Its walk also stops
    /// before the old tail, while [`crate::Pool`] counts the tail too.
    pub fn record_failure(&mut self) -> bool {
        self.failed = self.failed.saturating_add(1);

        if usize::from(self.failed) <= FAILURE_LIMIT {
            return false;
        }

        if self.eligible && self.state == BlockState::Active {
            self.state = BlockState::RecycleCandidate;
        }

        true
    }

    pub fn is_candidate(&self) -> bool {
        self.state == BlockState::RecycleCandidate
    }

    /// Only the recycling scan calls this.
    pub fn verify(&mut self) {
        debug_assert_eq!(
            self.state,
            BlockState::RecycleCandidate,
            "only candidates can be verified"
        );
        self.state = BlockState::Verified;
    }

    /// Start of the region the block describes.
    #[inline]
    pub fn base(node: NonNull<Node<Block>>) -> NonNull<u8> {
        node.cast()
    }

    /// Header at `offset` bytes from the block start.
    ///
    /// **SAFETY**: `offset` must be the position of a header carved from this block.
    #[inline]
    pub unsafe fn header_at(node: NonNull<Node<Block>>, offset: usize) -> NonNull<Header> {
        unsafe { Self::base(node).add(offset).cast() }
    }
}
