use std::ptr::NonNull;

use crate::{
    ALIGNMENT,
    block::{BLOCK_HEADER_SIZE, Block, ScanHint},
    list::Node,
    utils::align,
};

/// Verifies that every allocation carved from the candidate `node` was
/// released, in which case the block is marked verified and may be reused.
///
/// The scan resumes from the header where the previous attempt stopped,
/// because everything before it was already seen released. Walking stops on
/// the first header still in use (remembered for next time, its retry counter
/// bumped) or after exactly `objs` headers.
///
/// **SAFETY**: `node` must be a live block of the pool whose headers were all
/// written by the pool.
pub(crate) unsafe fn check_block_free(mut node: NonNull<Node<Block>>, traced: bool) -> bool {
    let block = unsafe { &mut node.as_mut().data };

    debug_assert!(block.is_candidate(), "scanning a block that is not a candidate");

    let ScanHint { mut offset, mut index } = block.hint.unwrap_or(ScanHint {
        offset: BLOCK_HEADER_SIZE,
        index: 0,
    });

    if traced {
        tracing::info!(
            block = ?node.as_ptr(),
            offset,
            index,
            objs = block.objs,
            "resuming recycling scan"
        );
    }

    while offset < block.cursor && index < block.objs {
        let mut header = unsafe { Block::header_at(node, offset) };
        let header = unsafe { header.as_mut() };

        if !header.is_released() {
            block.hint = Some(ScanHint { offset, index });

            if header.retry() {
                tracing::info!(
                    block = ?node.as_ptr(),
                    len = header.len,
                    "allocation keeps its block occupied"
                );
            }

            return false;
        }

        debug_assert!(header.len != 0, "zero length header while scanning");
        debug_assert!(!header.is_large(), "large header inside a block");

        offset = align(offset + header.len as usize, ALIGNMENT);
        index += 1;
    }

    debug_assert_eq!(index, block.objs, "scan ended before visiting every header");

    block.verify();

    true
}
