//! Fork resolution.
//!
//! Given locally remembered block histories and the portal's canonical
//! ancestry, find the newest block both sides agree on. The result is the
//! cursor the stream rewinds to. Resuming too early duplicates data and
//! resuming too late loses it.

use serde::{Deserialize, Serialize};

use crate::cursor::{BlockCursor, PipelineState};

/// One remembered snapshot of recently processed blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkHistory {
    pub rollback_chain: Vec<BlockCursor>,
    pub finalized: Option<BlockCursor>,
}

impl From<&PipelineState> for ForkHistory {
    fn from(state: &PipelineState) -> Self {
        Self {
            rollback_chain: state.rollback_chain.clone(),
            finalized: state.finalized.clone(),
        }
    }
}

/// Compute the safe resume cursor after a fork.
///
/// `histories` are ordered newest snapshot first; `previous_blocks` is the
/// portal's canonical ancestry in ascending order. Returns `None` when no
/// safe point exists above finalization, which the caller must treat as fatal.
///
/// Each history's chain is walked from its newest block down. A block whose
/// hash appears among the unconsumed portal blocks is the answer. Once the
/// portal blocks are exhausted the current local block is trusted as the fork
/// point, unless it lies below the recorded finalized block. After every check
/// the portal blocks at or above that height are consumed, across histories.
pub fn resolve_fork(histories: &[ForkHistory], previous_blocks: &[BlockCursor]) -> Option<BlockCursor> {
    let mut unconsumed: Vec<&BlockCursor> = previous_blocks.iter().collect();

    for history in histories {
        let mut chain: Vec<&BlockCursor> = history.rollback_chain.iter().collect();
        chain.sort_by(|a, b| b.number.cmp(&a.number));

        for block in chain {
            if let Some(found) = unconsumed.iter().find(|p| p.hash == block.hash) {
                return Some((*found).clone());
            }

            if unconsumed.is_empty() {
                if let Some(finalized) = &history.finalized {
                    if block.number < finalized.number {
                        return None;
                    }
                }
                return Some(block.clone());
            }

            unconsumed.retain(|p| p.number < block.number);
        }

        if let (Some(finalized), [last]) = (&history.finalized, unconsumed.as_slice()) {
            if last.hash == finalized.hash {
                return Some(finalized.clone());
            }
        }
    }

    None
}
