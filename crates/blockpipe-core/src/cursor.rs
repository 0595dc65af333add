//! Block cursors and the per-stream pipeline state.

use serde::{Deserialize, Serialize};

/// A block position, identified by `(number, hash)`.
///
/// Two cursors with the same number but a different hash describe divergent
/// chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockCursor {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Unix timestamp of the block (seconds since epoch), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl BlockCursor {
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns `true` if both cursors point at the same block, ignoring the timestamp.
    pub fn same_block(&self, other: &BlockCursor) -> bool {
        self.number == other.number && self.hash == other.hash
    }

    /// Returns the next block to fetch (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.number + 1
    }
}

impl std::fmt::Display for BlockCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// State the engine owns for one running stream.
///
/// `rollback_chain` is the local memory used for fork resolution: recently
/// committed cursors in ascending block order, never reaching below the
/// finalized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Last committed block.
    pub cursor: BlockCursor,
    /// Recently committed blocks, oldest first.
    pub rollback_chain: Vec<BlockCursor>,
    /// Latest block the portal declared irreversible.
    pub finalized: Option<BlockCursor>,
}

impl PipelineState {
    pub fn new(cursor: BlockCursor) -> Self {
        Self {
            rollback_chain: vec![cursor.clone()],
            cursor,
            finalized: None,
        }
    }

    /// Record a committed batch.
    ///
    /// `blocks` must be in ascending order and above the current cursor. The
    /// finalized cursor only ever moves forward. Chain entries below the
    /// finalized block are pruned and at most `depth` entries are kept.
    pub fn commit<'a>(
        &mut self,
        blocks: impl IntoIterator<Item = &'a BlockCursor>,
        finalized: Option<&BlockCursor>,
        depth: usize,
    ) {
        for block in blocks {
            if block.number <= self.cursor.number && !self.rollback_chain.is_empty() {
                continue;
            }
            self.rollback_chain.push(block.clone());
            self.cursor = block.clone();
        }

        if let Some(f) = finalized {
            let newer = self
                .finalized
                .as_ref()
                .map_or(true, |current| f.number > current.number);
            if newer {
                self.finalized = Some(f.clone());
            }
        }

        self.prune(depth);
    }

    /// Roll the state back to `safe`: the cursor moves there and every chain
    /// entry above it is discarded.
    pub fn rewind_to(&mut self, safe: &BlockCursor) {
        self.rollback_chain.retain(|b| b.number < safe.number);
        self.rollback_chain.push(safe.clone());
        self.cursor = safe.clone();
    }

    fn prune(&mut self, depth: usize) {
        if let Some(finalized) = &self.finalized {
            let floor = finalized.number;
            // Keep the newest entry even when it is below finalization, it
            // anchors the parent hash of the next request.
            let last = self.rollback_chain.len().saturating_sub(1);
            let mut i = 0;
            self.rollback_chain.retain(|b| {
                let keep = b.number >= floor || i == last;
                i += 1;
                keep
            });
        }
        if self.rollback_chain.len() > depth {
            let excess = self.rollback_chain.len() - depth.max(1);
            self.rollback_chain.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(n: u64) -> BlockCursor {
        BlockCursor::new(n, format!("0x{n:x}"))
    }

    #[test]
    fn commit_advances_cursor_and_chain() {
        let mut state = PipelineState::new(c(100));
        let batch = vec![c(101), c(102), c(103)];
        state.commit(&batch, None, 100);
        assert_eq!(state.cursor, c(103));
        let numbers: Vec<_> = state.rollback_chain.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![100, 101, 102, 103]);
    }

    #[test]
    fn commit_prunes_below_finalized() {
        let mut state = PipelineState::new(c(100));
        let batch: Vec<_> = (101..=110).map(c).collect();
        state.commit(&batch, Some(&c(105)), 100);
        assert_eq!(state.finalized, Some(c(105)));
        assert_eq!(state.rollback_chain.first().unwrap().number, 105);
        assert_eq!(state.rollback_chain.last().unwrap().number, 110);
    }

    #[test]
    fn finalized_never_moves_backwards() {
        let mut state = PipelineState::new(c(100));
        state.commit(&[c(101)], Some(&c(90)), 100);
        state.commit(&[c(102)], Some(&c(80)), 100);
        assert_eq!(state.finalized, Some(c(90)));
    }

    #[test]
    fn chain_capped_at_depth() {
        let mut state = PipelineState::new(c(0));
        let batch: Vec<_> = (1..50).map(c).collect();
        state.commit(&batch, None, 10);
        assert_eq!(state.rollback_chain.len(), 10);
        assert_eq!(state.rollback_chain.last().unwrap().number, 49);
    }

    #[test]
    fn newest_entry_survives_finalization() {
        let mut state = PipelineState::new(c(10));
        state.commit(&[c(11), c(12)], Some(&c(500)), 100);
        assert_eq!(state.rollback_chain, vec![c(12)]);
    }

    #[test]
    fn rewind_truncates_chain() {
        let mut state = PipelineState::new(c(100));
        let batch: Vec<_> = (101..=110).map(c).collect();
        state.commit(&batch, None, 100);
        state.rewind_to(&c(104));
        assert_eq!(state.cursor.number, 104);
        assert_eq!(state.rollback_chain.last().unwrap().number, 104);
        assert_eq!(state.rollback_chain.len(), 5);
    }

    #[test]
    fn same_block_ignores_timestamp() {
        let a = c(7).with_timestamp(1);
        assert!(a.same_block(&c(7)));
        assert!(!a.same_block(&BlockCursor::new(7, "0xother")));
        assert_eq!(c(7).next_block(), 8);
    }
}
