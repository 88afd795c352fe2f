//! Per-sequence block tables layered over `BlockPool` (§4.2): allocation on
//! growth, copy-on-write forking for sibling sequences, and release on
//! preemption/completion.

use std::collections::HashMap;

use runner_common::Result;

use crate::block_pool::{BlockId, BlockPool};
use crate::sequence::SequenceId;

pub struct BlockManager {
    block_size: usize,
    pool: BlockPool,
    tables: HashMap<SequenceId, Vec<BlockId>>,
}

impl BlockManager {
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        Self { block_size, pool: BlockPool::new(total_blocks), tables: HashMap::new() }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.pool.free_blocks()
    }

    pub fn total_blocks(&self) -> usize {
        self.pool.total_blocks()
    }

    fn blocks_for(&self, n_tokens: usize) -> usize {
        (n_tokens + self.block_size - 1) / self.block_size.max(1)
    }

    pub fn can_allocate(&self, n_tokens: usize) -> bool {
        self.blocks_for(n_tokens) <= self.pool.free_blocks()
    }

    pub fn block_table(&self, seq_id: SequenceId) -> &[BlockId] {
        self.tables.get(&seq_id).map(|t| t.as_slice()).unwrap_or(&[])
    }

    /// Ensures `seq_id`'s block table has enough blocks for `n_tokens` total
    /// tokens, allocating new blocks as needed.
    pub fn allocate_for(&mut self, seq_id: SequenceId, n_tokens: usize) -> Result<()> {
        let needed = self.blocks_for(n_tokens);
        let table = self.tables.entry(seq_id).or_insert_with(Vec::new);
        if needed <= table.len() {
            return Ok(());
        }
        let to_allocate = needed - table.len();
        let mut allocated = Vec::with_capacity(to_allocate);
        for _ in 0..to_allocate {
            match self.pool.allocate() {
                Ok(id) => allocated.push(id),
                Err(err) => {
                    for id in allocated {
                        self.pool.release(id);
                    }
                    return Err(err);
                }
            }
        }
        table.extend(allocated);
        Ok(())
    }

    /// Shares `parent`'s block table with `child` via refcount bump — no
    /// copy happens until a write lands on a shared block (COW).
    pub fn fork(&mut self, parent: SequenceId, child: SequenceId) {
        let parent_table = self.tables.get(&parent).cloned().unwrap_or_default();
        for &block_id in &parent_table {
            self.pool.retain(block_id);
        }
        self.tables.insert(child, parent_table);
    }

    /// Performs a copy-on-write split of `seq_id`'s last block if it is
    /// currently shared with another sequence, returning
    /// `Some((old_block, new_block))`. The caller (`Worker`) physically
    /// copies block contents between the two ids; this method only updates
    /// pool/table bookkeeping.
    pub fn cow_last_block(&mut self, seq_id: SequenceId) -> Result<Option<(BlockId, BlockId)>> {
        let last = match self.tables.get(&seq_id).and_then(|t| t.last().copied()) {
            Some(id) => id,
            None => return Ok(None),
        };
        if self.pool.refcount(last) <= 1 {
            return Ok(None);
        }
        let new_block = self.pool.allocate()?;
        self.pool.release(last);
        if let Some(table) = self.tables.get_mut(&seq_id) {
            *table.last_mut().unwrap() = new_block;
        }
        Ok(Some((last, new_block)))
    }

    /// Physically frees now-unneeded trailing blocks after a sequence's
    /// token count shrinks, e.g. a speculative rejection truncating
    /// previously-proposed tokens — freeing the slots outright rather than
    /// just moving a length cursor (open question, §9).
    pub fn truncate_to(&mut self, seq_id: SequenceId, n_tokens: usize) {
        let needed = self.blocks_for(n_tokens);
        if let Some(table) = self.tables.get_mut(&seq_id) {
            while table.len() > needed {
                let block_id = table.pop().unwrap();
                self.pool.release(block_id);
            }
        }
    }

    pub fn release(&mut self, seq_id: SequenceId) {
        if let Some(table) = self.tables.remove(&seq_id) {
            for block_id in table {
                self.pool.release(block_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_common::RunnerError;

    #[test]
    fn allocate_for_grows_table_and_consumes_pool() {
        let mut mgr = BlockManager::new(16, 4);
        mgr.allocate_for(1, 20).unwrap(); // 2 blocks
        assert_eq!(mgr.block_table(1).len(), 2);
        assert_eq!(mgr.free_blocks(), 2);
    }

    #[test]
    fn allocate_for_is_idempotent_within_same_block_count() {
        let mut mgr = BlockManager::new(16, 4);
        mgr.allocate_for(1, 10).unwrap();
        mgr.allocate_for(1, 15).unwrap(); // still 1 block
        assert_eq!(mgr.block_table(1).len(), 1);
    }

    #[test]
    fn out_of_blocks_when_pool_exhausted() {
        let mut mgr = BlockManager::new(16, 1);
        mgr.allocate_for(1, 16).unwrap();
        let err = mgr.allocate_for(2, 16);
        assert!(matches!(err, Err(RunnerError::OutOfBlocks { .. })));
    }

    #[test]
    fn fork_shares_blocks_until_cow_split() {
        let mut mgr = BlockManager::new(16, 4);
        mgr.allocate_for(1, 16).unwrap();
        mgr.fork(1, 2);
        assert_eq!(mgr.block_table(1), mgr.block_table(2));
        assert_eq!(mgr.free_blocks(), 3);

        let split = mgr.cow_last_block(2).unwrap();
        assert!(split.is_some());
        assert_ne!(mgr.block_table(1)[0], mgr.block_table(2)[0], "writer got its own block");
    }

    #[test]
    fn release_returns_all_blocks() {
        let mut mgr = BlockManager::new(16, 4);
        mgr.allocate_for(1, 32).unwrap();
        mgr.release(1);
        assert_eq!(mgr.free_blocks(), 4);
    }

    #[test]
    fn truncate_to_physically_frees_trailing_blocks() {
        let mut mgr = BlockManager::new(16, 4);
        mgr.allocate_for(1, 48).unwrap(); // 3 blocks
        assert_eq!(mgr.free_blocks(), 1);
        mgr.truncate_to(1, 17); // 2 blocks needed
        assert_eq!(mgr.block_table(1).len(), 2);
        assert_eq!(mgr.free_blocks(), 2);
    }
}
