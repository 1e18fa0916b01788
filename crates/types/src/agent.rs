//! An agent: a named, ordered pipeline of blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockSequenceError, validate_block_sequence};

/// A named pipeline and the anchor for its variables' ownership scope.
///
/// Blocks are owned positionally and have no identity outside their agent.
/// The mutation helpers renumber the sequence so `block_number` stays
/// contiguous from 1 without callers managing numbers by hand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Agent {
            id: id.into(),
            name: name.into(),
            blocks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn block_by_id(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn block_by_number(&self, number: u32) -> Option<&Block> {
        self.blocks.iter().find(|block| block.block_number == number)
    }

    /// Appends `block` at the end of the pipeline, assigning the next number.
    pub fn push_block(&mut self, mut block: Block) {
        block.block_number = self.blocks.len() as u32 + 1;
        self.blocks.push(block);
    }

    /// Inserts `block` at zero-based position `at` (clamped to the end) and
    /// renumbers the whole sequence.
    pub fn insert_block(&mut self, at: usize, block: Block) {
        let at = at.min(self.blocks.len());
        self.blocks.insert(at, block);
        self.renumber();
    }

    /// Removes the block with the given id, renumbering the remainder.
    pub fn remove_block(&mut self, id: &str) -> Option<Block> {
        let position = self.blocks.iter().position(|block| block.id == id)?;
        let removed = self.blocks.remove(position);
        self.renumber();
        Some(removed)
    }

    /// Checks the contiguous/ascending numbering invariant.
    pub fn validate(&self) -> Result<(), BlockSequenceError> {
        validate_block_sequence(&self.blocks)
    }

    fn renumber(&mut self) {
        for (index, block) in self.blocks.iter_mut().enumerate() {
            block.block_number = index as u32 + 1;
        }
    }
}
