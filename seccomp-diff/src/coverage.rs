use serde::{Deserialize, Serialize};

const WORD_BITS: usize = u64::BITS as usize;

/// Set of instruction indices reached in one program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coverage {
    len: usize,
    words: Vec<u64>,
}

/// Serializable view of a [`Coverage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub instructions: usize,
    pub covered: usize,
    pub uncovered: Vec<usize>,
}

impl Coverage {
    pub fn new(len: usize) -> Self {
        Coverage {
            len,
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mark(&mut self, pc: usize) {
        debug_assert!(pc < self.len, "pc {} outside program of {}", pc, self.len);
        if let Some(word) = self.words.get_mut(pc / WORD_BITS) {
            *word |= 1 << (pc % WORD_BITS);
        }
    }

    pub fn is_covered(&self, pc: usize) -> bool {
        pc < self.len && self.words[pc / WORD_BITS] & (1 << (pc % WORD_BITS)) != 0
    }

    /// Add every instruction covered by `other`. Both must describe the same program.
    pub fn merge(&mut self, other: &Coverage) {
        assert_eq!(self.len, other.len, "merging coverage of different programs");
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= src;
        }
    }

    pub fn covered(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.covered() == self.len
    }

    pub fn uncovered(&self) -> Vec<usize> {
        (0..self.len).filter(|&pc| !self.is_covered(pc)).collect()
    }

    pub fn summary(&self) -> CoverageSummary {
        CoverageSummary {
            instructions: self.len,
            covered: self.covered(),
            uncovered: self.uncovered(),
        }
    }
}
