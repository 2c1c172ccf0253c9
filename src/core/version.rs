//! Rolled header versions
//!
//! With version rolling the pool lets the miner flip the header version bits
//! selected by a mask. [`VersionSource`] enumerates those candidates once and
//! hands them out in rotation.

use rand::Rng;
use rand::seq::SliceRandom;

/// Mask bits used for rolling; wider masks are truncated to their lowest bits
pub const MAX_ROLLING_BITS: usize = 16;

/// Cyclic supply of candidate versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSource {
    versions: Vec<u32>,
    cursor: usize,
}

impl VersionSource {
    /// Enumerate `version` followed by every other setting of the mask bits,
    /// fewer set bits first.
    ///
    /// Mask bits already set in `version` are rolled like the others, so every
    /// candidate is distinct.
    pub fn new(version: u32, mask: u32) -> Self {
        let bits: Vec<u32> = (0..32u32)
            .filter(|&bit| mask & (1u32 << bit) != 0)
            .take(MAX_ROLLING_BITS)
            .collect();
        let rolling_mask = bits.iter().fold(0u32, |acc, &bit| acc | (1u32 << bit));
        let base = version & !rolling_mask;

        let mut subsets: Vec<u32> = (0u32..(1u32 << bits.len())).collect();
        subsets.sort_by_key(|subset| subset.count_ones());

        let mut versions = Vec::with_capacity(subsets.len());
        versions.push(version);
        for subset in subsets {
            let rolled = bits
                .iter()
                .enumerate()
                .filter(|(index, _)| subset & (1u32 << *index) != 0)
                .fold(0u32, |acc, (_, &bit)| acc | (1u32 << bit));
            let candidate = base | rolled;
            if candidate != version {
                versions.push(candidate);
            }
        }

        Self {
            versions,
            cursor: 0,
        }
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether there are no candidates
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Fill `dest` with the next candidates and return how many were written.
    ///
    /// Never repeats a candidate within one call; slots beyond the number of
    /// candidates are zeroed.
    pub fn retrieve(&mut self, dest: &mut [u32]) -> usize {
        let count = dest.len().min(self.versions.len());
        for slot in dest.iter_mut().take(count) {
            *slot = self.versions[self.cursor];
            self.cursor = (self.cursor + 1) % self.versions.len();
        }
        dest[count..].fill(0);
        count
    }

    /// Shuffle the candidate order and restart the rotation
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.versions.shuffle(rng);
        self.cursor = 0;
    }
}
