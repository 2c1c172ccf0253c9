//! Work handed over by the pool layer
//!
//! A [`Work`] carries everything needed to build block headers for any
//! extranonce2: the coinbase halves, merkle branches and header fields, plus
//! the share target and the channel shares go back on. The pipeline clones it
//! on receipt and never writes back.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::channel::Sender;

use super::hash::double_sha256;
use super::target::Target;
use super::version::VersionSource;
use crate::error::{Error, Result};

/// Size of a block header
pub const HEADER_SIZE: usize = 80;

/// Widest extranonce2 the pipeline can roll
pub const MAX_EXTRANONCE2_SIZE: usize = 8;

/// Read the ntime field of a wire-order header
pub fn header_ntime(header: &[u8; HEADER_SIZE]) -> u32 {
    LittleEndian::read_u32(&header[68..72])
}

/// A share for the pool layer to encode and send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    /// Pool job the share belongs to
    pub job_id: Arc<str>,
    /// Extranonce2 the header was built with
    pub extranonce2: u64,
    /// Header timestamp
    pub ntime: u32,
    /// Winning nonce
    pub nonce: u32,
    /// Rolled version bits, zero without version rolling
    pub version_mask: u32,
}

/// A pool job as the pipeline sees it
#[derive(Debug, Clone)]
pub struct Work {
    /// Pool job id
    pub job_id: Arc<str>,
    /// Previous block hash in header byte order
    pub prev_hash: [u8; 32],
    /// Coinbase bytes before the extranonces
    pub coinbase1: Vec<u8>,
    /// Coinbase bytes after the extranonces
    pub coinbase2: Vec<u8>,
    /// Pool-assigned extranonce1
    pub extranonce1: Vec<u8>,
    /// Width of extranonce2 in bytes
    pub extranonce2_size: usize,
    /// Merkle branches, in header byte order
    pub merkle_branches: Vec<[u8; 32]>,
    /// Base header version
    pub version: u32,
    /// Whether the pool accepts rolled versions
    pub version_rolling: bool,
    /// Bits the pool allows to roll
    pub version_mask: u32,
    /// Candidate versions
    pub versions: VersionSource,
    /// Compact network target
    pub nbits: u32,
    /// Header timestamp
    pub ntime: u32,
    /// Share target
    pub target: Target,
    /// Channel shares are written to; owned by the pool layer
    pub submit: Sender<Submit>,
}

impl Work {
    /// Create work without version rolling and an empty extranonce1
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<Arc<str>>,
        prev_hash: [u8; 32],
        coinbase1: Vec<u8>,
        coinbase2: Vec<u8>,
        version: u32,
        nbits: u32,
        ntime: u32,
        target: Target,
        submit: Sender<Submit>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            prev_hash,
            coinbase1,
            coinbase2,
            extranonce1: Vec::new(),
            extranonce2_size: 4,
            merkle_branches: Vec::new(),
            version,
            version_rolling: false,
            version_mask: 0,
            versions: VersionSource::new(version, 0),
            nbits,
            ntime,
            target,
            submit,
        }
    }

    /// Set the extranonce1 and extranonce2 width
    pub fn with_extranonce(mut self, extranonce1: Vec<u8>, extranonce2_size: usize) -> Self {
        self.extranonce1 = extranonce1;
        self.extranonce2_size = extranonce2_size;
        self
    }

    /// Set the merkle branches
    pub fn with_merkle_branches(mut self, branches: Vec<[u8; 32]>) -> Self {
        self.merkle_branches = branches;
        self
    }

    /// Enable version rolling over `mask`
    pub fn with_version_rolling(mut self, mask: u32) -> Self {
        self.version_rolling = mask != 0;
        self.version_mask = mask;
        self.versions = VersionSource::new(self.version, mask);
        self
    }

    /// Check the fields the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(Error::invalid_work("empty job id"));
        }
        if self.extranonce2_size == 0 || self.extranonce2_size > MAX_EXTRANONCE2_SIZE {
            return Err(Error::invalid_work(format!(
                "extranonce2 size {} outside 1..={}",
                self.extranonce2_size, MAX_EXTRANONCE2_SIZE
            )));
        }
        if self.version == 0 {
            return Err(Error::invalid_work("zero header version"));
        }
        Ok(())
    }

    /// Mask selecting the extranonce2 bits the pool gave us
    pub fn extranonce2_mask(&self) -> u64 {
        match self.extranonce2_size {
            0 => 0,
            size if size >= MAX_EXTRANONCE2_SIZE => u64::MAX,
            size => u64::MAX >> (64 - size * 8),
        }
    }

    /// Coinbase transaction for `extranonce2`.
    ///
    /// Extranonce2 is written big-endian over its configured width, matching
    /// how it is submitted back as hex.
    pub fn coinbase(&self, extranonce2: u64) -> Vec<u8> {
        let width = self.extranonce2_size.min(MAX_EXTRANONCE2_SIZE);
        let encoded = extranonce2.to_be_bytes();

        let mut coinbase = Vec::with_capacity(
            self.coinbase1.len() + self.extranonce1.len() + width + self.coinbase2.len(),
        );
        coinbase.extend_from_slice(&self.coinbase1);
        coinbase.extend_from_slice(&self.extranonce1);
        coinbase.extend_from_slice(&encoded[MAX_EXTRANONCE2_SIZE - width..]);
        coinbase.extend_from_slice(&self.coinbase2);
        coinbase
    }

    /// Merkle root for `extranonce2`
    pub fn merkle_root(&self, extranonce2: u64) -> [u8; 32] {
        let mut root = double_sha256(&self.coinbase(extranonce2));
        let mut pair = [0u8; 64];
        for branch in &self.merkle_branches {
            pair[..32].copy_from_slice(&root);
            pair[32..].copy_from_slice(branch);
            root = double_sha256(&pair);
        }
        root
    }

    /// Wire-order 80-byte header with a zero nonce
    pub fn header(&self, extranonce2: u64) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], self.version);
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&self.merkle_root(extranonce2));
        LittleEndian::write_u32(&mut header[68..72], self.ntime);
        LittleEndian::write_u32(&mut header[72..76], self.nbits);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn sample_work() -> Work {
        let (submit, _rx) = unbounded();
        Work::new(
            "job-1",
            [0x11; 32],
            vec![0x01, 0x02],
            vec![0x03, 0x04],
            0x2000_0000,
            0x1703_4e8a,
            0x6512_3456,
            Target::max(),
            submit,
        )
        .with_extranonce(vec![0xaa, 0xbb], 4)
    }

    #[test]
    fn test_extranonce2_mask() {
        let mut work = sample_work();
        assert_eq!(work.extranonce2_mask(), 0xffff_ffff);
        work.extranonce2_size = 8;
        assert_eq!(work.extranonce2_mask(), u64::MAX);
        work.extranonce2_size = 2;
        assert_eq!(work.extranonce2_mask(), 0xffff);
    }

    #[test]
    fn test_coinbase_layout() {
        let work = sample_work();
        assert_eq!(
            work.coinbase(0x0102_0304),
            vec![0x01, 0x02, 0xaa, 0xbb, 0x01, 0x02, 0x03, 0x04, 0x03, 0x04]
        );
    }

    #[test]
    fn test_merkle_root_folds_branches() {
        let work = sample_work();
        let leaf = double_sha256(&work.coinbase(5));
        assert_eq!(work.merkle_root(5), leaf);

        let branch = [0x22; 32];
        let work = work.with_merkle_branches(vec![branch]);
        let mut pair = Vec::from(leaf);
        pair.extend_from_slice(&branch);
        assert_eq!(work.merkle_root(5), double_sha256(&pair));
    }

    #[test]
    fn test_header_layout() {
        let work = sample_work();
        let header = work.header(9);
        assert_eq!(&header[0..4], &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(&header[4..36], &[0x11; 32]);
        assert_eq!(&header[36..68], &work.merkle_root(9));
        assert_eq!(header_ntime(&header), 0x6512_3456);
        assert_eq!(&header[72..76], &[0x8a, 0x4e, 0x03, 0x17]);
        assert_eq!(&header[76..80], &[0, 0, 0, 0]);
        assert_ne!(work.header(9)[36..68], work.header(10)[36..68]);
    }

    #[test]
    fn test_validate() {
        let work = sample_work();
        assert!(work.validate().is_ok());

        let mut bad = work.clone();
        bad.extranonce2_size = 9;
        assert!(matches!(bad.validate(), Err(Error::InvalidWork(_))));

        let mut bad = work;
        bad.job_id = Arc::from("");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_version_rolling_flag() {
        let work = sample_work().with_version_rolling(0x1fff_e000);
        assert!(work.version_rolling);
        assert_eq!(work.versions.len(), 1 << 16);

        let work = sample_work().with_version_rolling(0);
        assert!(!work.version_rolling);
    }
}
