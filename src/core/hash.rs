//! SHA256d helpers

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

/// SHA256 initial chaining value
const SHA256_IV: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

/// SHA256 applied twice
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Compression state after the first 64 header bytes.
///
/// Words are serialized little-endian, the order the chip loads them in.
pub fn midstate(block: &[u8; 64]) -> [u8; 32] {
    let mut state = SHA256_IV;
    sha2::compress256(&mut state, &[GenericArray::clone_from_slice(block)]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Block 125552
    const HEADER: &str = "0100000081cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000\
                          e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122b\
                          c7f5d74df2b9441a42a14695";

    #[test]
    fn test_double_sha256_block_header() {
        let header = hex::decode(HEADER).unwrap();
        let hash = double_sha256(&header);
        assert_eq!(
            hex::encode(hash),
            "1dbd981fe6985776b644b173a4d0385ddc1aa2a829688d1e0000000000000000"
        );
    }

    #[test]
    fn test_midstate() {
        let header = hex::decode(HEADER).unwrap();
        let block: [u8; 64] = header[..64].try_into().unwrap();
        assert_eq!(
            hex::encode(midstate(&block)),
            "93c524951367c505ba69e616a010282d376ee807daa9562f69ce5bcd2dda787a"
        );
    }
}
