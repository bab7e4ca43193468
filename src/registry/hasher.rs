//! SHA-256 whose intermediate state can be persisted between requests.
//!
//! Chunked uploads may be spread across many requests and process restarts,
//! so the running hash is kept as plain data (chaining value, pending partial
//! block, total length) and serialized next to the upload session.

use serde::{Deserialize, Serialize};
use sha2::digest::generic_array::GenericArray;

use super::Digest;

const BLOCK_SIZE: usize = 64;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashState {
    state: [u32; 8],
    buffer: Vec<u8>,
    length: u64,
}

impl Default for HashState {
    fn default() -> Self {
        Self {
            state: INITIAL_STATE,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            length: 0,
        }
    }
}

fn compress(state: &mut [u32; 8], block: &[u8]) {
    sha2::compress256(state, std::slice::from_ref(GenericArray::from_slice(block)));
}

impl HashState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length += data.len() as u64;

        if !self.buffer.is_empty() {
            let take = (BLOCK_SIZE - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() < BLOCK_SIZE {
                return;
            }
            compress(&mut self.state, &self.buffer);
            self.buffer.clear();
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            compress(&mut self.state, block);
        }
        self.buffer.extend_from_slice(blocks.remainder());
    }

    /// Digest of everything fed so far. The state itself is left untouched.
    pub fn finish(&self) -> Digest {
        let mut state = self.state;
        let mut tail = self.buffer.clone();
        tail.push(0x80);
        while tail.len() % BLOCK_SIZE != BLOCK_SIZE - 8 {
            tail.push(0);
        }
        tail.extend_from_slice(&self.length.wrapping_mul(8).to_be_bytes());
        for block in tail.chunks_exact(BLOCK_SIZE) {
            compress(&mut state, block);
        }

        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        Digest::from_sha256(&out)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Restore a persisted state. The pending block must be shorter than a
    /// block and agree with the total length.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let state: Self = serde_json::from_str(raw)?;
        if state.buffer.len() >= BLOCK_SIZE || state.buffer.len() as u64 != state.length % BLOCK_SIZE as u64 {
            return Err(serde::de::Error::custom(format!(
                "pending block of {} bytes does not match length {}",
                state.buffer.len(),
                state.length
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            HashState::new().finish().as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_matches_one_shot_digest_across_block_boundaries() {
        for len in [1, 55, 56, 63, 64, 65, 119, 128, 1000] {
            let data = sample(len);
            let mut state = HashState::new();
            state.update(&data);
            assert_eq!(state.finish(), Digest::of(&data), "len {len}");
        }
    }

    #[test]
    fn test_split_updates_survive_serialization() {
        let data = sample(777);
        for split in [0, 1, 63, 64, 65, 300, 777] {
            let mut state = HashState::new();
            state.update(&data[..split]);
            let mut restored = HashState::from_json(&state.to_json().unwrap()).unwrap();
            restored.update(&data[split..]);
            assert_eq!(restored.finish(), Digest::of(&data), "split {split}");
            assert_eq!(restored.len(), 777);
        }
    }

    #[test]
    fn test_corrupt_state_is_rejected() {
        let mut state = HashState::new();
        state.update(&sample(10));
        let mut value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();

        value["buffer"] = serde_json::json!(vec![0u8; 100]);
        assert!(HashState::from_json(&value.to_string()).is_err());

        value["buffer"] = serde_json::json!(vec![0u8; 9]);
        assert!(HashState::from_json(&value.to_string()).is_err());

        value["buffer"] = serde_json::json!(sample(10));
        assert!(HashState::from_json(&value.to_string()).is_ok());
    }
}
