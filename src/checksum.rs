use crc32fast::Hasher;

/// Incremental CRC32 over a file frame's `identifier ‖ content`.
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Hasher,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Current value, without consuming the accumulator
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }

    /// One-shot checksum of a complete buffer
    pub fn of(data: &[u8]) -> u32 {
        let mut checksum = Self::new();
        checksum.update(data);
        checksum.finalize()
    }
}
