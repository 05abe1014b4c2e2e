//! Payload masking ([RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3)).
use rand::{rngs::StdRng, RngCore, SeedableRng};

/// XORs `buf` with the repeating 4-byte `key`, starting at key offset 0.
///
/// Masking and unmasking are the same operation.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // every full chunk consumed a whole key, so the tail starts at key offset 0 again
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

/// Source of masking keys owned by a single encoder.
///
/// Keys do not need to be cryptographically strong, only unpredictable to intermediaries,
/// so a seeded `StdRng` is used instead of reaching for the OS on every frame.
pub(crate) struct MaskKeys {
    rng: StdRng,
}

impl MaskKeys {
    pub(crate) fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    #[inline]
    pub(crate) fn next_key(&mut self) -> [u8; 4] {
        self.rng.next_u32().to_ne_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    #[test]
    fn test_matches_bytewise_for_all_lengths() {
        let key = [0x6d, 0xb6, 0xb2, 0x80];
        for len in 0..=37 {
            let data: Vec<u8> = (0..len).map(|i| (i * 13) as u8).collect();

            let mut expected = data.clone();
            mask_bytewise(&mut expected, key);

            let mut actual = data.clone();
            apply_mask(&mut actual, key);

            assert_eq!(actual, expected, "length {len}");
        }
    }

    #[test]
    fn test_mask_twice_is_identity() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, key);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_unaligned_slices() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let buffer: Vec<u8> = (0..20).collect();

        for offset in 0..4 {
            let mut data = buffer.clone();
            apply_mask(&mut data[offset..], key);
            for (i, byte) in data[offset..].iter().enumerate() {
                assert_eq!(*byte, buffer[offset + i] ^ key[i % 4]);
            }
        }
    }

    #[test]
    fn test_keys_vary() {
        let mut keys = MaskKeys::new();
        let drawn: Vec<[u8; 4]> = (0..16).map(|_| keys.next_key()).collect();
        assert!(drawn.iter().any(|key| *key != drawn[0]));
    }
}
