//! Payload masking, RFC 6455 Section 5.3.
//!
//! Byte `i` of the payload is XORed with `key[i % 4]`. Applying the same key
//! twice restores the input, so one routine serves both directions.

/// XORs `buf` in place with `key`, starting at key offset 0.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // every full chunk consumed the key exactly once, so the tail restarts at offset 0
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}
