//! Checksums for buffer contents and back-end blocks.

/// Seed folded into every block checksum so a written all-zero payload is
/// distinguishable from a never-written block.
const BLOCK_SEED: u16 = 0x5EED;

/// 16-bit XOR fold of a block payload, stored in the block trailer.
pub fn block_checksum(payload: &[u8]) -> u16 {
    let mut acc = BLOCK_SEED;
    let mut chunks = payload.chunks_exact(2);
    for pair in &mut chunks {
        acc ^= u16::from_le_bytes([pair[0], pair[1]]);
        acc = acc.rotate_left(1);
    }
    if let [last] = chunks.remainder() {
        acc ^= u16::from(*last);
    }
    acc
}

/// Fletcher-32 over buffer contents, kept in the tag.
pub fn buffer_checksum(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0xFFFF;
    let mut sum2: u32 = 0xFFFF;

    // 359 words keeps both sums below 2^32 before reduction.
    for block in data.chunks(718) {
        let mut words = block.chunks_exact(2);
        for w in &mut words {
            sum1 += u32::from(u16::from_le_bytes([w[0], w[1]]));
            sum2 += sum1;
        }
        if let [last] = words.remainder() {
            sum1 += u32::from(*last);
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
        sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
    sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
    (sum2 << 16) | sum1
}
