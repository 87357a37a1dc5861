//! Nilsimsa — streaming 256-bit locality-sensitive hash.
//!
//! Bytes are absorbed through a 5-byte sliding window; for each new byte,
//! eight trigrams drawn from the window feed a fixed substitution table and
//! increment one of 256 accumulators.  Finalisation thresholds the
//! accumulators against their mean: output bit `i` is set iff
//! `acc[i] > total / 256`.
//!
//! Similar inputs produce digests at small Hamming distance; the ordering
//! engine works on the raw [`distance`] throughout.  The folded similarity
//! score `128 - distance / 2` is available as [`similarity`].

/// Digest as four little-endian 64-bit words; bit `i` of the digest is
/// `hash[i >> 6] >> (i & 63) & 1`.
pub type NilsimsaDigest = [u64; 4];

// Substitution table for the trigram accumulator mapping.
#[rustfmt::skip]
const TT53: [u8; 256] = [
    0x02, 0xD6, 0x9E, 0x6F, 0xF9, 0x1D, 0x04, 0xAB, 0xD0, 0x22, 0x16, 0x1F,
    0xD8, 0x73, 0xA1, 0xAC, 0x3B, 0x70, 0x62, 0x96, 0x1E, 0x6E, 0x8F, 0x39,
    0x9D, 0x05, 0x14, 0x4A, 0xA6, 0xBE, 0xAE, 0x0E, 0xCF, 0xB9, 0x9C, 0x9A,
    0xC7, 0x68, 0x13, 0xE1, 0x2D, 0xA4, 0xEB, 0x51, 0x8D, 0x64, 0x6B, 0x50,
    0x23, 0x80, 0x03, 0x41, 0xEC, 0xBB, 0x71, 0xCC, 0x7A, 0x86, 0x7F, 0x98,
    0xF2, 0x36, 0x5E, 0xEE, 0x8E, 0xCE, 0x4F, 0xB8, 0x32, 0xB6, 0x5F, 0x59,
    0xDC, 0x1B, 0x31, 0x4C, 0x7B, 0xF0, 0x63, 0x01, 0x6C, 0xBA, 0x07, 0xE8,
    0x12, 0x77, 0x49, 0x3C, 0xDA, 0x46, 0xFE, 0x2F, 0x79, 0x1C, 0x9B, 0x30,
    0xE3, 0x00, 0x06, 0x7E, 0x2E, 0x0F, 0x38, 0x33, 0x21, 0xAD, 0xA5, 0x54,
    0xCA, 0xA7, 0x29, 0xFC, 0x5A, 0x47, 0x69, 0x7D, 0xC5, 0x95, 0xB5, 0xF4,
    0x0B, 0x90, 0xA3, 0x81, 0x6D, 0x25, 0x55, 0x35, 0xF5, 0x75, 0x74, 0x0A,
    0x26, 0xBF, 0x19, 0x5C, 0x1A, 0xC6, 0xFF, 0x99, 0x5D, 0x84, 0xAA, 0x66,
    0x3E, 0xAF, 0x78, 0xB3, 0x20, 0x43, 0xC1, 0xED, 0x24, 0xEA, 0xE6, 0x3F,
    0x18, 0xF3, 0xA0, 0x42, 0x57, 0x08, 0x53, 0x60, 0xC3, 0xC0, 0x83, 0x40,
    0x82, 0xD7, 0x09, 0xBD, 0x44, 0x2A, 0x67, 0xA8, 0x93, 0xE0, 0xC2, 0x56,
    0x9F, 0xD9, 0xDD, 0x85, 0x15, 0xB4, 0x8A, 0x27, 0x28, 0x92, 0x76, 0xDE,
    0xEF, 0xF8, 0xB2, 0xB7, 0xC9, 0x3D, 0x45, 0x94, 0x4B, 0x11, 0x0D, 0x65,
    0xD5, 0x34, 0x8B, 0x91, 0x0C, 0xFA, 0x87, 0xE9, 0x7C, 0x5B, 0xB1, 0x4D,
    0xE5, 0xD4, 0xCB, 0x10, 0xA2, 0x17, 0x89, 0xBC, 0xDB, 0xB0, 0xE2, 0x97,
    0x88, 0x52, 0xF7, 0x48, 0xD3, 0x61, 0x2C, 0x3A, 0x2B, 0xD1, 0x8C, 0xFB,
    0xF1, 0xCD, 0xE4, 0x6A, 0xE7, 0xA9, 0xFD, 0xC4, 0x37, 0xC8, 0xD2, 0xF6,
    0xDF, 0x58, 0x72, 0x4E,
];

#[inline]
fn tran3(a: u8, b: u8, c: u8, n: u8) -> u8 {
    (TT53[(a.wrapping_add(n)) as usize] ^ TT53[b as usize].wrapping_mul(n + n + 1))
        .wrapping_add(TT53[(c ^ TT53[n as usize]) as usize])
}

/// Streaming hasher state.
#[derive(Clone)]
pub struct Nilsimsa {
    acc: [u64; 256],
    // Last four window bytes, most recent first.
    w: [u8; 4],
    count: u64,
}

impl Default for Nilsimsa {
    fn default() -> Self {
        Nilsimsa {
            acc: [0; 256],
            w: [0; 4],
            count: 0,
        }
    }
}

impl Nilsimsa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let [mut w1, mut w2, mut w3, mut w4] = self.w;
        let mut seen = self.count;

        for &w0 in data {
            // Trigram set grows with the window until 5 bytes are available.
            if seen > 1 {
                self.acc[tran3(w0, w1, w2, 0) as usize] += 1;
                if seen > 2 {
                    self.acc[tran3(w0, w1, w3, 1) as usize] += 1;
                    self.acc[tran3(w0, w2, w3, 2) as usize] += 1;
                    if seen > 3 {
                        self.acc[tran3(w0, w1, w4, 3) as usize] += 1;
                        self.acc[tran3(w0, w2, w4, 4) as usize] += 1;
                        self.acc[tran3(w0, w3, w4, 5) as usize] += 1;
                        self.acc[tran3(w4, w1, w0, 6) as usize] += 1;
                        self.acc[tran3(w4, w3, w0, 7) as usize] += 1;
                    }
                }
            }

            w4 = w3;
            w3 = w2;
            w2 = w1;
            w1 = w0;
            seen += 1;
        }

        self.w = [w1, w2, w3, w4];
        self.count = seen;
    }

    /// Threshold the accumulators into the 256-bit digest.
    pub fn finalize(&self) -> NilsimsaDigest {
        let total: u64 = match self.count {
            0..=2 => 0,
            3 => 1,
            4 => 4,
            n => 8 * n - 28,
        };
        let threshold = total / 256;

        let mut hash = [0u64; 4];
        for (i, &a) in self.acc.iter().enumerate() {
            if a > threshold {
                hash[i >> 6] |= 1u64 << (i & 0x3F);
            }
        }
        hash
    }
}

/// One-shot digest of a byte slice.
pub fn digest(data: &[u8]) -> NilsimsaDigest {
    let mut h = Nilsimsa::new();
    h.update(data);
    h.finalize()
}

/// Hamming distance between two digests; 0 for identical, up to 256.
#[inline]
pub fn distance(a: &NilsimsaDigest, b: &NilsimsaDigest) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Folded similarity score in `[0, 128]`; 128 means identical.
#[inline]
pub fn similarity(a: &NilsimsaDigest, b: &NilsimsaDigest) -> u32 {
    128 - distance(a, b) / 2
}
