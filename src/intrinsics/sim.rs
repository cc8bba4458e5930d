//! Host model of the device random number generator.
//!
//! The hardware PRNG is a xoroshiro128+ stream per worker. This model
//! produces the same kind of stream and applies the exact bit-to-float
//! mapping the code generator emits for `rand(f32)`, so host execution and
//! device execution agree on the value range.

#[derive(Debug, Clone)]
pub struct DeviceRng {
    s0: u64,
    s1: u64,
}

impl DeviceRng {
    /// Seed both state words from `seed` with splitmix64, which never yields
    /// the all-zero state.
    pub fn new(seed: u64) -> Self {
        let mut state = seed;
        let s0 = splitmix64(&mut state);
        let s1 = splitmix64(&mut state);
        Self { s0, s1 }
    }

    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.s0;
        let mut s1 = self.s1;
        let result = s0.wrapping_add(s1);
        s1 ^= s0;
        self.s0 = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.s1 = s1.rotate_left(37);
        result
    }

    /// `urand32`: the high half of the next 64-bit draw.
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    pub fn next_f32(&mut self) -> f32 {
        uniform_f32_from_bits(self.next_u32())
    }
}

/// Map 32 random bits onto `[0, 1)`.
///
/// Only the top 24 bits are used; every result is an exact multiple of
/// 2^-24 and the largest is `1 - 2^-24`.
pub fn uniform_f32_from_bits(bits: u32) -> f32 {
    (bits >> 8) as f32 * (1.0 / 16_777_216.0)
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
