//! Seeded xorshift64* stream for weight initialization and training samples.
//!
//! Not cryptographically secure; only reproducibility matters here.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves zero
        let state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    /// Fills `out` with uniform samples from `[low, high)`.
    pub fn fill_range_f32(&mut self, out: &mut [f32], low: f32, high: f32) {
        for v in out {
            *v = self.gen_range_f32(low, high);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn unit_samples_stay_in_range() {
        let mut rng = Prng::new(0);
        for _ in 0..10_000 {
            let v = rng.next_f32_01();
            assert!((0.0..1.0).contains(&v));
            let r = rng.gen_range_f32(-1.0, 1.0);
            assert!((-1.0..1.0).contains(&r));
        }
    }
}
