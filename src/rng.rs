/// Linear congruential generator behind every randomized choice of the optimizer.
///
/// Identical seeds reproduce identical node orders, candidate shuffles and
/// loop limits, which is what makes a whole run reproducible.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

const MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const INCREMENT: u64 = 1_442_695_040_888_963_407;

impl Lcg {
    pub fn new(seed: u64) -> Self {
        let mut rng = Self { state: 0 };
        rng.seed(seed);
        rng
    }

    pub fn seed(&mut self, seed: u64) {
        self.state = seed;
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT);
        self.state
    }

    /// High half of the state; the low bits of an LCG cycle with short periods.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform double in `[0, 1)` built from the top 53 bits.
    #[inline]
    pub fn next_double(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Uniform integer in `[0, bound)`. Always consumes one draw; `bound <= 1` yields 0.
    #[inline]
    pub fn rand_int(&mut self, bound: u32) -> u32 {
        ((self.next_u32() as u64 * bound as u64) >> 32) as u32
    }

    /// Fills `out` with a Fisher-Yates permutation of `0..out.len()`.
    pub fn randomized_index_vector(&mut self, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = i as u32;
        }
        self.shuffle(out);
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        let size = items.len();
        for i in 0..size.saturating_sub(1) {
            let j = i + self.rand_int((size - i) as u32) as usize;
            items.swap(i, j);
        }
    }
}

/// Mixes a uid into a well-spread 64-bit value (SplitMix64 finalizer).
pub fn mix_seed(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
