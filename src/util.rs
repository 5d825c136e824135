#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => { if cfg!(test) { println! { $($thing),* } } };
);


// A small deterministic generator for the runtime's seeded random
// stream and the allocation fuzzer. Quality doesn't matter much here;
// reproducibility from the seed does.
pub struct PseudoRandom {
    state: u64,
}

impl PseudoRandom {
    pub fn new(seed: u64) -> PseudoRandom {
        // Zero would get stuck; mix the seed so any input works.
        PseudoRandom {
            state: seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        // xorshift64* step.
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    // A value in [0, limit). A limit of zero yields zero.
    pub fn next_below(&mut self, limit: u64) -> u64 {
        if limit == 0 {
            0
        } else {
            self.next_u64() % limit
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_from_seed() {
        let mut a = PseudoRandom::new(42);
        let mut b = PseudoRandom::new(42);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut c = PseudoRandom::new(43);
        assert_ne!(a.next_u64(), c.next_u64());
    }

    #[test]
    fn test_next_below_bounds() {
        let mut random = PseudoRandom::new(7);
        for _ in 0..1000 {
            assert!(random.next_below(13) < 13);
        }
        assert_eq!(random.next_below(0), 0);
    }
}
