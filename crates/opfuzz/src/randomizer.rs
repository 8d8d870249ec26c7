//! Shape-preserving replacement values for operands.

use rand::Rng;

use crate::config::FuzzerConfig;
use crate::operand::Operand;

/// Upper bound on draws when resampling for a value that differs from the
/// original. Only reached for domains of (almost) one element.
pub const MAX_RESAMPLE_ATTEMPTS: usize = 64;

/// ASCII letters, digits and punctuation.
const ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Draws with `draw` until the result differs from `original`, giving up
/// after [`MAX_RESAMPLE_ATTEMPTS`].
fn resample<T: PartialEq, R: Rng + ?Sized>(
    rng: &mut R,
    original: &T,
    mut draw: impl FnMut(&mut R) -> T,
) -> T {
    let mut candidate = draw(rng);
    for _ in 1..MAX_RESAMPLE_ATTEMPTS {
        if &candidate != original {
            break;
        }
        candidate = draw(rng);
    }
    candidate
}

/// Bounds used when generating replacement values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Randomizer {
    pub min_str_len: usize,
    pub max_str_len: usize,
    pub min_int: i64,
    pub max_int: i64,
    pub min_oparg: u32,
    pub max_oparg: u32,
}

impl From<&FuzzerConfig> for Randomizer {
    fn from(config: &FuzzerConfig) -> Self {
        Self {
            min_str_len: config.min_str_len,
            max_str_len: config.max_str_len,
            min_int: config.min_int,
            max_int: config.max_int,
            min_oparg: config.min_oparg,
            max_oparg: config.max_oparg,
        }
    }
}

impl Default for Randomizer {
    fn default() -> Self {
        Self::from(&FuzzerConfig::default())
    }
}

impl Randomizer {
    /// Random printable string with a length inside the configured bounds.
    pub fn string<R: Rng + ?Sized>(&self, rng: &mut R, original: &str) -> String {
        if self.max_str_len == 0 {
            return String::new();
        }
        let (min, max) = (self.min_str_len, self.max_str_len);
        resample(rng, &original.to_string(), |rng| {
            let len = rng.gen_range(min..=max);
            (0..len)
                .map(|_| {
                    let pos = rng.gen_range(0..ALPHABET.len());
                    char::from(ALPHABET.get(pos).copied().unwrap_or(b'_'))
                })
                .collect()
        })
    }

    pub fn integer<R: Rng + ?Sized>(&self, rng: &mut R, original: i64) -> i64 {
        integer_in(rng, original, self.min_int, self.max_int)
    }

    /// Random encoded operand in `lower..=upper`, different from `original`.
    pub fn oparg<R: Rng + ?Sized>(&self, rng: &mut R, original: u32, lower: u32, upper: u32) -> u32 {
        if lower >= upper {
            return lower;
        }
        resample(rng, &original, |rng| rng.gen_range(lower..=upper))
    }

    /// Random encoded operand over the full configured range.
    pub fn any_oparg<R: Rng + ?Sized>(&self, rng: &mut R, original: u32) -> u32 {
        self.oparg(rng, original, self.min_oparg, self.max_oparg)
    }

    /// Replacement of the same shape as `value`. Values without a strategy
    /// (`None`, booleans, floats, bytes, code) come back unchanged.
    pub fn operand<R: Rng + ?Sized>(&self, rng: &mut R, value: &Operand) -> Operand {
        match value {
            Operand::Str(s) => Operand::Str(self.string(rng, s)),
            Operand::Int(i) => Operand::Int(self.integer(rng, *i)),
            Operand::Tuple(items) => {
                Operand::Tuple(items.iter().map(|item| self.operand(rng, item)).collect())
            }
            Operand::FrozenSet(items) => {
                let randomized: Vec<Operand> =
                    items.iter().map(|item| self.operand(rng, item)).collect();
                Operand::frozen_set(randomized)
            }
            other => other.clone(),
        }
    }
}

fn integer_in<R: Rng + ?Sized>(rng: &mut R, original: i64, lower: i64, upper: i64) -> i64 {
    if lower >= upper {
        return lower;
    }
    resample(rng, &original, |rng| rng.gen_range(lower..=upper))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_string_differs_and_respects_bounds() {
        let mut rng = rng();
        let randomizer = Randomizer {
            min_str_len: 2,
            max_str_len: 5,
            ..Default::default()
        };
        for _ in 0..200 {
            let s = randomizer.string(&mut rng, "ab");
            assert_ne!(s, "ab");
            assert!((2..=5).contains(&s.len()));
            assert!(s.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_integer_differs() {
        let mut rng = rng();
        let randomizer = Randomizer {
            min_int: 0,
            max_int: 1,
            ..Default::default()
        };
        for _ in 0..100 {
            assert_eq!(randomizer.integer(&mut rng, 0), 1);
            assert_eq!(randomizer.integer(&mut rng, 1), 0);
        }
    }

    #[test]
    fn test_single_value_domains_terminate() {
        let mut rng = rng();
        let randomizer = Randomizer {
            min_str_len: 0,
            max_str_len: 0,
            min_int: 3,
            max_int: 3,
            ..Default::default()
        };
        assert_eq!(randomizer.string(&mut rng, ""), "");
        assert_eq!(randomizer.integer(&mut rng, 3), 3);
        assert_eq!(randomizer.oparg(&mut rng, 4, 4, 4), 4);
        assert_eq!(resample(&mut rng, &1u8, |_| 1u8), 1);
    }

    #[test]
    fn test_oparg_stays_in_range() {
        let mut rng = rng();
        let randomizer = Randomizer::default();
        for _ in 0..100 {
            let oparg = randomizer.oparg(&mut rng, 3, 0, 11);
            assert!(oparg <= 11);
            assert_ne!(oparg, 3);
        }
    }

    #[test]
    fn test_composites_keep_shape() {
        let mut rng = rng();
        let randomizer = Randomizer::default();
        let value = Operand::Tuple(vec![
            Operand::from("a"),
            Operand::Tuple(vec![Operand::Int(1), Operand::None]),
        ]);
        match randomizer.operand(&mut rng, &value) {
            Operand::Tuple(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], Operand::Str(s) if s != "a"));
                match &items[1] {
                    Operand::Tuple(inner) => {
                        assert!(matches!(inner[0], Operand::Int(i) if i != 1));
                        assert_eq!(inner[1], Operand::None);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }

        let set = Operand::frozen_set([Operand::Int(1), Operand::Int(2)]);
        assert!(matches!(
            randomizer.operand(&mut rng, &set),
            Operand::FrozenSet(_)
        ));
    }

    #[test]
    fn test_values_without_strategy_pass_through() {
        let mut rng = rng();
        let randomizer = Randomizer::default();
        for value in [Operand::None, Operand::Bool(true), Operand::Float(-0.0)] {
            assert_eq!(randomizer.operand(&mut rng, &value), value);
        }
    }
}
