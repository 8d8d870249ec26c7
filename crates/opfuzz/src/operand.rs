//! Logical operand values and their type- and sign-aware constant keys.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::unit::CompiledUnit;

/// The logical value an instruction carries before encoding.
#[derive(Debug, Clone)]
pub enum Operand {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Operand>),
    FrozenSet(Vec<Operand>),
    /// A nested compiled unit, loaded as a constant when creating a function.
    Code(Arc<CompiledUnit>),
}

/// Key identifying a constant-pool slot.
///
/// Values that compare equal but must stay distinct (`0.0` and `-0.0`,
/// `1` and `True`, tuples holding such values) map to different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstKey {
    None,
    Bool(bool),
    Int(i64),
    Float {
        value: u64,
        negative: bool,
    },
    Complex {
        re: u64,
        im: u64,
        re_negative: bool,
        im_negative: bool,
    },
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<ConstKey>),
    FrozenSet(BTreeSet<ConstKey>),
    Code(u64),
}

/// Bits of `value` with both zeros collapsed, so that the sign is carried
/// only by the separate sign flag of the key.
fn float_value_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// Derives the constant-pool key of `value`. Composite values embed the keys
/// of their elements.
pub fn const_key(value: &Operand) -> ConstKey {
    match value {
        Operand::None => ConstKey::None,
        Operand::Bool(b) => ConstKey::Bool(*b),
        Operand::Int(i) => ConstKey::Int(*i),
        Operand::Float(f) => ConstKey::Float {
            value: float_value_bits(*f),
            negative: f.is_sign_negative(),
        },
        Operand::Complex { re, im } => ConstKey::Complex {
            re: float_value_bits(*re),
            im: float_value_bits(*im),
            re_negative: re.is_sign_negative(),
            im_negative: im.is_sign_negative(),
        },
        Operand::Str(s) => ConstKey::Str(s.clone()),
        Operand::Bytes(b) => ConstKey::Bytes(b.clone()),
        Operand::Tuple(items) => ConstKey::Tuple(items.iter().map(const_key).collect()),
        Operand::FrozenSet(items) => ConstKey::FrozenSet(items.iter().map(const_key).collect()),
        Operand::Code(unit) => ConstKey::Code(unit.id),
    }
}

impl Operand {
    pub fn key(&self) -> ConstKey {
        const_key(self)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Operand::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Builds a frozen set, dropping elements whose key is already present.
    pub fn frozen_set(items: impl IntoIterator<Item = Operand>) -> Operand {
        let mut seen = BTreeSet::new();
        let unique = items
            .into_iter()
            .filter(|item| seen.insert(item.key()))
            .collect();
        Operand::FrozenSet(unique)
    }
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Operand {}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Operand::Str(value.to_string())
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Int(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => write!(f, "None"),
            Operand::Bool(true) => write!(f, "True"),
            Operand::Bool(false) => write!(f, "False"),
            Operand::Int(i) => write!(f, "{i}"),
            Operand::Float(v) => write!(f, "{v:?}"),
            Operand::Complex { re, im } => write!(f, "({re:?}{im:+?}j)"),
            Operand::Str(s) => write!(f, "{s:?}"),
            Operand::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Operand::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Operand::FrozenSet(items) => {
                write!(f, "frozenset({{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}})")
            }
            Operand::Code(unit) => write!(f, "<code {} #{}>", unit.name, unit.id),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_zero_keys_differ() {
        assert_ne!(const_key(&Operand::Float(0.0)), const_key(&Operand::Float(-0.0)));
        assert_eq!(const_key(&Operand::Float(1.5)), const_key(&Operand::Float(1.5)));
    }

    #[test]
    fn test_complex_keys_track_both_signs() {
        let a = Operand::Complex { re: 0.0, im: 0.0 };
        let b = Operand::Complex { re: 0.0, im: -0.0 };
        let c = Operand::Complex { re: -0.0, im: 0.0 };
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_ne!(b.key(), c.key());
    }

    #[test]
    fn test_nested_signed_zero_keys_differ() {
        let positive = Operand::Tuple(vec![
            Operand::Int(1),
            Operand::Tuple(vec![Operand::Float(0.0)]),
        ]);
        let negative = Operand::Tuple(vec![
            Operand::Int(1),
            Operand::Tuple(vec![Operand::Float(-0.0)]),
        ]);
        assert_ne!(positive.key(), negative.key());

        let set_pos = Operand::frozen_set([Operand::Float(0.0)]);
        let set_neg = Operand::frozen_set([Operand::Float(-0.0)]);
        assert_ne!(set_pos.key(), set_neg.key());
    }

    #[test]
    fn test_type_disambiguates_equal_values() {
        assert_ne!(Operand::Int(1).key(), Operand::Bool(true).key());
        assert_ne!(Operand::Int(1).key(), Operand::Float(1.0).key());
        assert_ne!(
            Operand::Tuple(vec![]).key(),
            Operand::FrozenSet(vec![]).key()
        );
    }

    #[test]
    fn test_frozen_set_key_ignores_order() {
        let a = Operand::frozen_set([Operand::Int(1), Operand::Int(2)]);
        let b = Operand::frozen_set([Operand::Int(2), Operand::Int(1)]);
        assert_eq!(a.key(), b.key());
        let dup = Operand::frozen_set([Operand::Int(2), Operand::Int(2)]);
        assert!(matches!(dup, Operand::FrozenSet(ref items) if items.len() == 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(Operand::Tuple(vec![Operand::Int(1)]).to_string(), "(1,)");
        assert_eq!(Operand::Float(-0.0).to_string(), "-0.0");
        assert_eq!(Operand::from("x").to_string(), "\"x\"");
    }
}
